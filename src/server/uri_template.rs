//! Minimal URI templates for resource registration.
//!
//! `{name}` matches one or more characters up to the next `/`; `{+name}` and `{name*}` may
//! span slashes.

use std::collections::HashMap;
use std::fmt;

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Var { name: String, greedy: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    raw: String,
    parts: Vec<Part>,
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl UriTemplate {
    /// True when `uri` contains template expressions.
    pub fn is_template(uri: &str) -> bool {
        uri.contains('{')
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        let mut parts = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let close = rest[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| Error::Other(format!("unclosed expression in template {raw}")))?;
            let expr = &rest[open + 1..close];
            let (expr, greedy) = match expr.strip_prefix('+') {
                Some(e) => (e, true),
                None => match expr.strip_suffix('*') {
                    Some(e) => (e, true),
                    None => (expr, false),
                },
            };
            if expr.is_empty() || !expr.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(Error::Other(format!("invalid variable in template {raw}")));
            }
            if matches!(parts.last(), Some(Part::Var { .. })) {
                return Err(Error::Other(format!(
                    "adjacent variables in template {raw}"
                )));
            }
            parts.push(Part::Var {
                name: expr.to_string(),
                greedy,
            });
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Matches a concrete URI, returning the variable bindings.
    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let mut vars = HashMap::new();
        if match_parts(&self.parts, uri, &mut vars) {
            Some(vars)
        } else {
            None
        }
    }
}

fn match_parts(parts: &[Part], input: &str, vars: &mut HashMap<String, String>) -> bool {
    let Some((head, tail)) = parts.split_first() else {
        return input.is_empty();
    };
    match head {
        Part::Literal(lit) => match input.strip_prefix(lit.as_str()) {
            Some(rest) => match_parts(tail, rest, vars),
            None => false,
        },
        Part::Var { name, greedy } => {
            let limit = if *greedy {
                input.len()
            } else {
                input.find('/').unwrap_or(input.len())
            };
            // Longest candidate first.
            let ends: Vec<usize> = input[..limit]
                .char_indices()
                .map(|(i, c)| i + c.len_utf8())
                .collect();
            for end in ends.into_iter().rev() {
                if match_parts(tail, &input[end..], vars) {
                    vars.insert(name.clone(), input[..end].to_string());
                    return true;
                }
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_variables_stop_at_slash() {
        let t = UriTemplate::parse("users://{id}/profile").unwrap();
        let vars = t.matches("users://42/profile").unwrap();
        assert_eq!(vars["id"], "42");
        assert!(t.matches("users://4/2/profile").is_none());
        assert!(t.matches("users:///profile").is_none());
    }

    #[test]
    fn greedy_variables_span_segments() {
        let t = UriTemplate::parse("file:///{+path}").unwrap();
        assert_eq!(t.matches("file:///a/b/c.txt").unwrap()["path"], "a/b/c.txt");
        let t = UriTemplate::parse("repo://{owner}/{path*}").unwrap();
        let vars = t.matches("repo://me/src/lib.rs").unwrap();
        assert_eq!(vars["owner"], "me");
        assert_eq!(vars["path"], "src/lib.rs");
    }

    #[test]
    fn literal_suffix_must_match() {
        let t = UriTemplate::parse("docs://{name}.md").unwrap();
        assert_eq!(t.matches("docs://intro.md").unwrap()["name"], "intro");
        assert!(t.matches("docs://intro.txt").is_none());
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(UriTemplate::parse("a://{x").is_err());
        assert!(UriTemplate::parse("a://{}").is_err());
        assert!(UriTemplate::parse("a://{x}{y}").is_err());
        assert!(!UriTemplate::is_template("a://plain"));
    }
}
