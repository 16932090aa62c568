//! Argument and output schemas.
//!
//! A [`Schema`] is either a ready JSON Schema document or a [`SchemaAdapter`] that produces one
//! on first use. Resolution and compilation happen once and are cached for the lifetime of the
//! registration.

use std::fmt;
use std::sync::{Arc, OnceLock};

use jsonschema::Validator;
use serde_json::Value;

use crate::error::ValidationIssue;
use crate::Error;

/// Produces a JSON Schema from some other schema description (a typed model, a DSL, ...).
pub trait SchemaAdapter: Send + Sync {
    fn to_json_schema(&self) -> Result<Value, Error>;
}

enum Source {
    Json(Value),
    Adapter(Arc<dyn SchemaAdapter>),
}

struct Inner {
    source: Source,
    resolved: OnceLock<Result<Value, String>>,
    validator: OnceLock<Result<Validator, String>>,
}

/// A lazily resolved, cached JSON Schema.
#[derive(Clone)]
pub struct Schema {
    inner: Arc<Inner>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.source {
            Source::Json(v) => f.debug_tuple("Schema").field(v).finish(),
            Source::Adapter(_) => f.write_str("Schema(<adapter>)"),
        }
    }
}

impl Schema {
    pub fn json(schema: Value) -> Self {
        Self::from_source(Source::Json(schema))
    }

    pub fn adapter(adapter: impl SchemaAdapter + 'static) -> Self {
        Self::from_source(Source::Adapter(Arc::new(adapter)))
    }

    fn from_source(source: Source) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                resolved: OnceLock::new(),
                validator: OnceLock::new(),
            }),
        }
    }

    /// The JSON Schema document. Adapters are invoked at most once.
    pub fn resolve(&self) -> Result<&Value, Error> {
        let resolved = self.inner.resolved.get_or_init(|| match &self.inner.source {
            Source::Json(v) => Ok(v.clone()),
            Source::Adapter(a) => a.to_json_schema().map_err(|e| e.to_string()),
        });
        resolved
            .as_ref()
            .map_err(|e| Error::internal(format!("schema resolution failed: {e}")))
    }

    fn validator(&self) -> Result<&Validator, Error> {
        let schema = self.resolve()?;
        let compiled = self
            .inner
            .validator
            .get_or_init(|| jsonschema::validator_for(schema).map_err(|e| e.to_string()));
        compiled
            .as_ref()
            .map_err(|e| Error::internal(format!("invalid schema: {e}")))
    }

    /// Checks `instance`, reporting every failed check as [`Error::Validation`].
    pub fn validate(&self, instance: &Value) -> Result<(), Error> {
        let validator = self.validator()?;
        if validator.is_valid(instance) {
            return Ok(());
        }
        let issues: Vec<ValidationIssue> = validator
            .iter_errors(instance)
            .map(|e| ValidationIssue {
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect();
        Err(Error::Validation(issues))
    }
}

impl From<Value> for Schema {
    fn from(v: Value) -> Self {
        Schema::json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl SchemaAdapter for Counting {
        fn to_json_schema(&self) -> Result<Value, Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"type": "object", "properties": {"n": {"type": "integer"}}}))
        }
    }

    #[test]
    fn adapter_resolves_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let schema = Schema::adapter(Counting(calls.clone()));
        for _ in 0..3 {
            schema.validate(&json!({"n": 1})).unwrap();
        }
        schema.resolve().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reports_every_failed_check() {
        let schema = Schema::json(json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "string"}},
            "required": ["a", "b", "c"]
        }));
        let Err(Error::Validation(issues)) = schema.validate(&json!({"a": "x", "b": 3})) else {
            panic!("expected validation error");
        };
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().any(|i| i.path == "/a"));
        assert!(issues.iter().any(|i| i.message.contains("\"c\"")));
    }

    #[test]
    fn failing_adapter_is_internal_error() {
        struct Broken;
        impl SchemaAdapter for Broken {
            fn to_json_schema(&self) -> Result<Value, Error> {
                Err(Error::Other("no schema".into()))
            }
        }
        let err = Schema::adapter(Broken).validate(&json!({})).unwrap_err();
        assert_eq!(err.code(), -32603);
    }
}
