use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::context::RequestContext;
use super::middleware::MiddlewareFn;
use super::schema::Schema;
use super::uri_template::UriTemplate;
use crate::types::{
    CallToolResult, GetPromptResult, Prompt, PromptArgument, ReadResourceResult, Resource,
    ResourceTemplate, Tool,
};
use crate::Error;

pub type ToolHandler =
    Arc<dyn Fn(Value, RequestContext) -> BoxFuture<'static, Result<CallToolResult, Error>> + Send + Sync>;

pub type PromptHandler = Arc<
    dyn Fn(Map<String, Value>, RequestContext) -> BoxFuture<'static, Result<GetPromptResult, Error>>
        + Send
        + Sync,
>;

pub type ResourceHandler = Arc<
    dyn Fn(ResourceRequest, RequestContext) -> BoxFuture<'static, Result<ReadResourceResult, Error>>
        + Send
        + Sync,
>;

pub(crate) fn boxed_tool<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CallToolResult, Error>> + Send + 'static,
{
    Arc::new(
        move |args: Value, ctx: RequestContext| -> BoxFuture<'static, Result<CallToolResult, Error>> {
            Box::pin(f(args, ctx))
        },
    )
}

pub(crate) fn boxed_prompt<F, Fut>(f: F) -> PromptHandler
where
    F: Fn(Map<String, Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GetPromptResult, Error>> + Send + 'static,
{
    Arc::new(
        move |args: Map<String, Value>,
              ctx: RequestContext|
              -> BoxFuture<'static, Result<GetPromptResult, Error>> { Box::pin(f(args, ctx)) },
    )
}

pub(crate) fn boxed_resource<F, Fut>(f: F) -> ResourceHandler
where
    F: Fn(ResourceRequest, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReadResourceResult, Error>> + Send + 'static,
{
    Arc::new(
        move |req: ResourceRequest,
              ctx: RequestContext|
              -> BoxFuture<'static, Result<ReadResourceResult, Error>> { Box::pin(f(req, ctx)) },
    )
}

/// The URI being read and, for template matches, its variable bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    pub uri: String,
    pub variables: HashMap<String, String>,
}

/// Declaration of a tool.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub input_schema: Option<Schema>,
    pub output_schema: Option<Schema>,
    pub annotations: Option<Value>,
    pub meta: Option<Value>,
}

impl ToolDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            input_schema: None,
            output_schema: None,
            annotations: None,
            meta: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input_schema(mut self, schema: impl Into<Schema>) -> Self {
        self.input_schema = Some(schema.into());
        self
    }

    pub fn output_schema(mut self, schema: impl Into<Schema>) -> Self {
        self.output_schema = Some(schema.into());
        self
    }

    pub fn annotations(mut self, annotations: Value) -> Self {
        self.annotations = Some(annotations);
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub(crate) fn describe(&self) -> Result<Tool, Error> {
        let input_schema = match &self.input_schema {
            Some(s) => s.resolve()?.clone(),
            None => serde_json::json!({ "type": "object" }),
        };
        let output_schema = match &self.output_schema {
            Some(s) => Some(s.resolve()?.clone()),
            None => None,
        };
        Ok(Tool {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            input_schema,
            output_schema,
            annotations: self.annotations.clone(),
            meta: self.meta.clone(),
        })
    }
}

/// Declaration of a prompt.
#[derive(Debug, Clone)]
pub struct PromptDef {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
    /// Validates the argument object; when absent only `required` arguments are checked.
    pub arguments_schema: Option<Schema>,
    pub meta: Option<Value>,
}

impl PromptDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            arguments: Vec::new(),
            arguments_schema: None,
            meta: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn argument(mut self, name: impl Into<String>, description: &str, required: bool) -> Self {
        self.arguments.push(PromptArgument {
            name: name.into(),
            description: (!description.is_empty()).then(|| description.to_string()),
            required: Some(required),
        });
        self
    }

    pub fn arguments_schema(mut self, schema: impl Into<Schema>) -> Self {
        self.arguments_schema = Some(schema.into());
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub(crate) fn describe(&self) -> Prompt {
        Prompt {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            arguments: self.arguments.clone(),
            meta: self.meta.clone(),
        }
    }
}

/// Declaration of a resource. A `uri` containing `{...}` registers a template.
#[derive(Debug, Clone)]
pub struct ResourceDef {
    pub uri: String,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub meta: Option<Value>,
}

impl ResourceDef {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            title: None,
            description: None,
            mime_type: None,
            meta: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub(crate) fn describe(&self) -> Resource {
        Resource {
            uri: self.uri.clone(),
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            meta: self.meta.clone(),
        }
    }

    pub(crate) fn describe_template(&self) -> ResourceTemplate {
        ResourceTemplate {
            uri_template: self.uri.clone(),
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            meta: self.meta.clone(),
        }
    }
}

pub(crate) struct ToolEntry {
    pub def: ToolDef,
    pub handler: ToolHandler,
    /// Middleware of the groups this entry was mounted through, outermost first.
    pub layers: Vec<MiddlewareFn>,
}

pub(crate) struct PromptEntry {
    pub def: PromptDef,
    pub handler: PromptHandler,
    pub layers: Vec<MiddlewareFn>,
}

pub(crate) struct ResourceEntry {
    pub def: ResourceDef,
    pub template: Option<UriTemplate>,
    pub handler: ResourceHandler,
    pub layers: Vec<MiddlewareFn>,
}

/// How a mounted child's names are rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
    /// Names are kept.
    Flat,
    /// `prefix/name`
    Prefix(String),
    /// `name/suffix`
    Suffix(String),
    /// `prefix/name/suffix`
    Affix { prefix: String, suffix: String },
}

impl Namespace {
    pub fn apply(&self, name: &str) -> String {
        match self {
            Namespace::Flat => name.to_string(),
            Namespace::Prefix(p) => format!("{p}/{name}"),
            Namespace::Suffix(s) => format!("{name}/{s}"),
            Namespace::Affix { prefix, suffix } => format!("{prefix}/{name}/{suffix}"),
        }
    }
}

/// Insertion-ordered table keyed by name or URI. The first registration of a key wins.
pub(crate) struct Registry<T> {
    entries: Vec<Arc<T>>,
    index: HashMap<String, usize>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Registry<T> {
    /// Returns false, leaving the table untouched, when `key` is taken.
    pub fn insert(&mut self, key: String, entry: T) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(Arc::new(entry));
        true
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.index.get(key).map(|&i| self.entries[i].clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries.iter()
    }
}
