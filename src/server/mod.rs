//! The MCP dispatcher: registries, middleware, composition and request handling.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::bridge::RequestBridge;
use crate::error::{Error, ErrorCode};
use crate::logger::{default_logger, Logger};
use crate::protocol::{Notification, Request, Response, ResponseError};
use crate::transport::{Message, OutboundSender, Route, Transport};
use crate::types::{
    CallToolRequest, GetPromptRequest, Implementation, InitializeParams, InitializeResult,
    ListChangedCapability, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, ReadResourceRequest, ResourcesCapability, ServerCapabilities,
};
use crate::{negotiate_protocol_version, LATEST_PROTOCOL_VERSION};

mod context;
mod middleware;
mod registry;
mod schema;
mod uri_template;

#[cfg(test)]
mod test;

pub use context::{DispatchContext, RequestContext};
pub use middleware::{middleware_fn, MiddlewareContext, MiddlewareFn, Next};
pub use registry::{
    Namespace, PromptDef, PromptHandler, ResourceDef, ResourceHandler, ResourceRequest, ToolDef,
    ToolHandler,
};
pub use schema::{Schema, SchemaAdapter};
pub use uri_template::UriTemplate;

use middleware::Terminal;
use registry::{PromptEntry, Registry, ResourceEntry, ToolEntry};

/// Construction options for [`McpServer`].
#[derive(Clone)]
pub struct ServerOptions {
    pub info: Implementation,
    pub instructions: Option<String>,
    pub logger: Arc<dyn Logger>,
    /// How long elicitation and sampling requests wait for the client. `None` waits forever.
    pub client_request_timeout: Option<Duration>,
}

impl ServerOptions {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation::new(name, version),
            instructions: None,
            logger: default_logger(),
            client_request_timeout: None,
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn client_request_timeout(mut self, timeout: Duration) -> Self {
        self.client_request_timeout = Some(timeout);
        self
    }
}

struct ServerCore {
    info: Implementation,
    instructions: Option<String>,
    tools: RwLock<Registry<ToolEntry>>,
    prompts: RwLock<Registry<PromptEntry>>,
    resources: RwLock<Registry<ResourceEntry>>,
    middleware: RwLock<Vec<MiddlewareFn>>,
    outbound: RwLock<Option<Arc<dyn OutboundSender>>>,
    bridge: Arc<RequestBridge>,
    logger: Arc<dyn Logger>,
    initialized: AtomicBool,
}

/// An MCP server. Cheap to clone; clones share registries and state.
#[derive(Clone)]
pub struct McpServer {
    core: Arc<ServerCore>,
}

#[derive(Clone, Copy)]
enum ListKind {
    Tools,
    Prompts,
    Resources,
}

impl ListKind {
    fn method(self) -> &'static str {
        match self {
            ListKind::Tools => "notifications/tools/list_changed",
            ListKind::Prompts => "notifications/prompts/list_changed",
            ListKind::Resources => "notifications/resources/list_changed",
        }
    }
}

impl McpServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            core: Arc::new(ServerCore {
                info: options.info,
                instructions: options.instructions,
                tools: RwLock::new(Registry::default()),
                prompts: RwLock::new(Registry::default()),
                resources: RwLock::new(Registry::default()),
                middleware: RwLock::new(Vec::new()),
                outbound: RwLock::new(None),
                bridge: Arc::new(RequestBridge::new(options.client_request_timeout)),
                logger: options.logger,
                initialized: AtomicBool::new(false),
            }),
        }
    }

    pub fn info(&self) -> &Implementation {
        &self.core.info
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        self.core.logger.clone()
    }

    pub fn bridge(&self) -> Arc<RequestBridge> {
        self.core.bridge.clone()
    }

    /// Registers the path for server-originated messages. Replaces any previous one.
    pub fn set_outbound(&self, outbound: Arc<dyn OutboundSender>) {
        *self.core.outbound.write() = Some(outbound);
    }

    pub fn clear_outbound(&self) {
        self.core.outbound.write().take();
    }

    fn outbound(&self) -> Option<Arc<dyn OutboundSender>> {
        self.core.outbound.read().clone()
    }

    /// Registers a tool. A second tool with the same name is ignored with a warning.
    pub fn tool<F, Fut>(&self, def: ToolDef, handler: F) -> &Self
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<crate::types::CallToolResult, Error>> + Send + 'static,
    {
        let entry = ToolEntry {
            def,
            handler: registry::boxed_tool(handler),
            layers: Vec::new(),
        };
        if self.add_tool(entry) {
            self.notify_list_changed(ListKind::Tools);
        }
        self
    }

    /// Registers a prompt. A second prompt with the same name is ignored with a warning.
    pub fn prompt<F, Fut>(&self, def: PromptDef, handler: F) -> &Self
    where
        F: Fn(Map<String, Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<crate::types::GetPromptResult, Error>> + Send + 'static,
    {
        let entry = PromptEntry {
            def,
            handler: registry::boxed_prompt(handler),
            layers: Vec::new(),
        };
        if self.add_prompt(entry) {
            self.notify_list_changed(ListKind::Prompts);
        }
        self
    }

    /// Registers a resource or, when `def.uri` contains `{...}`, a resource template.
    pub fn resource<F, Fut>(&self, def: ResourceDef, handler: F) -> &Self
    where
        F: Fn(ResourceRequest, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<crate::types::ReadResourceResult, Error>> + Send + 'static,
    {
        let template = if UriTemplate::is_template(&def.uri) {
            match UriTemplate::parse(&def.uri) {
                Ok(t) => Some(t),
                Err(e) => {
                    self.core
                        .logger
                        .error(&format!("resource '{}' not registered: {e}", def.uri));
                    return self;
                }
            }
        } else {
            None
        };
        let entry = ResourceEntry {
            def,
            template,
            handler: registry::boxed_resource(handler),
            layers: Vec::new(),
        };
        if self.add_resource(entry) {
            self.notify_list_changed(ListKind::Resources);
        }
        self
    }

    /// Appends a middleware; it wraps every request, outermost first.
    pub fn use_middleware<F>(&self, f: F) -> &Self
    where
        F: for<'a> Fn(&'a mut MiddlewareContext, Next<'a>) -> BoxFuture<'a, Result<(), Error>>
            + Send
            + Sync
            + 'static,
    {
        self.core.middleware.write().push(Arc::new(f));
        self
    }

    /// Mounts everything `child` has registered so far.
    ///
    /// Tool and prompt names are rewritten by `namespace`; resource URIs are kept. Calls routed
    /// to a mounted entry run this server's middleware, then the child's. Names already taken
    /// here keep their existing registration and log a warning.
    pub fn group(&self, namespace: Namespace, child: &McpServer) -> &Self {
        let child_layers = child.core.middleware.read().clone();
        let tools: Vec<_> = child.core.tools.read().iter().cloned().collect();
        let prompts: Vec<_> = child.core.prompts.read().iter().cloned().collect();
        let resources: Vec<_> = child.core.resources.read().iter().cloned().collect();

        let layered = |own: &[MiddlewareFn]| {
            let mut layers = child_layers.clone();
            layers.extend(own.iter().cloned());
            layers
        };

        let mut added = [false; 3];
        for tool in tools {
            let mut def = tool.def.clone();
            def.name = namespace.apply(&def.name);
            added[0] |= self.add_tool(ToolEntry {
                def,
                handler: tool.handler.clone(),
                layers: layered(&tool.layers),
            });
        }
        for prompt in prompts {
            let mut def = prompt.def.clone();
            def.name = namespace.apply(&def.name);
            added[1] |= self.add_prompt(PromptEntry {
                def,
                handler: prompt.handler.clone(),
                layers: layered(&prompt.layers),
            });
        }
        for resource in resources {
            added[2] |= self.add_resource(ResourceEntry {
                def: resource.def.clone(),
                template: resource.template.clone(),
                handler: resource.handler.clone(),
                layers: layered(&resource.layers),
            });
        }

        for (kind, changed) in [ListKind::Tools, ListKind::Prompts, ListKind::Resources]
            .into_iter()
            .zip(added)
        {
            if changed {
                self.notify_list_changed(kind);
            }
        }
        self
    }

    fn add_tool(&self, entry: ToolEntry) -> bool {
        let name = entry.def.name.clone();
        let inserted = self.core.tools.write().insert(name.clone(), entry);
        if !inserted {
            self.warn_duplicate("tool", &name);
        }
        inserted
    }

    fn add_prompt(&self, entry: PromptEntry) -> bool {
        let name = entry.def.name.clone();
        let inserted = self.core.prompts.write().insert(name.clone(), entry);
        if !inserted {
            self.warn_duplicate("prompt", &name);
        }
        inserted
    }

    fn add_resource(&self, entry: ResourceEntry) -> bool {
        let uri = entry.def.uri.clone();
        let inserted = self.core.resources.write().insert(uri.clone(), entry);
        if !inserted {
            self.warn_duplicate("resource", &uri);
        }
        inserted
    }

    fn warn_duplicate(&self, kind: &str, key: &str) {
        self.core.logger.warn(&format!(
            "{kind} '{key}' is already registered; keeping the first registration"
        ));
    }

    fn notify_list_changed(&self, kind: ListKind) {
        if !self.core.initialized.load(Ordering::Acquire) {
            return;
        }
        let Some(outbound) = self.outbound() else {
            return;
        };
        let message = Message::Notification(Notification::new(kind.method(), None));
        if let Err(e) = outbound.send(message, &Route::global()) {
            self.core
                .logger
                .debug(&format!("{} not delivered: {e}", kind.method()));
        }
    }

    /// Handles one incoming message. Returns the response for requests and `None` otherwise.
    pub async fn dispatch(&self, message: Message, ctx: &DispatchContext) -> Option<Response> {
        match message {
            Message::Request(request) => Some(self.handle_request(request, ctx).await),
            Message::Response(response) => {
                if !self.core.bridge.resolve(ctx.session_id.as_ref(), response) {
                    self.core.logger.debug("client response matched no pending request");
                }
                None
            }
            Message::Notification(notification) => {
                self.handle_notification(&notification);
                None
            }
        }
    }

    fn handle_notification(&self, notification: &Notification) {
        match notification.method.as_str() {
            "notifications/initialized" => self.core.logger.debug("client initialized"),
            "notifications/cancelled" | "notifications/progress" => self.core.logger.debug(
                &format!("received {}: {:?}", notification.method, notification.params),
            ),
            other => self
                .core
                .logger
                .debug(&format!("ignoring notification {other}")),
        }
    }

    async fn handle_request(&self, request: Request, dctx: &DispatchContext) -> Response {
        let id = request.id.clone();
        let params = request.params.unwrap_or(Value::Null);
        let progress_token = params
            .get("_meta")
            .and_then(|m| m.get("progressToken"))
            .cloned();

        let rctx = RequestContext::new(
            id.clone(),
            progress_token,
            dctx,
            self.outbound(),
            self.core.bridge.clone(),
        );
        let mut mctx = MiddlewareContext::new(
            request.method,
            params,
            id.clone(),
            dctx.session_id.clone(),
            dctx.auth.clone(),
        );
        let chain = self.core.middleware.read().clone();
        let terminal = MethodTerminal {
            core: &self.core,
            rctx: &rctx,
            dctx,
        };

        let outcome = AssertUnwindSafe(Next::new(&chain, &terminal).run(&mut mctx))
            .catch_unwind()
            .await;

        let result = match outcome {
            Err(panic) => Err(Error::internal(format!(
                "handler for '{}' panicked: {}",
                mctx.method,
                panic_message(&*panic)
            ))),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) if !mctx.executed() => Err(Error::internal(format!(
                "handler for '{}' was not executed: a middleware did not call next()",
                mctx.method
            ))),
            Ok(Ok(())) => mctx
                .response
                .take()
                .unwrap_or_else(|| Err(Error::internal("handler produced no response"))),
        };

        match result {
            Ok(value) => Response::success(id, value),
            Err(e) => {
                if e.code() == i32::from(ErrorCode::InternalError) {
                    self.core
                        .logger
                        .error(&format!("request {} ({}) failed: {e}", id, mctx.method));
                }
                Response::error(Some(id), e.to_response_error())
            }
        }
    }

    /// Serves this server over a message transport until the peer disconnects.
    ///
    /// Requests other than `initialize` are handled concurrently, so a handler waiting on an
    /// elicitation can receive the client's answer over the same transport.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<(), Error> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.set_outbound(Arc::new(PeerSender { tx: tx.clone() }));

        let writer = {
            let transport = transport.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if let Err(e) = transport.send(message).await {
                        tracing::error!(?e, "failed to write message");
                        break;
                    }
                }
            })
        };

        let dctx = Arc::new(RwLock::new(DispatchContext::default()));
        let mut incoming = transport.receive();
        let mut result = Ok(());

        while let Some(item) = incoming.next().await {
            match item {
                Ok(Message::Request(request)) if request.method == "initialize" => {
                    if let Some(params) = request
                        .params
                        .as_ref()
                        .and_then(|p| serde_json::from_value::<InitializeParams>(p.clone()).ok())
                    {
                        let mut ctx = dctx.write();
                        ctx.client_capabilities = params.capabilities;
                        ctx.protocol_version =
                            Some(negotiate_protocol_version(&params.protocol_version).to_string());
                    }
                    let ctx = dctx.read().clone();
                    if let Some(response) = self.dispatch(Message::Request(request), &ctx).await {
                        let _ = tx.send(Message::Response(response));
                    }
                }
                Ok(Message::Request(request)) => {
                    let server = self.clone();
                    let ctx = dctx.read().clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(response) =
                            server.dispatch(Message::Request(request), &ctx).await
                        {
                            let _ = tx.send(Message::Response(response));
                        }
                    });
                }
                Ok(other) => {
                    let ctx = dctx.read().clone();
                    self.dispatch(other, &ctx).await;
                }
                Err(Error::Serialization(e)) => {
                    tracing::warn!(error = %e, "unparseable message");
                    let _ = tx.send(Message::Response(Response::error(
                        None,
                        ResponseError::new(ErrorCode::ParseError, format!("Parse error: {e}")),
                    )));
                }
                Err(Error::ConnectionClosed) => break,
                Err(e) => {
                    tracing::error!(?e, "transport failed");
                    result = Err(e);
                    break;
                }
            }
        }

        tracing::debug!("peer disconnected, stopping server loop");
        self.clear_outbound();
        drop(tx);
        // Flush responses already queued; in-flight handlers keep their own senders alive.
        if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
            tracing::debug!("writer still busy after shutdown grace period");
        }
        transport.close().await?;
        result
    }
}

/// Delivers server-originated messages to the single peer of [`McpServer::serve`].
struct PeerSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl OutboundSender for PeerSender {
    fn send(&self, message: Message, _route: &Route) -> Result<(), Error> {
        self.tx.send(message).map_err(|_| Error::ConnectionClosed)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, Error> {
    serde_json::from_value(params.clone()).map_err(|e| Error::invalid_params(e.to_string()))
}

struct MethodTerminal<'s> {
    core: &'s ServerCore,
    rctx: &'s RequestContext,
    dctx: &'s DispatchContext,
}

impl Terminal for MethodTerminal<'_> {
    fn call<'a>(&'a self, ctx: &'a mut MiddlewareContext) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move { self.core.route(ctx, self.rctx, self.dctx).await })
    }
}

enum Target {
    Tool(Arc<ToolEntry>),
    Prompt(Arc<PromptEntry>),
    Resource(Arc<ResourceEntry>, HashMap<String, String>),
}

impl Target {
    fn layers(&self) -> &[MiddlewareFn] {
        match self {
            Target::Tool(e) => &e.layers,
            Target::Prompt(e) => &e.layers,
            Target::Resource(e, _) => &e.layers,
        }
    }
}

struct EntityTerminal<'s> {
    rctx: &'s RequestContext,
    target: &'s Target,
}

impl Terminal for EntityTerminal<'_> {
    fn call<'a>(&'a self, ctx: &'a mut MiddlewareContext) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let outcome = invoke(self.target, &ctx.params, self.rctx).await;
            ctx.complete(outcome);
            Ok(())
        })
    }
}

async fn invoke(target: &Target, params: &Value, rctx: &RequestContext) -> Result<Value, Error> {
    match target {
        Target::Tool(entry) => {
            let req: CallToolRequest = parse_params(params)?;
            let args = match req.arguments {
                Value::Null => Value::Object(Map::new()),
                other => other,
            };
            if let Some(schema) = &entry.def.input_schema {
                schema.validate(&args)?;
            }
            let result = (entry.handler)(args, rctx.clone()).await?;
            if let (Some(schema), false) = (&entry.def.output_schema, result.is_error) {
                let structured = result.structured_content.as_ref().ok_or_else(|| {
                    Error::invalid_params(format!(
                        "Tool {} has an output schema but returned no structured content",
                        entry.def.name
                    ))
                })?;
                schema.validate(structured)?;
            }
            Ok(serde_json::to_value(result)?)
        }
        Target::Prompt(entry) => {
            let req: GetPromptRequest = parse_params(params)?;
            let args = req.arguments.unwrap_or_default();
            match &entry.def.arguments_schema {
                Some(schema) => schema.validate(&Value::Object(args.clone()))?,
                None => check_required_arguments(&entry.def, &args)?,
            }
            let result = (entry.handler)(args, rctx.clone()).await?;
            Ok(serde_json::to_value(result)?)
        }
        Target::Resource(entry, variables) => {
            let req: ReadResourceRequest = parse_params(params)?;
            let request = ResourceRequest {
                uri: req.uri,
                variables: variables.clone(),
            };
            let result = (entry.handler)(request, rctx.clone()).await?;
            Ok(serde_json::to_value(result)?)
        }
    }
}

fn check_required_arguments(def: &PromptDef, args: &Map<String, Value>) -> Result<(), Error> {
    let issues: Vec<_> = def
        .arguments
        .iter()
        .filter(|a| a.required == Some(true) && !args.contains_key(&a.name))
        .map(|a| crate::error::ValidationIssue {
            path: String::new(),
            message: format!("missing required argument '{}'", a.name),
        })
        .collect();
    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(issues))
    }
}

impl ServerCore {
    async fn route(
        &self,
        ctx: &mut MiddlewareContext,
        rctx: &RequestContext,
        dctx: &DispatchContext,
    ) -> Result<(), Error> {
        let method = ctx.method.clone();
        let target = match method.as_str() {
            "tools/call" => self.find_tool(&ctx.params),
            "prompts/get" => self.find_prompt(&ctx.params),
            "resources/read" => self.find_resource(&ctx.params),
            _ => {
                let outcome = self.handle_method(&method, &ctx.params, dctx);
                ctx.complete(outcome);
                return Ok(());
            }
        };
        match target {
            Ok(target) => {
                let inner = EntityTerminal {
                    rctx,
                    target: &target,
                };
                Next::new(target.layers(), &inner).run(ctx).await
            }
            Err(e) => {
                ctx.complete(Err(e));
                Ok(())
            }
        }
    }

    fn find_tool(&self, params: &Value) -> Result<Target, Error> {
        let req: CallToolRequest = parse_params(params)?;
        self.tools
            .read()
            .get(&req.name)
            .map(Target::Tool)
            .ok_or_else(|| Error::not_found(format!("Tool not found: {}", req.name)))
    }

    fn find_prompt(&self, params: &Value) -> Result<Target, Error> {
        let req: GetPromptRequest = parse_params(params)?;
        self.prompts
            .read()
            .get(&req.name)
            .map(Target::Prompt)
            .ok_or_else(|| Error::not_found(format!("Prompt not found: {}", req.name)))
    }

    fn find_resource(&self, params: &Value) -> Result<Target, Error> {
        let req: ReadResourceRequest = parse_params(params)?;
        let resources = self.resources.read();
        if let Some(entry) = resources.get(&req.uri).filter(|e| e.template.is_none()) {
            return Ok(Target::Resource(entry, HashMap::new()));
        }
        let found = resources
            .iter()
            .find_map(|entry| {
                entry
                    .template
                    .as_ref()
                    .and_then(|t| t.matches(&req.uri))
                    .map(|vars| Target::Resource(entry.clone(), vars))
            })
            .ok_or_else(|| Error::not_found(format!("Resource not found: {}", req.uri)));
        found
    }

    fn handle_method(
        &self,
        method: &str,
        params: &Value,
        dctx: &DispatchContext,
    ) -> Result<Value, Error> {
        match method {
            "initialize" => self.initialize(params, dctx),
            "ping" => Ok(Value::Object(Map::new())),
            "tools/list" => {
                let tools = self
                    .tools
                    .read()
                    .iter()
                    .map(|e| e.def.describe())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(serde_json::to_value(ListToolsResult {
                    tools,
                    next_cursor: None,
                })?)
            }
            "prompts/list" => {
                let prompts = self.prompts.read().iter().map(|e| e.def.describe()).collect();
                Ok(serde_json::to_value(ListPromptsResult {
                    prompts,
                    next_cursor: None,
                })?)
            }
            "resources/list" => {
                let resources = self
                    .resources
                    .read()
                    .iter()
                    .filter(|e| e.template.is_none())
                    .map(|e| e.def.describe())
                    .collect();
                Ok(serde_json::to_value(ListResourcesResult {
                    resources,
                    next_cursor: None,
                })?)
            }
            "resources/templates/list" => {
                let resource_templates = self
                    .resources
                    .read()
                    .iter()
                    .filter(|e| e.template.is_some())
                    .map(|e| e.def.describe_template())
                    .collect();
                Ok(serde_json::to_value(ListResourceTemplatesResult {
                    resource_templates,
                    next_cursor: None,
                })?)
            }
            other => Err(Error::not_found(format!("Method not found: {other}"))),
        }
    }

    fn initialize(&self, params: &Value, dctx: &DispatchContext) -> Result<Value, Error> {
        let params: InitializeParams = parse_params(params)?;
        let version = negotiate_protocol_version(&params.protocol_version);
        self.initialized.store(true, Ordering::Release);
        self.logger.info(&format!(
            "initialize from {} {} (requested {}, using {}){}",
            params.client_info.name,
            params.client_info.version,
            params.protocol_version,
            version,
            dctx.session_id
                .as_ref()
                .map(|s| format!(" session {s}"))
                .unwrap_or_default(),
        ));

        let elicitation = (version == LATEST_PROTOCOL_VERSION && self.outbound.read().is_some())
            .then(|| Value::Object(Map::new()));
        let list_changed = Some(ListChangedCapability {
            list_changed: Some(true),
        });
        let result = InitializeResult {
            protocol_version: version.to_string(),
            capabilities: ServerCapabilities {
                tools: list_changed.clone(),
                prompts: list_changed,
                resources: Some(ResourcesCapability {
                    subscribe: None,
                    list_changed: Some(true),
                }),
                elicitation,
                ..ServerCapabilities::default()
            },
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }
}
