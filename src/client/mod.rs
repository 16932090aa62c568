use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::{
    error::{Error, ErrorCode},
    protocol::{Notification, Request, RequestId, Response},
    transport::{Message, Transport},
    types::{
        CallToolRequest, CallToolResult, ClientCapabilities, CreateMessageRequestParams,
        CreateMessageResult, ElicitRequestParams, ElicitResult, GetPromptRequest,
        GetPromptResult, Implementation, InitializeResult, ListPromptsResult,
        ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
        ServerCapabilities, Tool,
    },
};

mod builder;
pub use builder::ClientBuilder;


/// How long [`Client::request`] waits for an answer by default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Answers the requests a server sends back to the client.
///
/// Every method has a default: requests fail with "method not found" and notifications are
/// ignored, so implementors only override what they advertise in their capabilities.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// Handles `elicitation/create`.
    async fn elicit(&self, params: ElicitRequestParams) -> Result<ElicitResult, Error> {
        let _ = params;
        Err(Error::not_found("Method not found: elicitation/create"))
    }

    /// Handles `sampling/createMessage`.
    async fn create_message(
        &self,
        params: CreateMessageRequestParams,
    ) -> Result<CreateMessageResult, Error> {
        let _ = params;
        Err(Error::not_found("Method not found: sampling/createMessage"))
    }

    async fn on_notification(&self, notification: Notification) {
        tracing::debug!(method = %notification.method, "unhandled server notification");
    }
}

/// A handler that supports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ClientHandler for NoopHandler {}

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Response>>>>;

/// The MCP client struct, managing transport, requests, and responses.
///
/// A background task reads the transport: responses complete the matching pending request,
/// server requests go to the [`ClientHandler`] and notifications to
/// [`ClientHandler::on_notification`].
pub struct Client {
    transport: Arc<dyn Transport>,
    /// The server's capabilities, populated after a successful initialize call.
    server_capabilities: RwLock<Option<ServerCapabilities>>,
    next_id: AtomicI64,
    pending: Pending,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    /// To handle shutdown, in stdin/stdout case we also need to shut down subprocess
    subprocess: Mutex<Option<Child>>,
    /// Temporary file for stderr output - will be automatically deleted when dropped
    stderr_file: Option<NamedTempFile>,
}

impl Client {
    /// Creates a new MCP client with the given transport and starts reading from it.
    /// This does not perform initialization. You typically call `client.initialize(...)` next.
    pub fn new(transport: Arc<dyn Transport>, handler: Arc<dyn ClientHandler>) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(transport.clone(), handler, pending.clone()));
        tracing::debug!("Created new MCP client");
        Self {
            transport,
            server_capabilities: RwLock::new(None),
            next_id: AtomicI64::new(0),
            pending,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reader,
            subprocess: Mutex::new(None),
            stderr_file: None,
        }
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub(crate) fn with_process(mut self, child: Child, stderr_file: Option<NamedTempFile>) -> Self {
        self.subprocess = Mutex::new(Some(child));
        self.stderr_file = stderr_file;
        self
    }

    /// Sends `initialize`, records the server capabilities and completes the handshake with
    /// `notifications/initialized`.
    pub async fn initialize(
        &self,
        implementation: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, Error> {
        tracing::info!(?implementation, "Initializing MCP client");

        let params = serde_json::json!({
            "clientInfo": implementation,
            "capabilities": capabilities,
            "protocolVersion": crate::LATEST_PROTOCOL_VERSION,
        });

        let response = self.request("initialize", Some(params)).await?;
        let init_result: InitializeResult = serde_json::from_value(response)?;
        tracing::debug!(?init_result, "Received initialization response");

        *self.server_capabilities.write() = Some(init_result.capabilities.clone());
        self.notify("notifications/initialized", None).await?;

        tracing::info!(
            version = %init_result.protocol_version,
            "MCP client initialization complete"
        );
        Ok(init_result)
    }

    /// Sends a request and waits for the matching response.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails, the server returns an error, the child
    /// process exits, or no response arrives within the request timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let request = Request::new(method, params, id.clone());
        tracing::debug!(?request, "Sending MCP request");
        if let Err(e) = self.transport.send(Message::Request(request)).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let outcome = tokio::select! {
            response = rx => response.map_err(|_| Error::ConnectionClosed),
            _ = tokio::time::sleep(self.request_timeout) => {
                tracing::error!("Request to '{}' timed out after {:?}", method, self.request_timeout);
                Err(Error::Timeout(format!("'{method}' after {:?}", self.request_timeout)))
            }
            err = self.process_exit() => Err(err),
        };
        self.pending.lock().remove(&id);

        let response = outcome?;
        if let Some(error) = response.error {
            tracing::debug!(?error, "Server returned error");
            return Err(error.into());
        }
        response
            .result
            .ok_or_else(|| Error::protocol(ErrorCode::InternalError, "Response missing result"))
    }

    /// Resolves once the child process has exited. Never resolves without one.
    async fn process_exit(&self) -> Error {
        loop {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let status = self.subprocess.lock().as_mut().map(|child| child.try_wait());
            let Some(status) = status else {
                return futures::future::pending().await;
            };
            match status {
                Ok(None) => continue,
                Ok(Some(exit_status)) => {
                    return Error::Other(format!("Process exited with status: {exit_status}"))
                }
                Err(e) => return Error::Other(format!("Error checking process status: {e}")),
            }
        }
    }

    /// Sends a notification to the server using the given method and optional parameters.
    /// Notifications do not expect a response from the server.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        tracing::debug!(%method, ?params, "Sending MCP notification");
        self.transport
            .send(Message::Notification(Notification::new(method, params)))
            .await
    }

    /// Returns the cached server capabilities if the client has already initialized.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities.read().clone()
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.request("ping", None).await.map(|_| ())
    }

    /// Lists available tools on the server by calling `tools/list`.
    pub async fn list_tools(&self) -> Result<ListToolsResult, Error> {
        let response = self.request("tools/list", None).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Calls a tool on the server by name, passing the specified arguments as JSON.
    /// If the returned `CallToolResult` has `is_error` set to `true`, this method converts
    /// it into an `Error::Other`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, Error> {
        tracing::debug!(%name, ?arguments, "Calling tool");
        let request = CallToolRequest {
            name: name.to_string(),
            arguments,
        };
        let response = self
            .request("tools/call", Some(serde_json::to_value(request)?))
            .await?;

        let tool_result: CallToolResult = serde_json::from_value(response)?;
        if tool_result.is_error {
            let message = tool_result
                .content
                .iter()
                .filter_map(|msg| match msg {
                    crate::types::MessageContent::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::Other(format!(
                "Tool '{name}' execution failed: {message}"
            )));
        }
        Ok(tool_result)
    }

    /// Retrieves a single tool from the server by name, returning `Some(tool)` if found, or `None` otherwise.
    pub async fn get_tool(&self, name: &str) -> Result<Option<Tool>, Error> {
        let tools = self.list_tools().await?;
        Ok(tools.tools.into_iter().find(|t| t.name == name))
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, Error> {
        let response = self.request("prompts/list", None).await?;
        Ok(serde_json::from_value(response)?)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<GetPromptResult, Error> {
        let request = GetPromptRequest {
            name: name.to_string(),
            arguments,
        };
        let response = self
            .request("prompts/get", Some(serde_json::to_value(request)?))
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Lists resources by calling `resources/list` on the server.
    pub async fn list_resources(&self) -> Result<ListResourcesResult, Error> {
        let response = self.request("resources/list", None).await?;
        Ok(serde_json::from_value(response)?)
    }

    pub async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult, Error> {
        let response = self.request("resources/templates/list", None).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Reads a resource by URI from the server, calling `resources/read`.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, Error> {
        let params = serde_json::json!({ "uri": uri });
        let response = self.request("resources/read", Some(params)).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Reads last `tail_lines` lines from stderr file (100 by default).
    pub async fn get_stderr(&self, tail_lines: Option<usize>) -> Result<String, Error> {
        let Some(file) = &self.stderr_file else {
            return Err(Error::Other("No stderr file available".to_string()));
        };
        let line_count = tail_lines.unwrap_or(100);
        let file = tokio::fs::File::open(file.path()).await?;
        let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(file));
        let mut last_lines = std::collections::VecDeque::with_capacity(line_count);
        while let Some(line) = lines.next_line().await? {
            if last_lines.len() >= line_count {
                last_lines.pop_front();
            }
            last_lines.push_back(line);
        }
        Ok(last_lines.into_iter().collect::<Vec<_>>().join("\n"))
    }

    /// Closes the transport and stops the child process, if any. This does not send a server
    /// shutdown request.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let child = self.subprocess.lock().take();
        perform_shutdown(self.transport.clone(), child).await
    }
}

async fn perform_shutdown(transport: Arc<dyn Transport>, child: Option<Child>) -> Result<(), Error> {
    tracing::info!("Shutting down MCP client");
    transport.close().await?;

    if let Some(mut child) = child {
        const TIMEOUT: u64 = 2;
        if let Ok(None) = child.try_wait() {
            tracing::info!("Have an associated subprocess, waiting {}s", TIMEOUT);
            let _ = timeout(Duration::from_secs(TIMEOUT), child.wait()).await;
        }
        if let Ok(None) = child.try_wait() {
            tracing::info!("Have an associated subprocess, sending kill and waiting {}s", TIMEOUT);
            let _ = child.start_kill();
            let _ = timeout(Duration::from_secs(TIMEOUT), child.wait()).await;
        }
        tracing::info!("Exit code from subprocess {:?}", child.try_wait());
    }
    Ok(())
}

async fn read_loop(transport: Arc<dyn Transport>, handler: Arc<dyn ClientHandler>, pending: Pending) {
    let mut stream = transport.receive();
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Response(response)) => {
                let waiter = response.id.as_ref().and_then(|id| pending.lock().remove(id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::debug!(?response.id, "response matched no pending request"),
                }
            }
            Ok(Message::Request(request)) => {
                let transport = transport.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let response = answer_server_request(handler.as_ref(), request).await;
                    if let Err(e) = transport.send(Message::Response(response)).await {
                        tracing::error!(?e, "failed to answer server request");
                    }
                });
            }
            Ok(Message::Notification(notification)) => handler.on_notification(notification).await,
            Err(Error::Serialization(e)) => tracing::debug!(%e, "skipping unreadable message"),
            Err(e) => {
                tracing::debug!(?e, "transport closed");
                break;
            }
        }
    }
    // Dropping the senders fails every waiter with `ConnectionClosed`.
    pending.lock().clear();
    tracing::debug!("Response handler task terminated");
}

async fn answer_server_request(handler: &dyn ClientHandler, request: Request) -> Response {
    let params = request.params.unwrap_or(Value::Null);
    let result = match request.method.as_str() {
        "ping" => Ok(Value::Object(Map::new())),
        "elicitation/create" => match serde_json::from_value(params) {
            Ok(p) => handler
                .elicit(p)
                .await
                .and_then(|r| Ok(serde_json::to_value(r)?)),
            Err(e) => Err(Error::invalid_params(e.to_string())),
        },
        "sampling/createMessage" => match serde_json::from_value(params) {
            Ok(p) => handler
                .create_message(p)
                .await
                .and_then(|r| Ok(serde_json::to_value(r)?)),
            Err(e) => Err(Error::invalid_params(e.to_string())),
        },
        other => Err(Error::not_found(format!("Method not found: {other}"))),
    };
    match result {
        Ok(value) => Response::success(request.id, value),
        Err(e) => Response::error(Some(request.id), e.to_response_error()),
    }
}

// Like calling `shutdown` explicitly, but not waiting for it to complete.
impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
        let child = self.subprocess.get_mut().take();
        let transport = self.transport.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = perform_shutdown(transport, child).await {
                    tracing::error!("Error during shutdown in drop: {e}");
                }
            });
        }
    }
}
