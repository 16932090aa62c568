//! Client side of the streamable HTTP transport.
//!
//! Every outgoing message is one `POST`. The answer is either a JSON body, a per-request event
//! stream, or `202 Accepted`. Whatever arrives is fanned into a single incoming stream, so a
//! [`Client`](crate::client::Client) drives this transport exactly like stdio.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::Error;
use crate::protocol::RequestId;
use crate::transport::http::{HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID};
use crate::transport::sse::SseDecoder;
use crate::transport::{Message, Transport};

type Incoming = Result<Message, Error>;

#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub endpoint: String,
    pub timeout: Duration,
    /// Resume an existing session instead of waiting for `initialize` to mint one.
    pub session_id: Option<String>,
}

impl HttpClientOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            session_id: None,
        }
    }
}

struct Shared {
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    last_event_id: RwLock<Option<String>>,
    /// Id of the in-flight `initialize`, so its answer can fix the protocol version.
    initialize_id: Mutex<Option<RequestId>>,
    sender: broadcast::Sender<Incoming>,
}

impl Shared {
    fn deliver(&self, message: Message) {
        if let Message::Response(response) = &message {
            let mut pending = self.initialize_id.lock();
            if pending.is_some() && response.id == *pending {
                *pending = None;
                if let Some(version) = response
                    .result
                    .as_ref()
                    .and_then(|r| r.get("protocolVersion"))
                    .and_then(Value::as_str)
                {
                    *self.protocol_version.write() = Some(version.to_string());
                }
            }
        }
        let _ = self.sender.send(Ok(message));
    }

    fn deliver_json(&self, body: &[u8]) -> Result<(), Error> {
        match serde_json::from_slice::<Value>(body)? {
            Value::Array(items) => {
                for item in items {
                    self.deliver(serde_json::from_value(item)?);
                }
            }
            value => self.deliver(serde_json::from_value(value)?),
        }
        Ok(())
    }
}

pub struct HttpClientTransport {
    http: reqwest::Client,
    endpoint: String,
    shared: Arc<Shared>,
    receiver: Mutex<Option<broadcast::Receiver<Incoming>>>,
}

impl HttpClientTransport {
    pub fn new(options: HttpClientOptions) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let (sender, receiver) = broadcast::channel(100);
        Ok(Self {
            http,
            endpoint: options.endpoint,
            shared: Arc::new(Shared {
                session_id: RwLock::new(options.session_id),
                protocol_version: RwLock::new(None),
                last_event_id: RwLock::new(None),
                initialize_id: Mutex::new(None),
                sender,
            }),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.shared.protocol_version.read().clone()
    }

    /// Id of the last event seen on any stream, for resuming with
    /// [`open_standing_stream`](Self::open_standing_stream).
    pub fn last_event_id(&self) -> Option<String> {
        self.shared.last_event_id.read().clone()
    }

    fn with_session_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(sid) = self.shared.session_id.read().as_deref() {
            req = req.header(HEADER_SESSION_ID, sid);
        }
        if let Some(version) = self.shared.protocol_version.read().as_deref() {
            req = req.header(HEADER_PROTOCOL_VERSION, version);
        }
        req
    }

    /// Opens the session's standing event stream with a `GET`, resuming after the last seen
    /// event when there is one. Events are delivered through [`Transport::receive`].
    pub async fn open_standing_stream(&self) -> Result<(), Error> {
        let mut req = self
            .with_session_headers(self.http.get(&self.endpoint))
            .header("accept", "text/event-stream");
        if let Some(last) = self.last_event_id() {
            req = req.header(HEADER_LAST_EVENT_ID, last);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                body,
            });
        }
        self.spawn_event_reader(resp);
        Ok(())
    }

    fn spawn_event_reader(&self, resp: reqwest::Response) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            let mut body = resp.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::debug!(error = %e, "event stream failed");
                        break;
                    }
                };
                for frame in decoder.push(&chunk) {
                    if let Some(id) = frame.id {
                        *shared.last_event_id.write() = Some(id);
                    }
                    match serde_json::from_str::<Message>(&frame.data) {
                        Ok(message) => shared.deliver(message),
                        Err(e) => {
                            let _ = shared.sender.send(Err(Error::Serialization(e.to_string())));
                        }
                    }
                }
            }
            tracing::debug!("event stream ended");
        });
    }
}

#[async_trait]
impl Transport for HttpClientTransport {
    async fn send(&self, message: Message) -> Result<(), Error> {
        if let Message::Request(r) = &message {
            if r.method == "initialize" {
                *self.shared.initialize_id.lock() = Some(r.id.clone());
            }
        }

        let req = self
            .with_session_headers(self.http.post(&self.endpoint))
            .header("accept", "application/json, text/event-stream")
            .json(&message);
        let resp = req.send().await?;
        let status = resp.status();

        if let Some(sid) = resp
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|h| h.to_str().ok())
        {
            *self.shared.session_id.write() = Some(sid.to_string());
        }

        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(%status, %body, "post rejected");
            // JSON-RPC errors without a request id still reach the caller's stream.
            if let Ok(Message::Response(r)) = serde_json::from_str::<Message>(&body) {
                if r.id.is_some() {
                    self.shared.deliver(Message::Response(r));
                    return Ok(());
                }
            }
            return Err(Error::Http {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        if content_type.starts_with("text/event-stream") {
            self.spawn_event_reader(resp);
            return Ok(());
        }
        let body = resp.bytes().await?;
        if body.is_empty() {
            return Ok(());
        }
        self.shared.deliver_json(&body)
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = Result<Message, Error>> + Send>> {
        let rx = self
            .receiver
            .lock()
            .take()
            .unwrap_or_else(|| self.shared.sender.subscribe());
        Box::pin(futures::stream::unfold(
            (rx, false),
            |(mut rx, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match rx.recv().await {
                        Ok(item) => {
                            let terminal = matches!(item, Err(Error::ConnectionClosed));
                            return Some((item, (rx, terminal)));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "incoming messages dropped: reader lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        ))
    }

    /// Ends the session with a `DELETE` and closes the incoming stream.
    async fn close(&self) -> Result<(), Error> {
        let session = self.shared.session_id.write().take();
        if session.is_some() {
            let req = self.http.delete(&self.endpoint);
            let req = match session.as_deref() {
                Some(sid) => req.header(HEADER_SESSION_ID, sid),
                None => req,
            };
            let req = match self.protocol_version() {
                Some(v) => req.header(HEADER_PROTOCOL_VERSION, v),
                None => req,
            };
            match req.send().await {
                Ok(resp) => tracing::debug!(status = %resp.status(), "session deleted"),
                Err(e) => tracing::debug!(error = %e, "session delete failed"),
            }
        }
        let _ = self.shared.sender.send(Err(Error::ConnectionClosed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Notification, Request};
    use crate::server::{McpServer, ServerOptions, ToolDef};
    use crate::transport::http::{HttpTransportOptions, StreamableHttpTransport};
    use crate::transport::Route;
    use crate::types::CallToolResult;
    use crate::store::SessionId;
    use serde_json::json;

    async fn spawn_server() -> (StreamableHttpTransport, String) {
        let server = McpServer::new(
            ServerOptions::new("e2e", "1.0.0").logger(Arc::new(crate::logger::NoopLogger)),
        );
        server.tool(ToolDef::new("log"), |_args, ctx| async move {
            ctx.notify("notifications/message", Some(json!({"data": "step"})))?;
            Ok(CallToolResult::text("finished"))
        });
        let transport = StreamableHttpTransport::new(server, HttpTransportOptions::default());
        let router = transport.router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (transport, format!("http://{addr}/mcp"))
    }

    async fn next_message(
        stream: &mut Pin<Box<dyn Stream<Item = Result<Message, Error>> + Send>>,
    ) -> Message {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("transport error")
    }

    fn init_request() -> Message {
        Message::Request(Request::new(
            "initialize",
            Some(json!({
                "protocolVersion": crate::LATEST_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "e2e-client", "version": "0.1.0"}
            })),
            RequestId::Number(1),
        ))
    }

    #[tokio::test]
    async fn talks_to_a_live_server() {
        let (server_side, endpoint) = spawn_server().await;
        let transport = HttpClientTransport::new(HttpClientOptions::new(endpoint)).unwrap();
        let mut incoming = transport.receive();

        transport.send(init_request()).await.unwrap();
        let Message::Response(init) = next_message(&mut incoming).await else {
            panic!("expected the initialize response");
        };
        assert_eq!(init.id, Some(RequestId::Number(1)));
        assert!(transport.session_id().is_some());
        assert_eq!(
            transport.protocol_version().as_deref(),
            Some(crate::LATEST_PROTOCOL_VERSION)
        );

        transport
            .send(Message::Notification(Notification::new(
                "notifications/initialized",
                None,
            )))
            .await
            .unwrap();

        // Streamed tool call: the notification comes before the result.
        transport
            .send(Message::Request(Request::new(
                "tools/call",
                Some(json!({"name": "log"})),
                RequestId::Number(2),
            )))
            .await
            .unwrap();
        let first = next_message(&mut incoming).await;
        assert_eq!(first.method(), Some("notifications/message"));
        let Message::Response(result) = next_message(&mut incoming).await else {
            panic!("expected the tool result");
        };
        assert_eq!(result.id, Some(RequestId::Number(2)));
        assert_eq!(transport.last_event_id().as_deref(), Some("2#request-n2"));

        let sid = transport.session_id().unwrap();
        transport.close().await.unwrap();
        assert!(!server_side.store().has(&SessionId::new(sid)));
    }

    #[tokio::test]
    async fn standing_stream_receives_server_pushes() {
        let (server_side, endpoint) = spawn_server().await;
        let transport = HttpClientTransport::new(HttpClientOptions::new(endpoint)).unwrap();
        let mut incoming = transport.receive();
        transport.send(init_request()).await.unwrap();
        next_message(&mut incoming).await;

        transport.open_standing_stream().await.unwrap();
        let hello = next_message(&mut incoming).await;
        assert_eq!(
            hello.method(),
            Some(crate::transport::http::CONNECTION_ESTABLISHED)
        );

        let route = Route {
            session_id: transport.session_id().map(SessionId::new),
            ..Route::default()
        };
        server_side
            .send(
                Message::Notification(Notification::new("notifications/message", None)),
                &route,
            )
            .unwrap();
        let pushed = next_message(&mut incoming).await;
        assert_eq!(pushed.method(), Some("notifications/message"));
        assert_eq!(transport.last_event_id().as_deref(), Some("1#session"));

        let err = transport.open_standing_stream().await.unwrap_err();
        assert!(matches!(err, Error::Http { status: 409, .. }));
    }
}
