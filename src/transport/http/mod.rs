//! Streamable HTTP transport.
//!
//! One endpoint answers three methods:
//!
//! - `POST` carries client messages. Requests are answered with a JSON body, or with a
//!   per-request event stream when the client accepts `text/event-stream`.
//! - `GET` opens the session's standing event stream, optionally resuming after a
//!   `last-event-id`.
//! - `DELETE` ends the session.
//!
//! Server-originated messages reach the client through the [`OutboundSender`] this transport
//! registers on the server at construction.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::error::ErrorCode;
use crate::logger::Logger;
use crate::protocol::{Notification, Request, RequestId, Response as RpcResponse, ResponseError};
use crate::server::{DispatchContext, McpServer};
use crate::store::{
    EventId, InMemorySessionStore, SessionId, SessionMeta, SessionStore, StreamId, UnknownSession,
    DEFAULT_EVENT_CAPACITY,
};
use crate::transport::sse::{SseWriter, StreamWriter};
use crate::transport::{Message, OutboundSender, Route};
use crate::types::{AuthInfo, InitializeParams};
use crate::{is_supported_protocol_version, Error, ProtocolGeneration, LEGACY_PROTOCOL_VERSION};


pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";

/// Method of the id-less event that opens a standing stream when nothing was replayed.
pub const CONNECTION_ESTABLISHED: &str = "notifications/connection/established";

#[derive(Debug, Clone)]
pub struct HttpTransportOptions {
    /// Route the endpoint is mounted at.
    pub path: String,
    /// Mint session ids on `initialize` and require them afterwards. When false the transport
    /// is stateless and `GET`/`DELETE` are not allowed.
    ///
    /// Without a session there is no negotiated version to fall back on: each POST is judged
    /// by its own `mcp-protocol-version` header, and a POST without one is treated as
    /// `2025-03-26`. Batches are therefore accepted unless the header names `2025-06-18`.
    pub sessions: bool,
    /// Accepted `Origin` values. Empty disables the check.
    pub allowed_origins: Vec<String>,
    /// Accepted `Host` values. Empty disables the check.
    pub allowed_hosts: Vec<String>,
    /// Events retained per session, over all its streams, for resumption.
    pub event_buffer_capacity: usize,
}

impl Default for HttpTransportOptions {
    fn default() -> Self {
        Self {
            path: "/mcp".to_string(),
            sessions: true,
            allowed_origins: Vec::new(),
            allowed_hosts: Vec::new(),
            event_buffer_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// A request stream is identified by the writer carrying it, not only by the request id:
/// stateless callers share one id space and routinely reuse the same ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    session: Option<SessionId>,
    writer: u64,
    request: RequestId,
}

struct Inner {
    server: McpServer,
    options: HttpTransportOptions,
    store: Arc<dyn SessionStore>,
    standing: Mutex<HashMap<SessionId, Arc<SseWriter>>>,
    request_streams: Mutex<HashMap<StreamKey, Arc<SseWriter>>>,
    logger: Arc<dyn Logger>,
}

/// Serves an [`McpServer`] over streamable HTTP.
#[derive(Clone)]
pub struct StreamableHttpTransport {
    inner: Arc<Inner>,
}

struct TransportOutbound {
    inner: Weak<Inner>,
}

impl OutboundSender for TransportOutbound {
    fn send(&self, message: Message, route: &Route) -> Result<(), Error> {
        match self.inner.upgrade() {
            Some(inner) => inner.deliver(message, route),
            None => Err(Error::ConnectionClosed),
        }
    }
}

impl StreamableHttpTransport {
    pub fn new(server: McpServer, options: HttpTransportOptions) -> Self {
        let store = Arc::new(InMemorySessionStore::new(options.event_buffer_capacity));
        Self::with_store(server, options, store)
    }

    /// Like [`new`](Self::new) but with a caller-provided session store.
    pub fn with_store(
        server: McpServer,
        options: HttpTransportOptions,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let inner = Arc::new(Inner {
            logger: server.logger(),
            server: server.clone(),
            options,
            store,
            standing: Mutex::new(HashMap::new()),
            request_streams: Mutex::new(HashMap::new()),
        });
        server.set_outbound(Arc::new(TransportOutbound {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// The axum router serving the endpoint.
    pub fn router(&self) -> Router {
        Router::new()
            .route(
                &self.inner.options.path,
                post(handle_post)
                    .get(handle_get)
                    .delete(handle_delete)
                    .fallback(method_not_allowed),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.inner.clone())
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.inner.store.clone()
    }

    /// Pushes a server-originated message as if a handler had sent it.
    pub fn send(&self, message: Message, route: &Route) -> Result<(), Error> {
        self.inner.deliver(message, route)
    }

    pub fn standing_stream_count(&self) -> usize {
        self.inner.standing.lock().len()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"))
}

fn plain(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

fn bad_session() -> Response {
    plain(
        StatusCode::BAD_REQUEST,
        "Bad Request: invalid or missing session id",
    )
}

fn with_session(mut response: Response, session: Option<&SessionId>) -> Response {
    if let Some(sid) = session {
        if let Ok(v) = HeaderValue::from_str(sid.as_str()) {
            response.headers_mut().insert(HEADER_SESSION_ID, v);
        }
    }
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T, session: Option<&SessionId>) -> Response {
    let body = match serde_json::to_vec(body) {
        Ok(b) => b,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    let response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    with_session(response, session)
}

/// A JSON-RPC error that has no request id to answer, sent with a 400.
fn rpc_error(code: ErrorCode, message: String) -> Response {
    let response = RpcResponse::error(None, ResponseError::new(code, message));
    json_response(StatusCode::BAD_REQUEST, &response, None)
}

fn sse_response(body: Body, session: Option<&SessionId>) -> Response {
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    with_session(response, session)
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET, POST, DELETE")],
        "Method Not Allowed",
    )
        .into_response()
}

fn stateless_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        "Method Not Allowed: sessions are disabled",
    )
        .into_response()
}

impl Inner {
    fn check_origin_and_host(&self, headers: &HeaderMap) -> Result<(), Response> {
        if !self.options.allowed_hosts.is_empty() {
            let host = header_str(headers, "host").unwrap_or_default();
            if !self.options.allowed_hosts.iter().any(|h| h == host) {
                return Err(plain(StatusCode::FORBIDDEN, "Forbidden: host not allowed"));
            }
        }
        if !self.options.allowed_origins.is_empty() {
            if let Some(origin) = header_str(headers, "origin") {
                if !self.options.allowed_origins.iter().any(|o| o == origin) {
                    return Err(plain(StatusCode::FORBIDDEN, "Forbidden: origin not allowed"));
                }
            }
        }
        Ok(())
    }

    /// The caller's session. `None` only when sessions are disabled.
    fn session_for(&self, headers: &HeaderMap) -> Result<Option<SessionMeta>, Response> {
        if !self.options.sessions {
            return Ok(None);
        }
        header_str(headers, HEADER_SESSION_ID)
            .and_then(|sid| self.store.get(&SessionId::new(sid)))
            .map(Some)
            .ok_or_else(bad_session)
    }

    /// Applies the protocol-version header rules and returns the effective version.
    fn check_version(
        &self,
        headers: &HeaderMap,
        meta: Option<&SessionMeta>,
    ) -> Result<String, Response> {
        let requested = header_str(headers, HEADER_PROTOCOL_VERSION);
        if let Some(v) = requested {
            if !is_supported_protocol_version(v) {
                return Err(plain(
                    StatusCode::BAD_REQUEST,
                    &format!("Bad Request: unsupported protocol version {v}"),
                ));
            }
        }
        match (meta, requested) {
            (Some(meta), Some(v)) if v != meta.protocol_version => Err(plain(
                StatusCode::BAD_REQUEST,
                "Bad Request: protocol version does not match the session",
            )),
            (Some(meta), None)
                if ProtocolGeneration::of(&meta.protocol_version) == ProtocolGeneration::Latest =>
            {
                Err(plain(
                    StatusCode::BAD_REQUEST,
                    "Bad Request: missing mcp-protocol-version header",
                ))
            }
            (Some(meta), _) => Ok(meta.protocol_version.clone()),
            (None, v) => Ok(v.unwrap_or(LEGACY_PROTOCOL_VERSION).to_string()),
        }
    }

    fn log_event(
        &self,
        session: Option<&SessionId>,
        stream: &StreamId,
        message: &Message,
    ) -> Option<EventId> {
        let session = session.filter(|_| self.options.sessions)?;
        match self.store.append(session, stream, message.clone()) {
            Ok(id) => Some(id),
            Err(e) => {
                self.logger
                    .debug(&format!("event for {session}/{stream} not logged: {e}"));
                None
            }
        }
    }

    /// Logs and writes `message` on the stream of `request`. With `log_without_writer` the
    /// event is still logged for later replay when the stream is gone.
    ///
    /// Without a writer id the request id alone must identify the stream, which only holds
    /// inside a session.
    fn emit_on_request_stream(
        &self,
        session: Option<&SessionId>,
        writer: Option<u64>,
        request: &RequestId,
        message: &Message,
        log_without_writer: bool,
    ) -> Result<(), Error> {
        let streams = self.request_streams.lock();
        let found = match writer {
            Some(writer) => streams.get(&StreamKey {
                session: session.cloned(),
                writer,
                request: request.clone(),
            }),
            None if session.is_some() => streams
                .iter()
                .find(|(k, _)| k.session.as_ref() == session && &k.request == request)
                .map(|(_, w)| w),
            None => None,
        }
        .filter(|w| !w.is_closed());
        if found.is_none() && !log_without_writer {
            return Err(Error::NoStream(format!("request {request}")));
        }
        let id = self.log_event(session, &StreamId::for_request(request), message);
        match found {
            Some(w) => w.write(id.as_ref(), message),
            None => Err(Error::NoStream(format!("request {request}"))),
        }
    }

    fn deliver(&self, message: Message, route: &Route) -> Result<(), Error> {
        if let Some(request) = &route.related_request {
            let sent = self.emit_on_request_stream(
                route.session_id.as_ref(),
                route.stream,
                request,
                &message,
                false,
            );
            if sent.is_ok() {
                return Ok(());
            }
        }

        let session = match &route.session_id {
            Some(sid) if !route.global => sid,
            _ => {
                if matches!(message, Message::Request(_)) {
                    return Err(Error::NoStream("a request cannot be broadcast".to_string()));
                }
                let standing = self.standing.lock();
                for (sid, writer) in standing.iter() {
                    if route.session_id.as_ref() == Some(sid) || writer.is_closed() {
                        continue;
                    }
                    let id = self.log_event(Some(sid), &StreamId::standing(), &message);
                    let _ = writer.write(id.as_ref(), &message);
                }
                return Ok(());
            }
        };

        let standing = self.standing.lock();
        match standing.get(session).filter(|w| !w.is_closed()) {
            Some(writer) => {
                let id = self.log_event(Some(session), &StreamId::standing(), &message);
                writer.write(id.as_ref(), &message)
            }
            None if matches!(message, Message::Request(_)) => Err(Error::NoStream(format!(
                "session {session} has no open stream"
            ))),
            None => {
                if !self.store.has(session) {
                    return Err(Error::SessionNotFound(session.to_string()));
                }
                // Kept for a later GET with last-event-id.
                self.log_event(Some(session), &StreamId::standing(), &message);
                Ok(())
            }
        }
    }

    async fn initialize(&self, request: Request, auth: Option<AuthInfo>) -> Response {
        let params: Option<InitializeParams> = request
            .params
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok());
        let session_id = self.options.sessions.then(SessionId::generate);
        let ctx = DispatchContext {
            session_id: session_id.clone(),
            protocol_version: None,
            client_capabilities: params
                .as_ref()
                .map(|p| p.capabilities.clone())
                .unwrap_or_default(),
            auth,
            stream: None,
        };

        let Some(response) = self.server.dispatch(Message::Request(request), &ctx).await else {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };
        let negotiated = response
            .result
            .as_ref()
            .and_then(|r| r.get("protocolVersion"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match (session_id, negotiated) {
            (Some(sid), Some(version)) => {
                let mut meta = SessionMeta::new(sid.clone(), version);
                if let Some(p) = params {
                    meta.client_info = Some(p.client_info);
                    meta.client_capabilities = p.capabilities;
                }
                if let Err(e) = self.store.create(meta) {
                    self.logger
                        .error(&format!("failed to store session {sid}: {e}"));
                    return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
                }
                self.logger.info(&format!("session {sid} created"));
                json_response(StatusCode::OK, &response, Some(&sid))
            }
            _ => json_response(StatusCode::OK, &response, None),
        }
    }

    fn mark_initialized(&self, meta: &SessionMeta) {
        let mut meta = meta.clone();
        meta.initialized = true;
        if let Err(e) = self.store.update(meta) {
            self.logger
                .debug(&format!("could not mark session initialized: {e}"));
        }
    }

    async fn answer_json(
        &self,
        requests: Vec<Request>,
        ctx: &DispatchContext,
        batch: bool,
    ) -> Response {
        let responses: Vec<RpcResponse> = futures::future::join_all(
            requests
                .into_iter()
                .map(|r| self.server.dispatch(Message::Request(r), ctx)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let session = ctx.session_id.as_ref();
        if batch {
            return json_response(StatusCode::OK, &responses, session);
        }
        match responses.into_iter().next() {
            Some(response) => json_response(StatusCode::OK, &response, session),
            None => with_session(StatusCode::ACCEPTED.into_response(), session),
        }
    }

    fn stream_requests(
        self: &Arc<Self>,
        requests: Vec<Request>,
        mut ctx: DispatchContext,
    ) -> Response {
        let session = ctx.session_id.clone();
        let (writer, body) = SseWriter::open({
            let weak = Arc::downgrade(self);
            move |writer_id| {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .request_streams
                        .lock()
                        .retain(|_, w| w.id() != writer_id);
                }
            }
        });

        let writer_id = writer.id();
        ctx.stream = Some(writer_id);
        {
            let mut streams = self.request_streams.lock();
            for r in &requests {
                streams.insert(
                    StreamKey {
                        session: session.clone(),
                        writer: writer_id,
                        request: r.id.clone(),
                    },
                    writer.clone(),
                );
            }
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let mut pending: FuturesUnordered<_> = requests
                .into_iter()
                .map(|r| {
                    let inner = inner.clone();
                    let ctx = ctx.clone();
                    async move {
                        let id = r.id.clone();
                        (id, inner.server.dispatch(Message::Request(r), &ctx).await)
                    }
                })
                .collect();

            while let Some((id, response)) = pending.next().await {
                if let Some(response) = response {
                    if let Err(e) = inner.emit_on_request_stream(
                        ctx.session_id.as_ref(),
                        Some(writer_id),
                        &id,
                        &Message::Response(response),
                        true,
                    ) {
                        inner
                            .logger
                            .debug(&format!("response for {id} not streamed: {e}"));
                    }
                }
                inner.request_streams.lock().remove(&StreamKey {
                    session: ctx.session_id.clone(),
                    writer: writer_id,
                    request: id,
                });
            }
            writer.close();
        });

        sse_response(body, session.as_ref())
    }

    fn open_standing(
        &self,
        sid: &SessionId,
        writer: Arc<SseWriter>,
        resume: Option<&EventId>,
    ) -> Result<(), Response> {
        let mut standing = self.standing.lock();
        if standing.get(sid).is_some_and(|w| !w.is_closed()) {
            return Err(plain(
                StatusCode::CONFLICT,
                "Conflict: only one standing stream is allowed per session",
            ));
        }

        let replayed = match resume {
            Some(id) => self
                .store
                .replay(sid, &id.stream, id.seq, UnknownSession::Reject, writer.as_ref())
                .map_err(|_| bad_session())?,
            None => 0,
        };
        if replayed == 0 {
            let hello = Message::Notification(Notification::new(
                CONNECTION_ESTABLISHED,
                Some(serde_json::json!({ "sessionId": sid })),
            ));
            let _ = writer.write(None, &hello);
        }
        standing.insert(sid.clone(), writer);
        Ok(())
    }

    fn close_session(&self, sid: &SessionId) {
        let standing = self.standing.lock().remove(sid);
        if let Some(writer) = standing {
            writer.close();
        }

        let request_writers: Vec<Arc<SseWriter>> = {
            let mut streams = self.request_streams.lock();
            let keys: Vec<StreamKey> = streams
                .keys()
                .filter(|k| k.session.as_ref() == Some(sid))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| streams.remove(k)).collect()
        };
        for writer in request_writers {
            writer.close();
        }

        let cancelled = self.server.bridge().cancel_session(sid);
        self.store.delete(sid);
        self.logger.info(&format!(
            "session {sid} closed, {cancelled} pending client request(s) cancelled"
        ));
    }
}

async fn handle_post(
    State(inner): State<Arc<Inner>>,
    auth: Option<Extension<AuthInfo>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(r) = inner.check_origin_and_host(&headers) {
        return r;
    }
    let auth = auth.map(|Extension(a)| a);

    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return rpc_error(ErrorCode::ParseError, format!("Parse error: {e}")),
    };
    let (batch, raw) = match value {
        Value::Array(items) => (true, items),
        other => (false, vec![other]),
    };
    if raw.is_empty() {
        return rpc_error(ErrorCode::InvalidRequest, "Invalid Request: empty batch".into());
    }
    let messages = match raw
        .into_iter()
        .map(serde_json::from_value::<Message>)
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(m) => m,
        Err(e) => return rpc_error(ErrorCode::InvalidRequest, format!("Invalid Request: {e}")),
    };

    if messages.iter().any(Message::is_initialize) {
        if batch {
            return rpc_error(
                ErrorCode::InvalidRequest,
                "Invalid Request: initialize must not be part of a batch".into(),
            );
        }
        if let Some(Message::Request(request)) = messages.into_iter().next() {
            return inner.initialize(request, auth).await;
        }
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let meta = match inner.session_for(&headers) {
        Ok(m) => m,
        Err(r) => return r,
    };
    let version = match inner.check_version(&headers, meta.as_ref()) {
        Ok(v) => v,
        Err(r) => return r,
    };
    if batch && ProtocolGeneration::of(&version) == ProtocolGeneration::Latest {
        return rpc_error(
            ErrorCode::InvalidRequest,
            format!("Invalid Request: batching is not supported by protocol version {version}"),
        );
    }

    let ctx = DispatchContext {
        session_id: meta.as_ref().map(|m| m.id.clone()),
        protocol_version: Some(version),
        client_capabilities: meta
            .as_ref()
            .map(|m| m.client_capabilities.clone())
            .unwrap_or_default(),
        auth,
        stream: None,
    };

    let mut requests = Vec::new();
    for message in messages {
        match message {
            Message::Request(r) => requests.push(r),
            other => {
                if let (Message::Notification(n), Some(meta)) = (&other, meta.as_ref()) {
                    if n.method == "notifications/initialized" {
                        inner.mark_initialized(meta);
                    }
                }
                inner.server.dispatch(other, &ctx).await;
            }
        }
    }

    if requests.is_empty() {
        return with_session(StatusCode::ACCEPTED.into_response(), ctx.session_id.as_ref());
    }
    if accepts_event_stream(&headers) {
        inner.stream_requests(requests, ctx)
    } else {
        inner.answer_json(requests, &ctx, batch).await
    }
}

async fn handle_get(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    if let Err(r) = inner.check_origin_and_host(&headers) {
        return r;
    }
    if !inner.options.sessions {
        return stateless_not_allowed();
    }
    if !accepts_event_stream(&headers) {
        return plain(
            StatusCode::BAD_REQUEST,
            "Bad Request: GET requires Accept: text/event-stream",
        );
    }
    let meta = match inner.session_for(&headers) {
        Ok(Some(m)) => m,
        Ok(None) => return bad_session(),
        Err(r) => return r,
    };
    if let Err(r) = inner.check_version(&headers, Some(&meta)) {
        return r;
    }
    let resume = match header_str(&headers, HEADER_LAST_EVENT_ID) {
        Some(raw) => match raw.parse::<EventId>() {
            Ok(id) => Some(id),
            Err(_) => return plain(StatusCode::BAD_REQUEST, "Bad Request: malformed last-event-id"),
        },
        None => None,
    };

    let sid = meta.id;
    let (writer, body) = SseWriter::open({
        let weak = Arc::downgrade(&inner);
        let sid = sid.clone();
        move |writer_id| {
            if let Some(inner) = weak.upgrade() {
                let mut standing = inner.standing.lock();
                if standing.get(&sid).is_some_and(|w| w.id() == writer_id) {
                    standing.remove(&sid);
                }
            }
        }
    });

    match inner.open_standing(&sid, writer, resume.as_ref()) {
        Ok(()) => sse_response(body, Some(&sid)),
        Err(r) => r,
    }
}

async fn handle_delete(State(inner): State<Arc<Inner>>, headers: HeaderMap) -> Response {
    if let Err(r) = inner.check_origin_and_host(&headers) {
        return r;
    }
    if !inner.options.sessions {
        return stateless_not_allowed();
    }
    let meta = match inner.session_for(&headers) {
        Ok(Some(m)) => m,
        Ok(None) => return bad_session(),
        Err(r) => return r,
    };
    if let Err(r) = inner.check_version(&headers, Some(&meta)) {
        return r;
    }
    inner.close_session(&meta.id);
    StatusCode::OK.into_response()
}
