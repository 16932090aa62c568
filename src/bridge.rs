//! Server-to-client requests issued while a handler is running.
//!
//! A handler that needs the client (an elicitation form, a sampling call) goes through
//! [`RequestBridge::request`]: the request is pushed over the registered
//! [`OutboundSender`], parked in the pending table, and completed when the client's
//! response comes back through [`RequestBridge::resolve`].

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{Request, RequestId, Response};
use crate::store::SessionId;
use crate::transport::{Message, OutboundSender, Route};
use crate::types::ClientCapabilities;
use crate::Error;

/// Capabilities a client must announce before the server may use them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCapability {
    Elicitation,
    Sampling,
    Roots,
}

impl ClientCapability {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCapability::Elicitation => "elicitation",
            ClientCapability::Sampling => "sampling",
            ClientCapability::Roots => "roots",
        }
    }

    pub fn supported_by(&self, caps: &ClientCapabilities) -> bool {
        match self {
            ClientCapability::Elicitation => caps.elicitation.is_some(),
            ClientCapability::Sampling => caps.sampling.is_some(),
            ClientCapability::Roots => caps.roots.is_some(),
        }
    }
}

/// Who a bridged request goes to.
#[derive(Debug, Clone, Default)]
pub struct BridgeTarget {
    pub session_id: Option<SessionId>,
    /// The client request whose handler is asking.
    pub related_request: Option<RequestId>,
    pub related_stream: Option<u64>,
    pub client_capabilities: ClientCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    session: Option<SessionId>,
    request: RequestId,
}

type Pending = HashMap<PendingKey, oneshot::Sender<Result<Value, Error>>>;

/// Table of in-flight server-to-client requests.
pub struct RequestBridge {
    pending: Mutex<Pending>,
    timeout: Option<Duration>,
}

// Removes the pending entry when the awaiting future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<Pending>,
    key: PendingKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

impl Default for RequestBridge {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RequestBridge {
    /// `timeout` bounds how long a bridged request waits for the client. `None` waits forever.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Sends `method` to the client and waits for its result.
    ///
    /// Fails with [`Error::Capability`] before anything is sent when the client did not
    /// announce `capability`, with the delivery error when no stream can carry the request,
    /// and with [`Error::Timeout`] when the configured timeout elapses.
    pub async fn request(
        &self,
        outbound: Option<&dyn OutboundSender>,
        target: BridgeTarget,
        capability: ClientCapability,
        method: &str,
        params: Value,
    ) -> Result<Value, Error> {
        if !capability.supported_by(&target.client_capabilities) {
            return Err(Error::Capability(capability.name()));
        }
        let outbound = outbound.ok_or_else(|| Error::NoStream(method.to_string()))?;

        let id = RequestId::String(uuid::Uuid::new_v4().to_string());
        let key = PendingKey {
            session: target.session_id.clone(),
            request: id.clone(),
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            key,
        };

        let route = Route {
            session_id: target.session_id,
            related_request: target.related_request,
            stream: target.related_stream,
            global: false,
        };
        tracing::debug!(%id, method, "sending request to client");
        outbound.send(
            Message::Request(Request::new(method, Some(params), id.clone())),
            &route,
        )?;

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| Error::Timeout(format!("{method} ({id})")))?,
            None => rx.await,
        };
        outcome.map_err(|_| Error::ConnectionClosed)?
    }

    /// Completes the pending request matching `response`. Returns false when nothing was
    /// waiting for it.
    pub fn resolve(&self, session: Option<&SessionId>, response: Response) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        let key = PendingKey {
            session: session.cloned(),
            request: id,
        };
        let Some(tx) = self.pending.lock().remove(&key) else {
            tracing::debug!(request = %key.request, "response for unknown request dropped");
            return false;
        };
        let result = match response.error {
            Some(err) => Err(Error::from(err)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        tx.send(result).is_ok()
    }

    /// Fails every request pending for `session`. Returns how many were cancelled.
    pub fn cancel_session(&self, session: &SessionId) -> usize {
        let cancelled: Vec<_> = {
            let mut pending = self.pending.lock();
            let keys: Vec<PendingKey> = pending
                .keys()
                .filter(|k| k.session.as_ref() == Some(session))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k))
                .collect()
        };
        let n = cancelled.len();
        for tx in cancelled {
            let _ = tx.send(Err(Error::SessionNotFound(session.to_string())));
        }
        n
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::ResponseError;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(Message, Route)>>,
        fail: bool,
    }

    impl OutboundSender for Outbox {
        fn send(&self, message: Message, route: &Route) -> Result<(), Error> {
            if self.fail {
                return Err(Error::NoStream("test".into()));
            }
            self.sent.lock().push((message, route.clone()));
            Ok(())
        }
    }

    impl Outbox {
        fn last_request_id(&self) -> RequestId {
            match &self.sent.lock().last().unwrap().0 {
                Message::Request(r) => r.id.clone(),
                other => panic!("expected request, got {other:?}"),
            }
        }
    }

    fn elicitation_target(session: &str) -> BridgeTarget {
        BridgeTarget {
            session_id: Some(SessionId::new(session)),
            related_request: Some(RequestId::Number(1)),
            related_stream: None,
            client_capabilities: ClientCapabilities {
                elicitation: Some(json!({})),
                ..ClientCapabilities::default()
            },
        }
    }

    #[tokio::test]
    async fn missing_capability_fails_without_delivery() {
        let bridge = RequestBridge::default();
        let outbox = Outbox::default();
        let err = bridge
            .request(
                Some(&outbox),
                BridgeTarget::default(),
                ClientCapability::Elicitation,
                "elicitation/create",
                json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Capability("elicitation")));
        assert!(outbox.sent.lock().is_empty());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn matching_response_completes_request() {
        let bridge = Arc::new(RequestBridge::default());
        let outbox = Arc::new(Outbox::default());

        let task = {
            let bridge = bridge.clone();
            let outbox = outbox.clone();
            tokio::spawn(async move {
                bridge
                    .request(
                        Some(&*outbox),
                        elicitation_target("s1"),
                        ClientCapability::Elicitation,
                        "elicitation/create",
                        json!({"message": "name?"}),
                    )
                    .await
            })
        };

        while outbox.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let (_, route) = outbox.sent.lock()[0].clone();
        assert_eq!(route.related_request, Some(RequestId::Number(1)));
        assert_eq!(route.session_id, Some(SessionId::new("s1")));

        let id = outbox.last_request_id();
        // Same id under another session does not match.
        assert!(!bridge.resolve(
            Some(&SessionId::new("other")),
            Response::success(id.clone(), json!({}))
        ));
        assert!(bridge.resolve(
            Some(&SessionId::new("s1")),
            Response::success(id, json!({"action": "accept"}))
        ));

        let value = task.await.unwrap().unwrap();
        assert_eq!(value["action"], "accept");
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_becomes_protocol_error() {
        let bridge = Arc::new(RequestBridge::default());
        let outbox = Arc::new(Outbox::default());
        let task = {
            let (bridge, outbox) = (bridge.clone(), outbox.clone());
            tokio::spawn(async move {
                bridge
                    .request(
                        Some(&*outbox),
                        elicitation_target("s1"),
                        ClientCapability::Elicitation,
                        "elicitation/create",
                        json!({}),
                    )
                    .await
            })
        };
        while outbox.sent.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        let id = outbox.last_request_id();
        bridge.resolve(
            Some(&SessionId::new("s1")),
            Response::error(Some(id), ResponseError::new(ErrorCode::InvalidParams, "nope")),
        );
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code(), -32602);
    }

    #[tokio::test]
    async fn delivery_failure_is_immediate() {
        let bridge = RequestBridge::default();
        let outbox = Outbox {
            fail: true,
            ..Outbox::default()
        };
        let err = bridge
            .request(
                Some(&outbox),
                elicitation_target("s1"),
                ClientCapability::Elicitation,
                "elicitation/create",
                json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoStream(_)));
        assert_eq!(bridge.pending_count(), 0);

        let err = bridge
            .request(
                None,
                elicitation_target("s1"),
                ClientCapability::Elicitation,
                "elicitation/create",
                json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoStream(_)));
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let bridge = RequestBridge::new(Some(Duration::from_millis(50)));
        let outbox = Outbox::default();
        let err = bridge
            .request(
                Some(&outbox),
                elicitation_target("s1"),
                ClientCapability::Elicitation,
                "elicitation/create",
                json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(outbox.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn session_teardown_cancels_pending_requests() {
        let bridge = Arc::new(RequestBridge::default());
        let outbox = Arc::new(Outbox::default());
        let task = {
            let (bridge, outbox) = (bridge.clone(), outbox.clone());
            tokio::spawn(async move {
                bridge
                    .request(
                        Some(&*outbox),
                        elicitation_target("s1"),
                        ClientCapability::Elicitation,
                        "elicitation/create",
                        json!({}),
                    )
                    .await
            })
        };
        while bridge.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bridge.cancel_session(&SessionId::new("other")), 0);
        assert_eq!(bridge.cancel_session(&SessionId::new("s1")), 1);
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn dropped_waiter_removes_pending_entry() {
        let bridge = Arc::new(RequestBridge::default());
        let outbox = Arc::new(Outbox::default());
        let task = {
            let (bridge, outbox) = (bridge.clone(), outbox.clone());
            tokio::spawn(async move {
                bridge
                    .request(
                        Some(&*outbox),
                        elicitation_target("s1"),
                        ClientCapability::Elicitation,
                        "elicitation/create",
                        json!({}),
                    )
                    .await
            })
        };
        while bridge.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        assert_eq!(bridge.pending_count(), 0);
    }
}
