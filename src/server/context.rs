use std::sync::Arc;

use serde_json::Value;

use crate::bridge::{BridgeTarget, ClientCapability, RequestBridge};
use crate::protocol::{Notification, RequestId};
use crate::store::SessionId;
use crate::transport::{Message, OutboundSender, Route};
use crate::types::{
    AuthInfo, ClientCapabilities, CreateMessageRequestParams, CreateMessageResult,
    ElicitRequestParams, ElicitResult, ProgressNotificationParams,
};
use crate::Error;

/// What the transport knows about the caller of one message.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub session_id: Option<SessionId>,
    pub protocol_version: Option<String>,
    pub client_capabilities: ClientCapabilities,
    pub auth: Option<AuthInfo>,
    /// Response stream the transport opened for this message, if any.
    pub stream: Option<u64>,
}

/// Handed to every tool, prompt and resource handler.
///
/// Lets a handler report progress, push notifications into the caller's stream and ask the
/// client for input while the call is still running.
#[derive(Clone)]
pub struct RequestContext {
    request_id: RequestId,
    session_id: Option<SessionId>,
    progress_token: Option<Value>,
    auth: Option<AuthInfo>,
    client_capabilities: ClientCapabilities,
    protocol_version: Option<String>,
    stream: Option<u64>,
    outbound: Option<Arc<dyn OutboundSender>>,
    bridge: Arc<RequestBridge>,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: RequestId,
        progress_token: Option<Value>,
        dispatch: &DispatchContext,
        outbound: Option<Arc<dyn OutboundSender>>,
        bridge: Arc<RequestBridge>,
    ) -> Self {
        Self {
            request_id,
            session_id: dispatch.session_id.clone(),
            progress_token,
            auth: dispatch.auth.clone(),
            client_capabilities: dispatch.client_capabilities.clone(),
            protocol_version: dispatch.protocol_version.clone(),
            stream: dispatch.stream,
            outbound,
            bridge,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn auth(&self) -> Option<&AuthInfo> {
        self.auth.as_ref()
    }

    pub fn client_capabilities(&self) -> &ClientCapabilities {
        &self.client_capabilities
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    pub fn progress_token(&self) -> Option<&Value> {
        self.progress_token.as_ref()
    }

    fn route(&self) -> Route {
        Route {
            session_id: self.session_id.clone(),
            related_request: Some(self.request_id.clone()),
            stream: self.stream,
            global: false,
        }
    }

    /// Sends a notification tied to this request.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| Error::NoStream(method.to_string()))?;
        outbound.send(
            Message::Notification(Notification::new(method, params)),
            &self.route(),
        )
    }

    /// Reports progress. A no-op when the caller sent no progress token.
    pub fn progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), Error> {
        let Some(token) = self.progress_token.clone() else {
            return Ok(());
        };
        let params = ProgressNotificationParams {
            progress_token: token,
            progress,
            total,
            message,
        };
        self.notify("notifications/progress", Some(serde_json::to_value(params)?))
    }

    /// Asks the client to fill in `requested_schema` (an `elicitation/create` request).
    pub async fn elicit(
        &self,
        message: impl Into<String>,
        requested_schema: Value,
    ) -> Result<ElicitResult, Error> {
        let params = ElicitRequestParams {
            message: message.into(),
            requested_schema,
        };
        let result = self
            .send_request(
                ClientCapability::Elicitation,
                "elicitation/create",
                serde_json::to_value(params)?,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Asks the client to run a model completion (a `sampling/createMessage` request).
    pub async fn sample(
        &self,
        params: CreateMessageRequestParams,
    ) -> Result<CreateMessageResult, Error> {
        let result = self
            .send_request(
                ClientCapability::Sampling,
                "sampling/createMessage",
                serde_json::to_value(params)?,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn send_request(
        &self,
        capability: ClientCapability,
        method: &str,
        params: Value,
    ) -> Result<Value, Error> {
        let target = BridgeTarget {
            session_id: self.session_id.clone(),
            related_request: Some(self.request_id.clone()),
            related_stream: self.stream,
            client_capabilities: self.client_capabilities.clone(),
        };
        self.bridge
            .request(self.outbound.as_deref(), target, capability, method, params)
            .await
    }
}
