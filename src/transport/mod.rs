use async_trait::async_trait;
use futures::Stream;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

use crate::protocol::{Notification, Request, RequestId, Response};
use crate::store::SessionId;
use crate::Error;

/// A message that can be sent over a transport
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    pub fn is_initialize(&self) -> bool {
        matches!(self, Message::Request(r) if r.method == "initialize")
    }
}

// Custom visitor: classify by the presence of `id`, `method` and `result`/`error`.
struct MessageVisitor;

impl<'de> Visitor<'de> for MessageVisitor {
    type Value = Message;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a valid JSON-RPC 2.0 message")
    }

    fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let mut obj = serde_json::Map::new();
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value()?;
            obj.insert(key, value);
        }
        let value = serde_json::Value::Object(obj);

        if value.get("jsonrpc").and_then(|v| v.as_str()) != Some(crate::JSONRPC_VERSION) {
            return Err(de::Error::custom("invalid message: jsonrpc must be \"2.0\""));
        }

        if value.get("id").is_some() {
            if value.get("method").is_some() {
                Ok(Message::Request(
                    Request::deserialize(value).map_err(de::Error::custom)?,
                ))
            } else if value.get("result").is_some() || value.get("error").is_some() {
                Ok(Message::Response(
                    Response::deserialize(value).map_err(de::Error::custom)?,
                ))
            } else {
                Err(de::Error::custom(
                    "invalid message: 'id' present without 'method' or 'result/error'",
                ))
            }
        } else if value.get("method").is_some() {
            Ok(Message::Notification(
                Notification::deserialize(value).map_err(de::Error::custom)?,
            ))
        } else {
            Err(de::Error::custom("invalid message: missing 'id' and 'method'"))
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(MessageVisitor)
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Message::Request(req) => {
                map.serialize_entry("jsonrpc", &req.jsonrpc)?;
                map.serialize_entry("id", &req.id)?;
                map.serialize_entry("method", &req.method)?;
                if let Some(ref params) = req.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Response(resp) => {
                map.serialize_entry("jsonrpc", &resp.jsonrpc)?;
                map.serialize_entry("id", &resp.id)?;
                if let Some(ref result) = resp.result {
                    map.serialize_entry("result", result)?;
                }
                if let Some(ref error) = resp.error {
                    map.serialize_entry("error", error)?;
                }
            }
            Message::Notification(notif) => {
                map.serialize_entry("jsonrpc", &notif.jsonrpc)?;
                map.serialize_entry("method", &notif.method)?;
                if let Some(ref params) = notif.params {
                    map.serialize_entry("params", params)?;
                }
            }
        }
        map.end()
    }
}

/// Trait for implementing MCP transports
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a message over the transport
    async fn send(&self, message: Message) -> Result<(), Error>;

    /// Receive messages from the transport
    fn receive(&self) -> Pin<Box<dyn Stream<Item = Result<Message, Error>> + Send>>;

    /// Close the transport
    async fn close(&self) -> Result<(), Error>;
}

/// Where a server-originated message should go.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Route {
    /// Session the message belongs to, if any.
    pub session_id: Option<SessionId>,
    /// The client request whose handler produced this message.
    pub related_request: Option<RequestId>,
    /// Transport-assigned id of the response stream `related_request` arrived on. Request ids
    /// are only unique per client, so without a session this is what tells two callers apart.
    pub stream: Option<u64>,
    /// Broadcast to every open standing stream except `session_id`'s.
    pub global: bool,
}

impl Route {
    pub fn global() -> Self {
        Route {
            global: true,
            ..Route::default()
        }
    }
}

/// Delivery path for server-originated notifications and requests.
///
/// Registered once on the server by whichever transport serves it.
pub trait OutboundSender: Send + Sync {
    fn send(&self, message: Message, route: &Route) -> Result<(), Error>;
}

pub mod http;
pub mod http_client;
pub mod sse;
pub mod stdio;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_messages_by_shape() {
        let req: Message =
            serde_json::from_value(json!({"jsonrpc":"2.0","id":1,"method":"ping"})).unwrap();
        let notif: Message =
            serde_json::from_value(json!({"jsonrpc":"2.0","method":"notifications/initialized"}))
                .unwrap();
        let resp: Message =
            serde_json::from_value(json!({"jsonrpc":"2.0","id":"a","result":{}})).unwrap();
        assert!(matches!(req, Message::Request(_)));
        assert!(matches!(notif, Message::Notification(_)));
        assert!(matches!(resp, Message::Response(_)));
    }

    #[test]
    fn rejects_malformed_envelopes() {
        for bad in [
            json!({"jsonrpc":"2.0","id":1}),
            json!({"jsonrpc":"2.0"}),
            json!({"jsonrpc":"1.0","id":1,"method":"ping"}),
            json!({"id":1,"method":"ping"}),
        ] {
            assert!(serde_json::from_value::<Message>(bad).is_err());
        }
    }

    #[test]
    fn serializes_without_extra_fields() {
        let msg = Message::Notification(Notification::new("notifications/progress", None));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, json!({"jsonrpc":"2.0","method":"notifications/progress"}));
    }
}
