//! Session metadata and replayable event logs.
//!
//! Every session keeps one bounded log shared by all of its streams. Sequence numbers are
//! counted per stream.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::protocol::RequestId;
use crate::transport::sse::StreamWriter;
use crate::transport::Message;
use crate::types::{ClientCapabilities, Implementation};
use crate::Error;

/// Events kept per session, across all of its streams, before the oldest are evicted.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Opaque session identifier, sent to clients in the `mcp-session-id` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    /// A fresh random (UUID v4) id.
    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a substream within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    const STANDING: &'static str = "session";

    /// The long-lived stream opened by GET.
    pub fn standing() -> Self {
        StreamId(Self::STANDING.to_string())
    }

    /// The stream carrying one streamed POST request.
    ///
    /// Numeric and string ids get distinct names, so `5` and `"5"` never share a log.
    pub fn for_request(id: &RequestId) -> Self {
        match id {
            RequestId::Number(n) => StreamId(format!("request-n{n}")),
            RequestId::String(s) => StreamId(format!("request-s{s}")),
        }
    }

    pub fn is_standing(&self) -> bool {
        self.0 == Self::STANDING
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of an event. Rendered as `<seq>#<stream>` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    pub seq: u64,
    pub stream: StreamId,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.seq, self.stream)
    }
}

impl FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seq, stream) = s
            .split_once('#')
            .ok_or_else(|| Error::Other(format!("malformed event id: {s}")))?;
        let seq = seq
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::Other(format!("malformed event id: {s}")))?;
        if stream.is_empty() {
            return Err(Error::Other(format!("malformed event id: {s}")));
        }
        Ok(EventId {
            seq,
            stream: StreamId(stream.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: EventId,
    pub message: Message,
}

/// What a session knows about its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: SessionId,
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
    #[serde(default)]
    pub client_capabilities: ClientCapabilities,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub initialized: bool,
}

impl SessionMeta {
    pub fn new(id: SessionId, protocol_version: impl Into<String>) -> Self {
        Self {
            id,
            protocol_version: protocol_version.into(),
            client_info: None,
            client_capabilities: ClientCapabilities::default(),
            created_at: Utc::now(),
            initialized: false,
        }
    }
}

/// How [`SessionStore::replay`] treats a session id it does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownSession {
    /// Replay nothing and report zero events.
    Ignore,
    /// Fail with [`Error::SessionNotFound`].
    Reject,
}

/// Storage for session metadata and their event logs.
///
/// Methods are synchronous so callers can append and write under one lock.
pub trait SessionStore: Send + Sync {
    /// Registers a new session. Fails if the id is already taken.
    fn create(&self, meta: SessionMeta) -> Result<(), Error>;

    fn get(&self, id: &SessionId) -> Option<SessionMeta>;

    fn has(&self, id: &SessionId) -> bool {
        self.get(id).is_some()
    }

    /// Replaces the metadata of an existing session.
    fn update(&self, meta: SessionMeta) -> Result<(), Error>;

    /// Removes the session and every event it logged. Returns whether it existed.
    fn delete(&self, id: &SessionId) -> bool;

    /// Logs `message` on `stream` and returns its freshly assigned id.
    fn append(&self, session: &SessionId, stream: &StreamId, message: Message)
        -> Result<EventId, Error>;

    /// Writes every retained event of `stream` with a sequence number above `after`, in order.
    ///
    /// Stops without error as soon as the writer refuses an event. Returns the number of
    /// events written.
    fn replay(
        &self,
        session: &SessionId,
        stream: &StreamId,
        after: u64,
        on_unknown: UnknownSession,
        writer: &dyn StreamWriter,
    ) -> Result<usize, Error>;
}

struct SessionEntry {
    meta: SessionMeta,
    /// Next sequence number per stream. Request streams are forgotten once none of their
    /// events is retained.
    next_seq: HashMap<StreamId, u64>,
    events: VecDeque<StoredEvent>,
}

impl SessionEntry {
    fn new(meta: SessionMeta) -> Self {
        Self {
            meta,
            next_seq: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    fn evict_oldest(&mut self) {
        let Some(evicted) = self.events.pop_front() else {
            return;
        };
        let stream = evicted.id.stream;
        if !stream.is_standing() && !self.events.iter().any(|e| e.id.stream == stream) {
            self.next_seq.remove(&stream);
        }
    }
}

/// Reference [`SessionStore`] keeping everything in process memory.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    capacity: usize,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl InMemorySessionStore {
    /// `capacity` bounds the events retained per session; it is clamped to at least one.
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Number of events currently retained for `session`, over all its streams.
    pub fn retained_events(&self, session: &SessionId) -> usize {
        self.sessions
            .read()
            .get(session)
            .map_or(0, |entry| entry.events.len())
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, meta: SessionMeta) -> Result<(), Error> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&meta.id) {
            return Err(Error::Other(format!("session {} already exists", meta.id)));
        }
        sessions.insert(meta.id.clone(), SessionEntry::new(meta));
        Ok(())
    }

    fn get(&self, id: &SessionId) -> Option<SessionMeta> {
        self.sessions.read().get(id).map(|e| e.meta.clone())
    }

    fn has(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    fn update(&self, meta: SessionMeta) -> Result<(), Error> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&meta.id) {
            Some(entry) => {
                entry.meta = meta;
                Ok(())
            }
            None => Err(Error::SessionNotFound(meta.id.to_string())),
        }
    }

    fn delete(&self, id: &SessionId) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    fn append(
        &self,
        session: &SessionId,
        stream: &StreamId,
        message: Message,
    ) -> Result<EventId, Error> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(session)
            .ok_or_else(|| Error::SessionNotFound(session.to_string()))?;
        let next = entry.next_seq.entry(stream.clone()).or_insert(1);
        let id = EventId {
            seq: *next,
            stream: stream.clone(),
        };
        *next += 1;

        // Push before evicting so the stream being written keeps its counter.
        entry.events.push_back(StoredEvent {
            id: id.clone(),
            message,
        });
        while entry.events.len() > self.capacity {
            entry.evict_oldest();
        }
        Ok(id)
    }

    fn replay(
        &self,
        session: &SessionId,
        stream: &StreamId,
        after: u64,
        on_unknown: UnknownSession,
        writer: &dyn StreamWriter,
    ) -> Result<usize, Error> {
        let pending: Vec<StoredEvent> = {
            let sessions = self.sessions.read();
            let Some(entry) = sessions.get(session) else {
                return match on_unknown {
                    UnknownSession::Ignore => Ok(0),
                    UnknownSession::Reject => Err(Error::SessionNotFound(session.to_string())),
                };
            };
            entry
                .events
                .iter()
                .filter(|e| &e.id.stream == stream && e.id.seq > after)
                .cloned()
                .collect()
        };

        let mut written = 0;
        for event in &pending {
            if writer.write(Some(&event.id), &event.message).is_err() {
                tracing::debug!(session = %session, seq = event.id.seq, "replay stopped: writer closed");
                break;
            }
            written += 1;
        }
        Ok(written)
    }
}
