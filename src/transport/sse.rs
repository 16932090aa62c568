//! Server-sent event framing and the stream writer abstraction.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::store::EventId;
use crate::transport::Message;
use crate::Error;

/// One open server-to-client push channel.
pub trait StreamWriter: Send + Sync {
    /// Encodes and flushes one event. `id` is omitted from the frame when `None`.
    fn write(&self, id: Option<&EventId>, message: &Message) -> Result<(), Error>;

    /// Ends the stream. Further writes fail.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Formats one SSE frame: `id: <id>\ndata: <data>\n\n`.
pub fn encode_event(id: Option<&EventId>, data: &str) -> String {
    let mut frame = String::with_capacity(data.len() + 32);
    if let Some(id) = id {
        frame.push_str("id: ");
        frame.push_str(&id.to_string());
        frame.push('\n');
    }
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

/// A [`StreamWriter`] feeding an HTTP response body through an unbounded channel.
pub struct SseWriter {
    id: u64,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

struct CloseGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(on_close) = self.0.take() {
            on_close();
        }
    }
}

impl SseWriter {
    /// Opens a writer and the response body it feeds.
    ///
    /// `on_close` runs exactly once, when the body is dropped: after the writer is closed and
    /// the body drained, or when the client disconnects.
    pub fn open<F>(on_close: F) -> (Arc<SseWriter>, Body)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let id = NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let guard = CloseGuard(Some(Box::new(move || on_close(id))));

        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = rx.recv().await {
                yield Ok::<Bytes, Infallible>(chunk);
            }
        };

        let writer = Arc::new(SseWriter {
            id,
            tx: Mutex::new(Some(tx)),
        });
        (writer, Body::from_stream(stream))
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl StreamWriter for SseWriter {
    fn write(&self, id: Option<&EventId>, message: &Message) -> Result<(), Error> {
        let data = serde_json::to_string(message)?;
        let frame = encode_event(id, &data);
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx
                .send(Bytes::from(frame))
                .map_err(|_| Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// A decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub data: String,
}

/// Decodes every complete, blank-line-delimited event in `buf`.
///
/// Only `id:` and `data:` fields are kept; comments and unknown fields are skipped.
pub fn decode_sse_events(buf: &str) -> Vec<SseFrame> {
    let mut out = Vec::new();
    let mut id: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in buf.split('\n') {
        let l = line.trim_end_matches('\r');

        if l.is_empty() {
            if !data_lines.is_empty() {
                out.push(SseFrame {
                    id: id.take(),
                    data: data_lines.join("\n"),
                });
                data_lines.clear();
            }
            id = None;
            continue;
        }

        if l.starts_with(':') {
            continue;
        }

        if let Some(rest) = l.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = l.strip_prefix("id:") {
            id = Some(rest.trim_start().to_string());
        }
    }

    if !data_lines.is_empty() {
        out.push(SseFrame {
            id,
            data: data_lines.join("\n"),
        });
    }

    out
}

/// Incremental decoder for a byte stream of SSE frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    /// Feeds a chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk).replace("\r\n", "\n"));
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let raw: String = self.buf.drain(..pos + 2).collect();
            frames.extend(decode_sse_events(&raw));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Notification;
    use crate::store::StreamId;
    use futures::StreamExt;

    #[test]
    fn encodes_id_and_data() {
        let id = EventId {
            seq: 3,
            stream: StreamId::standing(),
        };
        assert_eq!(
            encode_event(Some(&id), "{\"a\":1}"),
            "id: 3#session\ndata: {\"a\":1}\n\n"
        );
        assert_eq!(encode_event(None, "{}"), "data: {}\n\n");
    }

    #[test]
    fn decodes_single_event() {
        let s = "event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n";
        let ev = decode_sse_events(s);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].data, "{\"jsonrpc\":\"2.0\"}");
        assert_eq!(ev[0].id, None);
    }

    #[test]
    fn keeps_event_ids_and_joins_multiline_data() {
        let s = "id: 1#session\ndata: a\ndata: b\n\n";
        let ev = decode_sse_events(s);
        assert_eq!(ev[0].id.as_deref(), Some("1#session"));
        assert_eq!(ev[0].data, "a\nb");
    }

    #[test]
    fn incremental_decoder_waits_for_frame_end() {
        let mut dec = SseDecoder::default();
        assert!(dec.push(b"id: 1#s\nda").is_empty());
        let frames = dec.push(b"ta: {}\n\ndata: x");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
        assert_eq!(dec.push(b"\n\n")[0].data, "x");
    }

    #[tokio::test]
    async fn writer_feeds_body_and_runs_close_hook_once() {
        let closed = Arc::new(AtomicU64::new(0));
        let hook = closed.clone();
        let (writer, body) = SseWriter::open(move |_| {
            hook.fetch_add(1, Ordering::SeqCst);
        });

        let msg = Message::Notification(Notification::new("notifications/test", None));
        writer.write(None, &msg).unwrap();
        writer.close();
        assert!(writer.is_closed());
        assert!(writer.write(None, &msg).is_err());

        let mut stream = body.into_data_stream();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(
            String::from_utf8(first.to_vec()).unwrap(),
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/test\"}\n\n"
        );
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_body_marks_writer_closed() {
        let (writer, body) = SseWriter::open(|_| {});
        drop(body);
        assert!(writer.is_closed());
    }
}
