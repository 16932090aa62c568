use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdout},
    sync::broadcast::{self, error::RecvError},
};

use crate::{
    error::Error,
    transport::{Message, Transport},
};

type Incoming = Result<Message, Error>;

/// Line-delimited JSON-RPC over a pair of async streams.
///
/// Works for either role: a server reading its own stdin, or a client talking to a child
/// process through its pipes.
pub struct StdioTransport<W> {
    /// A mutex-protected writer for sending messages.
    writer: tokio::sync::Mutex<W>,
    /// The first receiver, handed out by the first `receive()` so nothing read early is lost.
    receiver: Mutex<Option<broadcast::Receiver<Incoming>>>,
    sender: broadcast::Sender<Incoming>,
}

impl StdioTransport<Stdout> {
    /// A transport over this process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::with_streams(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<W> StdioTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a new StdioTransport by providing a read and a write stream.
    ///
    /// Spawns a reader task; must be called inside a Tokio runtime.
    pub fn with_streams<R>(read: R, write: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (sender, receiver) = broadcast::channel(100);
        let writer = tokio::sync::Mutex::new(write);

        let sender_clone = sender.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        tracing::debug!("EOF reached, closing the incoming stream");
                        let _ = sender_clone.send(Err(Error::ConnectionClosed));
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim_end();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let message = serde_json::from_str::<Message>(trimmed)
                            .map_err(|err| Error::Serialization(err.to_string()));
                        let _ = sender_clone.send(message);
                    }
                    Err(err) => {
                        let _ = sender_clone.send(Err(Error::Io(err.to_string())));
                        break;
                    }
                }
            }
        });

        StdioTransport {
            writer,
            receiver: Mutex::new(Some(receiver)),
            sender,
        }
    }
}

#[async_trait]
impl<W> Transport for StdioTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Sends a message by writing JSON to the underlying writer stream,
    /// followed by a newline, and then flushing.
    async fn send(&self, message: Message) -> Result<(), Error> {
        let json = serde_json::to_string(&message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Provides a stream of incoming messages. The stream ends after the first
    /// `ConnectionClosed` or I/O error.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = Result<Message, Error>> + Send>> {
        let rx = self
            .receiver
            .lock()
            .take()
            .unwrap_or_else(|| self.sender.subscribe());
        Box::pin(futures::stream::unfold(
            (rx, false),
            |(mut rx, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match rx.recv().await {
                        Ok(item) => {
                            let terminal =
                                matches!(item, Err(Error::ConnectionClosed) | Err(Error::Io(_)));
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

    async fn close(&self) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}
