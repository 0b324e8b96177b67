//! WebSocket transport over `tokio-tungstenite`.
//!
//! The sink half lives in a writer task so `close()` can stay synchronous;
//! the session side only ever queues commands. The read half is boxed so the
//! transport type is independent of the underlying socket.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::TransportError;
use crate::transport::{LinkState, TransportBackend, TransportEvent};

enum WriterCommand {
    Send(Message),
    Close,
}

type WsReader = BoxStream<'static, Result<Message, tungstenite::Error>>;

struct WsInner {
    writer: mpsc::UnboundedSender<WriterCommand>,
    reader: AsyncMutex<WsReader>,
    state_tx: watch::Sender<LinkState>,
    open_delivered: AtomicBool,
}

/// One side of a WebSocket link. Cloning shares the side.
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Wraps an already-established WebSocket stream. The handshake is the
    /// caller's business (`tokio_tungstenite::connect_async` or
    /// `accept_async`), so the link is born `Open`.
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, reader) = ws.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            use futures::SinkExt;
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Send(message) => {
                        if let Err(error) = sink.send(message).await {
                            tracing::warn!(%error, "websocket write failed");
                            break;
                        }
                    }
                    WriterCommand::Close => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        Self {
            inner: Arc::new(WsInner {
                writer: writer_tx,
                reader: AsyncMutex::new(reader.boxed()),
                state_tx: watch::Sender::new(LinkState::Open),
                open_delivered: AtomicBool::new(false),
            }),
        }
    }
}

impl TransportBackend for WebSocketTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if *self.inner.state_tx.borrow() == LinkState::Closed {
            return Err(TransportError::Closed);
        }
        self.inner
            .writer
            .send(WriterCommand::Send(Message::Text(frame)))
            .map_err(|_| TransportError::Closed)
    }

    async fn next_event(&self) -> TransportEvent {
        if *self.inner.state_tx.borrow() == LinkState::Closed {
            return TransportEvent::Closed;
        }
        if !self.inner.open_delivered.swap(true, Ordering::SeqCst) {
            return TransportEvent::Open;
        }

        let mut reader = self.inner.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(text),
                Some(Ok(Message::Close(_))) | None => {
                    drop(reader);
                    self.close();
                    return TransportEvent::Closed;
                }
                Some(Ok(other)) => {
                    tracing::trace!(kind = ?other, "skipping non-text websocket frame");
                }
                Some(Err(error)) => return TransportEvent::Error(TransportError::WebSocket(error)),
            }
        }
    }

    fn state(&self) -> LinkState {
        *self.inner.state_tx.borrow()
    }

    fn close(&self) {
        let previous = self.inner.state_tx.send_replace(LinkState::Closed);
        if previous != LinkState::Closed {
            let _ = self.inner.writer.send(WriterCommand::Close);
        }
    }
}
