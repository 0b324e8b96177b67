//! Transport abstraction over bidirectional text-frame links.

use crate::error::TransportError;

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "websocket")]
pub mod websocket;

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

/// What a session observes from its transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The link finished connecting and can carry frames.
    Open,
    /// One inbound text frame.
    Message(String),
    /// A non-fatal transport fault. The link may still deliver events.
    Error(TransportError),
    /// The link is gone. Terminal; no further events follow.
    Closed,
}

/// Backend contract. Kept crate-private so backends can use plain async fns
/// without committing to object safety.
pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    fn send(
        &self,
        frame: String,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
    fn next_event(&self) -> impl std::future::Future<Output = TransportEvent> + Send;
    fn state(&self) -> LinkState;
    fn close(&self);
}

/// A bidirectional text-frame link. Enum dispatch over the compiled-in
/// backends; each variant is feature-gated.
#[derive(Debug, Clone)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "websocket")]
    WebSocket(websocket::WebSocketTransport),
}

impl Transport {
    /// A connected in-process pair, born open.
    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Self::Mem(a), Self::Mem(b))
    }

    /// An in-process pair that stays `Connecting` until
    /// [`mem::MemTransport::open_link`] is called on each side.
    #[cfg(feature = "mem")]
    pub fn mem_pair_pending() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair_pending();
        (Self::Mem(a), Self::Mem(b))
    }

    pub async fn send(&self, frame: String) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Self::Mem(t) => t.send(frame).await,
            #[cfg(feature = "websocket")]
            Self::WebSocket(t) => t.send(frame).await,
        }
    }

    pub async fn next_event(&self) -> TransportEvent {
        match self {
            #[cfg(feature = "mem")]
            Self::Mem(t) => t.next_event().await,
            #[cfg(feature = "websocket")]
            Self::WebSocket(t) => t.next_event().await,
        }
    }

    pub fn state(&self) -> LinkState {
        match self {
            #[cfg(feature = "mem")]
            Self::Mem(t) => t.state(),
            #[cfg(feature = "websocket")]
            Self::WebSocket(t) => t.state(),
        }
    }

    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Self::Mem(t) => t.close(),
            #[cfg(feature = "websocket")]
            Self::WebSocket(t) => t.close(),
        }
    }
}

#[cfg(feature = "mem")]
impl From<mem::MemTransport> for Transport {
    fn from(t: mem::MemTransport) -> Self {
        Self::Mem(t)
    }
}

#[cfg(feature = "websocket")]
impl From<websocket::WebSocketTransport> for Transport {
    fn from(t: websocket::WebSocketTransport) -> Self {
        Self::WebSocket(t)
    }
}
