//! In-process transport backed by paired channels. The default backend for
//! tests and demos.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::error::TransportError;
use crate::transport::{LinkState, TransportBackend, TransportEvent};

#[derive(Debug)]
enum MemFrame {
    Text(String),
    /// The peer closed its side.
    Hangup,
}

#[derive(Debug)]
struct MemInner {
    /// Sends into the peer's receive queue.
    tx: mpsc::UnboundedSender<MemFrame>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<MemFrame>>,
    state_tx: watch::Sender<LinkState>,
    open_delivered: AtomicBool,
}

/// One side of an in-process link. Cloning shares the side.
#[derive(Debug, Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

impl MemTransport {
    /// A connected pair, born `Open`.
    pub fn pair() -> (Self, Self) {
        Self::pair_in(LinkState::Open)
    }

    /// A pair born `Connecting`. Each side opens independently via
    /// [`open_link`](Self::open_link), which lets tests hold frames in the
    /// queue until the link comes up.
    pub fn pair_pending() -> (Self, Self) {
        Self::pair_in(LinkState::Connecting)
    }

    fn pair_in(initial: LinkState) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let side = |tx, rx| MemTransport {
            inner: Arc::new(MemInner {
                tx,
                rx: AsyncMutex::new(rx),
                state_tx: watch::Sender::new(initial),
                open_delivered: AtomicBool::new(false),
            }),
        };
        (side(tx_b, rx_a), side(tx_a, rx_b))
    }

    /// Transitions a `Connecting` side to `Open`. No-op otherwise.
    pub fn open_link(&self) {
        self.inner.state_tx.send_if_modified(|state| {
            if *state == LinkState::Connecting {
                *state = LinkState::Open;
                true
            } else {
                false
            }
        });
    }

    fn mark_closed(&self) {
        self.inner.state_tx.send_replace(LinkState::Closed);
    }
}

impl TransportBackend for MemTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        match *self.inner.state_tx.borrow() {
            LinkState::Connecting => return Err(TransportError::NotOpen),
            LinkState::Closed => return Err(TransportError::Closed),
            LinkState::Open => {}
        }
        self.inner
            .tx
            .send(MemFrame::Text(frame))
            .map_err(|_| TransportError::Closed)
    }

    async fn next_event(&self) -> TransportEvent {
        let mut state_rx = self.inner.state_tx.subscribe();

        // Wait out the connecting phase, then report Open exactly once.
        loop {
            match *state_rx.borrow_and_update() {
                LinkState::Closed => return TransportEvent::Closed,
                LinkState::Open => break,
                LinkState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return TransportEvent::Closed;
            }
        }
        if !self.inner.open_delivered.swap(true, Ordering::SeqCst) {
            return TransportEvent::Open;
        }

        let mut rx = self.inner.rx.lock().await;
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(MemFrame::Text(text)) => return TransportEvent::Message(text),
                    Some(MemFrame::Hangup) | None => {
                        self.mark_closed();
                        return TransportEvent::Closed;
                    }
                },
                changed = state_rx.wait_for(|s| *s == LinkState::Closed) => {
                    let _ = changed;
                    return TransportEvent::Closed;
                }
            }
        }
    }

    fn state(&self) -> LinkState {
        *self.inner.state_tx.borrow()
    }

    fn close(&self) {
        let previous = self.inner.state_tx.send_replace(LinkState::Closed);
        if previous != LinkState::Closed {
            // Tell the peer; if its queue is already gone there is nothing
            // left to notify.
            let _ = self.inner.tx.send(MemFrame::Hangup);
        }
    }
}
