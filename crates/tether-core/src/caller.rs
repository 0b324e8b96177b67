//! Caller-side multiplexer: request correlation, batching and event routing
//! over one transport connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::envelope::{
    encode_outgoing, split_frame, InboundFromResponder, OperationKind, OutboundEnvelope,
    RequestId, RequestParams, ResponseBody, ResponseEnvelope, ResponseResult,
};
use crate::error::{ErrorCode, RpcError, TransportError};
use crate::outbox::Outbox;
use crate::transform::{DataTransformer, Identity};
use crate::transport::{LinkState, Transport, TransportEvent};

/// What a pending request observes.
#[derive(Debug)]
pub enum CallerEvent {
    /// The responder acknowledged a subscription.
    Started,
    Data(Value),
    Error(RpcError),
    /// The request is finished and its table entry is gone.
    Complete,
}

#[derive(Debug)]
struct PendingRequest {
    kind: OperationKind,
    tx: mpsc::UnboundedSender<CallerEvent>,
    /// Which transport incarnation this entry last heard from. Responses
    /// rebind it so a future transport swap knows which entries are live.
    owner_epoch: u64,
}

/// One caller endpoint. Construct, spawn [`run`](Self::run), then issue
/// requests from any task; only `run` consumes transport events.
pub struct CallerSession {
    transport: Transport,
    state: Mutex<LinkState>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    outbox: Mutex<Outbox>,
    flush_signal: Notify,
    transformer: Arc<dyn DataTransformer>,
    next_id: AtomicI64,
    epoch: AtomicU64,
}

impl CallerSession {
    pub fn new(transport: Transport) -> Arc<Self> {
        Self::with_transformer(transport, Arc::new(Identity))
    }

    pub fn with_transformer(transport: Transport, transformer: Arc<dyn DataTransformer>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            state: Mutex::new(LinkState::Connecting),
            pending: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Outbox::new()),
            flush_signal: Notify::new(),
            transformer,
            next_id: AtomicI64::new(1),
            epoch: AtomicU64::new(0),
        })
    }

    /// Issues a request with an auto-assigned numeric id.
    pub fn request(
        self: &Arc<Self>,
        kind: OperationKind,
        path: impl Into<String>,
        input: Value,
    ) -> Result<RequestHandle, RpcError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.request_with_id(id, kind, path, input)
    }

    /// Issues a request under a caller-chosen id. The id must not collide
    /// with a live request.
    pub fn request_with_id(
        self: &Arc<Self>,
        id: RequestId,
        kind: OperationKind,
        path: impl Into<String>,
        input: Value,
    ) -> Result<RequestHandle, RpcError> {
        if *self.state.lock() == LinkState::Closed {
            return Err(RpcError::Transport(TransportError::Closed));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(RpcError::Status {
                    code: ErrorCode::BadRequest,
                    message: format!("duplicate request id {id}"),
                });
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    kind,
                    tx,
                    owner_epoch: self.epoch.load(Ordering::Relaxed),
                },
            );
        }

        let input = self.transformer.serialize(input);
        self.outbox.lock().push(OutboundEnvelope::Request {
            id: id.clone(),
            kind,
            params: RequestParams {
                path: path.into(),
                input,
            },
        });
        self.flush_signal.notify_one();

        // close() may have slipped in between the state check and the
        // insert; its envelope would never flush, so roll it back.
        if *self.state.lock() == LinkState::Closed {
            self.outbox.lock().withdraw(&id);
            self.pending.lock().remove(&id);
            self.close_if_drained();
            return Err(RpcError::Transport(TransportError::Closed));
        }

        Ok(RequestHandle {
            id,
            kind,
            session: Arc::clone(self),
            rx,
            cancelled: false,
        })
    }

    /// Cancels a pending request. Unknown ids are a no-op. The handle's
    /// `cancel`/`Drop` funnels here.
    pub fn cancel(&self, id: &RequestId) {
        let removed = self.pending.lock().remove(id);
        let Some(entry) = removed else {
            return;
        };

        let withdrew = self.outbox.lock().withdraw(id);
        let _ = entry.tx.send(CallerEvent::Complete);

        // A stop only makes sense for a subscription the responder actually
        // saw; a withdrawn request never left this process.
        if entry.kind == OperationKind::Subscription
            && withdrew == 0
            && *self.state.lock() == LinkState::Open
        {
            self.outbox
                .lock()
                .push(OutboundEnvelope::Stop { id: id.clone() });
            self.flush_signal.notify_one();
        }

        self.close_if_drained();
    }

    /// Begins a graceful shutdown: no new requests, in-flight ones drain,
    /// and the transport closes once the table empties. Requests still
    /// sitting in the queue can never drain, so they complete here.
    pub fn close(&self) {
        *self.state.lock() = LinkState::Closed;
        let unsent = self.outbox.lock().drain();
        for envelope in &unsent {
            let removed = self.pending.lock().remove(envelope.id());
            if let Some(entry) = removed {
                let _ = entry.tx.send(CallerEvent::Complete);
            }
        }
        self.close_if_drained();
    }

    fn close_if_drained(&self) {
        let closed = *self.state.lock() == LinkState::Closed;
        if closed && self.pending.lock().is_empty() {
            self.transport.close();
        }
    }

    /// Ids of requests still awaiting a terminal response.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.pending.lock().keys().cloned().collect()
    }

    /// Marks the start of a new transport incarnation for the rebinding
    /// bookkeeping.
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drives the session until its transport closes. Exactly one task may
    /// run this.
    pub async fn run(self: Arc<Self>) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                _ = self.flush_signal.notified() => {
                    self.flush().await;
                }
                event = self.transport.next_event() => match event {
                    TransportEvent::Open => {
                        {
                            let mut state = self.state.lock();
                            if *state != LinkState::Closed {
                                *state = LinkState::Open;
                            }
                        }
                        tracing::debug!("link open");
                        self.flush().await;
                    }
                    TransportEvent::Message(text) => self.handle_frame(&text),
                    TransportEvent::Error(error) => {
                        tracing::warn!(%error, "transport error");
                    }
                    TransportEvent::Closed => {
                        self.handle_closed();
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Drains the queue into one frame. Retained untouched while the link is
    /// still connecting; a failed send re-queues the batch at the front.
    async fn flush(&self) {
        if *self.state.lock() != LinkState::Open {
            return;
        }
        let batch = self.outbox.lock().drain();
        if batch.is_empty() {
            return;
        }
        tracing::trace!(envelopes = batch.len(), "flushing");
        let frame = encode_outgoing(&batch);
        if let Err(error) = self.transport.send(frame).await {
            tracing::warn!(%error, "flush failed, re-queueing batch");
            self.outbox.lock().requeue_front(batch);
        }
    }

    fn handle_frame(&self, text: &str) {
        let items = match split_frame(text) {
            Ok(items) => items,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed frame");
                return;
            }
        };
        for item in &items {
            match InboundFromResponder::from_value(item) {
                Ok(InboundFromResponder::Reconnect) => {
                    tracing::info!("peer requested reconnect, draining");
                    self.close();
                }
                Ok(InboundFromResponder::Response(envelope)) => self.route_response(envelope),
                Err(error) => {
                    tracing::warn!(%error, "dropping invalid envelope");
                }
            }
        }
    }

    fn route_response(&self, envelope: ResponseEnvelope) {
        let Some(id) = envelope.id else {
            tracing::warn!("dropping unsolicited response");
            return;
        };

        // Non-terminal results keep the entry; terminal ones remove it and
        // the event is sent after the lock is gone.
        let terminal = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(&id) else {
                tracing::warn!(%id, "response for unknown request");
                return;
            };
            entry.owner_epoch = self.epoch.load(Ordering::Relaxed);
            match envelope.body {
                ResponseBody::Result {
                    result: ResponseResult::Data { data },
                } => {
                    let data = self.transformer.deserialize(data);
                    let _ = entry.tx.send(CallerEvent::Data(data));
                    None
                }
                ResponseBody::Result {
                    result: ResponseResult::Started,
                } => {
                    let _ = entry.tx.send(CallerEvent::Started);
                    None
                }
                ResponseBody::Result {
                    result: ResponseResult::Stopped,
                } => pending.remove(&id).map(|entry| {
                    // A cancelled subscription's entry is already gone, so a
                    // stop landing here means the peer ended it unasked.
                    let event = if entry.kind == OperationKind::Subscription {
                        CallerEvent::Error(RpcError::SubscriptionEndedPrematurely)
                    } else {
                        CallerEvent::Complete
                    };
                    (entry, event)
                }),
                ResponseBody::Error { mut error } => pending.remove(&id).map(|entry| {
                    if let Some(data) = error.data.take() {
                        error.data = Some(self.transformer.deserialize(data));
                    }
                    (entry, CallerEvent::Error(RpcError::Operation(error)))
                }),
            }
        };

        if let Some((entry, event)) = terminal {
            let _ = entry.tx.send(event);
            self.close_if_drained();
        }
    }

    fn handle_closed(&self) {
        let deliberate = {
            let mut state = self.state.lock();
            let was_closed = *state == LinkState::Closed;
            *state = LinkState::Closed;
            was_closed
        };

        let epoch = self.epoch.load(Ordering::Relaxed);
        let orphaned: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, e)| e.owner_epoch == epoch)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        tracing::debug!(deliberate, orphaned = orphaned.len(), "link closed");
        for entry in orphaned {
            let event = if deliberate {
                CallerEvent::Complete
            } else {
                CallerEvent::Error(RpcError::ChannelClosedPrematurely)
            };
            let _ = entry.tx.send(event);
        }
    }
}

impl std::fmt::Debug for CallerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerSession")
            .field("state", &*self.state.lock())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

/// A live request. Dropping it cancels the request if it has not already
/// finished.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    kind: OperationKind,
    session: Arc<CallerSession>,
    rx: mpsc::UnboundedReceiver<CallerEvent>,
    cancelled: bool,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The next event for this request, or `None` if the session is gone.
    pub async fn next_event(&mut self) -> Option<CallerEvent> {
        self.rx.recv().await
    }

    /// Cancels the request. Idempotent.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.session.cancel(&self.id);
        }
    }

    /// Consumes the handle and waits for a single value, the one-shot
    /// convenience for queries and mutations.
    pub async fn response(mut self) -> Result<Value, RpcError> {
        loop {
            match self.rx.recv().await {
                Some(CallerEvent::Data(value)) => {
                    self.cancel();
                    return Ok(value);
                }
                Some(CallerEvent::Error(error)) => {
                    self.cancelled = true;
                    return Err(error);
                }
                Some(CallerEvent::Started) => continue,
                Some(CallerEvent::Complete) => {
                    self.cancelled = true;
                    return Err(RpcError::Status {
                        code: ErrorCode::InternalError,
                        message: "request completed without a value".into(),
                    });
                }
                None => {
                    self.cancelled = true;
                    return Err(RpcError::ChannelClosedPrematurely);
                }
            }
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if !self.cancelled {
            self.session.cancel(&self.id);
        }
    }
}
