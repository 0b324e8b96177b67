//! Responder-side dispatch engine: envelope validation, operation
//! invocation and the live subscription registry for one connection.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{AbortHandle, Abortable, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::envelope::{
    encode_responses, extract_id, split_frame, InboundRequest, OperationKind, RequestId,
    RequestParams, ResponseEnvelope,
};
use crate::error::{ErrorCode, RpcError, WireError};
use crate::transform::{DataTransformer, Identity};
use crate::transport::{LinkState, Transport, TransportEvent};

/// What one invocation yields: a single value for queries and mutations, a
/// stream for subscriptions.
pub enum OperationOutput {
    Value(Value),
    Stream(BoxStream<'static, Result<Value, WireError>>),
}

impl std::fmt::Debug for OperationOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Everything an operation sees about one call. `context` is `None` when the
/// session was built without a context factory.
#[derive(Debug)]
pub struct OperationCall<Ctx> {
    pub path: String,
    pub kind: OperationKind,
    pub input: Value,
    pub context: Option<Ctx>,
}

/// The operation table a responder dispatches into.
///
/// Implementations resolve `path` themselves and answer `NotFound` for
/// unknown paths. Failures are opaque to the engine and pass through to the
/// wire unchanged.
pub trait OperationRegistry: Send + Sync + 'static {
    type Context: Clone + Send + Sync + 'static;

    fn invoke(
        &self,
        call: OperationCall<Self::Context>,
    ) -> impl Future<Output = Result<OperationOutput, WireError>> + Send;
}

type BoxedContextFactory<Ctx> = Box<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Ctx, WireError>> + Send>> + Send + Sync,
>;

/// A failure handed to the error observer, with whatever call attribution
/// survived validation. `kind: None` means the failure could not be pinned
/// to an operation.
#[derive(Debug)]
pub struct ErrorReport<'a, Ctx> {
    pub error: &'a RpcError,
    pub kind: Option<OperationKind>,
    pub path: Option<&'a str>,
    pub input: Option<&'a Value>,
    pub context: Option<Ctx>,
}

type BoxedErrorObserver<Ctx> = Box<dyn Fn(ErrorReport<'_, Ctx>) + Send + Sync>;

struct ActiveSubscription {
    abort: AbortHandle,
}

/// One responder endpoint bound to one transport connection. Construct via
/// [`builder`](Self::builder), then spawn [`run`](Self::run).
pub struct ResponderSession<R: OperationRegistry> {
    transport: Transport,
    registry: Arc<R>,
    subscriptions: Mutex<HashMap<RequestId, ActiveSubscription>>,
    transformer: Arc<dyn DataTransformer>,
    context_factory: Option<BoxedContextFactory<R::Context>>,
    on_error: Option<BoxedErrorObserver<R::Context>>,
    context: Mutex<Option<R::Context>>,
}

/// Configures a [`ResponderSession`].
pub struct ResponderBuilder<R: OperationRegistry> {
    transport: Transport,
    registry: Arc<R>,
    transformer: Arc<dyn DataTransformer>,
    context_factory: Option<BoxedContextFactory<R::Context>>,
    on_error: Option<BoxedErrorObserver<R::Context>>,
}

impl<R: OperationRegistry> ResponderBuilder<R> {
    /// Resolved once when the link opens; failure is fatal to the
    /// connection.
    pub fn context_factory<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Context, WireError>> + Send + 'static,
    {
        self.context_factory = Some(Box::new(move || Box::pin(factory())));
        self
    }

    pub fn transformer(mut self, transformer: Arc<dyn DataTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Observes every failure the engine reports or puts on the wire.
    pub fn on_error<F>(mut self, observer: F) -> Self
    where
        F: Fn(ErrorReport<'_, R::Context>) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(observer));
        self
    }

    pub fn build(self) -> Arc<ResponderSession<R>> {
        Arc::new(ResponderSession {
            transport: self.transport,
            registry: self.registry,
            subscriptions: Mutex::new(HashMap::new()),
            transformer: self.transformer,
            context_factory: self.context_factory,
            on_error: self.on_error,
            context: Mutex::new(None),
        })
    }
}

impl<R: OperationRegistry> ResponderSession<R> {
    pub fn new(transport: Transport, registry: Arc<R>) -> Arc<Self> {
        Self::builder(transport, registry).build()
    }

    pub fn builder(transport: Transport, registry: Arc<R>) -> ResponderBuilder<R> {
        ResponderBuilder {
            transport,
            registry,
            transformer: Arc::new(Identity),
            context_factory: None,
            on_error: None,
        }
    }

    /// Live subscription count, for tests and introspection.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_subscribed(&self, id: &RequestId) -> bool {
        self.subscriptions.lock().contains_key(id)
    }

    /// Asks the peer to drain and reconnect, the unsolicited
    /// `{"id":null,"method":"reconnect"}` request.
    pub async fn send_reconnect_notice(&self) {
        self.send_raw(r#"{"id":null,"method":"reconnect"}"#.to_owned())
            .await;
    }

    /// Drives the session until its transport closes. Frames are handled
    /// sequentially, which is what keeps responses in processing order.
    pub async fn run(self: Arc<Self>) -> Result<(), crate::error::TransportError> {
        loop {
            match self.transport.next_event().await {
                TransportEvent::Open => {
                    tracing::debug!("link open");
                    if !self.resolve_context().await {
                        return Ok(());
                    }
                }
                TransportEvent::Message(text) => self.handle_frame(&text).await,
                TransportEvent::Error(error) => {
                    let error = RpcError::Transport(error);
                    tracing::warn!(%error, "transport error");
                    self.observe(&error, None, None, None);
                }
                TransportEvent::Closed => {
                    self.clear_subscriptions();
                    return Ok(());
                }
            }
        }
    }

    /// Runs the context factory, if any. Returns `false` when the factory
    /// failed and the connection was torn down.
    async fn resolve_context(&self) -> bool {
        let Some(factory) = &self.context_factory else {
            return true;
        };
        match factory().await {
            Ok(ctx) => {
                *self.context.lock() = Some(ctx);
                true
            }
            Err(wire) => {
                let error = RpcError::Operation(wire.clone());
                tracing::warn!(%error, "context factory failed, closing connection");
                self.observe(&error, None, None, None);
                self.send_envelope(ResponseEnvelope::error(None, wire)).await;
                self.transport.close();
                false
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, text: &str) {
        let items = match split_frame(text) {
            Ok(items) => items,
            Err(envelope_error) => {
                let wire = WireError::new(envelope_error.error_code(), envelope_error.to_string());
                let error = RpcError::Envelope(envelope_error);
                self.observe(&error, None, None, None);
                self.send_envelope(ResponseEnvelope::error(None, wire)).await;
                return;
            }
        };

        // Batch members are independent: one bad member answers with its
        // own error while the rest dispatch normally.
        for item in &items {
            match InboundRequest::from_value(item) {
                Ok(InboundRequest::Stop { id }) => self.stop_subscription(&id),
                Ok(InboundRequest::Call { id, kind, params }) => {
                    self.handle_call(id, kind, params).await;
                }
                Err(envelope_error) => {
                    let id = extract_id(item);
                    let wire =
                        WireError::new(envelope_error.error_code(), envelope_error.to_string());
                    let error = RpcError::Envelope(envelope_error);
                    self.observe(&error, None, None, None);
                    self.send_envelope(ResponseEnvelope::error(id, wire)).await;
                }
            }
        }
    }

    async fn handle_call(self: &Arc<Self>, id: RequestId, kind: OperationKind, params: RequestParams) {
        let RequestParams { path, input } = params;
        let input = self.transformer.deserialize(input);
        let context = self.context.lock().clone();

        let outcome = self
            .registry
            .invoke(OperationCall {
                path: path.clone(),
                kind,
                input: input.clone(),
                context,
            })
            .await;

        match (kind, outcome) {
            (_, Err(wire)) => {
                self.fail_call(id, kind, &path, &input, wire).await;
            }
            (OperationKind::Query | OperationKind::Mutation, Ok(OperationOutput::Value(value))) => {
                let data = self.transformer.serialize(value);
                self.send_envelope(ResponseEnvelope::data(id, data)).await;
            }
            (OperationKind::Subscription, Ok(OperationOutput::Stream(stream))) => {
                self.start_subscription(id, kind, &path, &input, stream).await;
            }
            (_, Ok(output)) => {
                let wire = WireError::new(
                    ErrorCode::InternalError,
                    format!("{kind} produced an incompatible output"),
                );
                tracing::warn!(%path, %kind, ?output, "operation output shape mismatch");
                self.fail_call(id, kind, &path, &input, wire).await;
            }
        }
    }

    async fn fail_call(
        &self,
        id: RequestId,
        kind: OperationKind,
        path: &str,
        input: &Value,
        mut wire: WireError,
    ) {
        if let Some(data) = wire.data.take() {
            wire.data = Some(self.transformer.serialize(data));
        }
        let error = RpcError::Operation(wire.clone());
        self.observe(&error, Some(kind), Some(path), Some(input));
        self.send_envelope(ResponseEnvelope::error(Some(id), wire)).await;
    }

    async fn start_subscription(
        self: &Arc<Self>,
        id: RequestId,
        kind: OperationKind,
        path: &str,
        input: &Value,
        stream: BoxStream<'static, Result<Value, WireError>>,
    ) {
        let (abort, registration) = AbortHandle::new_pair();
        let stream = Abortable::new(stream, registration);

        // The link can drop between validation and here; a subscription
        // nobody will hear must not start.
        if self.transport.state() != LinkState::Open {
            abort.abort();
            return;
        }

        // Decide duplicate-vs-register inside the lock, await only after the
        // guard is gone.
        let duplicate = {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions.contains_key(&id) {
                true
            } else {
                subscriptions.insert(
                    id.clone(),
                    ActiveSubscription {
                        abort: abort.clone(),
                    },
                );
                false
            }
        };
        if duplicate {
            abort.abort();
            self.send_envelope(ResponseEnvelope::stopped(id.clone())).await;
            let wire = WireError::new(
                ErrorCode::BadRequest,
                format!("duplicate subscription id {id}"),
            );
            self.fail_call(id, kind, path, input, wire).await;
            return;
        }

        self.send_envelope(ResponseEnvelope::started(id.clone())).await;
        tracing::debug!(%id, %path, "subscription started");

        let session = Arc::clone(self);
        let path = path.to_owned();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => {
                        let data = session.transformer.serialize(value);
                        session
                            .send_envelope(ResponseEnvelope::data(id.clone(), data))
                            .await;
                    }
                    Err(mut wire) => {
                        session.subscriptions.lock().remove(&id);
                        if let Some(data) = wire.data.take() {
                            wire.data = Some(session.transformer.serialize(data));
                        }
                        let error = RpcError::Operation(wire.clone());
                        session.observe(&error, Some(OperationKind::Subscription), Some(&path), None);
                        session
                            .send_envelope(ResponseEnvelope::error(Some(id), wire))
                            .await;
                        return;
                    }
                }
            }
            // Whether the stream finished or a stop aborted it, `stopped`
            // goes out from here, strictly after any in-flight data send.
            // Connection teardown is the exception: nothing is sent then.
            session.subscriptions.lock().remove(&id);
            if session.transport.state() == LinkState::Open {
                session.send_envelope(ResponseEnvelope::stopped(id)).await;
            }
        });
    }

    /// The forwarding task notices the abort on its next poll and emits the
    /// `stopped` response itself.
    fn stop_subscription(&self, id: &RequestId) {
        let removed = self.subscriptions.lock().remove(id);
        match removed {
            Some(active) => {
                active.abort.abort();
                tracing::debug!(%id, "subscription stopped by peer");
            }
            None => {
                tracing::trace!(%id, "stop for unknown subscription");
            }
        }
    }

    fn clear_subscriptions(&self) {
        let drained: Vec<ActiveSubscription> =
            self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        tracing::debug!(aborted = drained.len(), "clearing subscriptions");
        for active in drained {
            active.abort.abort();
        }
    }

    async fn send_envelope(&self, envelope: ResponseEnvelope) {
        match encode_responses(std::slice::from_ref(&envelope)) {
            Ok(frame) => self.send_raw(frame).await,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize response");
            }
        }
    }

    async fn send_raw(&self, frame: String) {
        if let Err(error) = self.transport.send(frame).await {
            tracing::warn!(%error, "failed to send response");
        }
    }

    fn observe(
        &self,
        error: &RpcError,
        kind: Option<OperationKind>,
        path: Option<&str>,
        input: Option<&Value>,
    ) {
        if let Some(observer) = &self.on_error {
            observer(ErrorReport {
                error,
                kind,
                path,
                input,
                context: self.context.lock().clone(),
            });
        }
    }
}

impl<R: OperationRegistry> std::fmt::Debug for ResponderSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponderSession")
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}
