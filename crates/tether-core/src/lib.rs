//! Bidirectional RPC multiplexing over a single text-frame connection.
//!
//! One side runs a [`CallerSession`]: it correlates requests by id, batches
//! synchronous bursts into one frame, and routes responses back to per-request
//! handles. The other side runs a [`ResponderSession`]: it validates incoming
//! envelopes, dispatches into an [`OperationRegistry`], and tracks live
//! subscriptions so they can be cancelled or torn down with the connection.
//!
//! Both ends share the same [`Transport`] abstraction; the `mem` backend
//! pairs two in-process endpoints, the `websocket` feature adds
//! `tokio-tungstenite` links.

pub mod caller;
pub mod envelope;
pub mod error;
pub mod outbox;
pub mod responder;
pub mod transform;
pub mod transport;

pub use caller::{CallerEvent, CallerSession, RequestHandle};
pub use envelope::{
    encode_outgoing, encode_responses, extract_id, split_frame, InboundFromResponder,
    InboundRequest, OperationKind, OutboundEnvelope, RequestId, RequestParams, ResponseBody,
    ResponseEnvelope, ResponseResult,
};
pub use error::{EnvelopeError, ErrorCode, RpcError, TransportError, WireError};
pub use outbox::Outbox;
pub use responder::{
    ErrorReport, OperationCall, OperationOutput, OperationRegistry, ResponderBuilder,
    ResponderSession,
};
pub use transform::{DataTransformer, Identity};
pub use transport::{LinkState, Transport, TransportEvent};
