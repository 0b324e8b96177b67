//! Error codes and error types.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured error codes carried in wire error envelopes.
///
/// The numbers follow JSON-RPC conventions so that peers built independently
/// agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Malformed JSON or a frame member that is not an envelope object.
    ParseError = -32700,
    /// Well-formed JSON with an invalid envelope shape, a missing or invalid
    /// id, or a duplicate id.
    BadRequest = -32600,
    /// No operation registered under the requested path.
    NotFound = -32601,
    /// The operation invocation produced a shape that is not valid for its
    /// kind (e.g. a subscription that did not yield a stream).
    InternalError = -32603,
}

impl ErrorCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            -32700 => Some(Self::ParseError),
            -32600 => Some(Self::BadRequest),
            -32601 => Some(Self::NotFound),
            -32603 => Some(Self::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseError => write!(f, "parse error"),
            Self::BadRequest => write!(f, "bad request"),
            Self::NotFound => write!(f, "not found"),
            Self::InternalError => write!(f, "internal error"),
        }
    }
}

/// The structured error carried in a response envelope's `error` field.
///
/// `code` is kept as a raw `i32` on the wire so that application-defined
/// codes pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The well-known code this error maps to, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i32(self.code)
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ErrorCode::from_i32(self.code) {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => write!(f, "error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for WireError {}

/// Envelope validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    InvalidJson(String),
    NotAnObject,
    MissingId,
    InvalidId,
    MissingMethod,
    UnknownMethod(String),
    InvalidParams,
    InvalidResponse(String),
}

impl EnvelopeError {
    /// The wire code a validation failure is reported under.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidJson(_) | Self::NotAnObject | Self::InvalidResponse(_) => {
                ErrorCode::ParseError
            }
            Self::MissingId
            | Self::InvalidId
            | Self::MissingMethod
            | Self::UnknownMethod(_)
            | Self::InvalidParams => ErrorCode::BadRequest,
        }
    }
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(msg) => write!(f, "invalid JSON: {msg}"),
            Self::NotAnObject => write!(f, "envelope is not an object"),
            Self::MissingId => write!(f, "envelope has no id"),
            Self::InvalidId => write!(f, "envelope id must be a string or an integer"),
            Self::MissingMethod => write!(f, "envelope has no method"),
            Self::UnknownMethod(m) => write!(f, "unknown method {m:?}"),
            Self::InvalidParams => write!(f, "params must be an object with a string path"),
            Self::InvalidResponse(msg) => write!(f, "invalid response envelope: {msg}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The link is gone.
    Closed,
    /// The link exists but has not finished connecting.
    NotOpen,
    Io(std::io::Error),
    #[cfg(feature = "websocket")]
    WebSocket(tokio_tungstenite::tungstenite::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::NotOpen => write!(f, "transport not open"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            #[cfg(feature = "websocket")]
            Self::WebSocket(e) => write!(f, "websocket error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            #[cfg(feature = "websocket")]
            Self::WebSocket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// High-level RPC errors surfaced to callers and to the error observer.
#[derive(Debug)]
pub enum RpcError {
    Transport(TransportError),
    Envelope(EnvelopeError),
    Status { code: ErrorCode, message: String },
    /// The invoked operation itself failed; passed through opaque.
    Operation(WireError),
    /// The transport closed with the request still pending.
    ChannelClosedPrematurely,
    /// The peer stopped a subscription the caller never cancelled.
    SubscriptionEndedPrematurely,
}

impl RpcError {
    /// The structured error a responder puts on the wire for this failure.
    pub fn to_wire(&self) -> WireError {
        match self {
            Self::Operation(e) => e.clone(),
            Self::Envelope(e) => WireError::new(e.error_code(), e.to_string()),
            Self::Status { code, message } => WireError::new(*code, message.clone()),
            other => WireError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Envelope(e) => write!(f, "envelope error: {e}"),
            Self::Status { code, message } => write!(f, "{code}: {message}"),
            Self::Operation(e) => write!(f, "operation failed: {e}"),
            Self::ChannelClosedPrematurely => write!(f, "channel closed prematurely"),
            Self::SubscriptionEndedPrematurely => write!(f, "subscription ended prematurely"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Envelope(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<EnvelopeError> for RpcError {
    fn from(e: EnvelopeError) -> Self {
        Self::Envelope(e)
    }
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        Self::Operation(e)
    }
}
