//! Pluggable value transformation at the wire boundary.

use serde_json::Value;

/// Maps application values to and from their wire representation.
///
/// `serialize` runs on the way out (caller input, responder output data and
/// error payloads), `deserialize` on the way in. Both peers must install the
/// same transformer for the pair to round-trip.
pub trait DataTransformer: Send + Sync + 'static {
    fn serialize(&self, value: Value) -> Value;
    fn deserialize(&self, value: Value) -> Value;
}

/// The default transformer: values pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl DataTransformer for Identity {
    fn serialize(&self, value: Value) -> Value {
        value
    }

    fn deserialize(&self, value: Value) -> Value {
        value
    }
}
