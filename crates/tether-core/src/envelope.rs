//! JSON wire envelopes and the frame codec.
//!
//! A frame is a single envelope object or an array of envelope objects. A
//! batch of one is sent unwrapped. Unknown fields (`jsonrpc` in particular)
//! are tolerated on input and never emitted on output.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EnvelopeError, WireError};

/// A request correlation id. Strings and integers are both valid on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// The three operation shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }

    fn from_method(method: &str) -> Option<Self> {
        match method {
            "query" => Some(Self::Query),
            "mutation" => Some(Self::Mutation),
            "subscription" => Some(Self::Subscription),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `params` object of a request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub path: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
}

/// An envelope travelling caller → responder.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEnvelope {
    Request {
        id: RequestId,
        kind: OperationKind,
        params: RequestParams,
    },
    Stop {
        id: RequestId,
    },
}

impl OutboundEnvelope {
    pub fn id(&self) -> &RequestId {
        match self {
            Self::Request { id, .. } | Self::Stop { id } => id,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, kind, params } => {
                let mut obj = json!({
                    "id": id,
                    "method": kind.as_str(),
                    "params": { "path": params.path },
                });
                if !params.input.is_null() {
                    obj["params"]["input"] = params.input.clone();
                }
                obj
            }
            Self::Stop { id } => json!({ "id": id, "method": "subscription.stop" }),
        }
    }
}

/// A caller → responder envelope as the responder sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRequest {
    Call {
        id: RequestId,
        kind: OperationKind,
        params: RequestParams,
    },
    Stop {
        id: RequestId,
    },
}

impl InboundRequest {
    /// Validates one batch member. Distinguishes shape errors so the caller
    /// can answer with the right wire code.
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
        let id = match obj.get("id") {
            None | Some(Value::Null) => return Err(EnvelopeError::MissingId),
            Some(raw) => parse_id(raw).ok_or(EnvelopeError::InvalidId)?,
        };
        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingMethod)?;
        if method == "subscription.stop" {
            return Ok(Self::Stop { id });
        }
        let kind = OperationKind::from_method(method)
            .ok_or_else(|| EnvelopeError::UnknownMethod(method.to_owned()))?;
        let params = obj.get("params").ok_or(EnvelopeError::InvalidParams)?;
        let params: RequestParams =
            serde_json::from_value(params.clone()).map_err(|_| EnvelopeError::InvalidParams)?;
        Ok(Self::Call { id, kind, params })
    }
}

/// The `result` object of a success response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseResult {
    Data { data: Value },
    Started,
    Stopped,
}

/// Either a `result` or an `error` field, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Result { result: ResponseResult },
    Error { error: WireError },
}

/// An envelope travelling responder → caller in answer to a request.
/// `id: None` marks an unsolicited response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn data(id: RequestId, data: Value) -> Self {
        Self {
            id: Some(id),
            body: ResponseBody::Result {
                result: ResponseResult::Data { data },
            },
        }
    }

    pub fn started(id: RequestId) -> Self {
        Self {
            id: Some(id),
            body: ResponseBody::Result {
                result: ResponseResult::Started,
            },
        }
    }

    pub fn stopped(id: RequestId) -> Self {
        Self {
            id: Some(id),
            body: ResponseBody::Result {
                result: ResponseResult::Stopped,
            },
        }
    }

    pub fn error(id: Option<RequestId>, error: WireError) -> Self {
        Self {
            id,
            body: ResponseBody::Error { error },
        }
    }
}

/// A responder → caller envelope as the caller sees it. The only recognized
/// unsolicited responder request is the reconnect notice.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFromResponder {
    Reconnect,
    Response(ResponseEnvelope),
}

impl InboundFromResponder {
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
        if let Some(method) = obj.get("method") {
            return match method.as_str() {
                Some("reconnect") => Ok(Self::Reconnect),
                Some(other) => Err(EnvelopeError::UnknownMethod(other.to_owned())),
                None => Err(EnvelopeError::MissingMethod),
            };
        }
        let envelope: ResponseEnvelope = serde_json::from_value(value.clone())
            .map_err(|e| EnvelopeError::InvalidResponse(e.to_string()))?;
        Ok(Self::Response(envelope))
    }
}

/// Frames a batch: one envelope stays a bare object, more become an array.
pub fn encode_outgoing(batch: &[OutboundEnvelope]) -> String {
    let frame = match batch {
        [single] => single.to_value(),
        many => Value::Array(many.iter().map(OutboundEnvelope::to_value).collect()),
    };
    frame.to_string()
}

/// Serializes a batch of response envelopes with the same framing rule.
pub fn encode_responses(batch: &[ResponseEnvelope]) -> Result<String, serde_json::Error> {
    match batch {
        [single] => serde_json::to_string(single),
        many => serde_json::to_string(many),
    }
}

/// Splits an incoming text frame into its envelope values. A bare object is
/// a batch of one. Anything else is a frame-level parse error.
pub fn split_frame(text: &str) -> Result<Vec<Value>, EnvelopeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
    match value {
        Value::Array(items) => Ok(items),
        obj @ Value::Object(_) => Ok(vec![obj]),
        _ => Err(EnvelopeError::NotAnObject),
    }
}

/// Best-effort id extraction from an arbitrary envelope value, used to
/// correlate error responses for members that failed validation.
pub fn extract_id(value: &Value) -> Option<RequestId> {
    parse_id(value.as_object()?.get("id")?)
}

fn parse_id(raw: &Value) -> Option<RequestId> {
    match raw {
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        Value::String(s) => Some(RequestId::String(s.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn request_wire_shape() {
        let envelope = OutboundEnvelope::Request {
            id: RequestId::Number(1),
            kind: OperationKind::Query,
            params: RequestParams {
                path: "testQuery".into(),
                input: Value::Null,
            },
        };
        assert_eq!(
            envelope.to_value(),
            json!({"id": 1, "method": "query", "params": {"path": "testQuery"}})
        );

        let envelope = OutboundEnvelope::Request {
            id: RequestId::String("a".into()),
            kind: OperationKind::Mutation,
            params: RequestParams {
                path: "users.create".into(),
                input: json!({"name": "ada"}),
            },
        };
        assert_eq!(
            envelope.to_value(),
            json!({
                "id": "a",
                "method": "mutation",
                "params": {"path": "users.create", "input": {"name": "ada"}},
            })
        );
    }

    #[test]
    fn stop_wire_shape() {
        let envelope = OutboundEnvelope::Stop {
            id: RequestId::Number(7),
        };
        assert_eq!(
            envelope.to_value(),
            json!({"id": 7, "method": "subscription.stop"})
        );
    }

    #[test]
    fn batch_of_one_is_unwrapped() {
        let one = vec![OutboundEnvelope::Stop {
            id: RequestId::Number(1),
        }];
        let frame: Value = serde_json::from_str(&encode_outgoing(&one)).unwrap();
        assert!(frame.is_object());

        let two = vec![
            OutboundEnvelope::Stop {
                id: RequestId::Number(1),
            },
            OutboundEnvelope::Stop {
                id: RequestId::Number(2),
            },
        ];
        let frame: Value = serde_json::from_str(&encode_outgoing(&two)).unwrap();
        assert_eq!(frame.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn inbound_request_validation() {
        let ok = InboundRequest::from_value(&json!({
            "id": 1,
            "jsonrpc": "2.0",
            "method": "query",
            "params": {"path": "p"},
        }))
        .unwrap();
        assert!(matches!(
            ok,
            InboundRequest::Call {
                kind: OperationKind::Query,
                ..
            }
        ));

        assert_eq!(
            InboundRequest::from_value(&json!(42)),
            Err(EnvelopeError::NotAnObject)
        );
        assert_eq!(
            InboundRequest::from_value(&json!({"method": "query", "params": {"path": "p"}})),
            Err(EnvelopeError::MissingId)
        );
        assert_eq!(
            InboundRequest::from_value(&json!({"id": true, "method": "query"})),
            Err(EnvelopeError::InvalidId)
        );
        assert_eq!(
            InboundRequest::from_value(&json!({"id": 1, "method": "describe"})),
            Err(EnvelopeError::UnknownMethod("describe".into()))
        );
        assert_eq!(
            InboundRequest::from_value(&json!({"id": 1, "method": "query", "params": {}})),
            Err(EnvelopeError::InvalidParams)
        );
    }

    #[test]
    fn missing_input_defaults_to_null() {
        let parsed = InboundRequest::from_value(&json!({
            "id": "x",
            "method": "mutation",
            "params": {"path": "p"},
        }))
        .unwrap();
        match parsed {
            InboundRequest::Call { params, .. } => assert!(params.input.is_null()),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn response_envelope_shapes() {
        let data = ResponseEnvelope::data(RequestId::Number(3), json!({"hello": "world"}));
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({"id": 3, "result": {"type": "data", "data": {"hello": "world"}}})
        );

        let started = ResponseEnvelope::started(RequestId::String("s".into()));
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            json!({"id": "s", "result": {"type": "started"}})
        );

        let error = ResponseEnvelope::error(
            None,
            WireError::new(ErrorCode::ParseError, "bad frame"),
        );
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"id": null, "error": {"code": -32700, "message": "bad frame"}})
        );
    }

    #[test]
    fn responses_parse_with_extra_fields() {
        let parsed = InboundFromResponder::from_value(&json!({
            "id": 9,
            "jsonrpc": "2.0",
            "result": {"type": "stopped"},
        }))
        .unwrap();
        assert_eq!(
            parsed,
            InboundFromResponder::Response(ResponseEnvelope::stopped(RequestId::Number(9)))
        );
    }

    #[test]
    fn reconnect_notice_is_recognized() {
        let parsed =
            InboundFromResponder::from_value(&json!({"id": null, "method": "reconnect"})).unwrap();
        assert_eq!(parsed, InboundFromResponder::Reconnect);

        assert_eq!(
            InboundFromResponder::from_value(&json!({"id": null, "method": "restart"})),
            Err(EnvelopeError::UnknownMethod("restart".into()))
        );
    }

    #[test]
    fn split_frame_handles_both_shapes() {
        assert_eq!(split_frame(r#"{"id":1}"#).unwrap().len(), 1);
        assert_eq!(split_frame(r#"[{"id":1},{"id":2}]"#).unwrap().len(), 2);
        assert!(matches!(
            split_frame("not json"),
            Err(EnvelopeError::InvalidJson(_))
        ));
        assert_eq!(split_frame("3"), Err(EnvelopeError::NotAnObject));
    }

    #[test]
    fn extract_id_is_best_effort() {
        assert_eq!(
            extract_id(&json!({"id": 5, "method": "???"})),
            Some(RequestId::Number(5))
        );
        assert_eq!(extract_id(&json!({"id": [1]})), None);
        assert_eq!(extract_id(&json!("nope")), None);
    }
}
