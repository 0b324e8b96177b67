//! Bidirectional RPC multiplexing over a single text-frame connection.
//!
//! This crate re-exports the [`tether_core`] API. A connection has a caller
//! end and a responder end:
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use tether::prelude::*;
//!
//! struct Hello;
//!
//! impl OperationRegistry for Hello {
//!     type Context = ();
//!
//!     async fn invoke(&self, call: OperationCall<()>) -> Result<OperationOutput, WireError> {
//!         match call.path.as_str() {
//!             "greet" => Ok(OperationOutput::Value(json!({"hello": "world"}))),
//!             other => Err(WireError::new(
//!                 ErrorCode::NotFound,
//!                 format!("no such operation {other}"),
//!             )),
//!         }
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (a, b) = Transport::mem_pair();
//! let caller = CallerSession::new(a);
//! let responder = ResponderSession::new(b, Arc::new(Hello));
//! tokio::spawn(Arc::clone(&caller).run());
//! tokio::spawn(Arc::clone(&responder).run());
//!
//! let reply = caller
//!     .request(OperationKind::Query, "greet", Value::Null)?
//!     .response()
//!     .await?;
//! assert_eq!(reply, json!({"hello": "world"}));
//! # Ok(())
//! # }
//! ```

pub use tether_core::*;

/// The names most applications need.
pub mod prelude {
    pub use tether_core::{
        CallerEvent, CallerSession, DataTransformer, ErrorCode, OperationCall, OperationKind,
        OperationOutput, OperationRegistry, RequestHandle, RequestId, ResponderSession, RpcError,
        Transport, WireError,
    };
}
