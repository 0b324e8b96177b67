//! Transport-agnostic conformance scenarios.
//!
//! A transport backend implements [`TransportFactory`] and instantiates the
//! `run_*` scenarios as `#[tokio::test]` functions; the mem backend's
//! instantiation below doubles as the reference run.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tether_core::{
    CallerEvent, CallerSession, ErrorCode, OperationCall, OperationKind, OperationOutput,
    OperationRegistry, ResponderSession, RpcError, Transport, TransportError, WireError,
};

/// Failures a scenario can report.
#[derive(Debug)]
pub enum TestError {
    Setup(String),
    Rpc(RpcError),
    Transport(TransportError),
    Assertion(String),
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(msg) => write!(f, "setup failed: {msg}"),
            Self::Rpc(e) => write!(f, "rpc failed: {e}"),
            Self::Transport(e) => write!(f, "transport failed: {e}"),
            Self::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl From<TransportError> for TestError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Produces connected transport pairs for the scenarios.
pub trait TransportFactory {
    fn connect_pair() -> impl Future<Output = Result<(Transport, Transport), TestError>> + Send;
}

/// The mem backend's factory.
pub struct MemFactory;

impl TransportFactory for MemFactory {
    async fn connect_pair() -> Result<(Transport, Transport), TestError> {
        Ok(Transport::mem_pair())
    }
}

/// A small fixed operation table the scenarios run against.
pub struct DemoRegistry;

impl OperationRegistry for DemoRegistry {
    type Context = ();

    async fn invoke(&self, call: OperationCall<()>) -> Result<OperationOutput, WireError> {
        match (call.kind, call.path.as_str()) {
            (OperationKind::Query, "testQuery") => {
                let name = call.input["id"].as_str().unwrap_or("world").to_owned();
                Ok(OperationOutput::Value(json!({ "hello": name })))
            }
            (OperationKind::Query | OperationKind::Mutation, "echo") => {
                Ok(OperationOutput::Value(call.input))
            }
            (OperationKind::Subscription, "ticker") => {
                let stream = async_stream::stream! {
                    let mut n = 0i64;
                    loop {
                        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                        yield Ok(json!(n));
                        n += 1;
                    }
                };
                Ok(OperationOutput::Stream(stream.boxed()))
            }
            _ => Err(WireError::new(
                ErrorCode::NotFound,
                format!("no such operation {}", call.path),
            )),
        }
    }
}

async fn connect<F: TransportFactory>(
) -> Result<(Arc<CallerSession>, Arc<ResponderSession<DemoRegistry>>), TestError> {
    let (a, b) = F::connect_pair().await?;
    let caller = CallerSession::new(a);
    let responder = ResponderSession::new(b, Arc::new(DemoRegistry));
    tokio::spawn(Arc::clone(&caller).run());
    tokio::spawn(Arc::clone(&responder).run());
    tracing::debug!("scenario pair connected");
    Ok((caller, responder))
}

async fn run_query_echo_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (caller, _responder) = connect::<F>().await?;

    let fixed = caller
        .request_with_id(
            "1".into(),
            OperationKind::Query,
            "testQuery",
            json!({"id": "world"}),
        )?
        .response()
        .await?;
    if fixed["hello"] != json!("world") {
        return Err(TestError::Assertion(format!(
            "testQuery returned {fixed}"
        )));
    }

    let payload = json!({"numbers": [1, 2, 3], "flag": true});
    let echoed = caller
        .request(OperationKind::Mutation, "echo", payload.clone())?
        .response()
        .await?;
    if echoed != payload {
        return Err(TestError::Assertion(format!("echo returned {echoed}")));
    }

    caller.close();
    Ok(())
}

/// Query and mutation round trips, including the fixed `testQuery` answer.
pub async fn run_query_echo<F: TransportFactory>() {
    if let Err(error) = run_query_echo_inner::<F>().await {
        panic!("query echo scenario failed: {error}");
    }
}

async fn run_subscription_ticker_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (caller, responder) = connect::<F>().await?;

    let mut sub = caller.request(OperationKind::Subscription, "ticker", Value::Null)?;
    match sub.next_event().await {
        Some(CallerEvent::Started) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected started, got {other:?}"
            )))
        }
    }

    for expected in 0..3 {
        match sub.next_event().await {
            Some(CallerEvent::Data(value)) if value == json!(expected) => {}
            other => {
                return Err(TestError::Assertion(format!(
                    "expected tick {expected}, got {other:?}"
                )))
            }
        }
    }

    sub.cancel();
    loop {
        match sub.next_event().await {
            Some(CallerEvent::Data(_)) => continue,
            Some(CallerEvent::Complete) => break,
            other => {
                return Err(TestError::Assertion(format!(
                    "expected completion, got {other:?}"
                )))
            }
        }
    }

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    if responder.subscription_count() != 0 {
        return Err(TestError::Assertion(
            "subscription registry not cleared after cancel".into(),
        ));
    }

    caller.close();
    Ok(())
}

/// A full subscription lifecycle: started, a few ticks, cancel, cleanup.
pub async fn run_subscription_ticker<F: TransportFactory>() {
    if let Err(error) = run_subscription_ticker_inner::<F>().await {
        panic!("subscription ticker scenario failed: {error}");
    }
}

async fn run_error_passthrough_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (caller, _responder) = connect::<F>().await?;

    match caller
        .request(OperationKind::Query, "no.such.path", Value::Null)?
        .response()
        .await
    {
        Err(RpcError::Operation(wire)) if wire.error_code() == Some(ErrorCode::NotFound) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected not-found, got {other:?}"
            )))
        }
    }

    caller.close();
    Ok(())
}

/// Unknown paths come back as `NotFound` operation errors.
pub async fn run_error_passthrough<F: TransportFactory>() {
    if let Err(error) = run_error_passthrough_inner::<F>().await {
        panic!("error passthrough scenario failed: {error}");
    }
}
