//! Caller-side behavior over an in-process transport pair, against both a
//! real responder and a hand-driven raw peer.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tether_core::{
    CallerEvent, CallerSession, DataTransformer, ErrorCode, OperationCall, OperationKind,
    OperationOutput, OperationRegistry, RequestId, ResponderSession, RpcError, Transport,
    TransportEvent, WireError,
};

struct TestRegistry;

impl OperationRegistry for TestRegistry {
    type Context = ();

    async fn invoke(&self, call: OperationCall<()>) -> Result<OperationOutput, WireError> {
        match (call.kind, call.path.as_str()) {
            (OperationKind::Query, "testQuery") => {
                Ok(OperationOutput::Value(json!({"hello": "world"})))
            }
            (OperationKind::Query, "echo") | (OperationKind::Mutation, "echo") => {
                Ok(OperationOutput::Value(call.input))
            }
            (OperationKind::Mutation, "sum") => {
                let total: i64 = call
                    .input
                    .as_array()
                    .map(|items| items.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(OperationOutput::Value(json!(total)))
            }
            (OperationKind::Subscription, "ticker") => {
                let stream = futures::stream::unfold(0i64, |n| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((Ok(json!(n)), n + 1))
                });
                Ok(OperationOutput::Stream(stream.boxed()))
            }
            _ => Err(WireError::new(
                ErrorCode::NotFound,
                format!("no such operation {}", call.path),
            )),
        }
    }
}

fn connected_pair() -> (Arc<CallerSession>, Arc<ResponderSession<TestRegistry>>) {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::new(a);
    let responder = ResponderSession::new(b, Arc::new(TestRegistry));
    tokio::spawn(Arc::clone(&caller).run());
    tokio::spawn(Arc::clone(&responder).run());
    (caller, responder)
}

fn open_mem(transport: &Transport) {
    #[allow(irrefutable_let_patterns)]
    if let Transport::Mem(mem) = transport {
        mem.open_link();
    }
}

async fn expect_open(peer: &Transport) {
    match peer.next_event().await {
        TransportEvent::Open => {}
        other => panic!("expected open, got {other:?}"),
    }
}

async fn expect_message(peer: &Transport) -> Value {
    match peer.next_event().await {
        TransportEvent::Message(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn query_and_mutation_round_trip() {
    let (caller, _responder) = connected_pair();

    let query = caller
        .request(OperationKind::Query, "testQuery", Value::Null)
        .unwrap();
    let mutation = caller
        .request(OperationKind::Mutation, "sum", json!([1, 2, 3]))
        .unwrap();

    assert_eq!(query.response().await.unwrap(), json!({"hello": "world"}));
    assert_eq!(mutation.response().await.unwrap(), json!(6));
}

#[tokio::test]
async fn synchronous_burst_coalesces_into_one_frame() {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::new(a);

    // Two pushes with no await between them; the run task has not polled
    // yet, so both are still queued when the first flush happens.
    let first = caller
        .request(OperationKind::Query, "testQuery", Value::Null)
        .unwrap();
    let second = caller
        .request(OperationKind::Mutation, "sum", json!([2, 2]))
        .unwrap();
    tokio::spawn(Arc::clone(&caller).run());

    expect_open(&b).await;
    let frame = expect_message(&b).await;
    let batch = frame.as_array().expect("burst should arrive as an array");
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0]["method"], "query");
    assert_eq!(batch[1]["method"], "mutation");

    // Answer both in a single batched frame as well.
    let reply = json!([
        {"id": batch[0]["id"], "result": {"type": "data", "data": {"hello": "world"}}},
        {"id": batch[1]["id"], "result": {"type": "data", "data": 4}},
    ]);
    b.send(reply.to_string()).await.unwrap();

    assert_eq!(first.response().await.unwrap(), json!({"hello": "world"}));
    assert_eq!(second.response().await.unwrap(), json!(4));
}

#[tokio::test]
async fn subscription_lifecycle_with_cancel() {
    let (caller, responder) = connected_pair();

    let mut sub = caller
        .request(OperationKind::Subscription, "ticker", Value::Null)
        .unwrap();

    match sub.next_event().await {
        Some(CallerEvent::Started) => {}
        other => panic!("expected started, got {other:?}"),
    }
    for expected in 0..2 {
        match sub.next_event().await {
            Some(CallerEvent::Data(value)) => assert_eq!(value, json!(expected)),
            other => panic!("expected data, got {other:?}"),
        }
    }

    sub.cancel();
    loop {
        match sub.next_event().await {
            Some(CallerEvent::Data(_)) => continue,
            Some(CallerEvent::Complete) => break,
            other => panic!("expected complete, got {other:?}"),
        }
    }

    // The stop crosses the pair and the registry entry goes away.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(responder.subscription_count(), 0);
    assert!(caller.pending_ids().is_empty());
}

#[tokio::test]
async fn unexpected_close_fails_pending_requests() {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::new(a);
    tokio::spawn(Arc::clone(&caller).run());

    let handle = caller
        .request(OperationKind::Query, "testQuery", Value::Null)
        .unwrap();

    expect_open(&b).await;
    expect_message(&b).await;
    b.close();

    match handle.response().await {
        Err(RpcError::ChannelClosedPrematurely) => {}
        other => panic!("expected premature close, got {other:?}"),
    }
    assert!(matches!(
        caller.request(OperationKind::Query, "testQuery", Value::Null),
        Err(RpcError::Transport(_))
    ));
}

#[tokio::test]
async fn deliberate_close_drains_then_closes_transport() {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::new(a);
    tokio::spawn(Arc::clone(&caller).run());

    let handle = caller
        .request(OperationKind::Query, "echo", json!(1))
        .unwrap();

    expect_open(&b).await;
    let frame = expect_message(&b).await;

    // Close with the request still pending: the transport stays up until
    // the response drains the table.
    caller.close();
    let reply = json!({"id": frame["id"], "result": {"type": "data", "data": 1}});
    b.send(reply.to_string()).await.unwrap();

    assert_eq!(handle.response().await.unwrap(), json!(1));
    match b.next_event().await {
        TransportEvent::Closed => {}
        other => panic!("expected closed, got {other:?}"),
    }
}

#[tokio::test]
async fn deliberate_close_completes_remaining_requests() {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::new(a);
    tokio::spawn(Arc::clone(&caller).run());

    let mut handle = caller
        .request(OperationKind::Query, "echo", json!(1))
        .unwrap();

    expect_open(&b).await;
    expect_message(&b).await;

    caller.close();
    b.close();

    loop {
        match handle.next_event().await {
            Some(CallerEvent::Complete) => break,
            Some(CallerEvent::Data(_)) | Some(CallerEvent::Started) => continue,
            other => panic!("expected quiet completion, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn duplicate_caller_id_is_rejected_locally() {
    let (caller, _responder) = connected_pair();

    let first = caller
        .request_with_id(
            RequestId::Number(7),
            OperationKind::Query,
            "testQuery",
            Value::Null,
        )
        .unwrap();

    match caller.request_with_id(
        RequestId::Number(7),
        OperationKind::Query,
        "testQuery",
        Value::Null,
    ) {
        Err(RpcError::Status { code, .. }) => assert_eq!(code, ErrorCode::BadRequest),
        other => panic!("expected bad request, got {other:?}"),
    }

    // The first request is unaffected.
    assert_eq!(first.response().await.unwrap(), json!({"hello": "world"}));
}

#[tokio::test]
async fn requests_queue_until_the_link_opens() {
    let (a, b) = Transport::mem_pair_pending();
    let opener = a.clone();
    let caller = CallerSession::new(a);
    tokio::spawn(Arc::clone(&caller).run());

    let handle = caller
        .request(OperationKind::Query, "echo", json!("queued"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    open_mem(&opener);
    open_mem(&b);

    expect_open(&b).await;
    let frame = expect_message(&b).await;
    assert_eq!(frame["params"]["input"], json!("queued"));

    let reply = json!({"id": frame["id"], "result": {"type": "data", "data": "queued"}});
    b.send(reply.to_string()).await.unwrap();
    assert_eq!(handle.response().await.unwrap(), json!("queued"));
}

#[tokio::test]
async fn cancel_before_send_leaves_no_trace_on_the_wire() {
    let (a, b) = Transport::mem_pair_pending();
    let opener = a.clone();
    let caller = CallerSession::new(a);
    tokio::spawn(Arc::clone(&caller).run());

    let mut doomed = caller
        .request(OperationKind::Subscription, "ticker", Value::Null)
        .unwrap();
    doomed.cancel();
    let probe = caller
        .request(OperationKind::Query, "echo", json!("probe"))
        .unwrap();

    open_mem(&opener);
    open_mem(&b);

    expect_open(&b).await;
    let frame = expect_message(&b).await;
    assert_eq!(frame["params"]["input"], json!("probe"), "only the probe may cross");

    let reply = json!({"id": frame["id"], "result": {"type": "data", "data": "probe"}});
    b.send(reply.to_string()).await.unwrap();
    assert_eq!(probe.response().await.unwrap(), json!("probe"));
}

#[tokio::test]
async fn close_completes_requests_still_in_the_queue() {
    let (a, _b) = Transport::mem_pair_pending();
    let caller = CallerSession::new(a);
    tokio::spawn(Arc::clone(&caller).run());

    // The link never opens, so this request can never flush.
    let mut handle = caller
        .request(OperationKind::Query, "echo", json!(1))
        .unwrap();
    caller.close();

    match handle.next_event().await {
        Some(CallerEvent::Complete) => {}
        other => panic!("expected quiet completion, got {other:?}"),
    }
    assert!(caller.pending_ids().is_empty());
    assert!(matches!(
        caller.request(OperationKind::Query, "echo", json!(2)),
        Err(RpcError::Transport(_))
    ));
}

#[tokio::test]
async fn peer_stopping_a_live_subscription_surfaces_an_error() {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::new(a);
    tokio::spawn(Arc::clone(&caller).run());

    let mut sub = caller
        .request(OperationKind::Subscription, "ticker", Value::Null)
        .unwrap();

    expect_open(&b).await;
    let frame = expect_message(&b).await;
    let id = frame["id"].clone();

    // The responder ends the subscription without ever being asked to.
    b.send(json!({"id": id, "result": {"type": "started"}}).to_string())
        .await
        .unwrap();
    b.send(json!({"id": id, "result": {"type": "stopped"}}).to_string())
        .await
        .unwrap();

    match sub.next_event().await {
        Some(CallerEvent::Started) => {}
        other => panic!("expected started, got {other:?}"),
    }
    match sub.next_event().await {
        Some(CallerEvent::Error(RpcError::SubscriptionEndedPrematurely)) => {}
        other => panic!("expected premature end, got {other:?}"),
    }
    assert!(caller.pending_ids().is_empty());
}

#[tokio::test]
async fn reconnect_notice_drains_then_closes() {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::new(a);
    tokio::spawn(Arc::clone(&caller).run());

    let handle = caller
        .request(OperationKind::Query, "echo", json!(1))
        .unwrap();

    expect_open(&b).await;
    let frame = expect_message(&b).await;

    // The notice stops new work but lets the in-flight request finish.
    b.send(json!({"id": null, "method": "reconnect"}).to_string())
        .await
        .unwrap();
    let reply = json!({"id": frame["id"], "result": {"type": "data", "data": 1}});
    b.send(reply.to_string()).await.unwrap();

    assert_eq!(handle.response().await.unwrap(), json!(1));
    assert!(matches!(
        caller.request(OperationKind::Query, "echo", json!(2)),
        Err(RpcError::Transport(_))
    ));
    match b.next_event().await {
        TransportEvent::Closed => {}
        other => panic!("expected closed, got {other:?}"),
    }
}

/// Wraps every value in an object on the way out and unwraps it on the way
/// in, so an asymmetric application would notice immediately.
struct Wrapping;

impl DataTransformer for Wrapping {
    fn serialize(&self, value: Value) -> Value {
        json!({"w": value})
    }

    fn deserialize(&self, value: Value) -> Value {
        match value {
            Value::Object(mut obj) => obj.remove("w").unwrap_or(Value::Null),
            other => other,
        }
    }
}

#[tokio::test]
async fn transformer_round_trips_through_both_sides() {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::with_transformer(a, Arc::new(Wrapping));
    let responder = ResponderSession::builder(b, Arc::new(TestRegistry))
        .transformer(Arc::new(Wrapping))
        .build();
    tokio::spawn(Arc::clone(&caller).run());
    tokio::spawn(Arc::clone(&responder).run());

    for value in [
        json!({"nested": {"deep": true}}),
        json!([1, "two", null]),
        json!(42),
        json!("plain"),
        Value::Null,
    ] {
        let handle = caller
            .request(OperationKind::Query, "echo", value.clone())
            .unwrap();
        assert_eq!(handle.response().await.unwrap(), value);
    }
}
