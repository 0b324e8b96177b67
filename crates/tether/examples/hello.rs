//! A caller and a responder talking over an in-process pair.
//!
//! Run with: `cargo run -p tether --example hello`

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tether::prelude::*;

struct Greeter;

impl OperationRegistry for Greeter {
    type Context = ();

    async fn invoke(&self, call: OperationCall<()>) -> Result<OperationOutput, WireError> {
        match (call.kind, call.path.as_str()) {
            (OperationKind::Query, "greet") => {
                let name = call.input["name"].as_str().unwrap_or("world");
                Ok(OperationOutput::Value(json!({ "hello": name })))
            }
            (OperationKind::Subscription, "countdown") => {
                let stream = futures::stream::iter((1..=3).rev())
                    .then(|n| async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!(n))
                    })
                    .boxed();
                Ok(OperationOutput::Stream(stream))
            }
            _ => Err(WireError::new(
                ErrorCode::NotFound,
                format!("no such operation {}", call.path),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (a, b) = Transport::mem_pair();
    let caller = CallerSession::new(a);
    let responder = ResponderSession::new(b, Arc::new(Greeter));
    tokio::spawn(Arc::clone(&caller).run());
    tokio::spawn(Arc::clone(&responder).run());

    let reply = caller
        .request(OperationKind::Query, "greet", json!({"name": "tether"}))?
        .response()
        .await?;
    println!("greet -> {reply}");

    let mut sub = caller.request(OperationKind::Subscription, "countdown", Value::Null)?;
    while let Some(event) = sub.next_event().await {
        match event {
            CallerEvent::Started => println!("countdown started"),
            CallerEvent::Data(n) => println!("tick {n}"),
            CallerEvent::Error(RpcError::SubscriptionEndedPrematurely) => {
                println!("countdown finished");
                break;
            }
            CallerEvent::Error(error) => return Err(error.into()),
            CallerEvent::Complete => break,
        }
    }

    caller.close();
    Ok(())
}
