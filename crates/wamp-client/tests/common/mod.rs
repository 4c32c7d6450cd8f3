//! Scripted router helpers shared by the integration tests.
//!
//! Note: some helpers may appear unused because each test file is compiled
//! on its own.
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;
use wamp_client::{
    Invocation, InvocationOutcome, InvocationResult, MemoryPeer, Procedure, RegisterOptions,
    Registration, Session, SessionDetails,
};
use wamp_core::{to_dict, Dict, Message};

pub const SESSION_ID: u64 = 1234;
const WAIT: Duration = Duration::from_secs(5);

/// Next message the session sent to the router.
pub async fn next(peer: &mut MemoryPeer) -> Message {
    timeout(WAIT, peer.recv())
        .await
        .expect("router timed out waiting for the session")
        .expect("session closed the transport")
}

/// Wait until the session closes the transport, skipping anything else.
pub async fn expect_closed(peer: &mut MemoryPeer) {
    timeout(WAIT, async {
        while peer.recv().await.is_some() {}
    })
    .await
    .expect("session never closed the transport");
}

/// Await a future with the test timeout.
pub async fn within<F: Future>(fut: F) -> F::Output {
    timeout(WAIT, fut).await.expect("timed out")
}

pub fn welcome_details() -> Dict {
    to_dict(json!({
        "authid": "anon-1",
        "authrole": "anonymous",
        "authmethod": "anonymous",
        "roles": {"broker": {}, "dealer": {}}
    }))
}

/// Connect `session` over an in-memory transport and welcome it.
pub async fn join(session: &Session) -> (MemoryPeer, SessionDetails) {
    let (transport, mut peer) = wamp_client::memory_pair();
    let joined = session.connect(transport).expect("connect refused");

    match next(&mut peer).await {
        Message::Hello { realm, .. } => assert_eq!(realm, session.realm()),
        other => panic!("expected HELLO, got {other:?}"),
    }
    peer.send(Message::Welcome {
        session: SESSION_ID,
        details: welcome_details(),
    })
    .unwrap();

    let details = within(joined).await.expect("join failed");
    (peer, details)
}

/// Register `procedure` and answer with `registration` as the router.
pub async fn register<P: Procedure>(
    session: &Session,
    peer: &mut MemoryPeer,
    procedure: &str,
    registration: u64,
    handler: P,
) -> Registration {
    let pending = session
        .register(procedure, handler, RegisterOptions::default())
        .unwrap();
    let request = match next(peer).await {
        Message::Register {
            request,
            procedure: p,
            ..
        } => {
            assert_eq!(p, procedure);
            request
        }
        other => panic!("expected REGISTER, got {other:?}"),
    };
    peer.send(Message::Registered {
        request,
        registration,
    })
    .unwrap();
    within(pending).await.unwrap()
}

pub fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| json!(v)).collect()
}

/// Pin a closure to the procedure signature so its argument type is inferred.
pub fn procedure<F, Fut>(f: F) -> F
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvocationOutcome> + Send + 'static,
{
    f
}

/// A procedure that returns nothing.
pub fn noop() -> impl Procedure {
    procedure(|_inv| async { Ok(InvocationResult::default()) })
}

/// `add2(a, b) = a + b`, counting how often it ran.
pub fn add2(calls: std::sync::Arc<std::sync::atomic::AtomicUsize>) -> impl Procedure {
    procedure(move |inv| {
        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move {
            let a = inv.args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = inv.args.get(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(InvocationResult::new(vec![json!(a + b)]))
        }
    })
}
