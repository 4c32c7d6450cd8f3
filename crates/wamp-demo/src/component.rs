//! The example component.
//!
//! On every join it registers `com.example.add2`, subscribes to
//! `com.example.oncounter`, and starts a timer that calls `add2` and
//! publishes a counter each round. The loop state lives in [`Ticker`],
//! owned by the timer task.

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use wamp_client::{
    ApplicationError, CallOptions, Dict, Event, Invocation, InvocationOutcome, InvocationResult,
    PublishOptions, RegisterOptions, Session, SessionId, SubscribeOptions, WampError, WampResult,
};

use crate::config::DemoConfig;

pub const ADD2: &str = "com.example.add2";
pub const ONCOUNTER: &str = "com.example.oncounter";
const COMPONENT: &str = "Rust";

/// Install the component's lifecycle listeners on `session`.
pub fn attach(session: &Session, demo: DemoConfig) {
    session.on_connect(|_session| info!("transport connected"));
    session.on_join(move |session, details| {
        info!(session = details.session_id, realm = %details.realm, "session joined");
        start(session, details.session_id, &demo);
    });
    session.on_leave(|_session, close| {
        info!(reason = %close.reason, message = ?close.message, "left realm");
    });
    session.on_disconnect(|_session, was_clean| info!(was_clean, "disconnected"));
}

fn start(session: &Session, session_id: SessionId, demo: &DemoConfig) {
    match session.register(ADD2, add2, RegisterOptions::default()) {
        Ok(pending) => {
            tokio::spawn(async move {
                match pending.await {
                    Ok(registration) => {
                        info!(registration = registration.id, "registered procedure {ADD2}")
                    }
                    Err(error) => warn!(%error, "failed to register {ADD2}"),
                }
            });
        }
        Err(error) => warn!(%error, "failed to register {ADD2}"),
    }

    match session.subscribe(ONCOUNTER, on_counter, SubscribeOptions::default()) {
        Ok(pending) => {
            tokio::spawn(async move {
                match pending.await {
                    Ok(subscription) => info!(subscription = subscription.id, "subscribed to {ONCOUNTER}"),
                    Err(error) => warn!(%error, "failed to subscribe to {ONCOUNTER}"),
                }
            });
        }
        Err(error) => warn!(%error, "failed to subscribe to {ONCOUNTER}"),
    }

    let session = session.clone();
    let mut ticker = Ticker::new(demo.addend);
    let mut timer = tokio::time::interval(demo.interval());
    tokio::spawn(async move {
        loop {
            timer.tick().await;
            // A later join starts its own timer.
            if session.session_id() != Some(session_id) {
                break;
            }
            if let Err(error) = ticker.tick(&session).await {
                debug!(%error, "stopping timer");
                break;
            }
        }
    });
}

/// `add2(a, b)` returns `[a + b, callee session id, component name]`.
pub async fn add2(invocation: Invocation) -> InvocationOutcome {
    let operand = |index: usize| {
        invocation
            .args
            .get(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ApplicationError::new("wamp.error.invalid_argument")
                    .with_args(vec![json!(format!("argument {index} must be an integer"))])
            })
    };
    let sum = operand(0)?
        .checked_add(operand(1)?)
        .ok_or_else(|| ApplicationError::new("com.example.error.overflow"))?;

    Ok(InvocationResult::new(vec![
        json!(sum),
        json!(invocation.session_id),
        json!(COMPONENT),
    ]))
}

fn on_counter(event: Event) {
    info!(
        counter = ?event.args.first(),
        from = ?event.args.get(1),
        component = ?event.args.get(2),
        "oncounter event"
    );
}

/// State carried between timer rounds.
#[derive(Debug)]
pub struct Ticker {
    /// First `add2` operand; advances after each successful call.
    x: i64,
    addend: i64,
    /// Published value; advances after each publish, independent of the call.
    counter: u64,
}

impl Ticker {
    pub fn new(addend: i64) -> Self {
        Self {
            x: 0,
            addend,
            counter: 0,
        }
    }

    /// One round: call `add2(x, addend)` and publish the counter.
    ///
    /// Returns an error only when the session can no longer be used.
    pub async fn tick(&mut self, session: &Session) -> WampResult<()> {
        let call = session.call(
            ADD2,
            vec![json!(self.x), json!(self.addend)],
            Dict::new(),
            CallOptions::default(),
        )?;

        let session_id = session.session_id().unwrap_or_default();
        session
            .publish(
                ONCOUNTER,
                vec![json!(self.counter), json!(session_id), json!(COMPONENT)],
                Dict::new(),
                PublishOptions::default(),
            )?
            .await?;
        info!(counter = self.counter, "published to {ONCOUNTER}");
        self.counter += 1;

        match call.await {
            Ok(result) => {
                info!(result = ?result.args.first(), "got result");
                self.x += 1;
                Ok(())
            }
            Err(WampError::ConnectionClosed) => Err(WampError::ConnectionClosed),
            Err(error) => {
                warn!(%error, "call failed");
                Ok(())
            }
        }
    }
}
