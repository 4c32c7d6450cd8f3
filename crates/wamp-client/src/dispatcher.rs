//! Local registration and subscription tables, and routing of inbound
//! invocations and events to application handlers.
//!
//! The dispatcher is owned by the session sequencer and never shared; all
//! methods run on the sequencer in message order.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use serde_json::Value;
use wamp_core::error::{WampError, WampResult};
use wamp_core::messages::uris;

use crate::types::{
    ApplicationError, Event, Invocation, InvocationResult, Registration, RegistrationId, RequestId,
    Subscription, SubscriptionId,
};

/// Result a procedure hands back for one invocation.
pub type InvocationOutcome = Result<InvocationResult, ApplicationError>;

/// A locally implemented procedure.
///
/// Implemented for every `Fn(Invocation) -> impl Future<Output = InvocationOutcome>`,
/// so plain async closures work. Synchronous procedures return
/// `std::future::ready(..)`.
pub trait Procedure: Send + Sync + 'static {
    fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, InvocationOutcome>;
}

impl<F, Fut> Procedure for F
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvocationOutcome> + Send + 'static,
{
    fn invoke(&self, invocation: Invocation) -> BoxFuture<'static, InvocationOutcome> {
        Box::pin(self(invocation))
    }
}

/// Handler for events on a subscription.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

struct RegistrationEntry {
    procedure: String,
    handler: Arc<dyn Procedure>,
    /// UNREGISTER sent; invocations are refused until the router answers.
    retiring: bool,
}

struct SubscriptionEntry {
    topic: String,
    handlers: Vec<(u64, EventHandler)>,
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    registrations: HashMap<RegistrationId, RegistrationEntry>,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    next_handle: u64,
    /// Invocations whose result has not been sent yet.
    in_flight: HashSet<RequestId>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registrations ────────────────────────────────────────────────

    pub fn add_registration(
        &mut self,
        id: RegistrationId,
        procedure: String,
        handler: Arc<dyn Procedure>,
    ) -> Registration {
        tracing::debug!(registration = id, procedure = %procedure, "procedure registered");
        self.registrations.insert(
            id,
            RegistrationEntry {
                procedure: procedure.clone(),
                handler,
                retiring: false,
            },
        );
        Registration { id, procedure }
    }

    /// Stop routing invocations to `id` while an UNREGISTER is outstanding.
    pub fn retire_registration(&mut self, id: RegistrationId) -> WampResult<()> {
        match self.registrations.get_mut(&id) {
            Some(entry) if !entry.retiring => {
                entry.retiring = true;
                Ok(())
            }
            _ => Err(WampError::NoSuchRegistration(id)),
        }
    }

    /// Undo [`retire_registration`](Self::retire_registration) after the router refused.
    pub fn restore_registration(&mut self, id: RegistrationId) {
        if let Some(entry) = self.registrations.get_mut(&id) {
            entry.retiring = false;
        }
    }

    pub fn remove_registration(&mut self, id: RegistrationId) -> bool {
        match self.registrations.remove(&id) {
            Some(entry) => {
                tracing::debug!(registration = id, procedure = %entry.procedure, "procedure unregistered");
                true
            }
            None => false,
        }
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Add a local handler for a router subscription and return its handle.
    pub fn add_subscriber(
        &mut self,
        id: SubscriptionId,
        topic: String,
        handler: EventHandler,
    ) -> Subscription {
        self.next_handle += 1;
        let handle = self.next_handle;
        let entry = self
            .subscriptions
            .entry(id)
            .or_insert_with(|| SubscriptionEntry {
                topic: topic.clone(),
                handlers: Vec::new(),
            });
        entry.handlers.push((handle, handler));
        tracing::debug!(
            subscription = id,
            topic = %topic,
            handlers = entry.handlers.len(),
            "subscribed"
        );
        Subscription { id, topic, handle }
    }

    /// Remove one local handler.
    ///
    /// Returns `true` when it was the last handler for the router
    /// subscription, meaning the router must be told to unsubscribe.
    pub fn remove_subscriber(&mut self, subscription: &Subscription) -> WampResult<bool> {
        let entry = self
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or(WampError::NoSuchSubscription(subscription.id))?;

        let before = entry.handlers.len();
        entry.handlers.retain(|(handle, _)| *handle != subscription.handle);
        if entry.handlers.len() == before {
            return Err(WampError::NoSuchSubscription(subscription.id));
        }

        if entry.handlers.is_empty() {
            self.subscriptions.remove(&subscription.id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop every handler of a subscription the router revoked.
    pub fn remove_subscription(&mut self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some(entry) => {
                tracing::debug!(subscription = id, topic = %entry.topic, "subscription removed");
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ── Inbound traffic ──────────────────────────────────────────────

    /// Deliver an event to every local handler of its subscription.
    ///
    /// A panicking handler is logged and skipped; the remaining handlers
    /// still run. Returns the number of handlers invoked.
    pub fn dispatch_event(&self, event: Event) -> WampResult<usize> {
        let entry = self
            .subscriptions
            .get(&event.subscription)
            .ok_or(WampError::DroppedEvent(event.subscription))?;

        let subscription = event.subscription;
        for (handle, handler) in &entry.handlers {
            let delivered = event.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(delivered))) {
                tracing::error!(
                    subscription,
                    handle,
                    topic = %entry.topic,
                    panic = %panic_message(payload.as_ref()),
                    "event handler panicked"
                );
            }
        }
        Ok(entry.handlers.len())
    }

    /// Start an invocation and return the future producing its outcome.
    ///
    /// Fails with `NoSuchRegistration` when the registration is unknown or
    /// being unregistered; the caller answers the router with an ERROR.
    pub fn start_invocation(
        &mut self,
        invocation: Invocation,
    ) -> WampResult<BoxFuture<'static, InvocationOutcome>> {
        let registration = invocation.registration;
        let handler = match self.registrations.get(&registration) {
            Some(entry) if !entry.retiring => entry.handler.clone(),
            _ => return Err(WampError::NoSuchRegistration(registration)),
        };

        if !self.in_flight.insert(invocation.request) {
            tracing::warn!(request = invocation.request, "invocation request id reused while in flight");
        }

        match catch_unwind(AssertUnwindSafe(|| handler.invoke(invocation))) {
            Ok(fut) => Ok(fut),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(registration, panic = %message, "procedure panicked");
                Ok(Box::pin(future::ready(Err(runtime_error(message)))))
            }
        }
    }

    /// Mark an invocation answered.
    ///
    /// Returns `false` if it was not in flight: a second result for the
    /// same invocation must not be sent.
    pub fn finish_invocation(&mut self, request: RequestId) -> bool {
        self.in_flight.remove(&request)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget everything; used when the session ends.
    pub fn clear(&mut self) {
        self.registrations.clear();
        self.subscriptions.clear();
        self.in_flight.clear();
    }
}

/// Application error reported for a procedure that panicked.
pub(crate) fn runtime_error(message: String) -> ApplicationError {
    ApplicationError::new(uris::ERROR_RUNTIME).with_args(vec![Value::String(message)])
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
