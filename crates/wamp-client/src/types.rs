//! Value types exchanged between the application and the session.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wamp_core::messages::{Dict, Id, List};

pub type SessionId = Id;
pub type RequestId = Id;
pub type RegistrationId = Id;
pub type SubscriptionId = Id;
pub type PublicationId = Id;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport. Initial and terminal state.
    Disconnected,
    /// Transport is being opened.
    Connecting,
    /// Transport is open and HELLO has been sent.
    Connected,
    /// Credentials were sent in answer to a CHALLENGE.
    Authenticating,
    /// WELCOME received; operations are legal.
    Joined,
    /// GOODBYE sent, waiting for the router's answer.
    Leaving,
}

/// How the router matches a procedure or topic URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    #[default]
    Exact,
    Prefix,
    Wildcard,
}

/// How the router picks a callee when several share a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokePolicy {
    Single,
    Roundrobin,
    Random,
    First,
    Last,
}

fn insert_policy<T: Serialize>(options: &mut Dict, key: &str, value: T) {
    if let Ok(value) = serde_json::to_value(value) {
        options.insert(key.to_string(), value);
    }
}

/// Options for `Session::call`.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Router-side call timeout.
    pub timeout: Option<Duration>,
    /// Ask the router to disclose our session id to the callee.
    pub disclose_me: bool,
}

impl CallOptions {
    pub(crate) fn to_dict(&self) -> Dict {
        let mut options = Dict::new();
        if let Some(timeout) = self.timeout {
            options.insert("timeout".into(), Value::from(timeout.as_millis() as u64));
        }
        if self.disclose_me {
            options.insert("disclose_me".into(), Value::Bool(true));
        }
        options
    }
}

/// Options for `Session::register`.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub match_policy: MatchPolicy,
    pub invoke: Option<InvokePolicy>,
    /// Ask the router to disclose the caller's session id in invocations.
    pub disclose_caller: bool,
}

impl RegisterOptions {
    pub(crate) fn to_dict(&self) -> Dict {
        let mut options = Dict::new();
        if self.match_policy != MatchPolicy::Exact {
            insert_policy(&mut options, "match", self.match_policy);
        }
        if let Some(invoke) = self.invoke {
            insert_policy(&mut options, "invoke", invoke);
        }
        if self.disclose_caller {
            options.insert("disclose_caller".into(), Value::Bool(true));
        }
        options
    }
}

/// Options for `Session::subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub match_policy: MatchPolicy,
}

impl SubscribeOptions {
    pub(crate) fn to_dict(&self) -> Dict {
        let mut options = Dict::new();
        if self.match_policy != MatchPolicy::Exact {
            insert_policy(&mut options, "match", self.match_policy);
        }
        options
    }
}

/// Options for `Session::publish`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Wait for a PUBLISHED acknowledgement from the router.
    pub acknowledge: bool,
    /// Whether the publisher receives its own event (router default: excluded).
    pub exclude_me: Option<bool>,
    /// Sessions that must not receive the event.
    pub exclude: Vec<SessionId>,
    /// Only these sessions receive the event (empty means everyone).
    pub eligible: Vec<SessionId>,
    /// Ask the router to retain the event for late subscribers.
    pub retain: bool,
}

impl PublishOptions {
    /// Options with acknowledgement requested.
    pub fn acknowledged() -> Self {
        Self {
            acknowledge: true,
            ..Default::default()
        }
    }

    pub(crate) fn to_dict(&self) -> Dict {
        let mut options = Dict::new();
        if self.acknowledge {
            options.insert("acknowledge".into(), Value::Bool(true));
        }
        if let Some(exclude_me) = self.exclude_me {
            options.insert("exclude_me".into(), Value::Bool(exclude_me));
        }
        if !self.exclude.is_empty() {
            options.insert("exclude".into(), Value::from(self.exclude.clone()));
        }
        if !self.eligible.is_empty() {
            options.insert("eligible".into(), Value::from(self.eligible.clone()));
        }
        if self.retain {
            options.insert("retain".into(), Value::Bool(true));
        }
        options
    }
}

/// Outcome of a successful call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallResult {
    pub args: List,
    pub kwargs: Dict,
    pub details: Dict,
}

/// Outcome of a publish. `id` is only known when acknowledgement was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    pub id: Option<PublicationId>,
}

/// A procedure registered by this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: RegistrationId,
    pub procedure: String,
}

/// A local subscription handle.
///
/// Several handles may share one router subscription id when the same topic
/// is subscribed more than once; `handle` tells them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub handle: u64,
}

/// What the router told us when we joined.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDetails {
    pub realm: String,
    pub session_id: SessionId,
    pub authid: Option<String>,
    pub authrole: Option<String>,
    pub authmethod: Option<String>,
    /// Roles the router announced (`broker`, `dealer`, ...).
    pub router_roles: Dict,
    /// The full WELCOME details.
    pub details: Dict,
}

impl SessionDetails {
    pub(crate) fn from_welcome(realm: &str, session_id: SessionId, details: Dict) -> Self {
        let text = |key: &str| details.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            realm: realm.to_string(),
            session_id,
            authid: text("authid"),
            authrole: text("authrole"),
            authmethod: text("authmethod"),
            router_roles: details
                .get("roles")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            details,
        }
    }
}

/// Reason a session left its realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDetails {
    pub reason: String,
    pub message: Option<String>,
}

impl CloseDetails {
    pub fn new(reason: impl Into<String>, message: Option<String>) -> Self {
        Self {
            reason: reason.into(),
            message,
        }
    }

    pub(crate) fn from_message(reason: &str, details: &Dict) -> Self {
        Self::new(
            reason,
            details
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        )
    }
}

/// How the last connection of a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub was_clean: bool,
    pub reason: Option<String>,
}

/// An inbound invocation of a locally registered procedure.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request: RequestId,
    pub registration: RegistrationId,
    /// Our own session id.
    pub session_id: SessionId,
    /// The caller's session id, when the router disclosed it.
    pub caller: Option<SessionId>,
    /// The concrete procedure, present for pattern-based registrations.
    pub procedure: Option<String>,
    pub args: List,
    pub kwargs: Dict,
    pub details: Dict,
}

/// An inbound event for a subscription.
#[derive(Debug, Clone)]
pub struct Event {
    pub subscription: SubscriptionId,
    pub publication: PublicationId,
    /// The concrete topic, present for pattern-based subscriptions.
    pub topic: Option<String>,
    /// The publisher's session id, when the router disclosed it.
    pub publisher: Option<SessionId>,
    pub args: List,
    pub kwargs: Dict,
    pub details: Dict,
}

/// Successful outcome of a procedure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationResult {
    pub args: List,
    pub kwargs: Dict,
}

impl InvocationResult {
    pub fn new(args: List) -> Self {
        Self {
            args,
            kwargs: Dict::new(),
        }
    }

    pub fn with_kwargs(mut self, kwargs: Dict) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// Application error returned by a procedure, sent to the caller as ERROR.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationError {
    pub error: String,
    pub args: List,
    pub kwargs: Dict,
}

impl ApplicationError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            args: List::new(),
            kwargs: Dict::new(),
        }
    }

    pub fn with_args(mut self, args: List) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Dict) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// `None` for an empty list, so optional wire tails stay absent.
pub(crate) fn non_empty_list(list: List) -> Option<List> {
    (!list.is_empty()).then_some(list)
}

/// `None` for an empty dict, so optional wire tails stay absent.
pub(crate) fn non_empty_dict(dict: Dict) -> Option<Dict> {
    (!dict.is_empty()).then_some(dict)
}
