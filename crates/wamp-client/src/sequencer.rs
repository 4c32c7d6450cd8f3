//! The session sequencer.
//!
//! One task per connection owns the transport, the pending-operation table
//! and the dispatcher. It processes inbound messages in receipt order and
//! application commands in submission order, one at a time, so no table
//! is ever touched concurrently.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use wamp_core::error::{WampError, WampResult};
use wamp_core::messages::{uris, Dict, List, Message, MessageType};
use wamp_core::transport::{Transport, TransportEvent};

use crate::auth::Challenge;
use crate::dispatcher::{panic_message, runtime_error, Dispatcher, EventHandler, InvocationOutcome, Procedure};
use crate::pending::{Completion, PendingOperation, PendingTable, RequestKind};
use crate::session::Session;
use crate::types::{
    non_empty_dict, non_empty_list, CallResult, CloseDetails, Event, ExitInfo, Invocation,
    Publication, Registration, RegistrationId, RequestId, SessionDetails, SessionId,
    SessionState, Subscription, SubscriptionId,
};

const AGENT: &str = concat!("wamp-client-rs/", env!("CARGO_PKG_VERSION"));

type Reply<T> = oneshot::Sender<WampResult<T>>;

/// Work queued for the sequencer by session handles and invocation tasks.
pub(crate) enum Command {
    Call {
        request: RequestId,
        procedure: String,
        options: Dict,
        args: List,
        kwargs: Dict,
        reply: Reply<CallResult>,
    },
    Register {
        request: RequestId,
        procedure: String,
        options: Dict,
        handler: Arc<dyn Procedure>,
        reply: Reply<Registration>,
    },
    Unregister {
        request: RequestId,
        registration: RegistrationId,
        reply: Reply<()>,
    },
    Subscribe {
        request: RequestId,
        topic: String,
        options: Dict,
        handler: EventHandler,
        reply: Reply<Subscription>,
    },
    Unsubscribe {
        request: RequestId,
        subscription: Subscription,
        reply: Reply<()>,
    },
    Publish {
        request: RequestId,
        topic: String,
        options: Dict,
        args: List,
        kwargs: Dict,
        reply: Option<Reply<Publication>>,
    },
    /// Outcome of a local procedure, sent back by its invocation task.
    Yield {
        request: RequestId,
        outcome: InvocationOutcome,
    },
    Leave {
        reason: String,
        message: Option<String>,
        reply: Reply<CloseDetails>,
    },
}

impl Command {
    fn fail(self, error: WampError) {
        match self {
            Command::Call { reply, .. } => reply.fail(error),
            Command::Register { reply, .. } => reply.fail(error),
            Command::Unregister { reply, .. } | Command::Unsubscribe { reply, .. } => {
                reply.fail(error)
            }
            Command::Subscribe { reply, .. } => reply.fail(error),
            Command::Publish { reply, .. } => {
                if let Some(reply) = reply {
                    reply.fail(error);
                }
            }
            Command::Yield { request, .. } => {
                tracing::debug!(request, "invocation result discarded");
            }
            Command::Leave { reply, .. } => reply.fail(error),
        }
    }
}

/// Completion of a pending request together with what is needed to
/// install its result.
pub(crate) enum Responder {
    Call(Reply<CallResult>),
    Register {
        procedure: String,
        handler: Arc<dyn Procedure>,
        reply: Reply<Registration>,
    },
    Unregister {
        registration: RegistrationId,
        reply: Reply<()>,
    },
    Subscribe {
        topic: String,
        handler: EventHandler,
        reply: Reply<Subscription>,
    },
    Unsubscribe(Reply<()>),
    Publish(Reply<Publication>),
}

impl Completion for Responder {
    fn fail(self, error: WampError) {
        match self {
            Responder::Call(reply) => reply.fail(error),
            Responder::Register { reply, .. } => reply.fail(error),
            Responder::Unregister { reply, .. } | Responder::Unsubscribe(reply) => reply.fail(error),
            Responder::Subscribe { reply, .. } => reply.fail(error),
            Responder::Publish(reply) => reply.fail(error),
        }
    }
}

/// An UNSUBSCRIBE held back because a SUBSCRIBE still in flight for the
/// same topic may be answered with the same router subscription.
struct DeferredUnsubscribe {
    request: RequestId,
    subscription: SubscriptionId,
    topic: String,
    reply: Reply<()>,
}

/// `Err` ends the connection with the given exit.
type Flow = Result<(), ExitInfo>;

enum Step {
    Inbound(TransportEvent),
    Command(Option<Command>),
}

pub(crate) struct Sequencer<T> {
    session: Session,
    transport: T,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Handed to invocation tasks so their outcome comes back through the queue.
    results: mpsc::UnboundedSender<Command>,
    pending: PendingTable<Responder>,
    dispatcher: Dispatcher,
    /// SUBSCRIBE requests in flight, per topic.
    subscribing: HashMap<String, usize>,
    deferred: Vec<DeferredUnsubscribe>,
    join: Option<Reply<SessionDetails>>,
    leaving: Option<(CloseDetails, Reply<CloseDetails>)>,
    session_id: Option<SessionId>,
    opened: bool,
    transport_closed: bool,
    joined: bool,
    left: bool,
}

impl<T: Transport + 'static> Sequencer<T> {
    pub fn new(
        session: Session,
        transport: T,
        commands: mpsc::UnboundedReceiver<Command>,
        results: mpsc::UnboundedSender<Command>,
        join: Reply<SessionDetails>,
    ) -> Self {
        Self {
            session,
            transport,
            commands,
            results,
            pending: PendingTable::new(),
            dispatcher: Dispatcher::new(),
            subscribing: HashMap::new(),
            deferred: Vec::new(),
            join: Some(join),
            leaving: None,
            session_id: None,
            opened: false,
            transport_closed: false,
            joined: false,
            left: false,
        }
    }

    pub async fn run(mut self) {
        let exit = self.drive().await;
        if self.opened && !self.transport_closed {
            if let Err(error) = self.transport.close().await {
                tracing::debug!(%error, "error closing transport");
            }
        }
        self.teardown(exit);
    }

    async fn drive(&mut self) -> ExitInfo {
        if let Err(error) = self.transport.open().await {
            tracing::error!(%error, "transport failed to open");
            let exit = ExitInfo {
                was_clean: false,
                reason: Some(error.to_string()),
            };
            self.fail_join(error);
            return exit;
        }
        self.opened = true;
        self.set_state(SessionState::Connected);
        self.session.shared.lifecycle.connected(&self.session);

        let hello = self.hello();
        if let Err(exit) = self.send(hello).await {
            return exit;
        }

        loop {
            let step = tokio::select! {
                event = self.transport.recv() => Step::Inbound(event),
                command = self.commands.recv() => Step::Command(command),
            };

            let flow = match step {
                Step::Inbound(TransportEvent::Message(message)) => self.on_message(message).await,
                Step::Inbound(TransportEvent::Closed { was_clean, reason }) => {
                    self.transport_closed = true;
                    Err(self.on_transport_closed(was_clean, reason))
                }
                Step::Command(Some(command)) => self.on_command(command).await,
                // We hold a sender ourselves, so the queue never ends first.
                Step::Command(None) => continue,
            };
            if let Err(exit) = flow {
                return exit;
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn state(&self) -> SessionState {
        self.session.state()
    }

    fn set_state(&self, state: SessionState) {
        self.session.shared.status.send_modify(|status| status.state = state);
        tracing::debug!(?state, "session state changed");
    }

    async fn send(&mut self, message: Message) -> Flow {
        tracing::trace!(kind = %message.message_type(), "send");
        self.transport.send(message).await.map_err(|error| {
            tracing::error!(%error, "transport send failed");
            ExitInfo {
                was_clean: false,
                reason: Some(error.to_string()),
            }
        })
    }

    fn fail_join(&mut self, error: WampError) {
        if let Some(join) = self.join.take() {
            join.fail(error);
        }
    }

    /// Fire on-leave once per joined connection.
    fn report_leave(&mut self, close: &CloseDetails) {
        if self.joined && !self.left {
            self.left = true;
            self.session.shared.lifecycle.left(&self.session, close);
        }
    }

    fn hello(&self) -> Message {
        let config = self.session.config();
        let mut details = Dict::new();
        details.insert("agent".into(), Value::from(AGENT));
        details.insert(
            "roles".into(),
            json!({
                "caller": {"features": {
                    "caller_identification": true,
                    "call_timeout": true,
                }},
                "callee": {"features": {
                    "caller_identification": true,
                    "pattern_based_registration": true,
                    "shared_registration": true,
                    "registration_revocation": true,
                }},
                "publisher": {"features": {
                    "publisher_exclusion": true,
                    "subscriber_blackwhite_listing": true,
                }},
                "subscriber": {"features": {
                    "pattern_based_subscription": true,
                    "publisher_identification": true,
                    "subscription_revocation": true,
                }},
            }),
        );

        if !config.authenticators.is_empty() {
            let methods: Vec<&str> = config.authenticators.iter().map(|a| a.method()).collect();
            details.insert("authmethods".into(), json!(methods));
        }
        if let Some(authid) = config.authenticators.iter().find_map(|a| a.authid()) {
            details.insert("authid".into(), Value::from(authid));
        }
        if let Some(extra) = config.authenticators.iter().find_map(|a| a.authextra()) {
            details.insert("authextra".into(), Value::Object(extra));
        }

        Message::Hello {
            realm: config.realm.clone(),
            details,
        }
    }

    async fn protocol_violation(&mut self, text: String) -> Flow {
        tracing::error!(violation = %text, "protocol violation");
        let mut details = Dict::new();
        details.insert("message".into(), Value::String(text.clone()));
        // The connection ends either way.
        let _ = self
            .send(Message::Abort {
                details,
                reason: uris::ERROR_PROTOCOL_VIOLATION.into(),
            })
            .await;
        self.report_leave(&CloseDetails::new(
            uris::ERROR_PROTOCOL_VIOLATION,
            Some(text.clone()),
        ));
        self.fail_join(WampError::Protocol(text));
        Err(ExitInfo {
            was_clean: false,
            reason: Some(uris::ERROR_PROTOCOL_VIOLATION.into()),
        })
    }

    /// Abort the opening handshake from our side.
    async fn abort_join(&mut self, reason: &str, error: WampError) -> Flow {
        let mut details = Dict::new();
        details.insert("message".into(), Value::String(error.to_string()));
        let _ = self
            .send(Message::Abort {
                details,
                reason: reason.to_string(),
            })
            .await;
        self.fail_join(error);
        Err(ExitInfo {
            was_clean: true,
            reason: Some(reason.to_string()),
        })
    }

    // ── Inbound ──────────────────────────────────────────────────────

    async fn on_message(&mut self, message: Message) -> Flow {
        tracing::trace!(kind = %message.message_type(), "recv");

        let state = self.state();
        let establishing = matches!(
            state,
            SessionState::Connected | SessionState::Authenticating
        );
        let handshake = matches!(message, Message::Challenge { .. } | Message::Welcome { .. });
        if establishing != handshake && !matches!(message, Message::Abort { .. }) {
            return self
                .protocol_violation(format!(
                    "unexpected {} while {state:?}",
                    message.message_type()
                ))
                .await;
        }

        match message {
            Message::Challenge { auth_method, extra } => {
                self.on_challenge(Challenge {
                    method: auth_method,
                    extra,
                })
                .await
            }
            Message::Welcome { session, details } => {
                self.on_welcome(session, details);
                Ok(())
            }
            Message::Abort { details, reason } => Err(self.on_abort(details, reason)),
            Message::Goodbye { details, reason } => self.on_goodbye(details, reason).await,
            Message::Error {
                request_type,
                request,
                error,
                args,
                kwargs,
                ..
            } => {
                self.on_error(request_type, request, error, args, kwargs)
                    .await
            }
            Message::Result {
                request,
                details,
                args,
                kwargs,
            } => {
                self.on_result(request, details, args, kwargs);
                Ok(())
            }
            Message::Registered {
                request,
                registration,
            } => {
                self.on_registered(request, registration);
                Ok(())
            }
            Message::Unregistered { request, details } => {
                self.on_unregistered(request, details);
                Ok(())
            }
            Message::Subscribed {
                request,
                subscription,
            } => self.on_subscribed(request, subscription).await,
            Message::Unsubscribed { request, details } => {
                self.on_unsubscribed(request, details);
                Ok(())
            }
            Message::Published {
                request,
                publication,
            } => {
                if let Some(PendingOperation {
                    completion: Responder::Publish(reply),
                    ..
                }) = self.pending.resolve(request, RequestKind::Publish)
                {
                    let _ = reply.send(Ok(Publication {
                        id: Some(publication),
                    }));
                }
                Ok(())
            }
            Message::Event {
                subscription,
                publication,
                details,
                args,
                kwargs,
            } => {
                self.on_event(subscription, publication, details, args, kwargs);
                Ok(())
            }
            Message::Invocation {
                request,
                registration,
                details,
                args,
                kwargs,
            } => {
                self.on_invocation(request, registration, details, args, kwargs)
                    .await
            }
            other => {
                self.protocol_violation(format!("{} is not sent by routers", other.message_type()))
                    .await
            }
        }
    }

    async fn on_challenge(&mut self, challenge: Challenge) -> Flow {
        let authenticator = self
            .session
            .config()
            .authenticators
            .iter()
            .find(|a| a.accepts_method(&challenge.method))
            .cloned();

        let Some(authenticator) = authenticator else {
            tracing::error!(method = %challenge.method, "no authenticator for challenge");
            let error = WampError::NoMatchingAuthenticator {
                method: challenge.method,
            };
            return self.abort_join(uris::ERROR_NO_AUTH_METHOD, error).await;
        };

        match authenticator.compute_credentials(&challenge) {
            Ok(credentials) => {
                tracing::debug!(method = %challenge.method, "answering challenge");
                self.set_state(SessionState::Authenticating);
                self.send(Message::Authenticate {
                    signature: credentials.signature,
                    extra: credentials.extra,
                })
                .await
            }
            Err(error) => {
                tracing::error!(method = %challenge.method, %error, "failed to compute credentials");
                self.abort_join(uris::ERROR_AUTHENTICATION_FAILED, error).await
            }
        }
    }

    fn on_welcome(&mut self, session_id: SessionId, details: Dict) {
        let details = SessionDetails::from_welcome(self.session.realm(), session_id, details);
        self.session_id = Some(session_id);
        self.joined = true;
        self.session.shared.status.send_modify(|status| {
            status.state = SessionState::Joined;
            status.session_id = Some(session_id);
        });
        tracing::info!(
            session = session_id,
            realm = %details.realm,
            authid = ?details.authid,
            authrole = ?details.authrole,
            "joined realm"
        );

        self.session.shared.lifecycle.joined(&self.session, &details);
        if let Some(join) = self.join.take() {
            let _ = join.send(Ok(details));
        }
    }

    fn on_abort(&mut self, details: Dict, reason: String) -> ExitInfo {
        let close = CloseDetails::from_message(&reason, &details);
        tracing::warn!(reason = %close.reason, message = ?close.message, "router aborted session");
        self.report_leave(&close);
        self.fail_join(WampError::Aborted {
            reason: close.reason,
            message: close.message,
        });
        ExitInfo {
            was_clean: true,
            reason: Some(reason),
        }
    }

    async fn on_goodbye(&mut self, details: Dict, reason: String) -> Flow {
        let close = CloseDetails::from_message(&reason, &details);
        match self.leaving.take() {
            Some((_, reply)) => {
                tracing::info!(reason = %close.reason, "left realm");
                self.report_leave(&close);
                let _ = reply.send(Ok(close));
            }
            None => {
                tracing::info!(reason = %close.reason, message = ?close.message, "router closed session");
                // Best effort: the session ends whether or not this goes out.
                let _ = self
                    .send(Message::Goodbye {
                        details: Dict::new(),
                        reason: uris::CLOSE_GOODBYE_AND_OUT.into(),
                    })
                    .await;
                self.report_leave(&close);
            }
        }
        Err(ExitInfo {
            was_clean: true,
            reason: Some(reason),
        })
    }

    fn on_transport_closed(&mut self, was_clean: bool, reason: Option<String>) -> ExitInfo {
        if let Some((close, reply)) = self.leaving.take() {
            tracing::info!(reason = ?reason, "transport closed while leaving");
            self.report_leave(&close);
            let _ = reply.send(Ok(close));
            return ExitInfo {
                was_clean: true,
                reason,
            };
        }

        tracing::warn!(was_clean, reason = ?reason, state = ?self.state(), "transport lost");
        self.report_leave(&CloseDetails::new(uris::CLOSE_TRANSPORT_LOST, reason.clone()));
        ExitInfo {
            was_clean: false,
            reason,
        }
    }

    async fn on_error(
        &mut self,
        request_type: MessageType,
        request: RequestId,
        error: String,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Flow {
        let Some(kind) = RequestKind::from_request_type(request_type) else {
            tracing::warn!(request, %request_type, error = %error, "ERROR for unexpected request type");
            return Ok(());
        };
        let Some(op) = self.pending.resolve(request, kind) else {
            return Ok(());
        };
        tracing::debug!(request, %kind, error = %error, "request failed");

        match op.completion {
            Responder::Call(reply) => reply.fail(WampError::CallFailed {
                error,
                args: args.unwrap_or_default(),
                kwargs: kwargs.unwrap_or_default(),
            }),
            Responder::Register { reply, .. } => reply.fail(WampError::RegisterFailed(error)),
            Responder::Unregister {
                registration,
                reply,
            } => {
                self.dispatcher.restore_registration(registration);
                reply.fail(WampError::UnregisterFailed(error));
            }
            Responder::Subscribe { topic, reply, .. } => {
                reply.fail(WampError::SubscribeFailed(error));
                return self.subscribe_settled(&topic).await;
            }
            Responder::Unsubscribe(reply) => reply.fail(WampError::UnsubscribeFailed(error)),
            Responder::Publish(reply) => reply.fail(WampError::PublishFailed(error)),
        }
        Ok(())
    }

    fn on_result(
        &mut self,
        request: RequestId,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        let Some(PendingOperation {
            completion: Responder::Call(reply),
            ..
        }) = self.pending.resolve(request, RequestKind::Call)
        else {
            return;
        };
        let _ = reply.send(Ok(CallResult {
            args: args.unwrap_or_default(),
            kwargs: kwargs.unwrap_or_default(),
            details,
        }));
    }

    fn on_registered(&mut self, request: RequestId, registration: RegistrationId) {
        let Some(PendingOperation {
            completion:
                Responder::Register {
                    procedure,
                    handler,
                    reply,
                },
            ..
        }) = self.pending.resolve(request, RequestKind::Register)
        else {
            return;
        };
        let registration = self
            .dispatcher
            .add_registration(registration, procedure, handler);
        let _ = reply.send(Ok(registration));
    }

    fn on_unregistered(&mut self, request: RequestId, details: Option<Dict>) {
        if request == 0 {
            let revoked = details
                .as_ref()
                .and_then(|d| d.get("registration"))
                .and_then(Value::as_u64);
            match revoked {
                Some(id) if self.dispatcher.remove_registration(id) => {
                    tracing::info!(registration = id, "registration revoked by router");
                }
                _ => tracing::warn!(details = ?details, "revocation for unknown registration"),
            }
            return;
        }

        let Some(PendingOperation {
            completion: Responder::Unregister {
                registration,
                reply,
            },
            ..
        }) = self.pending.resolve(request, RequestKind::Unregister)
        else {
            return;
        };
        self.dispatcher.remove_registration(registration);
        let _ = reply.send(Ok(()));
    }

    async fn on_subscribed(&mut self, request: RequestId, subscription: SubscriptionId) -> Flow {
        let Some(PendingOperation {
            completion:
                Responder::Subscribe {
                    topic,
                    handler,
                    reply,
                },
            ..
        }) = self.pending.resolve(request, RequestKind::Subscribe)
        else {
            return Ok(());
        };

        // The router subscription lives on through this request, so the
        // held-back UNSUBSCRIBE must never reach the router.
        if let Some(index) = self
            .deferred
            .iter()
            .position(|deferred| deferred.subscription == subscription)
        {
            let deferred = self.deferred.remove(index);
            tracing::debug!(
                request = deferred.request,
                subscription,
                "subscription reused, unsubscribe dropped"
            );
            let _ = deferred.reply.send(Ok(()));
        }

        let handle = self
            .dispatcher
            .add_subscriber(subscription, topic.clone(), handler);
        let _ = reply.send(Ok(handle));
        self.subscribe_settled(&topic).await
    }

    /// One SUBSCRIBE for `topic` was answered. Once none is left in
    /// flight, send the unsubscribes that were waiting on the topic.
    async fn subscribe_settled(&mut self, topic: &str) -> Flow {
        if let Some(count) = self.subscribing.get_mut(topic) {
            *count = count.saturating_sub(1);
            if *count > 0 {
                return Ok(());
            }
            self.subscribing.remove(topic);
        }
        // Outside Joined, teardown fails whatever is still deferred.
        if self.state() != SessionState::Joined {
            return Ok(());
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|deferred| deferred.topic == topic);
        self.deferred = waiting;
        for deferred in ready {
            self.send_unsubscribe(deferred.request, deferred.subscription, deferred.reply)
                .await?;
        }
        Ok(())
    }

    async fn send_unsubscribe(
        &mut self,
        request: RequestId,
        subscription: SubscriptionId,
        reply: Reply<()>,
    ) -> Flow {
        if self
            .pending
            .register(request, RequestKind::Unsubscribe, Responder::Unsubscribe(reply))
            .is_err()
        {
            return Ok(());
        }
        tracing::debug!(request, subscription, "unsubscribe");
        self.send(Message::Unsubscribe {
            request,
            subscription,
        })
        .await
    }

    fn on_unsubscribed(&mut self, request: RequestId, details: Option<Dict>) {
        if request == 0 {
            let revoked = details
                .as_ref()
                .and_then(|d| d.get("subscription"))
                .and_then(Value::as_u64);
            match revoked {
                Some(id) if self.dispatcher.remove_subscription(id) => {
                    tracing::info!(subscription = id, "subscription revoked by router");
                }
                _ => tracing::warn!(details = ?details, "revocation for unknown subscription"),
            }
            return;
        }

        // Local handlers were already removed when the request was sent.
        if let Some(PendingOperation {
            completion: Responder::Unsubscribe(reply),
            ..
        }) = self.pending.resolve(request, RequestKind::Unsubscribe)
        {
            let _ = reply.send(Ok(()));
        }
    }

    fn on_event(
        &mut self,
        subscription: SubscriptionId,
        publication: u64,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        let topic = details
            .get("topic")
            .and_then(Value::as_str)
            .map(str::to_string);
        let publisher = details.get("publisher").and_then(Value::as_u64);
        let event = Event {
            subscription,
            publication,
            topic,
            publisher,
            args: args.unwrap_or_default(),
            kwargs: kwargs.unwrap_or_default(),
            details,
        };

        if let Err(error) = self.dispatcher.dispatch_event(event) {
            tracing::warn!(subscription, publication, %error, "event dropped");
        }
    }

    async fn on_invocation(
        &mut self,
        request: RequestId,
        registration: RegistrationId,
        details: Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Flow {
        let caller = details.get("caller").and_then(Value::as_u64);
        let procedure = details
            .get("procedure")
            .and_then(Value::as_str)
            .map(str::to_string);
        let invocation = Invocation {
            request,
            registration,
            session_id: self.session_id.unwrap_or_default(),
            caller,
            procedure,
            args: args.unwrap_or_default(),
            kwargs: kwargs.unwrap_or_default(),
            details,
        };

        match self.dispatcher.start_invocation(invocation) {
            Ok(outcome) => {
                let results = self.results.clone();
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(outcome)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            tracing::error!(request, panic = %message, "procedure panicked");
                            Err(runtime_error(message))
                        });
                    // Fails only once the session is gone.
                    let _ = results.send(Command::Yield { request, outcome });
                });
                Ok(())
            }
            Err(error) => {
                tracing::warn!(request, registration, %error, "invocation refused");
                self.send(Message::Error {
                    request_type: MessageType::Invocation,
                    request,
                    details: Dict::new(),
                    error: uris::ERROR_NO_SUCH_REGISTRATION.into(),
                    args: None,
                    kwargs: None,
                })
                .await
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) -> Flow {
        let state = self.state();
        match command {
            Command::Yield { request, outcome } => {
                if matches!(state, SessionState::Joined | SessionState::Leaving) {
                    self.on_yield(request, outcome).await
                } else {
                    Ok(())
                }
            }
            command if state != SessionState::Joined => {
                command.fail(WampError::NotConnected);
                Ok(())
            }
            Command::Call {
                request,
                procedure,
                options,
                args,
                kwargs,
                reply,
            } => {
                if self
                    .pending
                    .register(request, RequestKind::Call, Responder::Call(reply))
                    .is_err()
                {
                    return Ok(());
                }
                tracing::debug!(request, procedure = %procedure, "call");
                self.send(Message::Call {
                    request,
                    options,
                    procedure,
                    args: non_empty_list(args),
                    kwargs: non_empty_dict(kwargs),
                })
                .await
            }
            Command::Register {
                request,
                procedure,
                options,
                handler,
                reply,
            } => {
                let responder = Responder::Register {
                    procedure: procedure.clone(),
                    handler,
                    reply,
                };
                if self
                    .pending
                    .register(request, RequestKind::Register, responder)
                    .is_err()
                {
                    return Ok(());
                }
                tracing::debug!(request, procedure = %procedure, "register");
                self.send(Message::Register {
                    request,
                    options,
                    procedure,
                })
                .await
            }
            Command::Unregister {
                request,
                registration,
                reply,
            } => {
                if let Err(error) = self.dispatcher.retire_registration(registration) {
                    reply.fail(error);
                    return Ok(());
                }
                let responder = Responder::Unregister {
                    registration,
                    reply,
                };
                if self
                    .pending
                    .register(request, RequestKind::Unregister, responder)
                    .is_err()
                {
                    self.dispatcher.restore_registration(registration);
                    return Ok(());
                }
                tracing::debug!(request, registration, "unregister");
                self.send(Message::Unregister {
                    request,
                    registration,
                })
                .await
            }
            Command::Subscribe {
                request,
                topic,
                options,
                handler,
                reply,
            } => {
                let responder = Responder::Subscribe {
                    topic: topic.clone(),
                    handler,
                    reply,
                };
                if self
                    .pending
                    .register(request, RequestKind::Subscribe, responder)
                    .is_err()
                {
                    return Ok(());
                }
                *self.subscribing.entry(topic.clone()).or_insert(0) += 1;
                tracing::debug!(request, topic = %topic, "subscribe");
                self.send(Message::Subscribe {
                    request,
                    options,
                    topic,
                })
                .await
            }
            Command::Unsubscribe {
                request,
                subscription,
                reply,
            } => match self.dispatcher.remove_subscriber(&subscription) {
                Err(error) => {
                    reply.fail(error);
                    Ok(())
                }
                Ok(false) => {
                    // Other local handlers still use the router subscription.
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
                Ok(true) if self.subscribing.contains_key(&subscription.topic) => {
                    tracing::debug!(request, subscription = subscription.id, "unsubscribe deferred");
                    self.deferred.push(DeferredUnsubscribe {
                        request,
                        subscription: subscription.id,
                        topic: subscription.topic,
                        reply,
                    });
                    Ok(())
                }
                Ok(true) => self.send_unsubscribe(request, subscription.id, reply).await,
            },
            Command::Publish {
                request,
                topic,
                options,
                args,
                kwargs,
                reply,
            } => {
                if let Some(reply) = reply {
                    if self
                        .pending
                        .register(request, RequestKind::Publish, Responder::Publish(reply))
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                tracing::debug!(request, topic = %topic, "publish");
                self.send(Message::Publish {
                    request,
                    options,
                    topic,
                    args: non_empty_list(args),
                    kwargs: non_empty_dict(kwargs),
                })
                .await
            }
            Command::Leave {
                reason,
                message,
                reply,
            } => {
                let mut details = Dict::new();
                if let Some(message) = &message {
                    details.insert("message".into(), Value::String(message.clone()));
                }
                tracing::info!(reason = %reason, "leaving realm");
                self.set_state(SessionState::Leaving);
                self.leaving = Some((CloseDetails::new(reason.clone(), message), reply));
                self.send(Message::Goodbye { details, reason }).await
            }
        }
    }

    async fn on_yield(&mut self, request: RequestId, outcome: InvocationOutcome) -> Flow {
        if !self.dispatcher.finish_invocation(request) {
            tracing::warn!(request, "result for invocation not in flight rejected");
            return Ok(());
        }

        let message = match outcome {
            Ok(result) => Message::Yield {
                request,
                options: Dict::new(),
                args: non_empty_list(result.args),
                kwargs: non_empty_dict(result.kwargs),
            },
            Err(error) => {
                tracing::debug!(request, error = %error.error, "procedure returned error");
                Message::Error {
                    request_type: MessageType::Invocation,
                    request,
                    details: Dict::new(),
                    error: error.error,
                    args: non_empty_list(error.args),
                    kwargs: non_empty_dict(error.kwargs),
                }
            }
        };
        self.send(message).await
    }

    // ── Teardown ─────────────────────────────────────────────────────

    fn teardown(mut self, exit: ExitInfo) {
        self.report_leave(&CloseDetails::new(
            uris::CLOSE_TRANSPORT_LOST,
            exit.reason.clone(),
        ));

        // No new commands from here on; fail whatever is still queued.
        self.session.shared.commands.lock().take();
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.fail(WampError::ConnectionClosed);
        }

        let drained = self.pending.drain_all(WampError::ConnectionClosed);
        for deferred in self.deferred.drain(..) {
            deferred.reply.fail(WampError::ConnectionClosed);
        }
        tracing::debug!(
            registrations = self.dispatcher.registration_count(),
            subscriptions = self.dispatcher.subscription_count(),
            in_flight = self.dispatcher.in_flight_count(),
            "dropping local handlers"
        );
        self.dispatcher.clear();
        self.fail_join(WampError::ConnectionClosed);
        if let Some((_, reply)) = self.leaving.take() {
            reply.fail(WampError::ConnectionClosed);
        }

        if self.opened {
            self.session
                .shared
                .lifecycle
                .disconnected(&self.session, exit.was_clean);
        }
        tracing::info!(
            was_clean = exit.was_clean,
            reason = ?exit.reason,
            drained,
            "session disconnected"
        );

        self.session.shared.status.send_modify(|status| {
            status.state = SessionState::Disconnected;
            status.session_id = None;
            status.exit = Some(exit);
        });
    }
}
