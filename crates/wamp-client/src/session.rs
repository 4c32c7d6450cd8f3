//! The application-facing session handle.
//!
//! A [`Session`] is a cheap, cloneable handle onto one logical connection to
//! one realm. Operations never touch protocol state directly: they validate
//! their input, check that the session is joined, and queue a command for
//! the sequencer task that owns the transport and all tables. The caller
//! gets a [`Pending`] future that resolves when the router answers.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use wamp_core::error::{WampError, WampResult};
use wamp_core::id::IdGenerator;
use wamp_core::messages::{uris, Dict, List};
use wamp_core::transport::Transport;
use wamp_core::uri::validate_uri;

use crate::auth::{AnonymousAuth, Authenticator};
use crate::dispatcher::{EventHandler, Procedure};
use crate::lifecycle::Lifecycle;
use crate::pending::Pending;
use crate::sequencer::{Command, Sequencer};
use crate::types::{
    CallOptions, CallResult, CloseDetails, Event, ExitInfo, MatchPolicy, Publication,
    PublishOptions, RegisterOptions, Registration, SessionDetails, SessionId, SessionState,
    SubscribeOptions, Subscription,
};

/// Realm and credentials of a session.
#[derive(Clone)]
pub struct SessionConfig {
    pub realm: String,
    /// Tried in order when the router sends a CHALLENGE.
    pub authenticators: Vec<Arc<dyn Authenticator>>,
}

impl SessionConfig {
    /// A config for `realm` with no authenticators.
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            authenticators: Vec::new(),
        }
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticators.push(Arc::new(authenticator));
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("realm1").with_authenticator(AnonymousAuth::new())
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<&str> = self.authenticators.iter().map(|a| a.method()).collect();
        f.debug_struct("SessionConfig")
            .field("realm", &self.realm)
            .field("authenticators", &methods)
            .finish()
    }
}

/// Observable session status, published through a watch channel.
#[derive(Debug, Clone)]
pub(crate) struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<SessionId>,
    /// How the most recent connection ended.
    pub exit: Option<ExitInfo>,
}

pub(crate) struct Shared {
    pub config: SessionConfig,
    pub status: watch::Sender<SessionStatus>,
    pub ids: IdGenerator,
    /// Command queue of the running sequencer; `None` while disconnected.
    pub commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    pub lifecycle: Lifecycle,
}

/// Handle onto a WAMP session.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<Shared>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::Disconnected,
            session_id: None,
            exit: None,
        });
        Self {
            shared: Arc::new(Shared {
                config,
                status,
                ids: IdGenerator::new(),
                commands: Mutex::new(None),
                lifecycle: Lifecycle::default(),
            }),
        }
    }

    pub fn realm(&self) -> &str {
        &self.shared.config.realm
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.status.borrow().state
    }

    /// The router-assigned session id; `None` until joined.
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.status.borrow().session_id
    }

    pub fn is_joined(&self) -> bool {
        self.state() == SessionState::Joined
    }

    // ── Lifecycle listeners ──────────────────────────────────────────

    /// Called when the transport is open, before HELLO is sent.
    pub fn on_connect(&self, listener: impl Fn(&Session) + Send + Sync + 'static) {
        self.shared.lifecycle.add_connect(Arc::new(listener));
    }

    /// Called once the router welcomed the session.
    pub fn on_join(&self, listener: impl Fn(&Session, &SessionDetails) + Send + Sync + 'static) {
        self.shared.lifecycle.add_join(Arc::new(listener));
    }

    /// Called when a joined session leaves its realm, cleanly or not.
    pub fn on_leave(&self, listener: impl Fn(&Session, &CloseDetails) + Send + Sync + 'static) {
        self.shared.lifecycle.add_leave(Arc::new(listener));
    }

    /// Called once per connection after the transport is gone, with
    /// `was_clean == false` for an unexpected loss.
    pub fn on_disconnect(&self, listener: impl Fn(&Session, bool) + Send + Sync + 'static) {
        self.shared.lifecycle.add_disconnect(Arc::new(listener));
    }

    // ── Connection ───────────────────────────────────────────────────

    /// Open `transport` and join the configured realm.
    ///
    /// Legal only while disconnected. Spawns the sequencer task on the
    /// current tokio runtime; the returned future resolves on WELCOME.
    pub fn connect<T>(&self, transport: T) -> WampResult<Pending<SessionDetails>>
    where
        T: Transport + 'static,
    {
        let mut previous = SessionState::Disconnected;
        let claimed = self.shared.status.send_if_modified(|status| {
            previous = status.state;
            if status.state != SessionState::Disconnected {
                return false;
            }
            status.state = SessionState::Connecting;
            status.session_id = None;
            true
        });
        if !claimed {
            return Err(WampError::InvalidState(format!(
                "connect called while {previous:?}"
            )));
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        *self.shared.commands.lock() = Some(commands_tx.clone());

        let (join_tx, joined) = Pending::channel();
        tracing::info!(realm = %self.realm(), "connecting");
        let sequencer = Sequencer::new(self.clone(), transport, commands_rx, commands_tx, join_tx);
        tokio::spawn(sequencer.run());
        Ok(joined)
    }

    /// Send GOODBYE and wait for the router's answer.
    ///
    /// `reason` defaults to `wamp.close.normal`.
    pub fn leave(
        &self,
        reason: Option<&str>,
        message: Option<&str>,
    ) -> WampResult<Pending<CloseDetails>> {
        let reason = reason.unwrap_or(uris::CLOSE_NORMAL);
        validate_uri(reason, false)?;
        let (reply, pending) = Pending::channel();
        self.submit(Command::Leave {
            reason: reason.to_string(),
            message: message.map(str::to_string),
            reply,
        })?;
        Ok(pending)
    }

    /// Wait until the session is disconnected and report how the last
    /// connection ended.
    pub async fn disconnected(&self) -> ExitInfo {
        let mut status = self.shared.status.subscribe();
        let result = status
            .wait_for(|s| s.state == SessionState::Disconnected)
            .await
            .map(|s| s.exit.clone());
        // The sender lives in `self`, so the channel cannot close here.
        result.ok().flatten().unwrap_or(ExitInfo {
            was_clean: true,
            reason: None,
        })
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Call a remote procedure.
    pub fn call(
        &self,
        procedure: &str,
        args: List,
        kwargs: Dict,
        options: CallOptions,
    ) -> WampResult<Pending<CallResult>> {
        validate_uri(procedure, false)?;
        let (reply, pending) = Pending::channel();
        self.submit(Command::Call {
            request: self.shared.ids.next_id(),
            procedure: procedure.to_string(),
            options: options.to_dict(),
            args,
            kwargs,
            reply,
        })?;
        Ok(pending)
    }

    /// Register a local procedure. The handler is kept until the
    /// registration is unregistered or the session ends.
    pub fn register<P: Procedure>(
        &self,
        procedure: &str,
        handler: P,
        options: RegisterOptions,
    ) -> WampResult<Pending<Registration>> {
        validate_uri(procedure, options.match_policy == MatchPolicy::Wildcard)?;
        let (reply, pending) = Pending::channel();
        self.submit(Command::Register {
            request: self.shared.ids.next_id(),
            procedure: procedure.to_string(),
            options: options.to_dict(),
            handler: Arc::new(handler),
            reply,
        })?;
        Ok(pending)
    }

    pub fn unregister(&self, registration: &Registration) -> WampResult<Pending<()>> {
        let (reply, pending) = Pending::channel();
        self.submit(Command::Unregister {
            request: self.shared.ids.next_id(),
            registration: registration.id,
            reply,
        })?;
        Ok(pending)
    }

    /// Subscribe a handler to a topic.
    pub fn subscribe<F>(
        &self,
        topic: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> WampResult<Pending<Subscription>>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        validate_uri(topic, options.match_policy == MatchPolicy::Wildcard)?;
        let handler: EventHandler = Arc::new(handler);
        let (reply, pending) = Pending::channel();
        self.submit(Command::Subscribe {
            request: self.shared.ids.next_id(),
            topic: topic.to_string(),
            options: options.to_dict(),
            handler,
            reply,
        })?;
        Ok(pending)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> WampResult<Pending<()>> {
        let (reply, pending) = Pending::channel();
        self.submit(Command::Unsubscribe {
            request: self.shared.ids.next_id(),
            subscription: subscription.clone(),
            reply,
        })?;
        Ok(pending)
    }

    /// Publish an event.
    ///
    /// Without `acknowledge` the returned future is already complete; with
    /// it, the future resolves on PUBLISHED.
    pub fn publish(
        &self,
        topic: &str,
        args: List,
        kwargs: Dict,
        options: PublishOptions,
    ) -> WampResult<Pending<Publication>> {
        validate_uri(topic, false)?;
        let request = self.shared.ids.next_id();
        if !options.acknowledge {
            self.submit(Command::Publish {
                request,
                topic: topic.to_string(),
                options: options.to_dict(),
                args,
                kwargs,
                reply: None,
            })?;
            return Ok(Pending::ready(Ok(Publication { id: None })));
        }

        let (reply, pending) = Pending::channel();
        self.submit(Command::Publish {
            request,
            topic: topic.to_string(),
            options: options.to_dict(),
            args,
            kwargs,
            reply: Some(reply),
        })?;
        Ok(pending)
    }

    /// Queue a command for the sequencer. Fails synchronously unless joined.
    fn submit(&self, command: Command) -> WampResult<()> {
        if self.state() != SessionState::Joined {
            return Err(WampError::NotConnected);
        }
        let commands = self.shared.commands.lock();
        let sender = commands.as_ref().ok_or(WampError::NotConnected)?;
        sender.send(command).map_err(|_| WampError::NotConnected)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.shared.status.borrow();
        f.debug_struct("Session")
            .field("realm", &self.shared.config.realm)
            .field("state", &status.state)
            .field("session_id", &status.session_id)
            .finish()
    }
}
