//! Connection supervisor.
//!
//! `Client` drives a [`Session`] through one or more transports: it tries
//! them in order, stays attached while the session is joined, and reconnects
//! with exponential backoff when the connection is lost.

use std::fmt;
use std::time::Duration;

use tokio::time;

use wamp_core::codec::Serializer;
use wamp_core::error::{WampError, WampResult};
use wamp_core::transport::Transport;

use crate::session::Session;
use crate::transport::transport_for_url;
use crate::types::ExitInfo;

/// Builds a fresh, unopened transport for each connection attempt.
pub type TransportFactory = Box<dyn Fn() -> WampResult<Box<dyn Transport>> + Send + Sync>;

/// Reconnect schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Rounds of reconnection attempts before giving up (0 = never retry).
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each round.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 15,
            initial_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(300),
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Give up after the first failed round.
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Errors that no amount of reconnecting will fix.
fn is_fatal(error: &WampError) -> bool {
    matches!(
        error,
        WampError::NoMatchingAuthenticator { .. }
            | WampError::AuthFailed(_)
            | WampError::Aborted { .. }
            | WampError::InvalidState(_)
            | WampError::InvalidUri(_)
    )
}

/// Session plus transports plus retry policy.
pub struct Client {
    session: Session,
    transports: Vec<TransportFactory>,
    retry: RetryPolicy,
}

impl Client {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            transports: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Add a transport; transports are tried in the order added.
    pub fn with_transport<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> WampResult<Box<dyn Transport>> + Send + Sync + 'static,
    {
        self.transports.push(Box::new(factory));
        self
    }

    /// Add a transport for a router URL (`ws://`, `wss://`, `tcp://`, `rs://`).
    pub fn with_url(self, url: impl Into<String>, serializer: Serializer) -> Self {
        let url = url.into();
        self.with_transport(move || transport_for_url(&url, serializer))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Connect and keep the session alive until it ends cleanly or the
    /// retry budget is spent.
    ///
    /// Returns how the last joined session ended, or the last connection
    /// error when none ever joined.
    pub async fn connect(&self) -> WampResult<ExitInfo> {
        if self.transports.is_empty() {
            return Err(WampError::InvalidState("no transports configured".into()));
        }

        let mut retries = 0u32;
        let mut last_exit: Option<ExitInfo> = None;
        let mut last_error: Option<WampError> = None;

        loop {
            for (index, factory) in self.transports.iter().enumerate() {
                match self.attempt(factory).await {
                    Ok(exit) if exit.was_clean => {
                        tracing::info!("session closed: {}", exit.reason.as_deref().unwrap_or("-"));
                        return Ok(exit);
                    }
                    Ok(exit) => {
                        tracing::warn!(
                            "session lost: {}",
                            exit.reason.as_deref().unwrap_or("transport closed")
                        );
                        last_exit = Some(exit);
                        // A joined session resets the budget.
                        retries = 0;
                        break;
                    }
                    Err(error) if is_fatal(&error) => {
                        tracing::error!(transport = index, %error, "connection refused, not retrying");
                        return Err(error);
                    }
                    Err(error) => {
                        tracing::warn!(transport = index, %error, "connection attempt failed");
                        last_error = Some(error);
                    }
                }
            }

            if retries >= self.retry.max_retries {
                tracing::error!(retries, "giving up reconnecting");
                return match (last_exit, last_error) {
                    (Some(exit), _) => Ok(exit),
                    (None, Some(error)) => Err(error),
                    (None, None) => Err(WampError::ConnectionClosed),
                };
            }

            let delay = self.retry.delay(retries);
            retries += 1;
            tracing::info!(
                "reconnecting in {:?} (attempt {}/{})",
                delay,
                retries,
                self.retry.max_retries
            );
            time::sleep(delay).await;
        }
    }

    /// One connection: join, then wait for the session to end.
    async fn attempt(&self, factory: &TransportFactory) -> WampResult<ExitInfo> {
        let transport = factory()?;
        let joined = self.session.connect(transport)?;
        match joined.await {
            Ok(details) => {
                tracing::debug!(session = details.session_id, "attached");
                Ok(self.session.disconnected().await)
            }
            Err(error) => {
                // Let the sequencer finish so the next attempt may connect.
                self.session.disconnected().await;
                Err(error)
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("transports", &self.transports.len())
            .field("retry", &self.retry)
            .finish()
    }
}
