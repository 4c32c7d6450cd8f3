//! Request/response correlation.
//!
//! Every outstanding call, registration, subscription, unregistration,
//! unsubscription and acknowledged publication lives in a [`PendingTable`]
//! keyed by its request id until the matching response (or the session's end)
//! removes it. Callers hold the other end as a [`Pending`] future.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::oneshot;
use wamp_core::error::{WampError, WampResult};
use wamp_core::messages::MessageType;

use crate::types::RequestId;

/// Request category. Ids are unique per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Call,
    Register,
    Unregister,
    Subscribe,
    Unsubscribe,
    Publish,
}

impl RequestKind {
    /// Map the `Request.Type` of an ERROR message back to a request kind.
    pub fn from_request_type(request_type: MessageType) -> Option<Self> {
        match request_type {
            MessageType::Call => Some(Self::Call),
            MessageType::Register => Some(Self::Register),
            MessageType::Unregister => Some(Self::Unregister),
            MessageType::Subscribe => Some(Self::Subscribe),
            MessageType::Unsubscribe => Some(Self::Unsubscribe),
            MessageType::Publish => Some(Self::Publish),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Call => "call",
            Self::Register => "register",
            Self::Unregister => "unregister",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// The completion side of a pending operation.
pub trait Completion {
    /// Complete the operation with an error.
    fn fail(self, error: WampError);
}

impl<T> Completion for oneshot::Sender<WampResult<T>> {
    fn fail(self, error: WampError) {
        // The caller may have dropped its future; nothing to report then.
        let _ = self.send(Err(error));
    }
}

/// An outstanding request.
#[derive(Debug)]
pub struct PendingOperation<C> {
    pub id: RequestId,
    pub kind: RequestKind,
    pub created_at: Instant,
    pub completion: C,
}

/// Outstanding requests keyed by `(kind, id)`.
#[derive(Debug)]
pub struct PendingTable<C> {
    entries: HashMap<(RequestKind, RequestId), PendingOperation<C>>,
}

impl<C: Completion> PendingTable<C> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Record a new request.
    ///
    /// On a duplicate id the new completion is failed with
    /// `DuplicateRequestId` and the existing entry is left untouched.
    pub fn register(&mut self, id: RequestId, kind: RequestKind, completion: C) -> WampResult<()> {
        let key = (kind, id);
        if self.entries.contains_key(&key) {
            let error = WampError::DuplicateRequestId {
                id,
                kind: kind.to_string(),
            };
            tracing::error!(request = id, %kind, "duplicate request id");
            completion.fail(error.clone());
            return Err(error);
        }

        self.entries.insert(
            key,
            PendingOperation {
                id,
                kind,
                created_at: Instant::now(),
                completion,
            },
        );
        tracing::trace!(request = id, %kind, pending = self.entries.len(), "registered pending request");
        Ok(())
    }

    /// Remove the matching request so the caller can complete it.
    ///
    /// Returns `None` (and logs) for an unknown or already completed id.
    pub fn resolve(&mut self, id: RequestId, kind: RequestKind) -> Option<PendingOperation<C>> {
        let entry = self.entries.remove(&(kind, id));
        match &entry {
            Some(op) => {
                tracing::trace!(
                    request = id,
                    %kind,
                    elapsed_ms = op.created_at.elapsed().as_millis() as u64,
                    "resolved pending request"
                );
            }
            None => {
                tracing::warn!(request = id, %kind, "response for unknown request dropped");
            }
        }
        entry
    }

    /// Remove the matching request and fail it. Returns whether one existed.
    pub fn fail(&mut self, id: RequestId, kind: RequestKind, error: WampError) -> bool {
        match self.resolve(id, kind) {
            Some(op) => {
                op.completion.fail(error);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with `error`, leaving the table empty.
    pub fn drain_all(&mut self, error: WampError) -> usize {
        let count = self.entries.len();
        for (_, op) in self.entries.drain() {
            op.completion.fail(error.clone());
        }
        if count > 0 {
            tracing::debug!(count, %error, "drained pending requests");
        }
        count
    }

    pub fn contains(&self, id: RequestId, kind: RequestKind) -> bool {
        self.entries.contains_key(&(kind, id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C: Completion> Default for PendingTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future for the outcome of a session operation.
///
/// Resolves exactly once. If the engine drops the completion without
/// answering (the session went away) it resolves to `ConnectionClosed`.
#[must_use = "a pending operation does nothing unless awaited or dropped deliberately"]
pub struct Pending<T> {
    state: PendingState<T>,
}

enum PendingState<T> {
    Waiting(oneshot::Receiver<WampResult<T>>),
    Ready(Option<WampResult<T>>),
}

impl<T> Pending<T> {
    /// A linked completion sender and future.
    pub(crate) fn channel() -> (oneshot::Sender<WampResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                state: PendingState::Waiting(rx),
            },
        )
    }

    /// An already completed operation.
    pub fn ready(result: WampResult<T>) -> Self {
        Self {
            state: PendingState::Ready(Some(result)),
        }
    }

    /// Whether the outcome is already available without waiting.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PendingState::Ready(Some(_)))
    }
}

// Nothing is pinned structurally: the receiver is Unpin and `T` is only moved out.
impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = WampResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            PendingState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(WampError::ConnectionClosed))),
            PendingState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(WampError::ConnectionClosed)))
            }
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            PendingState::Waiting(_) => "waiting",
            PendingState::Ready(Some(_)) => "ready",
            PendingState::Ready(None) => "taken",
        };
        f.debug_struct("Pending").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Table = PendingTable<oneshot::Sender<WampResult<u32>>>;

    #[tokio::test]
    async fn resolve_removes_entry() {
        let mut table = Table::new();
        let (tx, pending) = Pending::channel();
        table.register(1, RequestKind::Call, tx).unwrap();

        let op = table.resolve(1, RequestKind::Call).unwrap();
        assert_eq!(op.id, 1);
        op.completion.send(Ok(42)).unwrap();

        assert_eq!(pending.await.unwrap(), 42);
        assert!(table.is_empty());
        assert!(table.resolve(1, RequestKind::Call).is_none());
    }

    #[tokio::test]
    async fn duplicate_id_fails_only_the_new_request() {
        let mut table = Table::new();
        let (first_tx, first) = Pending::channel();
        let (second_tx, second) = Pending::channel();
        table.register(5, RequestKind::Subscribe, first_tx).unwrap();

        let err = table
            .register(5, RequestKind::Subscribe, second_tx)
            .unwrap_err();
        assert!(matches!(err, WampError::DuplicateRequestId { id: 5, .. }));
        assert!(matches!(
            second.await,
            Err(WampError::DuplicateRequestId { .. })
        ));

        table
            .resolve(5, RequestKind::Subscribe)
            .unwrap()
            .completion
            .send(Ok(1))
            .unwrap();
        assert_eq!(first.await.unwrap(), 1);
    }

    #[test]
    fn same_id_in_different_kinds_is_independent() {
        let mut table = Table::new();
        let (a, _fa) = Pending::channel();
        let (b, _fb) = Pending::channel();
        table.register(3, RequestKind::Register, a).unwrap();
        table.register(3, RequestKind::Unregister, b).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.contains(3, RequestKind::Register));
    }

    #[tokio::test]
    async fn fail_completes_with_error_once() {
        let mut table = Table::new();
        let (tx, pending) = Pending::channel();
        table.register(9, RequestKind::Publish, tx).unwrap();

        assert!(table.fail(9, RequestKind::Publish, WampError::PublishFailed("denied".into())));
        assert!(!table.fail(9, RequestKind::Publish, WampError::ConnectionClosed));
        assert!(matches!(pending.await, Err(WampError::PublishFailed(_))));
    }

    #[tokio::test]
    async fn drain_all_fails_everything() {
        let mut table = Table::new();
        let futures: Vec<_> = (1..=4)
            .map(|id| {
                let (tx, pending) = Pending::channel();
                table.register(id, RequestKind::Call, tx).unwrap();
                pending
            })
            .collect();

        assert_eq!(table.drain_all(WampError::ConnectionClosed), 4);
        assert!(table.is_empty());
        for pending in futures {
            assert!(matches!(pending.await, Err(WampError::ConnectionClosed)));
        }
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_connection_closed() {
        let (tx, pending) = Pending::<()>::channel();
        drop(tx);
        assert!(matches!(pending.await, Err(WampError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn ready_future_is_immediate() {
        let pending = Pending::ready(Ok("done"));
        assert!(pending.is_ready());
        assert_eq!(pending.await.unwrap(), "done");
    }

    #[test]
    fn error_request_type_mapping() {
        assert_eq!(
            RequestKind::from_request_type(MessageType::Call),
            Some(RequestKind::Call)
        );
        assert_eq!(RequestKind::from_request_type(MessageType::Invocation), None);
    }
}
