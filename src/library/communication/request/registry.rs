use super::super::BrokerError;
use super::{CorrelationId, Reply, RpcError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

struct Slot {
    token: u64,
    created_at: Instant,
    sender: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Slots {
    pending: HashMap<CorrelationId, Slot>,
    next_token: u64,
    closed: bool,
}

type SharedSlots = Arc<Mutex<Slots>>;

fn lock(slots: &SharedSlots) -> MutexGuard<'_, Slots> {
    // Every mutation leaves the map consistent, so a poisoned lock is still usable
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of handing a reply to the [`CorrelationRegistry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A waiting caller received the reply
    Fulfilled {
        /// Identifier of the fulfilled call
        correlation_id: CorrelationId,
        /// Time between registration and resolution
        waited: Duration,
    },
    /// Nobody is waiting for the reply (anymore), it has been dropped
    Late(CorrelationId),
}

/// Bookkeeping of outstanding calls by their correlation identifier
///
/// Cloning a registry yields another handle to the same set of pending calls.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    slots: SharedSlots,
}

impl CorrelationRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a call, failing if the identifier is already in use
    ///
    /// The call is tracked until a reply is resolved for it or the returned [`PendingCall`] is dropped.
    /// Once the registry is [closed](CorrelationRegistry::close) every registration fails with
    /// [`BrokerError::Closed`].
    pub fn register(&self, correlation_id: CorrelationId) -> Result<PendingCall, RpcError> {
        let mut slots = lock(&self.slots);

        if slots.closed {
            return Err(RpcError::Broker(BrokerError::Closed));
        }

        if slots.pending.contains_key(&correlation_id) {
            return Err(RpcError::DuplicateId(correlation_id));
        }

        let (sender, receiver) = oneshot::channel();
        let created_at = Instant::now();
        let token = slots.next_token;
        slots.next_token += 1;

        let slot = Slot {
            token,
            created_at,
            sender,
        };
        slots.pending.insert(correlation_id.clone(), slot);

        trace!(%correlation_id, "Registered pending call");

        Ok(PendingCall {
            correlation_id,
            token,
            created_at,
            receiver,
            slots: self.slots.clone(),
        })
    }

    /// Hands a reply to the caller waiting for it
    pub fn resolve(&self, reply: Reply) -> Resolution {
        let slot = lock(&self.slots).pending.remove(reply.correlation_id());
        let correlation_id = reply.correlation_id().clone();

        let waited = match slot {
            Some(slot) => {
                let waited = slot.created_at.elapsed();
                slot.sender.send(reply).ok().map(|_| waited)
            }
            None => None,
        };

        match waited {
            Some(waited) => {
                trace!(%correlation_id, ?waited, "Fulfilled pending call");
                Resolution::Fulfilled {
                    correlation_id,
                    waited,
                }
            }
            None => {
                debug!(%correlation_id, "Dropping late reply");
                Resolution::Late(correlation_id)
            }
        }
    }

    /// Fails every pending call and all future registrations with [`BrokerError::Closed`]
    ///
    /// Used once replies can no longer be received.
    pub fn close(&self) {
        let mut slots = lock(&self.slots);
        slots.closed = true;

        let failed = slots.pending.len();
        slots.pending.clear();

        debug!(failed, "Closed registry");
    }

    /// Whether the registry has been closed
    pub fn is_closed(&self) -> bool {
        lock(&self.slots).closed
    }

    /// Number of calls currently waiting for a reply
    pub fn len(&self) -> usize {
        lock(&self.slots).pending.len()
    }

    /// Whether no calls are waiting for a reply
    pub fn is_empty(&self) -> bool {
        lock(&self.slots).pending.is_empty()
    }

    /// Whether a call with the given identifier is waiting for a reply
    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        lock(&self.slots).pending.contains_key(correlation_id)
    }
}

/// Call registered with a [`CorrelationRegistry`] that has not been answered yet
///
/// Dropping it cancels the call. Replies arriving afterwards are treated as late.
pub struct PendingCall {
    correlation_id: CorrelationId,
    token: u64,
    created_at: Instant,
    receiver: oneshot::Receiver<Reply>,
    slots: SharedSlots,
}

impl PendingCall {
    /// Identifier the reply will carry
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Suspends until the reply arrives or the deadline elapses
    ///
    /// On expiry the call is removed from the registry and [`RpcError::Timeout`] is returned.
    pub async fn wait(self, deadline: Instant) -> Result<Reply, RpcError> {
        self.wait_or_cancel(deadline, std::future::pending::<()>()).await
    }

    /// Like [`wait`](PendingCall::wait) but gives up with [`RpcError::Cancelled`]
    /// as soon as `cancellation` completes
    pub async fn wait_or_cancel<F>(
        mut self,
        deadline: Instant,
        cancellation: F,
    ) -> Result<Reply, RpcError>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            outcome = timeout_at(deadline, &mut self.receiver) => outcome,
            _ = cancellation => {
                debug!(correlation_id = %self.correlation_id, "Call cancelled");
                return Err(RpcError::Cancelled);
            }
        };

        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            // Only a closed registry drops a slot without sending a reply
            Ok(Err(_)) => Err(RpcError::Broker(BrokerError::Closed)),
            Err(_) => {
                // A reply resolved right as the deadline passed is about to arrive
                if !self.release() {
                    if let Ok(reply) = (&mut self.receiver).await {
                        return Ok(reply);
                    }
                }

                let after = deadline.saturating_duration_since(self.created_at);
                debug!(correlation_id = %self.correlation_id, ?after, "Call timed out");

                Err(RpcError::Timeout {
                    correlation_id: self.correlation_id.clone(),
                    after,
                })
            }
        }
    }
}

impl PendingCall {
    /// Removes the slot of this call, returning whether it was still registered
    fn release(&self) -> bool {
        let mut slots = lock(&self.slots);

        // The identifier may have been registered again after this call was resolved
        let owned = slots
            .pending
            .get(&self.correlation_id)
            .map_or(false, |slot| slot.token == self.token);

        if owned {
            slots.pending.remove(&self.correlation_id);
            trace!(correlation_id = %self.correlation_id, "Purged pending call");
        }

        owned
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reply(id: &str, body: &str) -> Reply {
        Reply::new(CorrelationId::from(id), body)
    }

    #[tokio::test]
    async fn deliver_reply_to_waiting_caller() {
        let registry = CorrelationRegistry::new();
        let pending = registry.register("a".into()).unwrap();

        assert!(matches!(
            registry.resolve(reply("a", "34")),
            Resolution::Fulfilled { .. }
        ));

        let deadline = Instant::now() + Duration::from_secs(1);
        let received = pending.wait(deadline).await.unwrap();

        assert_eq!(received, reply("a", "34"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn refuse_duplicate_identifiers() {
        let registry = CorrelationRegistry::new();
        let _pending = registry.register("a".into()).unwrap();

        assert!(matches!(
            registry.register("a".into()),
            Err(RpcError::DuplicateId(id)) if id.as_str() == "a"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn drop_second_reply() {
        let registry = CorrelationRegistry::new();
        let _pending = registry.register("a".into()).unwrap();

        registry.resolve(reply("a", "first"));

        assert_eq!(
            registry.resolve(reply("a", "second")),
            Resolution::Late("a".into())
        );
    }

    #[tokio::test]
    async fn drop_replies_nobody_asked_for() {
        let registry = CorrelationRegistry::new();

        assert_eq!(
            registry.resolve(reply("unknown", "1")),
            Resolution::Late("unknown".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expire_at_deadline() {
        let registry = CorrelationRegistry::new();
        let pending = registry.register("a".into()).unwrap();
        let started = Instant::now();

        let result = pending.wait(started + Duration::from_secs(5)).await;

        assert!(matches!(
            result,
            Err(RpcError::Timeout { ref correlation_id, after })
                if correlation_id.as_str() == "a" && after == Duration::from_secs(5)
        ));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(!registry.contains(&"a".into()));

        assert_eq!(
            registry.resolve(reply("a", "too late")),
            Resolution::Late("a".into())
        );
    }

    #[tokio::test]
    async fn purge_cancelled_calls() {
        let registry = CorrelationRegistry::new();
        let pending = registry.register("a".into()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(60);

        let result = pending.wait_or_cancel(deadline, async {}).await;

        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert!(registry.is_empty());
        assert_eq!(
            registry.resolve(reply("a", "34")),
            Resolution::Late("a".into())
        );
    }

    #[tokio::test]
    async fn purge_dropped_calls() {
        let registry = CorrelationRegistry::new();
        let pending = registry.register("a".into()).unwrap();

        assert!(registry.contains(pending.correlation_id()));
        drop(pending);
        assert!(registry.is_empty());

        // The identifier may be used again once the previous call is gone
        assert!(registry.register("a".into()).is_ok());
    }

    #[tokio::test]
    async fn keep_reregistered_identifier_when_answered_call_is_dropped() {
        let registry = CorrelationRegistry::new();
        let first = registry.register("a".into()).unwrap();
        registry.resolve(reply("a", "1"));

        let second = registry.register("a".into()).unwrap();
        drop(first);

        assert!(registry.contains(&"a".into()));
        assert!(matches!(
            registry.resolve(reply("a", "2")),
            Resolution::Fulfilled { .. }
        ));

        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(second.wait(deadline).await.unwrap(), reply("a", "2"));
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_reply_resolved_before_deadline_passed() {
        let registry = CorrelationRegistry::new();
        let pending = registry.register("a".into()).unwrap();
        registry.resolve(reply("a", "34"));

        // The deadline has already passed when the caller starts waiting
        let result = pending.wait(Instant::now()).await;

        assert_eq!(result.unwrap(), reply("a", "34"));
    }

    #[tokio::test]
    async fn fail_pending_and_new_calls_once_closed() {
        let registry = CorrelationRegistry::new();
        let pending = registry.register("a".into()).unwrap();

        registry.close();

        let deadline = Instant::now() + Duration::from_secs(60);
        assert!(matches!(
            pending.wait(deadline).await,
            Err(RpcError::Broker(BrokerError::Closed))
        ));
        assert!(matches!(
            registry.register("b".into()),
            Err(RpcError::Broker(BrokerError::Closed))
        ));
        assert!(registry.is_closed());
        assert!(registry.is_empty());
    }
}
