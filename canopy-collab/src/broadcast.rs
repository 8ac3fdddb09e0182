//! Session-scoped fan-out of operations and presence deltas.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` events; a subscriber that falls further behind receives a
//! [`Delivery::Lagged`] marker and is expected to catch up from the
//! operation log.
//!
//! ```text
//!   OperationLog ──┐                      ┌──► Subscription (alice)
//!   Presence     ──┼─► EventBus::publish ─┼──► Subscription (bob)
//!   SessionStore ──┘   (one channel per   └──► Subscription (carol)
//!                       session)
//! ```
//!
//! `EventBus` is the seam for multi-instance deployments: a broker-backed
//! implementation forwards publishes to the shared bus and feeds local
//! subscriptions from it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::error::CollabResult;
use crate::model::{Operation, Participant, PresenceRecord, SessionId, UserId};
use crate::registry::SessionRegistry;

/// Something that happened in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    OperationAppended(Operation),
    PresenceChanged(PresenceRecord),
    ParticipantJoined(Participant),
    RoleChanged(Participant),
    SessionClosed { session_id: SessionId },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::OperationAppended(op) => op.session_id,
            SessionEvent::PresenceChanged(record) => record.session_id,
            SessionEvent::ParticipantJoined(p) | SessionEvent::RoleChanged(p) => p.session_id,
            SessionEvent::SessionClosed { session_id } => *session_id,
        }
    }
}

/// One item pulled from a [`Subscription`].
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Arc<SessionEvent>),
    /// The subscriber fell behind and `n` events were skipped.
    Lagged(u64),
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters on the publish path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

// ─── Subscriptions ──────────────────────────────────────────────────

struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable reference to a subscription, used to cancel it from any task.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub session_id: SessionId,
    pub user_id: UserId,
    state: Arc<CancelState>,
}

impl SubscriptionHandle {
    fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            user_id,
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns true only for the call that performed the cancellation.
    pub fn cancel(&self) -> bool {
        let first = !self.state.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.state.notify.notify_one();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Receiving end of a session subscription.
///
/// Once the handle is cancelled `recv` returns `None`, including when the
/// cancellation races with an event already in flight.
pub struct Subscription {
    handle: SubscriptionHandle,
    receiver: broadcast::Receiver<Arc<SessionEvent>>,
    stats: Arc<AtomicBroadcastStats>,
    group: Weak<BroadcastGroup>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn session_id(&self) -> SessionId {
        self.handle.session_id
    }

    /// Wait for the next delivery. `None` means cancelled or the session
    /// channel was closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if self.handle.is_cancelled() {
            return None;
        }
        let result = tokio::select! {
            biased;
            _ = self.handle.state.notify.notified() => return None,
            result = self.receiver.recv() => result,
        };
        // Checked again: cancel may have landed while the event was in flight
        if self.handle.is_cancelled() {
            return None;
        }
        match result {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
                log::warn!(
                    "Subscriber {} in session {} lagged by {skipped} events",
                    self.handle.user_id,
                    self.handle.session_id
                );
                Some(Delivery::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
        if let Some(group) = self.group.upgrade() {
            group.remove(&self.handle.id);
        }
    }
}

// ─── Bus ────────────────────────────────────────────────────────────

/// Session-scoped publish/subscribe.
pub trait EventBus: Send + Sync {
    /// Fan out to current subscribers without waiting for delivery.
    /// Returns the number of receivers the event was queued for.
    fn publish(&self, session_id: SessionId, event: SessionEvent) -> CollabResult<usize>;

    fn subscribe(&self, session_id: SessionId, user_id: UserId) -> CollabResult<Subscription>;

    /// Release a subscription. Safe to call more than once.
    fn unsubscribe(&self, handle: &SubscriptionHandle);

    fn subscriber_count(&self, session_id: SessionId) -> usize;

    /// Drop the session's channel; live subscriptions drain buffered
    /// events and then end.
    fn close_session(&self, session_id: SessionId);
}

/// A broadcast group for a single session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<SessionEvent>>,
    /// subscription id -> user id
    subscribers: Mutex<HashMap<Uuid, UserId>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many events can be buffered per subscriber
    /// before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: Mutex::new(HashMap::new()),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    fn subscribe(self: &Arc<Self>, session_id: SessionId, user_id: UserId) -> Subscription {
        let handle = SubscriptionHandle::new(session_id, user_id);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.insert(handle.id, user_id);
        Subscription {
            handle,
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
            group: Arc::downgrade(self),
        }
    }

    fn remove(&self, subscription_id: &Uuid) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id)
            .is_some()
    }

    fn send(&self, event: Arc<SessionEvent>) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}

/// In-process [`EventBus`]: one [`BroadcastGroup`] per session.
pub struct LocalBus {
    groups: SessionRegistry<BroadcastGroup>,
    default_capacity: usize,
}

impl LocalBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: SessionRegistry::new(),
            default_capacity,
        }
    }

    pub fn stats(&self, session_id: SessionId) -> Option<BroadcastStats> {
        self.groups.get(&session_id).map(|group| group.stats())
    }

    /// Sessions with an open channel.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.groups.entries().into_iter().map(|(id, _)| id).collect()
    }
}

impl EventBus for LocalBus {
    fn publish(&self, session_id: SessionId, event: SessionEvent) -> CollabResult<usize> {
        // No group means nobody is listening
        let Some(group) = self.groups.get(&session_id) else {
            return Ok(0);
        };
        Ok(group.send(Arc::new(event)))
    }

    fn subscribe(&self, session_id: SessionId, user_id: UserId) -> CollabResult<Subscription> {
        // Registered under the registry lock so an unsubscribe cannot drop
        // the group in between
        let subscription = self.groups.with_slot(
            session_id,
            || BroadcastGroup::new(self.default_capacity),
            |group| group.subscribe(session_id, user_id),
        );
        log::debug!("User {user_id} subscribed to session {session_id}");
        Ok(subscription)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.cancel();
        if let Some(group) = self.groups.get(&handle.session_id) {
            if group.remove(&handle.id) {
                log::debug!(
                    "User {} unsubscribed from session {}",
                    handle.user_id,
                    handle.session_id
                );
            }
            // Nobody left listening
            self.groups
                .remove_if(&handle.session_id, |group| group.subscriber_count() == 0);
        }
    }

    fn subscriber_count(&self, session_id: SessionId) -> usize {
        self.groups
            .get(&session_id)
            .map_or(0, |group| group.subscriber_count())
    }

    fn close_session(&self, session_id: SessionId) {
        if self.groups.remove_if(&session_id, |_| true) {
            log::debug!("Closed broadcast channel for session {session_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, VectorClock};
    use std::time::Duration;

    fn op_event(session_id: SessionId, sequence: u64) -> SessionEvent {
        SessionEvent::OperationAppended(Operation {
            id: Uuid::new_v4(),
            session_id,
            author_id: Uuid::new_v4(),
            sequence,
            op_type: "add_node".into(),
            payload: vec![1, 2, 3],
            submitted_at: 0,
            vector_clock: VectorClock::new(),
            applied: false,
        })
    }

    fn sequence_of(delivery: Option<Delivery>) -> u64 {
        match delivery {
            Some(Delivery::Event(event)) => match &*event {
                SessionEvent::OperationAppended(op) => op.sequence,
                other => panic!("unexpected event {other:?}"),
            },
            other => panic!("unexpected delivery {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fan_out_in_publish_order() {
        let bus = LocalBus::new(16);
        let session = Uuid::new_v4();
        let mut alice = bus.subscribe(session, Uuid::new_v4()).unwrap();
        let mut bob = bus.subscribe(session, Uuid::new_v4()).unwrap();

        for seq in 1..=3 {
            assert_eq!(bus.publish(session, op_event(session, seq)).unwrap(), 2);
        }

        for seq in 1..=3 {
            assert_eq!(sequence_of(alice.recv().await), seq);
            assert_eq!(sequence_of(bob.recv().await), seq);
        }
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let bus = LocalBus::new(16);
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        let mut sub_b = bus.subscribe(session_b, Uuid::new_v4()).unwrap();

        bus.publish(session_a, op_event(session_a, 1)).unwrap();
        bus.publish(session_b, op_event(session_b, 7)).unwrap();

        assert_eq!(sequence_of(sub_b.recv().await), 7);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = LocalBus::new(16);
        let session = Uuid::new_v4();
        assert_eq!(bus.publish(session, op_event(session, 1)).unwrap(), 0);
        assert_eq!(bus.subscriber_count(session), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = LocalBus::new(16);
        let session = Uuid::new_v4();
        let mut sub = bus.subscribe(session, Uuid::new_v4()).unwrap();
        let handle = sub.handle();
        assert_eq!(bus.subscriber_count(session), 1);

        bus.unsubscribe(&handle);
        bus.unsubscribe(&handle);
        assert_eq!(bus.subscriber_count(session), 0);
        assert!(handle.is_cancelled());

        bus.publish(session, op_event(session, 1)).unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_recv() {
        let bus = Arc::new(LocalBus::new(16));
        let session = Uuid::new_v4();
        let mut sub = bus.subscribe(session, Uuid::new_v4()).unwrap();
        let handle = sub.handle();

        let waiter = tokio::spawn(async move { sub.recv().await.is_none() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.unsubscribe(&handle);

        let ended = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ended);
    }

    #[tokio::test]
    async fn test_event_buffered_before_cancel_is_not_delivered() {
        let bus = LocalBus::new(16);
        let session = Uuid::new_v4();
        let mut sub = bus.subscribe(session, Uuid::new_v4()).unwrap();

        bus.publish(session, op_event(session, 1)).unwrap();
        sub.handle().cancel();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_lag() {
        let bus = LocalBus::new(4);
        let session = Uuid::new_v4();
        let mut sub = bus.subscribe(session, Uuid::new_v4()).unwrap();

        for seq in 1..=10 {
            bus.publish(session, op_event(session, seq)).unwrap();
        }

        match sub.recv().await {
            Some(Delivery::Lagged(skipped)) => assert_eq!(skipped, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(sequence_of(sub.recv().await), 7);

        let stats = bus.stats(session).unwrap();
        assert_eq!(stats.messages_sent, 10);
        assert_eq!(stats.messages_dropped, 6);
        assert_eq!(stats.active_subscribers, 1);
    }

    #[tokio::test]
    async fn test_close_session_drains_then_ends() {
        let bus = LocalBus::new(16);
        let session = Uuid::new_v4();
        let mut sub = bus.subscribe(session, Uuid::new_v4()).unwrap();

        bus.publish(session, SessionEvent::SessionClosed { session_id: session })
            .unwrap();
        bus.close_session(session);

        match sub.recv().await {
            Some(Delivery::Event(event)) => {
                assert_eq!(*event, SessionEvent::SessionClosed { session_id: session })
            }
            other => panic!("expected close event, got {other:?}"),
        }
        assert!(sub.recv().await.is_none());
        assert!(bus.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscription_leaves_group() {
        let group = Arc::new(BroadcastGroup::new(8));
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let _a = group.subscribe(session, user);
        let b = group.subscribe(session, user);
        assert_eq!(group.subscriber_count(), 2);

        drop(b);
        assert_eq!(group.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_drops_channel() {
        let bus = LocalBus::new(16);
        let session = Uuid::new_v4();
        let first = bus.subscribe(session, Uuid::new_v4()).unwrap();
        let second = bus.subscribe(session, Uuid::new_v4()).unwrap();

        bus.unsubscribe(&first.handle());
        assert_eq!(bus.active_sessions(), vec![session]);
        bus.unsubscribe(&second.handle());
        assert!(bus.active_sessions().is_empty());

        // A later subscriber gets a fresh channel
        let mut third = bus.subscribe(session, Uuid::new_v4()).unwrap();
        assert_eq!(bus.publish(session, op_event(session, 1)).unwrap(), 1);
        assert_eq!(sequence_of(third.recv().await), 1);
    }

    #[test]
    fn test_event_session_id() {
        let session = Uuid::new_v4();
        let participant = Participant::new(session, Uuid::new_v4(), Role::Viewer);
        assert_eq!(SessionEvent::ParticipantJoined(participant).session_id(), session);
        assert_eq!(op_event(session, 1).session_id(), session);
    }
}
