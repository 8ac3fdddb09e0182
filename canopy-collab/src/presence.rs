//! Presence tracking: who is online in a session, where their cursor is,
//! what they have selected.
//!
//! ## Architecture
//!
//! ```text
//! heartbeat(s, u, update)
//!       │  per-session lock
//!       ▼
//! PresenceRoom ── discard if the sender's timestamp is older than the
//!       │         last one applied for this user
//!       │
//!       ├──► store.put_presence   (failure logged, never surfaced)
//!       └──► bus.publish(PresenceChanged)
//!
//! sweeper task (every sweep_interval)
//!       │
//!       ▼
//! records with no heartbeat for `timeout` ──► online = false ──► publish
//! ```
//!
//! Two clocks are kept apart. Sender timestamps only order heartbeats from
//! the same connection and are never compared with server time. The
//! record's `last_heartbeat` is stamped by the tracker on receipt and never
//! moves backwards for a user, and staleness is measured on the tracker's
//! monotonic clock. A client whose clock runs behind the server's is
//! therefore treated exactly like one in sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broadcast::{EventBus, SessionEvent};
use crate::config::PresenceConfig;
use crate::model::{now_millis, PresenceRecord, PresenceUpdate, SessionId, UserId};
use crate::registry::SessionRegistry;
use crate::storage::CollabStore;

struct PresenceEntry {
    record: PresenceRecord,
    /// When the last accepted heartbeat arrived.
    received: Instant,
    /// Sender timestamp of the last accepted heartbeat; reset on join.
    sent_at: Option<u64>,
}

impl PresenceEntry {
    fn is_stale(&self, timeout: Duration) -> bool {
        self.received.elapsed() > timeout
    }
}

#[derive(Default)]
struct PresenceRoom {
    entries: HashMap<UserId, PresenceEntry>,
    hydrated: bool,
}

impl PresenceRoom {
    /// Receive stamp for `user_id`'s next record.
    fn next_stamp(&self, user_id: &UserId) -> u64 {
        let last = self
            .entries
            .get(user_id)
            .map_or(0, |entry| entry.record.last_heartbeat);
        now_millis().max(last)
    }
}

pub struct PresenceTracker {
    store: Arc<dyn CollabStore>,
    bus: Arc<dyn EventBus>,
    config: PresenceConfig,
    rooms: SessionRegistry<Mutex<PresenceRoom>>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn CollabStore>, bus: Arc<dyn EventBus>, config: PresenceConfig) -> Self {
        Self {
            store,
            bus,
            config,
            rooms: SessionRegistry::new(),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Upsert the user's presence and reset its staleness timer.
    ///
    /// Returns false when the update was discarded because its sender
    /// timestamp is older than the last one applied for the user.
    pub fn heartbeat(&self, session_id: SessionId, user_id: UserId, update: PresenceUpdate) -> bool {
        self.with_room(session_id, |room| {
            let last_sent = room.entries.get(&user_id).and_then(|entry| entry.sent_at);
            if let (Some(sent), Some(last)) = (update.timestamp, last_sent) {
                if sent < last {
                    log::trace!(
                        "Discarded out-of-order heartbeat from {user_id} in session {session_id}"
                    );
                    return false;
                }
            }

            log::trace!("Heartbeat from {user_id} in session {session_id}");
            let record = PresenceRecord {
                session_id,
                user_id,
                online: update.online,
                cursor: update.cursor,
                selection: update.selection,
                last_heartbeat: room.next_stamp(&user_id),
            };
            room.entries.insert(
                user_id,
                PresenceEntry {
                    record: record.clone(),
                    received: Instant::now(),
                    sent_at: update.timestamp.or(last_sent),
                },
            );
            // Published under the lock so per-user order is kept
            self.persist_and_publish(record);
            true
        })
    }

    /// Mark the user online for a fresh connection.
    ///
    /// Cursor and selection from an earlier connection are kept, and the
    /// sender-timestamp ordering starts over so a client with a different
    /// clock is not held to the previous one.
    pub fn join(&self, session_id: SessionId, user_id: UserId) -> PresenceRecord {
        self.with_room(session_id, |room| {
            let last_heartbeat = room.next_stamp(&user_id);
            let record = match room.entries.get(&user_id) {
                Some(entry) => PresenceRecord {
                    online: true,
                    last_heartbeat,
                    ..entry.record.clone()
                },
                None => PresenceRecord {
                    session_id,
                    user_id,
                    online: true,
                    cursor: None,
                    selection: Vec::new(),
                    last_heartbeat,
                },
            };
            room.entries.insert(
                user_id,
                PresenceEntry {
                    record: record.clone(),
                    received: Instant::now(),
                    sent_at: None,
                },
            );
            log::trace!("User {user_id} online in session {session_id}");
            self.persist_and_publish(record.clone());
            record
        })
    }

    /// Every presence record of the session, ordered by user id. Records
    /// with no heartbeat within the timeout are reported offline.
    pub fn snapshot(&self, session_id: SessionId) -> Vec<PresenceRecord> {
        let timeout = self.config.timeout;
        let Some(slot) = self.existing_room(session_id) else {
            return Vec::new();
        };
        let room = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<PresenceRecord> = room
            .entries
            .values()
            .map(|entry| {
                let mut record = entry.record.clone();
                if entry.is_stale(timeout) {
                    record.online = false;
                }
                record
            })
            .collect();
        records.sort_by_key(|r| r.user_id);
        records
    }

    /// Explicit offline signal. Returns true if the user was online.
    pub fn mark_offline(&self, session_id: SessionId, user_id: UserId) -> bool {
        let Some(slot) = self.existing_room(session_id) else {
            return false;
        };
        let mut room = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let last_heartbeat = room.next_stamp(&user_id);
        let Some(entry) = room.entries.get_mut(&user_id) else {
            return false;
        };
        if !entry.record.online {
            return false;
        }
        entry.record.online = false;
        entry.record.last_heartbeat = last_heartbeat;
        self.persist_and_publish(entry.record.clone());
        true
    }

    /// Mark every stale online record offline and publish the change.
    /// Returns the (session, user) pairs that expired.
    pub fn sweep(&self) -> Vec<(SessionId, UserId)> {
        let mut expired = Vec::new();
        for (session_id, slot) in self.rooms.entries() {
            let mut room = slot.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in room.entries.values_mut() {
                if entry.record.online && entry.is_stale(self.config.timeout) {
                    entry.record.online = false;
                    expired.push((session_id, entry.record.user_id));
                    log::info!(
                        "User {} in session {session_id} timed out after {:?}",
                        entry.record.user_id,
                        entry.received.elapsed()
                    );
                    self.persist_and_publish(entry.record.clone());
                }
            }
        }
        expired
    }

    /// Load every session with persisted presence so the sweep also covers
    /// records left online by a previous run. Returns the number of
    /// sessions loaded.
    pub fn load_persisted(&self) -> usize {
        match self.store.presence_sessions() {
            Ok(sessions) => {
                for session_id in &sessions {
                    self.with_room(*session_id, |_| ());
                }
                sessions.len()
            }
            Err(e) => {
                log::warn!("Could not list persisted presence: {e}");
                0
            }
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the handle
    /// is dropped or the tracker is gone. Persisted records are loaded
    /// first.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let loaded = self.load_persisted();
        if loaded > 0 {
            log::debug!("Loaded persisted presence for {loaded} sessions");
        }
        let tracker: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                let expired = tracker.sweep();
                if !expired.is_empty() {
                    log::debug!("Presence sweep expired {} records", expired.len());
                }
            }
        });
        SweeperHandle { task }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Run `f` on the session's room under its lock.
    fn with_room<R>(&self, session_id: SessionId, f: impl FnOnce(&mut PresenceRoom) -> R) -> R {
        let slot = self.rooms.get_or_insert_with(session_id, Mutex::default);
        let mut room = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if !room.hydrated {
            self.hydrate(session_id, &mut room);
        }
        f(&mut room)
    }

    /// The session's room if it is loaded or has persisted records. Read
    /// paths never create rooms for sessions nobody has been present in.
    fn existing_room(&self, session_id: SessionId) -> Option<Arc<Mutex<PresenceRoom>>> {
        if let Some(slot) = self.rooms.get(&session_id) {
            let mut room = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if !room.hydrated {
                self.hydrate(session_id, &mut room);
            }
            drop(room);
            return Some(slot);
        }
        match self.store.list_presence(session_id) {
            Ok(records) if records.is_empty() => None,
            Ok(_) => {
                self.with_room(session_id, |_| ());
                self.rooms.get(&session_id)
            }
            Err(e) => {
                log::warn!("Could not load presence for session {session_id}: {e}");
                None
            }
        }
    }

    /// Load records persisted before a restart. Their age is taken from the
    /// stored receive stamp.
    fn hydrate(&self, session_id: SessionId, room: &mut PresenceRoom) {
        match self.store.list_presence(session_id) {
            Ok(records) => {
                let now = Instant::now();
                let wall = now_millis();
                for record in records {
                    let age = Duration::from_millis(wall.saturating_sub(record.last_heartbeat));
                    let received = now.checked_sub(age).unwrap_or(now);
                    room.entries.entry(record.user_id).or_insert(PresenceEntry {
                        record,
                        received,
                        sent_at: None,
                    });
                }
                room.hydrated = true;
            }
            Err(e) => log::warn!("Could not load presence for session {session_id}: {e}"),
        }
    }

    fn persist_and_publish(&self, record: PresenceRecord) {
        if let Err(e) = self.store.put_presence(&record) {
            // Degrade to in-memory; the sweep still expires the record
            log::warn!(
                "Presence write for {} in session {} failed: {e}",
                record.user_id,
                record.session_id
            );
        }
        let session_id = record.session_id;
        if let Err(e) = self.bus.publish(session_id, SessionEvent::PresenceChanged(record)) {
            log::warn!("Presence publish in session {session_id} failed: {e}");
        }
    }
}

/// Background sweep task; aborted on drop.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
