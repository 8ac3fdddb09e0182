//! Append-only, per-session operation log.
//!
//! ```text
//!  append(s, u, draft)
//!     │  authorize: session active, role ∈ {owner, editor}
//!     ▼
//!  ┌──────────── per-session lock ─────────────┐
//!  │ seq = last + 1                            │
//!  │ store.append_operation(op)  (with retry)  │
//!  │ last = seq                                │
//!  │ bus.publish(OperationAppended(op))        │
//!  └───────────────────────────────────────────┘
//! ```
//!
//! The per-session lock is the only serialization point: appends on
//! different sessions never contend. Publishing under the lock makes the
//! broadcast order identical to the sequence order.

use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broadcast::{EventBus, SessionEvent};
use crate::config::{CollabConfig, RetryPolicy};
use crate::error::{CollabError, CollabResult};
use crate::model::{now_millis, Operation, OperationDraft, SessionId, UserId};
use crate::registry::SessionRegistry;
use crate::retry::with_retry;
use crate::storage::{CollabStore, StoreError};

/// Cached tail of one session's log; `None` until read from storage.
#[derive(Default)]
struct LogState {
    last: Option<u64>,
}

pub struct OperationLog {
    store: Arc<dyn CollabStore>,
    bus: Arc<dyn EventBus>,
    config: CollabConfig,
    logs: SessionRegistry<Mutex<LogState>>,
}

impl OperationLog {
    pub fn new(store: Arc<dyn CollabStore>, bus: Arc<dyn EventBus>, config: CollabConfig) -> Self {
        Self {
            store,
            bus,
            config,
            logs: SessionRegistry::new(),
        }
    }

    /// Record an operation and fan it out.
    ///
    /// Either the operation is durably recorded and published, or an error
    /// is returned and the log is unchanged.
    pub async fn append(
        &self,
        session_id: SessionId,
        author_id: UserId,
        draft: OperationDraft,
    ) -> CollabResult<Operation> {
        self.authorize(session_id, author_id).await?;

        let slot = self.logs.get_or_insert_with(session_id, Mutex::default);
        let mut state = slot.lock().await;
        let last = match state.last {
            Some(last) => last,
            None => {
                let last = self.load_tail(session_id).await?;
                state.last = Some(last);
                last
            }
        };

        let op = Operation {
            id: draft.id.unwrap_or_else(Uuid::new_v4),
            session_id,
            author_id,
            sequence: last + 1,
            op_type: draft.op_type,
            payload: draft.payload,
            submitted_at: now_millis(),
            vector_clock: draft.vector_clock,
            applied: false,
        };

        if let Err(e) = self.persist(&op).await {
            // Re-read the tail on the next append
            state.last = None;
            return Err(e);
        }
        state.last = Some(op.sequence);

        log::debug!(
            "Appended {} #{} to session {session_id} by {author_id}",
            op.op_type,
            op.sequence
        );
        if let Err(e) = self
            .bus
            .publish(session_id, SessionEvent::OperationAppended(op.clone()))
        {
            // Subscribers recover through replay
            log::warn!("Publish of #{} in session {session_id} failed: {e}", op.sequence);
        }
        Ok(op)
    }

    /// Operations with sequence greater than `after`, in append order.
    ///
    /// The stream ends at the tail as of this call; call again with the last
    /// sequence seen to continue.
    pub async fn replay_since(
        &self,
        session_id: SessionId,
        after: u64,
    ) -> CollabResult<BoxStream<'static, CollabResult<Operation>>> {
        let tail = self.tail(session_id).await?;
        let state = ReplayState {
            store: self.store.clone(),
            retry: self.config.retry.clone(),
            session_id,
            cursor: after,
            tail,
            batch: self.config.replay_batch_size.max(1),
            buffered: VecDeque::new(),
            failed: false,
        };
        Ok(stream::unfold(state, ReplayState::next).boxed())
    }

    /// Collect a full replay into memory.
    pub async fn operations_since(
        &self,
        session_id: SessionId,
        after: u64,
    ) -> CollabResult<Vec<Operation>> {
        let mut replay = self.replay_since(session_id, after).await?;
        let mut ops = Vec::new();
        while let Some(op) = replay.next().await {
            ops.push(op?);
        }
        Ok(ops)
    }

    /// Last sequence recorded for the session (0 when empty).
    pub async fn tail(&self, session_id: SessionId) -> CollabResult<u64> {
        let Some(slot) = self.logs.get(&session_id) else {
            // Cached by the first append; unknown ids get no slot
            return self.load_tail(session_id).await;
        };
        let mut state = slot.lock().await;
        if let Some(last) = state.last {
            return Ok(last);
        }
        let last = self.load_tail(session_id).await?;
        state.last = Some(last);
        Ok(last)
    }

    /// Set the `applied` flag once a consumer has durably processed the
    /// operation.
    pub async fn mark_applied(&self, session_id: SessionId, sequence: u64) -> CollabResult<()> {
        let store = self.store.clone();
        let found = with_retry(&self.config.retry, "mark_applied", || {
            store.mark_applied(session_id, sequence)
        })
        .await?;
        if !found {
            return Err(CollabError::not_found(format!(
                "operation #{sequence} in session {session_id}"
            )));
        }
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn authorize(&self, session_id: SessionId, author_id: UserId) -> CollabResult<()> {
        let store = self.store.clone();
        let session = with_retry(&self.config.retry, "load_session", || {
            store.load_session(session_id)
        })
        .await?;
        if !session.is_some_and(|s| s.is_active) {
            return Err(CollabError::not_found(format!("session {session_id}")));
        }

        let participant = with_retry(&self.config.retry, "load_participant", || {
            store.load_participant(session_id, author_id)
        })
        .await?;
        match participant {
            Some(p) if p.role.can_write() => Ok(()),
            Some(p) => Err(CollabError::permission_denied(format!(
                "{} {author_id} cannot append to session {session_id}",
                p.role
            ))),
            None => Err(CollabError::permission_denied(format!(
                "user {author_id} is not a participant of session {session_id}"
            ))),
        }
    }

    async fn load_tail(&self, session_id: SessionId) -> CollabResult<u64> {
        let store = self.store.clone();
        with_retry(&self.config.retry, "last_sequence", || {
            store.last_sequence(session_id)
        })
        .await
    }

    async fn persist(&self, op: &Operation) -> CollabResult<()> {
        let store = self.store.clone();
        match with_retry(&self.config.retry, "append_operation", || store.append_operation(op)).await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // A retried write may have landed on an earlier attempt
                if self.is_recorded(op).await {
                    log::debug!("Append #{} was recorded by an earlier attempt", op.sequence);
                    return Ok(());
                }
                Err(e)
            }
        }
    }

    async fn is_recorded(&self, op: &Operation) -> bool {
        let store = self.store.clone();
        let found = with_retry(&self.config.retry, "verify_append", || {
            store.operations_after(op.session_id, op.sequence - 1, 1)
        })
        .await;
        matches!(found.as_deref(), Ok([recorded]) if recorded.id == op.id)
    }
}

struct ReplayState {
    store: Arc<dyn CollabStore>,
    retry: RetryPolicy,
    session_id: SessionId,
    cursor: u64,
    tail: u64,
    batch: usize,
    buffered: VecDeque<Operation>,
    failed: bool,
}

impl ReplayState {
    async fn next(mut self) -> Option<(CollabResult<Operation>, Self)> {
        loop {
            if let Some(op) = self.buffered.pop_front() {
                self.cursor = op.sequence;
                return Some((Ok(op), self));
            }
            if self.failed || self.cursor >= self.tail {
                return None;
            }

            let (store, session_id, cursor, batch) =
                (self.store.clone(), self.session_id, self.cursor, self.batch);
            let page: Result<Vec<Operation>, CollabError> =
                with_retry(&self.retry, "replay", || -> Result<_, StoreError> {
                    store.operations_after(session_id, cursor, batch)
                })
                .await;
            match page {
                Ok(page) => {
                    let tail = self.tail;
                    self.buffered
                        .extend(page.into_iter().filter(|op| op.sequence <= tail));
                    if self.buffered.is_empty() {
                        return None;
                    }
                }
                Err(e) => {
                    self.failed = true;
                    return Some((Err(e), self));
                }
            }
        }
    }
}
