//! Per-session slot map.
//!
//! Each session gets its own independently-locked state so that
//! cross-session work never contends. Lookups take a read lock; creation
//! falls back to a write lock with a double check.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::model::SessionId;

pub struct SessionRegistry<T> {
    slots: RwLock<HashMap<SessionId, Arc<T>>>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the slot for `session_id`.
    pub fn get_or_insert_with(&self, session_id: SessionId, init: impl FnOnce() -> T) -> Arc<T> {
        // Fast path: read lock
        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = slots.get(&session_id) {
                return slot.clone();
            }
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        // Double-check after acquiring write lock
        if let Some(slot) = slots.get(&session_id) {
            return slot.clone();
        }
        let slot = Arc::new(init());
        slots.insert(session_id, slot.clone());
        slot
    }

    /// Run `f` on the slot for `session_id`, creating it if needed, while
    /// holding the write lock. A concurrent `remove_if` cannot drop the
    /// slot until `f` returns.
    pub fn with_slot<R>(
        &self,
        session_id: SessionId,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&Arc<T>) -> R,
    ) -> R {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .entry(session_id)
            .or_insert_with(|| Arc::new(init()));
        f(slot)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<T>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Remove the slot if `predicate` holds for it.
    pub fn remove_if(&self, session_id: &SessionId, predicate: impl FnOnce(&T) -> bool) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.get(session_id) {
            Some(slot) if predicate(slot) => {
                slots.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all live slots.
    pub fn entries(&self) -> Vec<(SessionId, Arc<T>)> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
