//! Per-parent fan-out accounting for nested task spawns.
//!
//! [`SpawnTracker`] counts how many children each parent task currently has
//! in flight. A child is admitted with [`SpawnTracker::admit`], which hands
//! back a [`SpawnGuard`]; dropping the guard releases the slot, so the
//! release runs exactly once however the child's invocation ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Registry of active child counts keyed by parent task id.
///
/// An empty parent id means "top-level": it is never fan-out limited and is
/// never recorded.
#[derive(Debug, Default)]
pub struct SpawnTracker {
    counts: Mutex<HashMap<String, usize>>,
}

impl SpawnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        // The map holds plain counters; a panic mid-update cannot leave it torn.
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment `parent_id`'s count if it is below `max_children`.
    ///
    /// Returns `false` without side effects when the parent is at its limit.
    /// An empty `parent_id` always succeeds.
    pub fn try_spawn(&self, parent_id: &str, max_children: usize) -> bool {
        if parent_id.is_empty() {
            return true;
        }
        let mut counts = self.lock();
        let current = counts.get(parent_id).copied().unwrap_or(0);
        if current >= max_children {
            return false;
        }
        counts.insert(parent_id.to_string(), current + 1);
        drop(counts);
        debug!(parent_id, active = current + 1, "Child spawn admitted");
        true
    }

    /// Decrement `parent_id`'s count, clamped at zero.
    ///
    /// The entry is removed once it reaches zero. Releasing a parent with no
    /// recorded children is a no-op.
    pub fn release(&self, parent_id: &str) {
        if parent_id.is_empty() {
            return;
        }
        let mut counts = self.lock();
        match counts.get_mut(parent_id) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                counts.remove(parent_id);
            }
            None => {}
        }
    }

    /// Current number of active children for `parent_id` (0 if absent).
    pub fn count(&self, parent_id: &str) -> usize {
        self.lock().get(parent_id).copied().unwrap_or(0)
    }

    /// Number of parents with at least one active child.
    pub fn tracked_parents(&self) -> usize {
        self.lock().len()
    }

    /// Admit a child of `parent_id`, returning a guard that releases on drop.
    pub fn admit(self: &Arc<Self>, parent_id: &str, max_children: usize) -> Option<SpawnGuard> {
        self.try_spawn(parent_id, max_children).then(|| SpawnGuard {
            tracker: Arc::clone(self),
            parent_id: parent_id.to_string(),
        })
    }
}

/// Scope guard for one admitted child spawn.
#[derive(Debug)]
pub struct SpawnGuard {
    tracker: Arc<SpawnTracker>,
    parent_id: String,
}

impl SpawnGuard {
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.parent_id);
    }
}
