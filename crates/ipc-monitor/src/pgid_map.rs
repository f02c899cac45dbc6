//! PGID → slot lookup with wait-free readers.
//!
//! Mutations clone the current table, apply the change, and swap the new
//! version in; readers load the current `Arc` without taking any lock. A
//! reader that raced a swap keeps the old table alive until it drops its
//! guard, which is the reclamation grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use arc_swap::ArcSwap;

use crate::Pgid;

/// What the map records per enrolled PGID. The generation is the slot's
/// generation at enroll time; any consumer revalidates it under the slot
/// lock before applying a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub slot_idx: usize,
    pub generation: u32,
}

pub struct PgidMap {
    current: ArcSwap<HashMap<Pgid, MapEntry>>,
    update: Mutex<()>,
}

impl Default for PgidMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PgidMap {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(HashMap::new()),
            update: Mutex::new(()),
        }
    }

    /// Wait-free lookup; safe to call from the switch handler.
    pub fn lookup(&self, pgid: Pgid) -> Option<MapEntry> {
        self.current.load().get(&pgid).copied()
    }

    /// Applies a mutation under the update lock and publishes the new
    /// table. Everything done inside `f` becomes visible to readers
    /// atomically with the swap; side effects sequenced inside `f` (such
    /// as clearing an active-mask bit) are ordered before the publication.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<Pgid, MapEntry>) -> R) -> R {
        let _guard = self.update.lock().expect("poisoned");
        let mut next = self.current.load_full().as_ref().clone();
        let result = f(&mut next);
        self.current.store(Arc::new(next));
        result
    }
}
