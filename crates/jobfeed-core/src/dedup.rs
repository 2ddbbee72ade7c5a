//! Time-expiring window of recently published record ids.
//!
//! The window serialises all access behind its own lock, so callers on
//! concurrent publish tasks never coordinate among themselves. Ids move
//! through two states:
//!
//! ```text
//! (absent) --try_claim--> CLAIMED --mark_seen--> SEEN --retention/capacity--> (absent)
//!                            |
//!                            +------release-----> (absent)
//! ```
//!
//! Only `SEEN` entries count toward capacity; eviction past capacity is
//! oldest-first by publish time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Configuration for the dedup window.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a published id suppresses repeats.
    pub retention: Duration,
    /// Maximum number of published ids remembered at once.
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            capacity: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// A publish for this id is in flight.
    Claimed,
    /// Published at the given instant.
    Seen(Instant),
}

#[derive(Debug, Default)]
struct DedupInner {
    slots: HashMap<String, Slot>,
    /// Seen ids in publish order. May hold stale entries for ids that were
    /// re-marked; those are skipped when popped.
    order: VecDeque<(String, Instant)>,
    seen: usize,
}

impl DedupInner {
    fn is_expired(at: Instant, now: Instant, retention: Duration) -> bool {
        now.saturating_duration_since(at) >= retention
    }

    /// Pop the oldest order entry, removing its slot if the entry is current.
    /// Returns true if a live entry was removed.
    fn pop_oldest(&mut self) -> Option<bool> {
        let (id, at) = self.order.pop_front()?;
        if self.slots.get(&id) == Some(&Slot::Seen(at)) {
            self.slots.remove(&id);
            self.seen -= 1;
            Some(true)
        } else {
            Some(false)
        }
    }

    fn purge_expired(&mut self, now: Instant, retention: Duration) -> usize {
        let mut purged = 0;
        while let Some((_, at)) = self.order.front() {
            if !Self::is_expired(*at, now, retention) {
                break;
            }
            if self.pop_oldest() == Some(true) {
                purged += 1;
            }
        }
        purged
    }

    fn evict_over_capacity(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.seen > capacity {
            match self.pop_oldest() {
                Some(true) => evicted += 1,
                Some(false) => {}
                None => break,
            }
        }
        evicted
    }
}

/// Bounded, time-expiring set of published record ids.
#[derive(Clone)]
pub struct DedupWindow {
    config: DedupConfig,
    inner: Arc<Mutex<DedupInner>>,
}

impl DedupWindow {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(DedupInner::default())),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, DedupInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned dedup mutex");
            poisoned.into_inner()
        })
    }

    /// Whether a record with this id may be published now.
    ///
    /// Read-only: asking twice without a claim or mark in between gives the
    /// same answer.
    pub fn should_publish(&self, id: &str) -> bool {
        let inner = self.lock_inner();
        match inner.slots.get(id) {
            None => true,
            Some(Slot::Claimed) => false,
            Some(Slot::Seen(at)) => {
                DedupInner::is_expired(*at, Instant::now(), self.config.retention)
            }
        }
    }

    /// Atomically check and reserve an id for publishing.
    ///
    /// Of any number of concurrent callers for the same id, exactly one gets
    /// `true`. The winner must follow up with [`mark_seen`](Self::mark_seen)
    /// or [`release`](Self::release).
    pub fn try_claim(&self, id: &str) -> bool {
        let mut inner = self.lock_inner();
        inner.purge_expired(Instant::now(), self.config.retention);

        if inner.slots.contains_key(id) {
            return false;
        }
        inner.slots.insert(id.to_string(), Slot::Claimed);
        true
    }

    /// Record a successful publish, starting the retention clock.
    pub fn mark_seen(&self, id: &str) {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        inner.purge_expired(now, self.config.retention);

        let previous = inner.slots.insert(id.to_string(), Slot::Seen(now));
        if !matches!(previous, Some(Slot::Seen(_))) {
            inner.seen += 1;
        }
        inner.order.push_back((id.to_string(), now));

        let evicted = inner.evict_over_capacity(self.config.capacity);
        if evicted > 0 {
            tracing::debug!(evicted, "Dedup window over capacity, evicted oldest ids");
        }
    }

    /// Drop an in-flight claim so a later cycle may try again.
    ///
    /// Returns false if the id was not claimed (already seen or unknown).
    pub fn release(&self, id: &str) -> bool {
        let mut inner = self.lock_inner();
        if inner.slots.get(id) == Some(&Slot::Claimed) {
            inner.slots.remove(id);
            true
        } else {
            false
        }
    }

    /// Purge expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.lock_inner();
        inner.purge_expired(Instant::now(), self.config.retention)
    }

    /// Number of published ids currently remembered.
    pub fn len(&self) -> usize {
        self.lock_inner().seen
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ids claimed by in-flight publishes.
    pub fn in_flight(&self) -> usize {
        let inner = self.lock_inner();
        inner.slots.len() - inner.seen
    }
}
