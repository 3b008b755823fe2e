//! Short-lived memory of deleted event ids.
//!
//! When a moderator deletes an event, a client may still hold a copy and
//! publish it again. The guard refuses such re-publishes for a grace
//! window. Past that window moderation events are refused as too old
//! anyway, so the id can be forgotten.
//!
//! Expired ids are dropped when looked up, by [`DeletedEventGuard::sweep`],
//! and by marking itself once the map has doubled since its last sweep, so
//! memory stays bounded even without a sweeper task.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;

/// Size below which marking never sweeps.
const SWEEP_THRESHOLD: usize = 1024;

/// Maps a deleted event id to the unix time its entry expires.
pub struct DeletedEventGuard {
    entries: DashMap<String, u64>,
    grace: u64,
    clock: Arc<dyn Clock>,
    sweep_at: AtomicUsize,
}

impl DeletedEventGuard {
    pub fn new(grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            grace: grace.as_secs(),
            clock,
            sweep_at: AtomicUsize::new(SWEEP_THRESHOLD),
        }
    }

    /// Remember `id` for the grace window, starting now.
    pub fn mark_deleted(&self, id: &str) {
        let expiry = self.clock.now().saturating_add(self.grace);
        self.entries.insert(id.to_string(), expiry);
        if self.entries.len() >= self.sweep_at.load(Ordering::Relaxed) {
            self.sweep();
        }
    }

    /// True while `id` is inside its grace window. Expired entries are
    /// removed on the way out.
    pub fn is_recently_deleted(&self, id: &str) -> bool {
        let now = self.clock.now();
        let Some(expiry) = self.entries.get(id).map(|e| *e) else {
            return false;
        };
        if now < expiry {
            return true;
        }
        self.entries.remove_if(id, |_, exp| now >= *exp);
        false
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, expiry| now < *expiry);
        let remaining = self.entries.len();
        self.sweep_at
            .store(remaining.saturating_mul(2).max(SWEEP_THRESHOLD), Ordering::Relaxed);
        let removed = before.saturating_sub(remaining);
        if removed > 0 {
            debug!(removed, "swept deleted event ids");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `period` on the current tokio runtime.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}
