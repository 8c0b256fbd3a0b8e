//! The priority scheduler (E): two-queue (running / pending) state machine
//! with per-priority sub-queues and a fairness-aware admission check.

use std::collections::VecDeque;

use crate::config::QueueingPolicy;

use super::item::QueueItem;

/// Running and pending queues, each bucketed by priority (0 lowest,
/// `max_priority - 1` highest).
pub struct PriorityScheduler {
    running: Vec<VecDeque<QueueItem>>,
    pending: Vec<VecDeque<QueueItem>>,
    policy: QueueingPolicy,
}

impl PriorityScheduler {
    pub fn new(max_priority: u32, policy: QueueingPolicy) -> Self {
        let buckets = max_priority.max(1) as usize;
        Self {
            running: (0..buckets).map(|_| VecDeque::new()).collect(),
            pending: (0..buckets).map(|_| VecDeque::new()).collect(),
            policy,
        }
    }

    fn bucket(&self, priority: u32) -> usize {
        (priority as usize).min(self.running.len() - 1)
    }

    fn all_queued_affinities(&self) -> impl Iterator<Item = &crate::models::AffinityExpr> {
        self.running
            .iter()
            .chain(self.pending.iter())
            .flatten()
            .filter_map(|item| item.affinity())
    }

    /// Places `item` on running, unless the fairness policy finds an
    /// already-queued item whose affinity is a superset of this one's — in
    /// which case it goes straight to pending, tagged implicitly by that
    /// blocking relationship (re-derived on every enqueue rather than cached,
    /// since the admission scan is cheap and always current).
    pub fn enqueue(&mut self, item: QueueItem) {
        let bucket = self.bucket(item.priority());
        if self.policy == QueueingPolicy::Fairness
            && let Some(incoming) = item.affinity()
        {
            let blocked = self
                .all_queued_affinities()
                .any(|existing| incoming.is_superset_of(existing));
            if blocked {
                self.pending[bucket].push_back(item);
                return;
            }
        }
        self.running[bucket].push_back(item);
    }

    /// Pops the next item to dispatch: highest priority first, FIFO within a
    /// bucket.
    pub fn pop_running(&mut self) -> Option<QueueItem> {
        self.running.iter_mut().rev().find_map(|bucket| bucket.pop_front())
    }

    pub fn push_pending(&mut self, priority: u32, item: QueueItem) {
        let bucket = self.bucket(priority);
        self.pending[bucket].push_back(item);
    }

    pub fn running_is_empty(&self) -> bool {
        self.running.iter().all(VecDeque::is_empty)
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.iter().all(VecDeque::is_empty)
    }

    /// Moves every pending item back to running, preserving relative order
    /// within each priority bucket.
    pub fn activate_pending(&mut self) {
        for (bucket, pending) in self.pending.iter_mut().enumerate() {
            self.running[bucket].extend(pending.drain(..));
        }
    }
}
