//! Scheduler-wide configuration via small, explicit constructor parameters
//! rather than a config-file layer.

use std::time::Duration;

use crate::performer::AllocateType;

/// Admission policy for the priority scheduler's fairness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueingPolicy {
    /// Plain FIFO within each priority bucket; no fairness short-circuit.
    Fifo,
    /// Enqueue defers an item straight to pending when a broader-affinity
    /// item is already queued for the same resources.
    Fairness,
}

/// Constructor parameters for the queue actor.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_priority: u32,
    pub queueing_policy: QueueingPolicy,
    pub allocate_type: AllocateType,
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_priority: 16,
            queueing_policy: QueueingPolicy::Fairness,
            allocate_type: AllocateType::PreAllocation,
            idle_timeout: Duration::from_secs(30),
        }
    }
}
