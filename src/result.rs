//! Outcomes the performers hand back to callers: one instance's placement,
//! and a group's aggregate.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{Code, Status};
use crate::models::ResourceVector;

/// The outcome of scheduling one instance.
///
/// `unit_id` is the original logical candidate (which may be a bundle
/// fragment); `id` is that candidate resolved to its physical owner. Both
/// are always carried — never collapsed — so downstream consumers can tell
/// a logical placement from the agent that actually hosts it.
#[derive(Debug, Default)]
pub struct ScheduleResult {
    pub id: String,
    pub unit_id: String,
    pub code: Code,
    pub reason: String,
    pub hetero_product_name: String,
    pub allocated_vectors: HashMap<String, ResourceVector>,
    /// Set only in ALLOCATION mode: resolves once the reservation is
    /// confirmed into (or rolled back out of) the resource view.
    pub allocated_promise: Option<oneshot::Receiver<Status>>,
}

impl ScheduleResult {
    pub fn failure(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_success()
    }
}

impl Clone for ScheduleResult {
    /// Promises are one-shot and non-cloneable; a clone carries no promise
    /// of its own. This lets `ScheduleResult` travel as an ordinary value
    /// (downstream consumers receive a value copy) whenever the
    /// allocation-promise itself doesn't need to travel along with it, e.g.
    /// when a group result is assembled from the one performer call that
    /// owns the real promise.
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            unit_id: self.unit_id.clone(),
            code: self.code,
            reason: self.reason.clone(),
            hetero_product_name: self.hetero_product_name.clone(),
            allocated_vectors: self.allocated_vectors.clone(),
            allocated_promise: None,
        }
    }
}

/// Aggregate outcome for a group: success iff every required member
/// succeeded or the range policy's minimum was met.
#[derive(Debug, Default)]
pub struct GroupScheduleResult {
    pub code: Code,
    pub reason: String,
    pub results: Vec<ScheduleResult>,
}

impl GroupScheduleResult {
    /// Builds the aggregate the way `SchedulePerformer::DoCollectGroupResult`
    /// does: the *last* non-(success/already-allocated) code wins, with its
    /// reason carried up; an all-success group reports `Success`.
    pub fn collect(results: Vec<ScheduleResult>) -> Self {
        let mut code = Code::Success;
        let mut reason = String::new();
        for r in &results {
            if !matches!(r.code, Code::Success | Code::InstanceAllocated) {
                code = r.code;
                reason = format!("\n{}", r.reason);
            }
        }
        Self { code, reason, results }
    }
}
