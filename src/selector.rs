//! The feasibility-scoring framework contract (the *selector*): out of
//! scope as an implementation, but the core depends on its shape — given a
//! request and the cluster view, return a ranked, poppable queue of
//! candidate units. This module defines that contract plus one concrete,
//! runnable selector (`BasicSelector`) built on a simple filter/grade split
//! with least-allocated scoring, so the crate is usable standalone; callers
//! may plug in their own.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use async_trait::async_trait;

use crate::context::PreAllocatedContext;
use crate::error::Code;
use crate::models::{InstanceDescriptor, ResourceVector};
use crate::resource_view::ResourceViewInfo;

/// One ranked candidate unit. Ordered by `score` (higher first) so a
/// `BinaryHeap<NodeScore>` pops the best candidate first: nodes are
/// ordered by score, higher first.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub unit_id: String,
    pub score: i64,
    /// How many concurrent instances of this request the node can still
    /// host. `-1` denotes "unlimited for this call" (bundle/logical units),
    /// and is returned as a terminal candidate without decrementing.
    pub available_for_request: i64,
    pub hetero_product_name: String,
    pub allocated_vectors: std::collections::HashMap<String, ResourceVector>,
}

impl PartialEq for NodeScore {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for NodeScore {}
impl PartialOrd for NodeScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for NodeScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.cmp(&other.score)
    }
}

/// Result of one `select_feasible` call.
pub struct ScheduleResults {
    pub code: Code,
    pub reason: String,
    pub sorted_feasible_nodes: BinaryHeap<NodeScore>,
}

impl ScheduleResults {
    pub fn ok(sorted_feasible_nodes: BinaryHeap<NodeScore>) -> Self {
        Self {
            code: Code::Success,
            reason: String::new(),
            sorted_feasible_nodes,
        }
    }

    pub fn err(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            sorted_feasible_nodes: BinaryHeap::new(),
        }
    }
}

/// The black-box feasibility-scoring framework: filter units down to the
/// feasible set, then rank them. Pure (no I/O) over the snapshot.
#[async_trait]
pub trait Selector: Send + Sync {
    async fn select_feasible(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceDescriptor,
        snapshot: &ResourceViewInfo,
        expected_feasible: u32,
    ) -> ScheduleResults;
}

/// A minimal, runnable selector: filters units with enough allocatable
/// resources to host the request, then scores by least-allocated
/// utilization (lower post-placement utilization wins), the same strategy
/// a common least-allocated default.
#[derive(Debug, Clone, Default)]
pub struct BasicSelector;

fn fits(requested: &ResourceVector, allocatable: &ResourceVector) -> bool {
    requested
        .iter()
        .all(|(k, v)| *v <= 0 || allocatable.get(k).copied().unwrap_or(0) >= *v)
}

/// How many concurrent copies of `requested` still fit in `allocatable`,
/// capped by `expected_feasible` since no caller needs more than that many
/// ranked slots out of a single candidate.
fn max_concurrent(requested: &ResourceVector, allocatable: &ResourceVector, expected_feasible: u32) -> i64 {
    let concurrent = requested
        .iter()
        .filter(|(_, v)| **v > 0)
        .map(|(k, v)| allocatable.get(k).copied().unwrap_or(0) / v)
        .min()
        .unwrap_or(i64::MAX);
    concurrent.min(expected_feasible.max(1) as i64)
}

fn least_allocated_score(requested: &ResourceVector, allocatable: &ResourceVector, capacity: &ResourceVector) -> i64 {
    if requested.is_empty() {
        return 100;
    }
    let mut utilization_sum = 0.0;
    let mut count = 0.0;
    for (k, req) in requested {
        let cap = capacity.get(k).copied().unwrap_or(0);
        if cap <= 0 {
            continue;
        }
        let used = cap - allocatable.get(k).copied().unwrap_or(0);
        let post = (used + req) as f64 / cap as f64;
        utilization_sum += post;
        count += 1.0;
    }
    if count == 0.0 {
        return 100;
    }
    (((1.0 - utilization_sum / count) * 100.0).round()) as i64
}

#[async_trait]
impl Selector for BasicSelector {
    async fn select_feasible(
        &self,
        _ctx: &mut PreAllocatedContext,
        instance: &InstanceDescriptor,
        snapshot: &ResourceViewInfo,
        expected_feasible: u32,
    ) -> ScheduleResults {
        let mut heap = BinaryHeap::new();
        for unit in snapshot.units.values() {
            if !fits(&instance.resources, &unit.allocatable) {
                continue;
            }
            let score = least_allocated_score(&instance.resources, &unit.allocatable, &unit.capacity);
            heap.push(NodeScore {
                unit_id: unit.unit_id.clone(),
                score,
                available_for_request: max_concurrent(&instance.resources, &unit.allocatable, expected_feasible),
                hetero_product_name: String::new(),
                allocated_vectors: std::collections::HashMap::new(),
            });
        }
        if heap.is_empty() {
            return ScheduleResults::err(
                Code::ResourceNotEnough,
                "no available resource that meets the request requirements",
            );
        }
        ScheduleResults::ok(heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_view::ResourceUnit;

    #[tokio::test]
    async fn basic_selector_ranks_least_allocated_first() {
        crate::test_support::init_logging();
        let mut snapshot = ResourceViewInfo::default();
        snapshot.units.insert(
            "small".into(),
            ResourceUnit::new("small", [("cpu".to_string(), 20)].into_iter().collect()),
        );
        snapshot.units.insert(
            "large".into(),
            ResourceUnit::new("large", [("cpu".to_string(), 200)].into_iter().collect()),
        );

        let instance = InstanceDescriptor::new("i1", [("cpu".to_string(), 10)].into_iter().collect());
        let mut ctx = PreAllocatedContext::new();
        let selector = BasicSelector;
        let mut results = selector.select_feasible(&mut ctx, &instance, &snapshot, 1).await;
        assert!(results.code.is_success());
        let top = results.sorted_feasible_nodes.pop().unwrap();
        assert_eq!(top.unit_id, "large");
    }
}
