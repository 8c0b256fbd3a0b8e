//! The aggregated performer: a batch of same-spec instances sharing one
//! selector call, each drawn from the same ranked candidate queue via
//! `select_from_results`. This function is cancellation-agnostic — it
//! always schedules every request it's given. Per-member cancellation
//! (rolling back only the cancelled member, leaving siblings untouched) is
//! the caller's job: the queue actor carries one cancel future per member in
//! `AggregatedItem::cancels` and calls `super::rollback` only for the
//! members whose own future fired.

use std::collections::HashMap;

use crate::context::PreAllocatedContext;
use crate::models::ScheduleRequest;
use crate::resource_view::ResourceViewInfo;
use crate::result::ScheduleResult;

use super::{PerformerDeps, select_from_results};

/// Schedules `requests` (all the same resource spec) against one selector
/// call sized to the batch, returning results in the same order as input.
pub async fn schedule(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    snapshot: &ResourceViewInfo,
    requests: &[ScheduleRequest],
) -> Vec<ScheduleResult> {
    let Some(first) = requests.first() else {
        return Vec::new();
    };

    let selected = deps
        .selector
        .select_feasible(ctx, &first.instance, snapshot, requests.len() as u32)
        .await;
    if !selected.code.is_success() {
        return requests
            .iter()
            .map(|_| ScheduleResult::failure(selected.code, selected.reason.clone()))
            .collect();
    }

    let mut candidates = selected.sorted_feasible_nodes;
    let mut pre_allocated_count = HashMap::new();
    let mut out = Vec::with_capacity(requests.len());
    for request in requests {
        let result = select_from_results(
            deps,
            ctx,
            snapshot,
            &request.request_id,
            request.reserved_unit.as_deref(),
            &request.instance,
            &mut candidates,
            &mut pre_allocated_count,
        )
        .await;
        out.push(result);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::InstanceDescriptor;
    use crate::preemption::PreemptionController;
    use crate::resource_view::ResourceUnit;
    use crate::selector::BasicSelector;

    fn deps() -> PerformerDeps {
        PerformerDeps {
            allocate_type: super::super::AllocateType::PreAllocation,
            selector: Arc::new(BasicSelector),
            resource_view: None,
            preempt_controller: PreemptionController::new(),
            preempt_notifier: None,
        }
    }

    fn member(id: &str) -> ScheduleRequest {
        ScheduleRequest::new(id, InstanceDescriptor::new(id, [("cpu".to_string(), 10)].into_iter().collect()))
    }

    #[tokio::test]
    async fn batch_spreads_across_available_capacity_in_order() {
        crate::test_support::init_logging();
        let mut snapshot = ResourceViewInfo::default();
        snapshot.units.insert(
            "unit1".into(),
            ResourceUnit::new("unit1", [("cpu".to_string(), 25)].into_iter().collect()),
        );
        let requests = vec![member("a"), member("b"), member("c")];
        let mut ctx = PreAllocatedContext::new();
        let results = schedule(&deps(), &mut ctx, &snapshot, &requests).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert!(!results[2].is_ok());
        assert_eq!(ctx.allocated["unit1"]["cpu"], 20);
    }

    #[tokio::test]
    async fn cancelling_one_member_rolls_back_only_that_member() {
        crate::test_support::init_logging();
        let mut snapshot = ResourceViewInfo::default();
        snapshot.units.insert(
            "unit1".into(),
            ResourceUnit::new("unit1", [("cpu".to_string(), 100)].into_iter().collect()),
        );
        let requests = vec![member("a"), member("b")];
        let mut ctx = PreAllocatedContext::new();
        let results = schedule(&deps(), &mut ctx, &snapshot, &requests).await;
        assert!(results.iter().all(|r| r.is_ok()));

        super::super::rollback(&deps(), &mut ctx, &results[0].unit_id, &requests[0].instance).await;
        assert_eq!(ctx.allocated["unit1"]["cpu"], 10);
    }
}
