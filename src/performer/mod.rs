//! Performers (C): the hot path that drives one request or request-group
//! through the selector, preemption, pre-allocation, and rollback. A common
//! set of free functions (this module) backs the three variants in
//! `instance`, `group`, and `aggregate` — a sum type over the variants with
//! a shared contract, rather than the original's virtual-inheritance
//! hierarchy.

pub mod aggregate;
pub mod group;
pub mod instance;

use std::collections::{BinaryHeap, HashMap};

use std::sync::Arc;

use crate::context::PreAllocatedContext;
use crate::error::Code;
use crate::models::InstanceDescriptor;
use crate::preemption::{PreemptNotifier, PreemptionController};
use crate::resource_view::{InstanceInfo, ResourceViewInfo, SharedResourceView};
use crate::result::ScheduleResult;
use crate::selector::{NodeScore, Selector};

/// Whether a performer reserves into an ephemeral context only, or also
/// writes the reservation into the resource view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateType {
    PreAllocation,
    Allocation,
}

/// Shared, injected collaborators every performer variant needs: the
/// selector, the optional live resource view (only touched in
/// `Allocation` mode), and the preemption controller.
pub struct PerformerDeps {
    pub allocate_type: AllocateType,
    pub selector: Arc<dyn Selector>,
    pub resource_view: Option<SharedResourceView>,
    pub preempt_controller: PreemptionController,
    /// Absent means preemption is disabled: a feasibility failure is simply
    /// returned for the caller to retry via the pending queue.
    pub preempt_notifier: Option<Arc<dyn PreemptNotifier>>,
}

/// Idempotence check, plus honoring a prior group reservation. Returns
/// `Some(result)` without touching the selector when either applies.
pub async fn check_already_scheduled_or_reserved(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    snapshot: &ResourceViewInfo,
    request_id: &str,
    reserved_unit: Option<&str>,
    instance: &InstanceDescriptor,
) -> Option<ScheduleResult> {
    if let Some(owner) = snapshot.already_scheduled.get(request_id) {
        return Some(ScheduleResult {
            id: owner.clone(),
            unit_id: owner.clone(),
            code: Code::InstanceAllocated,
            reason: format!("request is already scheduled to {owner}"),
            ..Default::default()
        });
    }
    if let Some(unit_id) = reserved_unit
        && snapshot.contains_fragment(unit_id) {
            let owner = snapshot.owner_of(unit_id).unwrap_or(unit_id).to_string();
            let mut result = ScheduleResult {
                id: unit_id.to_string(),
                unit_id: unit_id.to_string(),
                code: Code::Success,
                ..Default::default()
            };
            pre_allocated(ctx, instance, unit_id, &mut result);
            allocate_into_resource_view(deps, instance, unit_id, &mut result).await;
            result.id = owner;
            return Some(result);
        }
    None
}

/// `DoSelectOne`: idempotence/reservation shortcut, else a single-candidate
/// selector call followed by `select_from_results`.
pub async fn do_select_one(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    snapshot: &ResourceViewInfo,
    request_id: &str,
    reserved_unit: Option<&str>,
    instance: &InstanceDescriptor,
) -> ScheduleResult {
    if let Some(result) =
        check_already_scheduled_or_reserved(deps, ctx, snapshot, request_id, reserved_unit, instance).await
    {
        return result;
    }
    let results = deps.selector.select_feasible(ctx, instance, snapshot, 1).await;
    if !matches!(results.code, Code::Success) {
        return ScheduleResult::failure(results.code, results.reason);
    }
    let mut candidates = results.sorted_feasible_nodes;
    let mut pre_allocated_count = HashMap::new();
    select_from_results(
        deps,
        ctx,
        snapshot,
        request_id,
        reserved_unit,
        instance,
        &mut candidates,
        &mut pre_allocated_count,
    )
    .await
}

/// `SelectFromResults`: pops the best remaining candidate, accounting for
/// concurrent selections already recorded for this group in
/// `pre_allocated_count`, resolves logical-to-physical, and pre-allocates.
#[allow(clippy::too_many_arguments)]
pub async fn select_from_results(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    snapshot: &ResourceViewInfo,
    request_id: &str,
    reserved_unit: Option<&str>,
    instance: &InstanceDescriptor,
    candidates: &mut BinaryHeap<NodeScore>,
    pre_allocated_count: &mut HashMap<String, i64>,
) -> ScheduleResult {
    if let Some(result) =
        check_already_scheduled_or_reserved(deps, ctx, snapshot, request_id, reserved_unit, instance).await
    {
        return result;
    }

    while let Some(mut top) = candidates.pop() {
        if top.available_for_request == -1 {
            let mut result = ScheduleResult {
                id: top.unit_id.clone(),
                unit_id: top.unit_id.clone(),
                code: Code::Success,
                hetero_product_name: top.hetero_product_name,
                allocated_vectors: top.allocated_vectors,
                ..Default::default()
            };
            pre_allocated(ctx, instance, &top.unit_id, &mut result);
            allocate_into_resource_view(deps, instance, &top.unit_id, &mut result).await;
            return result;
        }

        if let Some(taken) = pre_allocated_count.remove(&top.unit_id) {
            top.available_for_request -= taken;
            if top.available_for_request <= 0 {
                continue;
            }
        }

        top.available_for_request -= 1;
        let candidate_id = top.unit_id.clone();
        let remaining = top.available_for_request;
        let hetero_product_name = top.hetero_product_name.clone();
        let allocated_vectors = top.allocated_vectors.clone();
        if remaining > 0 {
            candidates.push(top);
        }

        let owner = snapshot.owner_of(&candidate_id).unwrap_or(&candidate_id).to_string();
        let mut result = ScheduleResult {
            id: owner,
            unit_id: candidate_id.clone(),
            code: Code::Success,
            hetero_product_name,
            allocated_vectors,
            ..Default::default()
        };
        pre_allocated(ctx, instance, &candidate_id, &mut result);
        allocate_into_resource_view(deps, instance, &candidate_id, &mut result).await;
        return result;
    }

    ScheduleResult::failure(
        Code::ResourceNotEnough,
        "no available resource that meets the request requirements",
    )
}

/// `PreAllocated`/`DoPreAllocated`: records the reservation into the
/// context (trace chain, accumulated resources/labels) and, in Allocation
/// mode, hands the instance to the resource view too.
pub fn pre_allocated(
    ctx: &mut PreAllocatedContext,
    instance: &InstanceDescriptor,
    unit_id: &str,
    result: &mut ScheduleResult,
) {
    if !result.is_ok() {
        return;
    }
    let mut resources = instance.resources.clone();
    // heterogeneous (accelerator) resource keys carry a slash and are
    // replaced wholesale by the allocated-vector map returned by the
    // selector.
    resources.retain(|k, _| !k.contains('/'));
    for (name, vector) in &result.allocated_vectors {
        resources.insert(name.clone(), vector.values().sum());
    }
    ctx.record(unit_id, &instance.instance_id, &resources, &instance.labels);
}

/// Reserves the already-pre-allocated instance into the live resource view
/// (ALLOCATION mode only), attaching the allocation-promise the caller may
/// await to learn whether the write was confirmed.
pub async fn allocate_into_resource_view(
    deps: &PerformerDeps,
    instance: &InstanceDescriptor,
    unit_id: &str,
    result: &mut ScheduleResult,
) {
    if deps.allocate_type != AllocateType::Allocation || !result.is_ok() {
        return;
    }
    let Some(view) = &deps.resource_view else {
        return;
    };
    let info = InstanceInfo {
        instance_id: instance.instance_id.clone(),
        unit_id: unit_id.to_string(),
        resources: instance.resources.clone(),
        labels: instance.labels.clone(),
        priority: instance.options.priority,
        scheduled_at: instance.options.enqueued_at,
        scheduler_chain: vec![unit_id.to_string()],
    };
    if let Ok(mut promises) = view
        .add_instances([(instance.instance_id.clone(), info)].into_iter().collect())
        .await
    {
        result.allocated_promise = promises.remove(&instance.instance_id);
    }
}

/// Undoes a successful pre-allocation: subtracts the member's resources and
/// labels from the context and, in Allocation mode, virtually deletes it
/// from the resource view.
pub async fn rollback(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    unit_id: &str,
    instance: &InstanceDescriptor,
) {
    let mut resources = instance.resources.clone();
    resources.retain(|k, _| !k.contains('/'));
    ctx.rollback(unit_id, &instance.instance_id, &resources, &instance.labels);
    if deps.allocate_type == AllocateType::Allocation
        && let Some(view) = &deps.resource_view {
            let _ = view
                .delete_instances(std::slice::from_ref(&instance.instance_id), true)
                .await;
        }
}

/// `IsScheduleResultNeedPreempt`: recoverable feasibility failures are
/// candidates for preemption, but only when a preempt callback exists —
/// callers without one get the plain failure and retry via the pending
/// queue.
pub fn needs_preemption(result: &ScheduleResult, preempt_enabled: bool) -> bool {
    preempt_enabled && result.code.is_feasibility_failure()
}

/// Aggregates a run of per-instance results the way `DoCollectGroupResult`
/// does.
pub fn collect_group_result(results: Vec<ScheduleResult>) -> crate::result::GroupScheduleResult {
    crate::result::GroupScheduleResult::collect(results)
}

pub use crate::result::{GroupScheduleResult, ScheduleResult as Result};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceVector;
    use crate::resource_view::ResourceUnit;
    use crate::selector::BasicSelector;

    fn deps() -> PerformerDeps {
        PerformerDeps {
            allocate_type: AllocateType::PreAllocation,
            selector: std::sync::Arc::new(BasicSelector),
            resource_view: None,
            preempt_controller: PreemptionController::new(),
            preempt_notifier: None,
        }
    }

    #[tokio::test]
    async fn scenario_1_single_instance_sufficient_resources() {
        crate::test_support::init_logging();
        let mut snapshot = ResourceViewInfo::default();
        snapshot.units.insert(
            "agent001".into(),
            ResourceUnit::new(
                "agent001",
                [("cpu".to_string(), 100), ("memory".to_string(), 100)]
                    .into_iter()
                    .collect(),
            ),
        );
        let instance = InstanceDescriptor::new(
            "i1",
            [("cpu".to_string(), 10), ("memory".to_string(), 10)].into_iter().collect(),
        );
        let mut ctx = PreAllocatedContext::new();
        let result = do_select_one(&deps(), &mut ctx, &snapshot, "req1", None, &instance).await;
        assert!(result.is_ok());
        assert_eq!(result.id, "agent001");
        assert_eq!(ctx.allocated["agent001"]["cpu"], 10);
        assert_eq!(ctx.allocated["agent001"]["memory"], 10);
    }

    #[tokio::test]
    async fn already_scheduled_is_idempotent() {
        crate::test_support::init_logging();
        let mut snapshot = ResourceViewInfo::default();
        snapshot
            .already_scheduled
            .insert("req1".to_string(), "agent001".to_string());
        let instance = InstanceDescriptor::new("i1", ResourceVector::new());
        let mut ctx = PreAllocatedContext::new();
        let result = do_select_one(&deps(), &mut ctx, &snapshot, "req1", None, &instance).await;
        assert_eq!(result.code, Code::InstanceAllocated);
        assert_eq!(result.id, "agent001");
        assert!(ctx.allocated.is_empty());
    }
}
