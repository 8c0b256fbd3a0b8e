//! The group performer: schedules a `GroupSpec` under StrictPack, Normal, or
//! Range policy. StrictPack folds the group into one virtual request;
//! Normal/Range schedule members individually (optionally batched against a
//! single selector call) with an in-pass preemption retry loop and, for
//! Range, a step-aligned truncation pass at the end.

use std::collections::HashMap;

use crate::context::PreAllocatedContext;
use crate::error::Code;
use crate::models::{GroupSpec, InstanceDescriptor, LabelMap, ResourceVector, add_assign};
use crate::resource_view::ResourceViewInfo;
use crate::result::{GroupScheduleResult, ScheduleResult};

use super::{PerformerDeps, do_select_one, needs_preemption, rollback, select_from_results};

/// Dispatches to the policy-specific scheduling path.
pub async fn schedule(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    snapshot: &ResourceViewInfo,
    group: &GroupSpec,
) -> GroupScheduleResult {
    match group.policy {
        crate::models::GroupPolicy::StrictPack => strict_pack(deps, ctx, snapshot, group).await,
        crate::models::GroupPolicy::Normal | crate::models::GroupPolicy::Range => {
            normal_or_range(deps, ctx, snapshot, group).await
        }
    }
}

/// Sums every member's resources and labels into one virtual request, the
/// way a bundle is packed into a single placement decision.
fn build_virtual_instance(group: &GroupSpec) -> InstanceDescriptor {
    let mut resources = ResourceVector::new();
    let mut labels = LabelMap::new();
    for request in &group.requests {
        add_assign(&mut resources, &request.instance.resources);
        labels.extend(request.instance.labels.clone());
    }
    let mut instance = InstanceDescriptor::new(group.group_id.clone(), resources);
    instance.labels = labels;
    instance.options = group
        .requests
        .first()
        .map(|r| r.instance.options)
        .unwrap_or_default();
    instance
}

async fn strict_pack(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    snapshot: &ResourceViewInfo,
    group: &GroupSpec,
) -> GroupScheduleResult {
    let virtual_instance = build_virtual_instance(group);
    let result = do_select_one(deps, ctx, snapshot, &group.group_id, None, &virtual_instance).await;

    if !result.is_ok() {
        let results = group
            .requests
            .iter()
            .map(|_| ScheduleResult::failure(result.code, result.reason.clone()))
            .collect();
        return GroupScheduleResult::collect(results);
    }

    let results = group
        .requests
        .iter()
        .map(|_| result.clone())
        .collect::<Vec<_>>();
    GroupScheduleResult::collect(results)
}

/// Undoes a successful StrictPack reservation: the whole group was recorded
/// as one virtual instance, so it is rolled back as one.
pub async fn rollback_strict_pack(deps: &PerformerDeps, ctx: &mut PreAllocatedContext, group: &GroupSpec, unit_id: &str) {
    let virtual_instance = build_virtual_instance(group);
    rollback(deps, ctx, unit_id, &virtual_instance).await;
}

/// True iff every member shares the same resource demand and labels, so a
/// single `expectedFeasible = group.size()` selector call can serve all of
/// them.
fn can_batch(group: &GroupSpec) -> bool {
    if !group.range.is_range {
        return false;
    }
    group.requests.windows(2).all(|pair| {
        pair[0].instance.resources == pair[1].instance.resources && pair[0].instance.labels == pair[1].instance.labels
    })
}

async fn normal_or_range(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    snapshot: &ResourceViewInfo,
    group: &GroupSpec,
) -> GroupScheduleResult {
    let min_required = group.min_required();
    let mut cached_snapshot: Option<ResourceViewInfo> = None;
    let mut shared_candidates = if can_batch(group) {
        let first = &group.requests[0].instance;
        let expected = group.requests.len() as u32;
        let results = deps.selector.select_feasible(ctx, first, snapshot, expected).await;
        results.code.is_success().then_some(results.sorted_feasible_nodes)
    } else {
        None
    };
    let mut pre_allocated_count = HashMap::new();
    let mut results = Vec::with_capacity(group.requests.len());
    let mut success_count = 0u32;
    let mut aborted = false;

    for request in &group.requests {
        if aborted {
            results.push(ScheduleResult::failure(
                Code::ResourceNotEnough,
                "group scheduling aborted after an unpreemptable member failure",
            ));
            continue;
        }

        let active_snapshot: &ResourceViewInfo = cached_snapshot.as_ref().unwrap_or(snapshot);
        let mut result = if let Some(candidates) = shared_candidates.as_mut() {
            select_from_results(
                deps,
                ctx,
                active_snapshot,
                &request.request_id,
                request.reserved_unit.as_deref(),
                &request.instance,
                candidates,
                &mut pre_allocated_count,
            )
            .await
        } else {
            do_select_one(
                deps,
                ctx,
                active_snapshot,
                &request.request_id,
                request.reserved_unit.as_deref(),
                &request.instance,
            )
            .await
        };

        if needs_preemption(&result, deps.preempt_notifier.is_some()) && success_count < min_required {
            let working = cached_snapshot.get_or_insert_with(|| snapshot.clone());
            let decision = working
                .units
                .values()
                .map(|unit| deps.preempt_controller.preempt_decision(&request.instance, unit))
                .find(|decision| decision.code.is_success());

            if let Some(decision) = decision {
                for victim in &decision.preempted_instances {
                    working.apply_preemption_delta(&decision.unit_id, victim);
                }
                if let Some(notifier) = &deps.preempt_notifier {
                    notifier.notify(&decision, &request.instance).await;
                }
                result = do_select_one(
                    deps,
                    ctx,
                    working,
                    &request.request_id,
                    request.reserved_unit.as_deref(),
                    &request.instance,
                )
                .await;
            } else {
                aborted = true;
            }
        }

        if result.is_ok() {
            success_count += 1;
        }
        results.push(result);
    }

    if group.range.is_range && success_count > group.range.min {
        truncate_range(deps, ctx, group, &mut results, &mut success_count).await;
    }

    finalize(group, results, success_count, min_required)
}

/// Rolls back the tail of a step-aligned range group, matching each result
/// to the original request that produced it by shared index — never an
/// adjacent or out-of-range member.
async fn truncate_range(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    group: &GroupSpec,
    results: &mut [ScheduleResult],
    success_count: &mut u32,
) {
    let step = group.range.step.max(1);
    debug_assert!(
        *success_count <= group.range.max,
        "truncate_range called with success_count {} exceeding range.max {}",
        success_count,
        group.range.max,
    );
    let step_count = group.range.max.saturating_sub(*success_count).div_ceil(step) * step;
    let reserved = group.range.min.max(group.range.max.saturating_sub(step_count));

    let mut seen = 0u32;
    for (request, result) in group.requests.iter().zip(results.iter_mut()) {
        if !result.is_ok() {
            continue;
        }
        seen += 1;
        if seen > reserved {
            rollback(deps, ctx, &result.unit_id, &request.instance).await;
            *result = ScheduleResult::failure(Code::ScheduleCanceled, "rolled back by range truncation");
            *success_count -= 1;
        }
    }
}

fn finalize(group: &GroupSpec, results: Vec<ScheduleResult>, success_count: u32, min_required: u32) -> GroupScheduleResult {
    if success_count >= min_required && !group.requests.is_empty() {
        return GroupScheduleResult {
            code: Code::Success,
            reason: String::new(),
            results,
        };
    }
    let mut aggregate = GroupScheduleResult::collect(results);
    if aggregate.code.is_success() {
        aggregate.code = Code::ResourceNotEnough;
        aggregate.reason = "group did not reach the minimum required members".into();
    }
    aggregate
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::{GroupPolicy, RangeOption, ScheduleRequest};
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

    fn member(id: &str, cpu: i64) -> ScheduleRequest {
        ScheduleRequest::new(id, InstanceDescriptor::new(id, [("cpu".to_string(), cpu)].into_iter().collect()))
    }

    #[tokio::test]
    async fn strict_pack_places_every_member_on_the_same_unit() {
        crate::test_support::init_logging();
        let mut snapshot = ResourceViewInfo::default();
        snapshot.units.insert(
            "unit1".into(),
            ResourceUnit::new("unit1", [("cpu".to_string(), 100)].into_iter().collect()),
        );
        let group = GroupSpec {
            group_id: "g1".into(),
            requests: vec![member("a", 10), member("b", 10)],
            policy: GroupPolicy::StrictPack,
            range: RangeOption::default(),
            priority_flag: false,
            timeout: None,
        };
        let mut ctx = PreAllocatedContext::new();
        let result = schedule(&deps(), &mut ctx, &snapshot, &group).await;
        assert!(result.code.is_success());
        assert_eq!(result.results.len(), 2);
        assert!(result.results.iter().all(|r| r.id == "unit1"));
        assert_eq!(ctx.allocated["unit1"]["cpu"], 20);

        rollback_strict_pack(&deps(), &mut ctx, &group, "unit1").await;
        assert!(ctx.allocated["unit1"].is_empty());
    }

    #[tokio::test]
    async fn range_group_truncates_to_step_aligned_minimum() {
        crate::test_support::init_logging();
        let mut snapshot = ResourceViewInfo::default();
        snapshot.units.insert(
            "unit1".into(),
            ResourceUnit::new("unit1", [("cpu".to_string(), 600)].into_iter().collect()),
        );
        let requests = (0..6).map(|i| member(&format!("m{i}"), 10)).collect();
        let group = GroupSpec {
            group_id: "g1".into(),
            requests,
            policy: GroupPolicy::Range,
            range: RangeOption {
                is_range: true,
                min: 5,
                max: 10,
                step: 3,
            },
            priority_flag: false,
            timeout: None,
        };
        let mut ctx = PreAllocatedContext::new();
        let result = schedule(&deps(), &mut ctx, &snapshot, &group).await;
        assert!(result.code.is_success());
        let successes = result.results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 5);
        assert_eq!(ctx.allocated["unit1"]["cpu"], 50);
    }

    #[tokio::test]
    async fn range_group_keeps_all_when_already_step_aligned() {
        crate::test_support::init_logging();
        let mut snapshot = ResourceViewInfo::default();
        snapshot.units.insert(
            "unit1".into(),
            ResourceUnit::new("unit1", [("cpu".to_string(), 600)].into_iter().collect()),
        );
        let requests = (0..6).map(|i| member(&format!("m{i}"), 10)).collect();
        let group = GroupSpec {
            group_id: "g1".into(),
            requests,
            policy: GroupPolicy::Range,
            range: RangeOption {
                is_range: true,
                min: 5,
                max: 10,
                step: 2,
            },
            priority_flag: false,
            timeout: None,
        };
        let mut ctx = PreAllocatedContext::new();
        let result = schedule(&deps(), &mut ctx, &snapshot, &group).await;
        assert!(result.code.is_success());
        let successes = result.results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 6);
    }
}
