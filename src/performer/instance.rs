//! The instance performer: schedules one request on its own. The common
//! path is `do_select_one`; the only variant-specific behavior is what
//! happens after a recoverable feasibility failure.

use crate::context::PreAllocatedContext;
use crate::models::ScheduleRequest;
use crate::resource_view::ResourceViewInfo;
use crate::result::ScheduleResult;

use super::{PerformerDeps, do_select_one, needs_preemption};

/// Schedules `request` once. On a recoverable feasibility failure with a
/// preempt notifier registered, tries every unit in the snapshot for a
/// preemption decision that would make the candidate fit, fires the
/// notification for the first one found, and returns regardless — the
/// caller retries the (unchanged) failure through the pending queue once
/// the notified eviction has actually freed the resources.
pub async fn schedule(
    deps: &PerformerDeps,
    ctx: &mut PreAllocatedContext,
    snapshot: &ResourceViewInfo,
    request: &ScheduleRequest,
) -> ScheduleResult {
    let result = do_select_one(
        deps,
        ctx,
        snapshot,
        &request.request_id,
        request.reserved_unit.as_deref(),
        &request.instance,
    )
    .await;

    if needs_preemption(&result, deps.preempt_notifier.is_some()) {
        let notifier = deps.preempt_notifier.as_ref().unwrap();
        for unit in snapshot.units.values() {
            let decision = deps.preempt_controller.preempt_decision(&request.instance, unit);
            if decision.code.is_success() {
                notifier.notify(&decision, &request.instance).await;
                break;
            }
        }
    }

    result
}
