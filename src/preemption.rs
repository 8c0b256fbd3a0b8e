//! The preemption controller: given a candidate instance and the
//! unit it failed to fit on, decide a minimal set of lower-priority victims
//! whose removal would make the candidate feasible. Never mutates the live
//! resource view — it operates purely over the cached snapshot and lets the
//! caller apply deletion-deltas.

use async_trait::async_trait;

use crate::error::Code;
use crate::models::{InstanceDescriptor, ResourceVector};
use crate::resource_view::{InstanceInfo, ResourceUnit};

/// Outcome of one preemption decision.
#[derive(Debug, Clone)]
pub struct PreemptResult {
    pub code: Code,
    pub unit_id: String,
    pub preempted_instances: Vec<InstanceInfo>,
}

impl PreemptResult {
    pub fn none(reason_unit: impl Into<String>) -> Self {
        Self {
            code: Code::NoPreemptableInstance,
            unit_id: reason_unit.into(),
            preempted_instances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreemptionController;

/// Notified once a preemption decision is made, so the caller can carry it
/// out (evict the chosen victims) out-of-band. The instance performer makes
/// at most one such call per failed attempt and never blocks the original
/// failure result on its outcome.
#[async_trait]
pub trait PreemptNotifier: Send + Sync {
    async fn notify(&self, decision: &PreemptResult, candidate: &InstanceDescriptor);
}

fn deficit(requested: &ResourceVector, allocatable: &ResourceVector) -> ResourceVector {
    let mut out = ResourceVector::new();
    for (k, v) in requested {
        let have = allocatable.get(k).copied().unwrap_or(0);
        if *v > have {
            out.insert(k.clone(), v - have);
        }
    }
    out
}

fn covers(freed: &ResourceVector, need: &ResourceVector) -> bool {
    need.iter().all(|(k, v)| freed.get(k).copied().unwrap_or(0) >= *v)
}

impl PreemptionController {
    pub fn new() -> Self {
        Self
    }

    /// Selects the smallest prefix of candidate victims (lowest priority
    /// first, ties broken by most-recently-scheduled first) whose combined
    /// resources cover the candidate's unmet demand on `unit`.
    pub fn preempt_decision(&self, candidate: &InstanceDescriptor, unit: &ResourceUnit) -> PreemptResult {
        let need = deficit(&candidate.resources, &unit.allocatable);
        if need.is_empty() {
            return PreemptResult {
                code: Code::Success,
                unit_id: unit.unit_id.clone(),
                preempted_instances: Vec::new(),
            };
        }

        let mut victims: Vec<&InstanceInfo> = unit.instances.values().collect();
        victims.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.scheduled_at.cmp(&a.scheduled_at))
        });

        let mut freed = ResourceVector::new();
        let mut chosen = Vec::new();
        for victim in victims {
            if victim.priority >= candidate.options.priority {
                // only lower-priority tenants are preemptable.
                continue;
            }
            if covers(&freed, &need) {
                break;
            }
            crate::models::add_assign(&mut freed, &victim.resources);
            chosen.push(victim.clone());
        }

        if !covers(&freed, &need) {
            return PreemptResult::none(unit.unit_id.clone());
        }

        PreemptResult {
            code: Code::Success,
            unit_id: unit.unit_id.clone(),
            preempted_instances: chosen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LabelMap, SchedulingOptions};

    fn victim(id: &str, priority: u32, scheduled_at: u64, cpu: i64) -> InstanceInfo {
        InstanceInfo {
            instance_id: id.into(),
            unit_id: "unit1".into(),
            resources: [("cpu".to_string(), cpu)].into_iter().collect(),
            labels: LabelMap::new(),
            priority,
            scheduled_at,
            scheduler_chain: vec!["unit1".into()],
        }
    }

    #[test]
    fn two_low_priority_victims_cover_a_high_priority_request() {
        crate::test_support::init_logging();
        let mut unit = ResourceUnit::new("unit1", [("cpu".to_string(), 0)].into_iter().collect());
        unit.instances.insert("a".into(), victim("a", 1, 1, 50));
        unit.instances.insert("b".into(), victim("b", 1, 2, 50));

        let mut candidate = InstanceDescriptor::new("hi", [("cpu".to_string(), 60)].into_iter().collect());
        candidate.options = SchedulingOptions {
            priority: 10,
            enqueued_at: 0,
        };

        let controller = PreemptionController::new();
        let decision = controller.preempt_decision(&candidate, &unit);
        assert!(decision.code.is_success());
        assert_eq!(decision.preempted_instances.len(), 2);
    }

    #[test]
    fn no_preemptable_when_all_same_priority() {
        crate::test_support::init_logging();
        let mut unit = ResourceUnit::new("unit1", [("cpu".to_string(), 0)].into_iter().collect());
        unit.instances.insert("a".into(), victim("a", 10, 1, 50));

        let candidate = InstanceDescriptor::new("hi", [("cpu".to_string(), 60)].into_iter().collect());
        let controller = PreemptionController::new();
        let decision = controller.preempt_decision(&candidate, &unit);
        assert_eq!(decision.code, Code::NoPreemptableInstance);
    }
}
