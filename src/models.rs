//! Core value types shared across the scheduling decision core: requests,
//! group specs, and the small resource/label algebra the performers use to
//! accumulate and roll back reservations.

use std::collections::{BTreeSet, HashMap};

/// A named resource demand or capacity, e.g. `{"cpu": 10, "memory": 10}`.
pub type ResourceVector = HashMap<String, i64>;

/// Opaque key/value labels attached to an instance or a resource unit.
pub type LabelMap = HashMap<String, String>;

/// Adds `b` into `a` in place, summing shared keys.
pub fn add_assign(a: &mut ResourceVector, b: &ResourceVector) {
    for (k, v) in b {
        *a.entry(k.clone()).or_insert(0) += v;
    }
}

/// Subtracts `b` from `a` in place, dropping keys that fall back to zero.
pub fn sub_assign(a: &mut ResourceVector, b: &ResourceVector) {
    for (k, v) in b {
        let entry = a.entry(k.clone()).or_insert(0);
        *entry -= v;
        if *entry == 0 {
            a.remove(k);
        }
    }
}

/// Required label constraints an instance or group member carries.
///
/// A simplified stand-in for the original's affinity-expression proto: a set
/// of `(key, value)` label requirements. `is_superset_of` backs both the
/// fairness-queue admission rule in [`crate::queue::priority`] and the
/// pending-affinity short-circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffinityExpr {
    pub required_labels: BTreeSet<(String, String)>,
}

impl AffinityExpr {
    pub fn new(required_labels: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            required_labels: required_labels.into_iter().collect(),
        }
    }

    /// True iff `self` requires everything `other` requires (and maybe more).
    pub fn is_superset_of(&self, other: &AffinityExpr) -> bool {
        self.required_labels.is_superset(&other.required_labels)
    }
}

/// Scheduling knobs that ride along with an instance: its priority bucket and
/// the timestamp used to order items FIFO within a bucket and to break
/// preemption ties (most-recently-scheduled victim first).
#[derive(Debug, Clone, Copy)]
#[derive(Default)]
pub struct SchedulingOptions {
    pub priority: u32,
    pub enqueued_at: u64,
}


/// One instance's demand: resources, labels, and the plugin-context map the
/// selector may read and write across calls for the same group.
#[derive(Debug, Clone)]
pub struct InstanceDescriptor {
    pub instance_id: String,
    pub group_id: Option<String>,
    pub resources: ResourceVector,
    pub labels: LabelMap,
    pub options: SchedulingOptions,
    pub plugin_ctx: HashMap<String, String>,
    pub affinity: Option<AffinityExpr>,
}

impl InstanceDescriptor {
    pub fn new(instance_id: impl Into<String>, resources: ResourceVector) -> Self {
        Self {
            instance_id: instance_id.into(),
            group_id: None,
            resources,
            labels: LabelMap::new(),
            options: SchedulingOptions::default(),
            plugin_ctx: HashMap::new(),
            affinity: None,
        }
    }
}

/// A single instance's scheduling demand, as submitted to the core.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub request_id: String,
    pub trace_id: String,
    pub instance: InstanceDescriptor,
    /// Set when a prior group decision already reserved a unit for this
    /// instance (see `DoSelectOne` step 2).
    pub reserved_unit: Option<String>,
}

impl ScheduleRequest {
    pub fn new(request_id: impl Into<String>, instance: InstanceDescriptor) -> Self {
        Self {
            request_id: request_id.into(),
            trace_id: String::new(),
            instance,
            reserved_unit: None,
        }
    }
}

/// Group scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPolicy {
    Normal,
    StrictPack,
    Range,
}

/// "Between `min` and `max` instances, in steps of `step`."
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOption {
    pub is_range: bool,
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

/// An ordered collection of requests sharing a group-id, plus the policy
/// that governs how the group performer schedules them.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub group_id: String,
    pub requests: Vec<ScheduleRequest>,
    pub policy: GroupPolicy,
    pub range: RangeOption,
    pub priority_flag: bool,
    pub timeout: Option<std::time::Duration>,
}

impl GroupSpec {
    /// The minimum number of members that must succeed for the group to
    /// report success: `range.min` under the Range policy, otherwise every
    /// member.
    pub fn min_required(&self) -> u32 {
        if self.range.is_range {
            self.range.min
        } else {
            self.requests.len() as u32
        }
    }
}
