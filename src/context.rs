//! The pre-allocation context (B): a mutable scratchpad that lives for
//! exactly one scheduling pass, accumulating reservations that are either
//! promoted to the resource view on confirm or rolled back.

use std::collections::{HashMap, HashSet};

use crate::models::{LabelMap, ResourceVector, add_assign, sub_assign};

/// Per-pass accumulation of reservations, shared by every performer call
/// made while scheduling one request or one group.
#[derive(Debug, Default)]
pub struct PreAllocatedContext {
    /// unit-id -> accumulated reserved resource vector.
    pub allocated: HashMap<String, ResourceVector>,
    /// unit-id -> accumulated label deltas.
    pub allocated_labels: HashMap<String, LabelMap>,
    /// instance-id -> selected unit-id, so later members of the same group
    /// can see what an earlier member picked.
    pub selected_unit_by_instance: HashMap<String, String>,
    /// Set of unit-ids already selected in this pass, so two different
    /// instances don't double-select the same logical unit by accident.
    pub selected_units: HashSet<String>,
    /// Plugin-context map threaded through the selector across calls for
    /// the same group.
    pub plugin_ctx: HashMap<String, String>,
}

impl PreAllocatedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates `resources`/`labels` into `unit_id`'s running totals and
    /// records the selection, so later iterations in this pass avoid
    /// double-selecting the unit for a different instance.
    pub fn record(
        &mut self,
        unit_id: &str,
        instance_id: &str,
        resources: &ResourceVector,
        labels: &LabelMap,
    ) {
        add_assign(self.allocated.entry(unit_id.to_string()).or_default(), resources);
        for (k, v) in labels {
            self.allocated_labels
                .entry(unit_id.to_string())
                .or_default()
                .insert(k.clone(), v.clone());
        }
        self.selected_unit_by_instance
            .insert(instance_id.to_string(), unit_id.to_string());
        self.selected_units.insert(unit_id.to_string());
    }

    /// Undoes a previously-recorded reservation for `instance_id` on
    /// `unit_id`. Post-rollback, `allocated[unit_id]` equals its
    /// pre-allocation value.
    pub fn rollback(
        &mut self,
        unit_id: &str,
        instance_id: &str,
        resources: &ResourceVector,
        labels: &LabelMap,
    ) {
        if let Some(acc) = self.allocated.get_mut(unit_id) {
            sub_assign(acc, resources);
        }
        if let Some(acc) = self.allocated_labels.get_mut(unit_id) {
            for k in labels.keys() {
                acc.remove(k);
            }
        }
        self.selected_units.remove(unit_id);
        self.selected_unit_by_instance.remove(instance_id);
    }
}
