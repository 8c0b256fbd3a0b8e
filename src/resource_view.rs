//! The resource-view store contract and an in-process, in-memory
//! implementation of it for embedding and tests — the counterpart of the
//! teacher's `Cache` in `libscheduler::cache`. A production deployment is
//! expected to supply its own `ResourceView` backed by a networked store;
//! the scheduling core only ever talks to the trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};

use crate::error::Status;
use crate::models::{LabelMap, ResourceVector, add_assign, sub_assign};

/// An instance currently allocated on some resource unit.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub unit_id: String,
    pub resources: ResourceVector,
    pub labels: LabelMap,
    pub priority: u32,
    pub scheduled_at: u64,
    pub scheduler_chain: Vec<String>,
}

/// A schedulable target: a node, or a logical bundle/fragment whose physical
/// owner differs (`owner_id`). A unit may expose nested fragments with their
/// own owner-id — selecting a fragment reports the owner as the placement.
#[derive(Debug, Clone, Default)]
pub struct ResourceUnit {
    pub unit_id: String,
    pub owner_id: String,
    pub allocatable: ResourceVector,
    pub capacity: ResourceVector,
    pub actual_use: ResourceVector,
    pub labels: LabelMap,
    pub fragments: HashMap<String, ResourceUnit>,
    pub instances: HashMap<String, InstanceInfo>,
}

impl ResourceUnit {
    pub fn new(unit_id: impl Into<String>, allocatable: ResourceVector) -> Self {
        let unit_id = unit_id.into();
        Self {
            owner_id: unit_id.clone(),
            capacity: allocatable.clone(),
            unit_id,
            allocatable,
            actual_use: ResourceVector::new(),
            labels: LabelMap::new(),
            fragments: HashMap::new(),
            instances: HashMap::new(),
        }
    }

    /// The owner-id of `unit_id` as seen through this unit's fragment map;
    /// a unit with no such fragment owns itself.
    pub fn owner_of(&self, unit_id: &str) -> Option<&str> {
        if unit_id == self.unit_id {
            return Some(self.owner_id.as_str());
        }
        self.fragments.get(unit_id).map(|f| f.owner_id.as_str())
    }
}

/// Immutable snapshot of the cluster view taken for one scheduling pass. The
/// core never mutates a snapshot; the group performer's preemption
/// simulation clones one and applies deletion-deltas to the clone.
#[derive(Debug, Clone, Default)]
pub struct ResourceViewInfo {
    pub units: HashMap<String, ResourceUnit>,
    pub already_scheduled: HashMap<String, String>,
    pub label_index: HashMap<String, HashMap<String, u32>>,
}

impl ResourceViewInfo {
    /// Resolves a logical unit/fragment-id to its physical owner-id, by
    /// consulting every top-level unit's fragment map.
    pub fn owner_of(&self, unit_id: &str) -> Option<&str> {
        self.units.get(unit_id).map(|u| u.owner_id.as_str()).or_else(|| {
            self.units
                .values()
                .find_map(|u| u.fragments.get(unit_id))
                .map(|f| f.owner_id.as_str())
        })
    }

    /// True iff `unit_id` (as a fragment or a top-level unit) still exists in
    /// this snapshot — used to validate a group-reserved unit hint.
    pub fn contains_fragment(&self, unit_id: &str) -> bool {
        self.units.contains_key(unit_id)
            || self.units.values().any(|u| u.fragments.contains_key(unit_id))
    }

    /// Removes `instance` from the cached snapshot and gives its resources
    /// and labels back to the owning unit's allocatable vector — the
    /// deletion-delta the group performer applies after a simulated
    /// preemption decision, so subsequent members in the same pass see the
    /// freed capacity without a real resource-view round trip.
    pub fn apply_preemption_delta(&mut self, unit_id: &str, instance: &InstanceInfo) {
        if let Some(unit) = self.units.get_mut(unit_id) {
            add_assign(&mut unit.allocatable, &instance.resources);
            for k in instance.labels.keys() {
                unit.labels.remove(k);
            }
            unit.instances.remove(&instance.instance_id);
            if let Some(fragment) = unit.fragments.get_mut(&instance.unit_id) {
                add_assign(&mut fragment.allocatable, &instance.resources);
                fragment.instances.remove(&instance.instance_id);
            }
        }
    }
}

/// The resource-view store contract consumed by the core. A production
/// implementation is backed by whatever authoritative store the deployment
/// uses; `AddInstances`/`DeleteInstances` are asynchronous because they may
/// involve network I/O.
#[async_trait]
pub trait ResourceView: Send + Sync {
    async fn get_resource_info(&self) -> anyhow::Result<ResourceViewInfo>;

    /// Reserves `instances` into the store. Each reservation is paired with
    /// a promise the caller may await via `Status` to learn whether the
    /// write was confirmed or rolled back.
    async fn add_instances(
        &self,
        instances: HashMap<String, InstanceInfo>,
    ) -> anyhow::Result<HashMap<String, oneshot::Receiver<Status>>>;

    /// Removes instances from the store. `virtual_delete` marks a rollback of
    /// a not-yet-confirmed pre-allocation rather than an eviction of a truly
    /// running instance.
    async fn delete_instances(&self, ids: &[String], virtual_delete: bool) -> anyhow::Result<()>;

    async fn get_fragment(&self, unit_id: &str) -> anyhow::Result<Option<ResourceUnit>>;

    async fn update_unit_status(&self, unit: ResourceUnit) -> anyhow::Result<()>;
}

struct Pending {
    sender: oneshot::Sender<Status>,
}

/// In-memory `ResourceView`:
/// a plain `HashMap`-backed store guarded by a single async mutex, good
/// enough to embed the core in a single process or to drive it in tests.
#[derive(Default)]
pub struct InMemoryResourceView {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    units: HashMap<String, ResourceUnit>,
    already_scheduled: HashMap<String, String>,
    pending: HashMap<String, Pending>,
}

impl InMemoryResourceView {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_unit(&self, unit: ResourceUnit) {
        let mut inner = self.inner.lock().await;
        inner.units.insert(unit.unit_id.clone(), unit);
    }

    pub async fn remove_unit(&self, unit_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.units.remove(unit_id);
    }

    /// Promotes a pending pre-allocation into a confirmed reservation,
    /// resolving its allocation-promise with `SUCCESS`.
    pub async fn confirm(&self, instance_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(pending) = inner.pending.remove(instance_id) {
            let _ = pending.sender.send(Status::ok());
        }
    }
}

#[async_trait]
impl ResourceView for InMemoryResourceView {
    async fn get_resource_info(&self) -> anyhow::Result<ResourceViewInfo> {
        let inner = self.inner.lock().await;
        Ok(ResourceViewInfo {
            units: inner.units.clone(),
            already_scheduled: inner.already_scheduled.clone(),
            label_index: HashMap::new(),
        })
    }

    async fn add_instances(
        &self,
        instances: HashMap<String, InstanceInfo>,
    ) -> anyhow::Result<HashMap<String, oneshot::Receiver<Status>>> {
        let mut inner = self.inner.lock().await;
        let mut promises = HashMap::with_capacity(instances.len());
        for (instance_id, info) in instances {
            if let Some(unit) = inner.units.get_mut(&info.unit_id) {
                sub_assign(&mut unit.allocatable, &info.resources);
                for (k, v) in &info.labels {
                    unit.labels.insert(k.clone(), v.clone());
                }
                unit.instances.insert(instance_id.clone(), info.clone());
            }
            inner
                .already_scheduled
                .insert(instance_id.clone(), info.unit_id.clone());
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(instance_id.clone(), Pending { sender: tx });
            promises.insert(instance_id, rx);
        }
        Ok(promises)
    }

    async fn delete_instances(&self, ids: &[String], virtual_delete: bool) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            if let Some(pending) = inner.pending.remove(id) {
                let _ = pending
                    .sender
                    .send(Status::new(crate::error::Code::ScheduleCanceled, "rolled back"));
            }
            let unit_id = inner.already_scheduled.remove(id);
            if let Some(unit_id) = unit_id
                && let Some(unit) = inner.units.get_mut(&unit_id)
                && let Some(info) = unit.instances.remove(id)
            {
                add_assign(&mut unit.allocatable, &info.resources);
                for k in info.labels.keys() {
                    unit.labels.remove(k);
                }
            }
            let _ = virtual_delete;
        }
        Ok(())
    }

    async fn get_fragment(&self, unit_id: &str) -> anyhow::Result<Option<ResourceUnit>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .units
            .get(unit_id)
            .cloned()
            .or_else(|| inner.units.values().find_map(|u| u.fragments.get(unit_id).cloned())))
    }

    async fn update_unit_status(&self, unit: ResourceUnit) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.units.insert(unit.unit_id.clone(), unit);
        Ok(())
    }
}

/// A shared handle to a `ResourceView`, the shape the queue actor and
/// performers hold it in — the only globally shared mutable state.
pub type SharedResourceView = Arc<dyn ResourceView>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_get_reflects_allocation() {
        crate::test_support::init_logging();
        let view = InMemoryResourceView::new();
        view.upsert_unit(ResourceUnit::new(
            "agent001",
            [("cpu".to_string(), 100), ("memory".to_string(), 100)]
                .into_iter()
                .collect(),
        ))
        .await;

        let instance = InstanceInfo {
            instance_id: "i1".into(),
            unit_id: "agent001".into(),
            resources: [("cpu".to_string(), 10), ("memory".to_string(), 10)]
                .into_iter()
                .collect(),
            labels: LabelMap::new(),
            priority: 0,
            scheduled_at: 0,
            scheduler_chain: vec!["agent001".into()],
        };
        view.add_instances([("i1".to_string(), instance)].into_iter().collect())
            .await
            .unwrap();

        let info = view.get_resource_info().await.unwrap();
        let unit = info.units.get("agent001").unwrap();
        assert_eq!(unit.allocatable["cpu"], 90);
        assert_eq!(info.already_scheduled["i1"], "agent001");
    }
}
