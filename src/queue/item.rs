//! QueueItem: the sum type the priority scheduler and the queue actor move
//! between running and pending, in place of the original's open
//! class hierarchy of queued request kinds.

use tokio::sync::oneshot;

use crate::models::{AffinityExpr, GroupSpec, ScheduleRequest};
use crate::result::{GroupScheduleResult, ScheduleResult};

/// One instance request awaiting scheduling.
pub struct InstanceItem {
    pub request: ScheduleRequest,
    pub respond_to: oneshot::Sender<ScheduleResult>,
    pub cancel: Option<oneshot::Receiver<()>>,
}

/// A request-group awaiting scheduling as a unit.
pub struct GroupItem {
    pub group: GroupSpec,
    pub respond_to: oneshot::Sender<GroupScheduleResult>,
    pub cancel: Option<oneshot::Receiver<()>>,
}

/// A batch of same-spec instances scheduled together against one selector
/// call. Each member carries its own cancel future — cancelling one member
/// mid-pass rolls back only that member, siblings are unaffected.
pub struct AggregatedItem {
    pub requests: Vec<ScheduleRequest>,
    pub respond_to: oneshot::Sender<Vec<ScheduleResult>>,
    pub cancels: Vec<Option<oneshot::Receiver<()>>>,
}

pub enum QueueItem {
    Instance(Box<InstanceItem>),
    Group(GroupItem),
    Aggregated(AggregatedItem),
}

impl QueueItem {
    /// The bucket this item is consumed from: the first (or only) member's
    /// priority, since group/aggregated members share one bucket.
    pub fn priority(&self) -> u32 {
        match self {
            QueueItem::Instance(item) => item.request.instance.options.priority,
            QueueItem::Group(item) => item
                .group
                .requests
                .first()
                .map(|r| r.instance.options.priority)
                .unwrap_or(0),
            QueueItem::Aggregated(item) => item
                .requests
                .first()
                .map(|r| r.instance.options.priority)
                .unwrap_or(0),
        }
    }

    /// The affinity expression that governs the fairness admission check,
    /// if any.
    pub fn affinity(&self) -> Option<&AffinityExpr> {
        match self {
            QueueItem::Instance(item) => item.request.instance.affinity.as_ref(),
            QueueItem::Group(item) => item.group.requests.first().and_then(|r| r.instance.affinity.as_ref()),
            QueueItem::Aggregated(item) => item.requests.first().and_then(|r| r.instance.affinity.as_ref()),
        }
    }

    /// True iff this item's cancel channel has already fired (or its sender
    /// was dropped). Checked at each cooperative suspension point. For an
    /// aggregated batch this is true only once every member has been
    /// cancelled — a partially-cancelled batch is still live.
    pub fn is_cancelled(&mut self) -> bool {
        fn fired(rx: &mut Option<oneshot::Receiver<()>>) -> bool {
            match rx {
                Some(rx) => !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)),
                None => false,
            }
        }
        match self {
            QueueItem::Instance(item) => fired(&mut item.cancel),
            QueueItem::Group(item) => fired(&mut item.cancel),
            QueueItem::Aggregated(item) => item.cancels.iter_mut().all(fired),
        }
    }
}
