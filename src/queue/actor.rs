//! The queue actor (F): a single-threaded cooperative event loop binding the
//! priority scheduler to the outside world. Represents the original's
//! `Init / Receive / Async / AsyncAfter / Terminate` mailbox sequence as one
//! worker task consuming a typed `tokio::mpsc` channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::SchedulerConfig;
use crate::context::PreAllocatedContext;
use crate::error::{Code, Status};
use crate::models::{GroupSpec, InstanceDescriptor, ScheduleRequest};
use crate::performer::{self, AllocateType, PerformerDeps};
use crate::preemption::{PreemptNotifier, PreemptionController};
use crate::resource_view::{InstanceInfo, ResourceViewInfo, SharedResourceView};
use crate::result::{GroupScheduleResult, ScheduleResult};
use crate::selector::Selector;

use super::item::{AggregatedItem, GroupItem, InstanceItem, QueueItem};
use super::priority::PriorityScheduler;

/// Messages the actor's mailbox accepts.
#[allow(clippy::large_enum_variant)]
pub enum ActorMessage {
    Schedule {
        request: ScheduleRequest,
        cancel: Option<oneshot::Receiver<()>>,
        respond_to: oneshot::Sender<ScheduleResult>,
    },
    GroupSchedule {
        group: GroupSpec,
        cancel: Option<oneshot::Receiver<()>>,
        respond_to: oneshot::Sender<GroupScheduleResult>,
    },
    Aggregated {
        requests: Vec<ScheduleRequest>,
        cancels: Vec<Option<oneshot::Receiver<()>>>,
        respond_to: oneshot::Sender<Vec<ScheduleResult>>,
    },
    Confirm {
        instance_id: String,
        accept: bool,
        respond_to: oneshot::Sender<Status>,
    },
    OnResourceUpdate,
}

/// A cheaply-cloneable handle callers use to talk to a running actor.
#[derive(Clone)]
pub struct QueueActorHandle {
    mailbox: mpsc::Sender<ActorMessage>,
}

impl QueueActorHandle {
    pub async fn schedule(&self, request: ScheduleRequest, cancel: Option<oneshot::Receiver<()>>) -> anyhow::Result<ScheduleResult> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(ActorMessage::Schedule {
                request,
                cancel,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("queue actor is no longer running"))?;
        rx.await.map_err(|_| anyhow::anyhow!("queue actor dropped the response"))
    }

    pub async fn group_schedule(
        &self,
        group: GroupSpec,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> anyhow::Result<GroupScheduleResult> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(ActorMessage::GroupSchedule {
                group,
                cancel,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("queue actor is no longer running"))?;
        rx.await.map_err(|_| anyhow::anyhow!("queue actor dropped the response"))
    }

    /// `cancels[i]` is the cancel future for `requests[i]`; cancelling one
    /// member rolls back only that member, siblings already placed or still
    /// pending are unaffected.
    pub async fn aggregated_schedule(
        &self,
        requests: Vec<ScheduleRequest>,
        cancels: Vec<Option<oneshot::Receiver<()>>>,
    ) -> anyhow::Result<Vec<ScheduleResult>> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(ActorMessage::Aggregated {
                requests,
                cancels,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("queue actor is no longer running"))?;
        rx.await.map_err(|_| anyhow::anyhow!("queue actor dropped the response"))
    }

    pub async fn confirm(&self, instance_id: impl Into<String>, accept: bool) -> anyhow::Result<Status> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(ActorMessage::Confirm {
                instance_id: instance_id.into(),
                accept,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("queue actor is no longer running"))?;
        rx.await.map_err(|_| anyhow::anyhow!("queue actor dropped the response"))
    }

    pub fn on_resource_update(&self) {
        let _ = self.mailbox.try_send(ActorMessage::OnResourceUpdate);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActorState {
    Waiting,
    Running,
    Pending,
}

/// A pre-allocation still waiting on its Confirm response (PRE_ALLOCATION
/// mode only).
struct PendingConfirmation {
    unit_id: String,
    instance: InstanceDescriptor,
}

enum DispatchOutcome {
    Done,
    Pending(QueueItem),
}

fn cancelled(cancel: &mut Option<oneshot::Receiver<()>>) -> bool {
    match cancel {
        Some(rx) => !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)),
        None => false,
    }
}

struct QueueActor {
    scheduler: PriorityScheduler,
    deps: PerformerDeps,
    config: SchedulerConfig,
    state: ActorState,
    snapshot: Option<ResourceViewInfo>,
    ctx: PreAllocatedContext,
    confirmations: HashMap<String, PendingConfirmation>,
}

impl QueueActor {
    async fn ensure_snapshot(&mut self) {
        if self.snapshot.is_some() {
            return;
        }
        self.refresh_snapshot().await;
    }

    async fn refresh_snapshot(&mut self) {
        let info = match &self.deps.resource_view {
            Some(view) => view.get_resource_info().await.unwrap_or_default(),
            None => ResourceViewInfo::default(),
        };
        log::debug!("queue actor refreshed its resource-view snapshot");
        self.snapshot = Some(info);
        self.ctx = PreAllocatedContext::new();
    }

    async fn handle(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Schedule {
                request,
                cancel,
                respond_to,
            } => {
                self.ensure_snapshot().await;
                self.scheduler.enqueue(QueueItem::Instance(Box::new(InstanceItem {
                    request,
                    respond_to,
                    cancel,
                })));
            }
            ActorMessage::GroupSchedule { group, cancel, respond_to } => {
                self.ensure_snapshot().await;
                self.scheduler
                    .enqueue(QueueItem::Group(GroupItem { group, respond_to, cancel }));
            }
            ActorMessage::Aggregated {
                requests,
                cancels,
                respond_to,
            } => {
                self.ensure_snapshot().await;
                self.scheduler.enqueue(QueueItem::Aggregated(AggregatedItem {
                    requests,
                    respond_to,
                    cancels,
                }));
            }
            ActorMessage::Confirm {
                instance_id,
                accept,
                respond_to,
            } => {
                self.handle_confirm(instance_id, accept, respond_to).await;
            }
            ActorMessage::OnResourceUpdate => {
                log::debug!("resource view updated, reactivating pending queue");
                self.refresh_snapshot().await;
                self.scheduler.activate_pending();
            }
        }
    }

    async fn handle_confirm(&mut self, instance_id: String, accept: bool, respond_to: oneshot::Sender<Status>) {
        let Some(pending) = self.confirmations.remove(&instance_id) else {
            let _ = respond_to.send(Status::new(Code::Failed, "no pending pre-allocation for this instance"));
            return;
        };
        if accept {
            if let Some(view) = &self.deps.resource_view {
                let info = InstanceInfo {
                    instance_id: instance_id.clone(),
                    unit_id: pending.unit_id.clone(),
                    resources: pending.instance.resources.clone(),
                    labels: pending.instance.labels.clone(),
                    priority: pending.instance.options.priority,
                    scheduled_at: pending.instance.options.enqueued_at,
                    scheduler_chain: vec![pending.unit_id.clone()],
                };
                let _ = view.add_instances([(instance_id, info)].into_iter().collect()).await;
            }
            let _ = respond_to.send(Status::ok());
        } else {
            log::debug!("confirm declined for {instance_id}, rolling back");
            performer::rollback(&self.deps, &mut self.ctx, &pending.unit_id, &pending.instance).await;
            let _ = respond_to.send(Status::ok());
        }
    }

    async fn rollback_group(&mut self, group: &GroupSpec, result: &GroupScheduleResult) {
        if group.policy == crate::models::GroupPolicy::StrictPack {
            if let Some(first_ok) = result.results.iter().find(|r| r.is_ok()) {
                performer::group::rollback_strict_pack(&self.deps, &mut self.ctx, group, &first_ok.unit_id).await;
            }
            return;
        }
        for (request, r) in group.requests.iter().zip(&result.results) {
            if r.is_ok() {
                performer::rollback(&self.deps, &mut self.ctx, &r.unit_id, &request.instance).await;
            }
        }
    }

    async fn consume_running(&mut self) {
        while let Some(item) = self.scheduler.pop_running() {
            self.ensure_snapshot().await;
            let outcome = match item {
                QueueItem::Instance(item) => self.dispatch_instance(item).await,
                QueueItem::Group(item) => self.dispatch_group(item).await,
                QueueItem::Aggregated(item) => self.dispatch_aggregated(item).await,
            };
            if let DispatchOutcome::Pending(item) = outcome {
                let priority = item.priority();
                self.scheduler.push_pending(priority, item);
            }
        }
    }

    async fn dispatch_instance(&mut self, mut item: Box<InstanceItem>) -> DispatchOutcome {
        if cancelled(&mut item.cancel) {
            let _ = item
                .respond_to
                .send(ScheduleResult::failure(Code::ScheduleCanceled, "cancelled before scheduling"));
            return DispatchOutcome::Done;
        }

        let snapshot = self.snapshot.clone().expect("snapshot fetched before consume");
        let result = performer::instance::schedule(&self.deps, &mut self.ctx, &snapshot, &item.request).await;

        if result.code.is_feasibility_failure() {
            if cancelled(&mut item.cancel) {
                let _ = item
                    .respond_to
                    .send(ScheduleResult::failure(Code::ScheduleCanceled, "cancelled while pending"));
                return DispatchOutcome::Done;
            }
            log::debug!("request {} moved to pending: {}", item.request.request_id, result.reason);
            return DispatchOutcome::Pending(QueueItem::Instance(item));
        }

        if cancelled(&mut item.cancel) {
            if result.is_ok() {
                performer::rollback(&self.deps, &mut self.ctx, &result.unit_id, &item.request.instance).await;
            }
            let _ = item
                .respond_to
                .send(ScheduleResult::failure(Code::ScheduleCanceled, "cancelled during scheduling"));
            return DispatchOutcome::Done;
        }

        if result.is_ok() && self.config.allocate_type == AllocateType::PreAllocation {
            self.confirmations.insert(
                item.request.instance.instance_id.clone(),
                PendingConfirmation {
                    unit_id: result.unit_id.clone(),
                    instance: item.request.instance.clone(),
                },
            );
        }

        let _ = item.respond_to.send(result);
        DispatchOutcome::Done
    }

    async fn dispatch_group(&mut self, mut item: GroupItem) -> DispatchOutcome {
        if cancelled(&mut item.cancel) {
            let _ = item.respond_to.send(GroupScheduleResult {
                code: Code::ScheduleCanceled,
                reason: "cancelled before scheduling".into(),
                results: Vec::new(),
            });
            return DispatchOutcome::Done;
        }

        let snapshot = self.snapshot.clone().expect("snapshot fetched before consume");
        let result = performer::group::schedule(&self.deps, &mut self.ctx, &snapshot, &item.group).await;

        if result.code.is_feasibility_failure() {
            self.rollback_group(&item.group, &result).await;
            if cancelled(&mut item.cancel) {
                let _ = item.respond_to.send(GroupScheduleResult {
                    code: Code::ScheduleCanceled,
                    reason: "cancelled while pending".into(),
                    results: Vec::new(),
                });
                return DispatchOutcome::Done;
            }
            log::debug!("group {} moved to pending: {}", item.group.group_id, result.reason);
            return DispatchOutcome::Pending(QueueItem::Group(item));
        }

        if cancelled(&mut item.cancel) {
            self.rollback_group(&item.group, &result).await;
            let _ = item.respond_to.send(GroupScheduleResult {
                code: Code::ScheduleCanceled,
                reason: "cancelled during scheduling".into(),
                results: Vec::new(),
            });
            return DispatchOutcome::Done;
        }

        if self.config.allocate_type == AllocateType::PreAllocation {
            for (request, r) in item.group.requests.iter().zip(&result.results) {
                if r.is_ok() {
                    self.confirmations.insert(
                        request.instance.instance_id.clone(),
                        PendingConfirmation {
                            unit_id: r.unit_id.clone(),
                            instance: request.instance.clone(),
                        },
                    );
                }
            }
        }

        let _ = item.respond_to.send(result);
        DispatchOutcome::Done
    }

    async fn dispatch_aggregated(&mut self, mut item: AggregatedItem) -> DispatchOutcome {
        if item.cancels.iter_mut().all(cancelled) {
            let _ = item.respond_to.send(
                item.requests
                    .iter()
                    .map(|_| ScheduleResult::failure(Code::ScheduleCanceled, "cancelled before scheduling"))
                    .collect(),
            );
            return DispatchOutcome::Done;
        }

        let snapshot = self.snapshot.clone().expect("snapshot fetched before consume");
        let mut results = performer::aggregate::schedule(&self.deps, &mut self.ctx, &snapshot, &item.requests).await;

        let all_infeasible = results.iter().all(|r| r.code.is_feasibility_failure());
        if all_infeasible {
            if item.cancels.iter_mut().all(cancelled) {
                let _ = item.respond_to.send(
                    results
                        .iter()
                        .map(|_| ScheduleResult::failure(Code::ScheduleCanceled, "cancelled while pending"))
                        .collect(),
                );
                return DispatchOutcome::Done;
            }
            return DispatchOutcome::Pending(QueueItem::Aggregated(item));
        }

        // Each member's own cancel future governs its own result: a member
        // cancelled mid-pass rolls back only that member, siblings keep
        // whatever the pass assigned them.
        for ((request, result), cancel) in item.requests.iter().zip(results.iter_mut()).zip(item.cancels.iter_mut()) {
            if cancelled(cancel) {
                if result.is_ok() {
                    performer::rollback(&self.deps, &mut self.ctx, &result.unit_id, &request.instance).await;
                }
                *result = ScheduleResult::failure(Code::ScheduleCanceled, "cancelled during scheduling");
            }
        }

        if self.config.allocate_type == AllocateType::PreAllocation {
            for (request, result) in item.requests.iter().zip(&results) {
                if result.is_ok() {
                    self.confirmations.insert(
                        request.instance.instance_id.clone(),
                        PendingConfirmation {
                            unit_id: result.unit_id.clone(),
                            instance: request.instance.clone(),
                        },
                    );
                }
            }
        }

        let _ = item.respond_to.send(results);
        DispatchOutcome::Done
    }

    /// Re-derives `state` from the queues' current emptiness, driving
    /// running consumption whenever there is work.
    async fn advance(&mut self) {
        if !self.scheduler.running_is_empty() {
            self.state = ActorState::Running;
            self.consume_running().await;
        }
        self.state = if !self.scheduler.running_is_empty() {
            ActorState::Running
        } else if !self.scheduler.pending_is_empty() {
            ActorState::Pending
        } else {
            ActorState::Waiting
        };
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<ActorMessage>) {
        loop {
            if self.state == ActorState::Waiting {
                tokio::select! {
                    msg = mailbox.recv() => {
                        match msg {
                            Some(msg) => self.handle(msg).await,
                            None => return,
                        }
                    }
                    _ = tokio::time::sleep(self.config.idle_timeout) => {
                        self.refresh_snapshot().await;
                        continue;
                    }
                }
            } else {
                match mailbox.recv().await {
                    Some(msg) => self.handle(msg).await,
                    None => return,
                }
            }
            self.advance().await;
        }
    }
}

/// Spawns the queue actor as a background task and returns a handle to it.
pub fn spawn(
    config: SchedulerConfig,
    selector: Arc<dyn Selector>,
    resource_view: Option<SharedResourceView>,
    preempt_notifier: Option<Arc<dyn PreemptNotifier>>,
) -> QueueActorHandle {
    let (tx, rx) = mpsc::channel(256);
    let deps = PerformerDeps {
        allocate_type: config.allocate_type,
        selector,
        resource_view,
        preempt_controller: PreemptionController::new(),
        preempt_notifier,
    };
    let actor = QueueActor {
        scheduler: PriorityScheduler::new(config.max_priority, config.queueing_policy),
        deps,
        config,
        state: ActorState::Waiting,
        snapshot: None,
        ctx: PreAllocatedContext::new(),
        confirmations: HashMap::new(),
    };
    tokio::spawn(actor.run(rx));
    QueueActorHandle { mailbox: tx }
}
