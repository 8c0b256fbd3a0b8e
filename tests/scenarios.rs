use std::sync::{Arc, Once};
use std::time::Duration;

use schedule_decision_core::{
    AllocateType, Code, GroupPolicy, GroupSpec, InMemoryResourceView, InstanceDescriptor, RangeOption, ResourceView,
    ScheduleRequest, SchedulerConfig, selector::BasicSelector, spawn,
};
use tokio::sync::oneshot;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .is_test(true)
            .try_init()
            .ok();
    });
}

fn instance(id: &str, cpu: i64, memory: i64) -> InstanceDescriptor {
    InstanceDescriptor::new(id, [("cpu".to_string(), cpu), ("memory".to_string(), memory)].into_iter().collect())
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        idle_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

#[tokio::test]
async fn scenario_1_single_instance_sufficient_resources() {
    init_logging();
    let view = Arc::new(InMemoryResourceView::new());
    view.upsert_unit(schedule_decision_core::resource_view::ResourceUnit::new(
        "agent001",
        [("cpu".to_string(), 100), ("memory".to_string(), 100)].into_iter().collect(),
    ))
    .await;

    let handle = spawn(config(), Arc::new(BasicSelector), Some(view), None);
    let request = ScheduleRequest::new("req1", instance("i1", 10, 10));
    let result = handle.schedule(request, None).await.unwrap();

    assert!(result.is_ok());
    assert_eq!(result.id, "agent001");
}

#[tokio::test]
async fn scenario_3_group_strict_pack_places_every_member_on_one_unit() {
    init_logging();
    let view = Arc::new(InMemoryResourceView::new());
    view.upsert_unit(schedule_decision_core::resource_view::ResourceUnit::new(
        "unit1",
        [("cpu".to_string(), 100), ("memory".to_string(), 100)].into_iter().collect(),
    ))
    .await;
    view.upsert_unit(schedule_decision_core::resource_view::ResourceUnit::new(
        "unit2",
        [("cpu".to_string(), 100), ("memory".to_string(), 100)].into_iter().collect(),
    ))
    .await;

    let handle = spawn(config(), Arc::new(BasicSelector), Some(view), None);
    let group = GroupSpec {
        group_id: "g1".into(),
        requests: vec![
            ScheduleRequest::new("m0", instance("m0", 10, 10)),
            ScheduleRequest::new("m1", instance("m1", 10, 10)),
        ],
        policy: GroupPolicy::StrictPack,
        range: RangeOption::default(),
        priority_flag: false,
        timeout: None,
    };
    let result = handle.group_schedule(group, None).await.unwrap();

    assert!(result.code.is_success());
    assert_eq!(result.results.len(), 2);
    let units: Vec<_> = result.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(units[0], units[1]);
}

#[tokio::test]
async fn scenario_4_range_group_keeps_all_when_step_aligned() {
    init_logging();
    let view = Arc::new(InMemoryResourceView::new());
    view.upsert_unit(schedule_decision_core::resource_view::ResourceUnit::new(
        "unit1",
        [("cpu".to_string(), 600)].into_iter().collect(),
    ))
    .await;

    let handle = spawn(config(), Arc::new(BasicSelector), Some(view), None);
    let requests = (0..6)
        .map(|i| ScheduleRequest::new(format!("m{i}"), InstanceDescriptor::new(format!("m{i}"), [("cpu".to_string(), 10)].into_iter().collect())))
        .collect();
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
    let result = handle.group_schedule(group, None).await.unwrap();

    assert!(result.code.is_success());
    assert_eq!(result.results.iter().filter(|r| r.is_ok()).count(), 6);
}

#[tokio::test]
async fn scenario_5_range_group_truncates_unaligned_count() {
    init_logging();
    let view = Arc::new(InMemoryResourceView::new());
    view.upsert_unit(schedule_decision_core::resource_view::ResourceUnit::new(
        "unit1",
        [("cpu".to_string(), 600)].into_iter().collect(),
    ))
    .await;

    let handle = spawn(config(), Arc::new(BasicSelector), Some(view), None);
    let requests = (0..6)
        .map(|i| ScheduleRequest::new(format!("m{i}"), InstanceDescriptor::new(format!("m{i}"), [("cpu".to_string(), 10)].into_iter().collect())))
        .collect();
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
    let result = handle.group_schedule(group, None).await.unwrap();

    assert!(result.code.is_success());
    assert_eq!(result.results.iter().filter(|r| r.is_ok()).count(), 5);
}

#[tokio::test]
async fn scenario_6_cancellation_during_pending_resolves_with_no_reservation() {
    init_logging();
    let view = Arc::new(InMemoryResourceView::new());
    view.upsert_unit(schedule_decision_core::resource_view::ResourceUnit::new(
        "agent001",
        [("cpu".to_string(), 5)].into_iter().collect(),
    ))
    .await;

    let handle = spawn(config(), Arc::new(BasicSelector), Some(view.clone()), None);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let request = ScheduleRequest::new("req1", instance("i1", 10, 0));

    let handle_for_task = handle.clone();
    let task = tokio::spawn(async move { handle_for_task.schedule(request, Some(cancel_rx)).await.unwrap() });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel_tx.send(()).unwrap();
    handle.on_resource_update();

    let result = task.await.unwrap();
    assert_eq!(result.code, Code::ScheduleCanceled);

    let info = view.get_resource_info().await.unwrap();
    assert!(info.already_scheduled.is_empty());
}

#[tokio::test]
async fn pre_allocation_mode_confirm_protocol_commits_into_the_resource_view() {
    init_logging();
    let view = Arc::new(InMemoryResourceView::new());
    view.upsert_unit(schedule_decision_core::resource_view::ResourceUnit::new(
        "agent001",
        [("cpu".to_string(), 100)].into_iter().collect(),
    ))
    .await;

    let cfg = SchedulerConfig {
        allocate_type: AllocateType::PreAllocation,
        idle_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let handle = spawn(cfg, Arc::new(BasicSelector), Some(view.clone()), None);
    let request = ScheduleRequest::new("req1", InstanceDescriptor::new("i1", [("cpu".to_string(), 10)].into_iter().collect()));
    let result = handle.schedule(request, None).await.unwrap();
    assert!(result.is_ok());

    let status = handle.confirm("i1", true).await.unwrap();
    assert!(status.is_ok());

    let info = view.get_resource_info().await.unwrap();
    assert_eq!(info.already_scheduled.get("i1"), Some(&"agent001".to_string()));
}

struct RecordingNotifier {
    seen: std::sync::Mutex<Vec<usize>>,
}

#[async_trait::async_trait]
impl schedule_decision_core::PreemptNotifier for RecordingNotifier {
    async fn notify(&self, decision: &schedule_decision_core::PreemptResult, _candidate: &InstanceDescriptor) {
        self.seen.lock().unwrap().push(decision.preempted_instances.len());
    }
}

#[tokio::test]
async fn scenario_2_preemption_notifies_but_leaves_the_failure_for_the_caller_to_retry() {
    init_logging();
    use schedule_decision_core::resource_view::{InstanceInfo, ResourceUnit};

    let mut unit = ResourceUnit::new("unit1", [("cpu".to_string(), 0)].into_iter().collect());
    for id in ["low1", "low2"] {
        unit.instances.insert(
            id.to_string(),
            InstanceInfo {
                instance_id: id.to_string(),
                unit_id: "unit1".into(),
                resources: [("cpu".to_string(), 50)].into_iter().collect(),
                labels: Default::default(),
                priority: 1,
                scheduled_at: 0,
                scheduler_chain: vec!["unit1".into()],
            },
        );
    }
    let view = Arc::new(InMemoryResourceView::new());
    view.upsert_unit(unit).await;

    let notifier = Arc::new(RecordingNotifier {
        seen: std::sync::Mutex::new(Vec::new()),
    });
    let handle = spawn(config(), Arc::new(BasicSelector), Some(view), Some(notifier.clone()));

    let mut high_priority = InstanceDescriptor::new("hi", [("cpu".to_string(), 60)].into_iter().collect());
    high_priority.options.priority = 10;
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let handle_for_task = handle.clone();
    let request = ScheduleRequest::new("req1", high_priority);
    // The eviction the preempt callback requests is asynchronous: the
    // failed attempt is parked in pending exactly as an un-notified
    // feasibility failure would be, so the test resolves it by cancelling
    // rather than waiting on a resource update that never comes.
    let task = tokio::spawn(async move { handle_for_task.schedule(request, Some(cancel_rx)).await.unwrap() });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel_tx.send(()).unwrap();
    handle.on_resource_update();
    let result = task.await.unwrap();

    assert_eq!(result.code, Code::ScheduleCanceled);
    assert_eq!(notifier.seen.lock().unwrap().as_slice(), &[2]);
}
