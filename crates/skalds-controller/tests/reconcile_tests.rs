//! Reconciliation: observations to lifecycle transitions, end to end
//! through the monitor where the scenario calls for it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use skalds_controller::events::{EventBus, MemoryEventBus};
use skalds_controller::monitor::task_monitor::TaskMonitorConfig;
use skalds_controller::monitor::TaskMonitor;
use skalds_controller::reconciler::{
    Decision, FailureReason, Reconciler, TaskObservation, cancel_task_external,
};
use skalds_controller::repository::{MemoryTaskRepository, TaskRepository};
use skalds_controller::state::{SkaldRecord, SkaldStore, TaskStore};
use skalds_core::cache::keys;
use skalds_core::{
    CacheBackend, Clock, EventTopic, ManualClock, MemoryCacheBackend, SkaldId, SkaldKind,
    SkaldStatus, Task, TaskId, TaskLifecycleStatus, TaskMode,
};

const ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(30);

fn observation(status: TaskLifecycleStatus) -> TaskObservation {
    TaskObservation {
        task_id: TaskId::new("t1").unwrap(),
        prev_status: status,
        executor: Some(SkaldId::new("s1").unwrap()),
        executor_online: true,
        heartbeat: None,
        history_saturated_equal: false,
        error: None,
        exception: None,
        assigning_for: None,
    }
}

async fn seed(repository: &MemoryTaskRepository, status: TaskLifecycleStatus) {
    let now = Utc::now();
    let mut task = Task::new(
        TaskId::new("t1").unwrap(),
        "W",
        "test",
        TaskMode::Passive,
        5,
        None,
        now,
        now + chrono::Duration::days(1),
    )
    .unwrap();
    task.lifecycle_status = status;
    task.executor = Some(SkaldId::new("s1").unwrap());
    repository.create_task(&task).await.unwrap();
}

async fn status_of(repository: &MemoryTaskRepository) -> TaskLifecycleStatus {
    repository
        .get_task(&TaskId::new("t1").unwrap())
        .await
        .unwrap()
        .unwrap()
        .lifecycle_status
}

#[tokio::test]
async fn heartbeat_200_finishes_running_task() {
    let repository = Arc::new(MemoryTaskRepository::new());
    seed(&repository, TaskLifecycleStatus::Running).await;
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    let mut obs = observation(TaskLifecycleStatus::Running);
    obs.heartbeat = Some(200);
    let decision = reconciler.apply(&obs).await.unwrap();
    assert_eq!(decision, Some(Decision::Finish));
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Finished);
}

#[tokio::test]
async fn heartbeat_200_from_assigning_steps_through_running() {
    let repository = Arc::new(MemoryTaskRepository::new());
    seed(&repository, TaskLifecycleStatus::Assigning).await;
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    let mut obs = observation(TaskLifecycleStatus::Assigning);
    obs.heartbeat = Some(200);
    reconciler.apply(&obs).await.unwrap();
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Finished);
}

#[tokio::test]
async fn exception_heartbeat_fails_task() {
    let repository = Arc::new(MemoryTaskRepository::new());
    seed(&repository, TaskLifecycleStatus::Running).await;
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    let mut obs = observation(TaskLifecycleStatus::Running);
    obs.heartbeat = Some(-1);
    obs.exception = Some("worker panicked".to_string());
    let decision = reconciler.apply(&obs).await.unwrap();
    assert_eq!(
        decision,
        Some(Decision::Fail(FailureReason::WorkerException))
    );
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Failed);
}

#[tokio::test]
async fn cancel_heartbeat_cancels_task() {
    let repository = Arc::new(MemoryTaskRepository::new());
    seed(&repository, TaskLifecycleStatus::Running).await;
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    let mut obs = observation(TaskLifecycleStatus::Running);
    obs.heartbeat = Some(-2);
    reconciler.apply(&obs).await.unwrap();
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Cancelled);
}

#[tokio::test]
async fn first_progress_heartbeat_promotes_assigning() {
    let repository = Arc::new(MemoryTaskRepository::new());
    seed(&repository, TaskLifecycleStatus::Assigning).await;
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    let mut obs = observation(TaskLifecycleStatus::Assigning);
    obs.heartbeat = Some(0);
    let decision = reconciler.apply(&obs).await.unwrap();
    assert_eq!(decision, Some(Decision::Promote));
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Running);
}

#[tokio::test]
async fn cas_loss_is_treated_as_success() {
    let repository = Arc::new(MemoryTaskRepository::new());
    seed(&repository, TaskLifecycleStatus::Cancelled).await;
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    // The observation is stale: it saw Running, but an external cancel
    // already landed. The apply must not error and must not overwrite.
    let mut obs = observation(TaskLifecycleStatus::Running);
    obs.heartbeat = Some(200);
    reconciler.apply(&obs).await.unwrap();
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Cancelled);
}

/// Full stuck-detection path: a constant heartbeat observed through the
/// task monitor saturates the window and the reconciler fails the task.
#[tokio::test]
async fn stuck_heartbeat_fails_after_window_saturates() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cache = Arc::new(MemoryCacheBackend::with_clock(clock.clone()));
    let repository = Arc::new(MemoryTaskRepository::new());
    let events = Arc::new(MemoryEventBus::new());
    let skald_store = Arc::new(SkaldStore::new(64));
    let task_store = Arc::new(TaskStore::new(64));

    seed(&repository, TaskLifecycleStatus::Running).await;
    let mut skald = SkaldRecord::new(SkaldId::new("s1").unwrap(), SkaldKind::Node, clock.now());
    skald.status = SkaldStatus::Online;
    skald_store.upsert(skald);

    cache
        .set_string(&keys::task_heartbeat(&TaskId::new("t1").unwrap()), "42", None)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let monitor = TaskMonitor::new(
        cache,
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        events as Arc<dyn EventBus>,
        skald_store,
        task_store,
        clock,
        TaskMonitorConfig {
            sync_interval: Duration::from_secs(3),
            stuck_window: 5,
            orphan_cancel_interval: Duration::ZERO,
        },
        tx,
    );
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    // Four identical samples: not yet saturated, still Running.
    for _ in 0..4 {
        monitor.run_cycle().await.unwrap();
        let obs = rx.recv().await.unwrap();
        reconciler.apply(&obs).await.unwrap();
    }
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Running);

    // The fifth saturates the window.
    monitor.run_cycle().await.unwrap();
    let obs = rx.recv().await.unwrap();
    assert!(obs.history_saturated_equal);
    let decision = reconciler.apply(&obs).await.unwrap();
    assert_eq!(decision, Some(Decision::Fail(FailureReason::Stuck)));
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Failed);
}

#[tokio::test]
async fn moving_heartbeat_in_window_stays_running() {
    let mut obs = observation(TaskLifecycleStatus::Running);
    obs.heartbeat = Some(50);
    obs.history_saturated_equal = false; // [50,50,51,50,50]
    assert_eq!(
        skalds_controller::reconciler::decide(&obs, ASSIGNMENT_TIMEOUT),
        Decision::Hold
    );
}

#[tokio::test]
async fn executor_offline_fails_running_task() {
    let repository = Arc::new(MemoryTaskRepository::new());
    seed(&repository, TaskLifecycleStatus::Running).await;
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    let mut obs = observation(TaskLifecycleStatus::Running);
    obs.executor_online = false;
    obs.heartbeat = Some(42);
    let decision = reconciler.apply(&obs).await.unwrap();
    assert_eq!(
        decision,
        Some(Decision::Fail(FailureReason::ExecutorOffline))
    );
    assert_eq!(status_of(&repository).await, TaskLifecycleStatus::Failed);
}

/// Assignment timeout: an Assigning task with no heartbeat is demoted to
/// Created with its executor cleared, and the next dispatch can rerun.
#[tokio::test]
async fn assignment_timeout_demotes_and_clears_executor() {
    let repository = Arc::new(MemoryTaskRepository::new());
    seed(&repository, TaskLifecycleStatus::Assigning).await;
    let reconciler = Reconciler::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        ASSIGNMENT_TIMEOUT,
    );

    let mut obs = observation(TaskLifecycleStatus::Assigning);
    obs.assigning_for = Some(Duration::from_secs(31));
    let decision = reconciler.apply(&obs).await.unwrap();
    assert_eq!(decision, Some(Decision::Demote));

    let task = repository
        .get_task(&TaskId::new("t1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.lifecycle_status, TaskLifecycleStatus::Created);
    assert!(task.executor.is_none());
}

#[tokio::test]
async fn external_cancel_emits_exactly_one_event() {
    let repository: Arc<dyn TaskRepository> = Arc::new(MemoryTaskRepository::new());
    let memory = Arc::new(MemoryEventBus::new());
    let events: Arc<dyn EventBus> = Arc::clone(&memory) as Arc<dyn EventBus>;

    let now = Utc::now();
    let mut task = Task::new(
        TaskId::new("t1").unwrap(),
        "W",
        "test",
        TaskMode::Passive,
        5,
        None,
        now,
        now + chrono::Duration::days(1),
    )
    .unwrap();
    task.lifecycle_status = TaskLifecycleStatus::Running;
    repository.create_task(&task).await.unwrap();

    let id = TaskId::new("t1").unwrap();
    let first = cancel_task_external(&repository, &events, &id).await.unwrap();
    assert!(first);
    let second = cancel_task_external(&repository, &events, &id).await.unwrap();
    assert!(!second);

    let cancels = memory.published_on(EventTopic::TaskCancel);
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].key.as_str(), "t1");

    let stored = repository.get_task(&id).await.unwrap().unwrap();
    assert_eq!(stored.lifecycle_status, TaskLifecycleStatus::Cancelled);
}
