//! Dispatcher behavior: eligibility, policies, and the assignment triple.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use skalds_controller::config::DispatchPolicyKind;
use skalds_controller::dispatcher::{Dispatcher, DispatcherConfig};
use skalds_controller::events::MemoryEventBus;
use skalds_controller::repository::{MemoryTaskRepository, TaskRepository};
use skalds_controller::state::{SkaldRecord, SkaldStore};
use skalds_core::{
    EventTopic, SkaldId, SkaldKind, SkaldStatus, Task, TaskId, TaskLifecycleStatus, TaskMode,
};

struct Harness {
    repository: Arc<MemoryTaskRepository>,
    events: Arc<MemoryEventBus>,
    skald_store: Arc<SkaldStore>,
    dispatcher: Dispatcher,
}

fn harness(policy: DispatchPolicyKind) -> Harness {
    let repository = Arc::new(MemoryTaskRepository::new());
    let events = Arc::new(MemoryEventBus::new());
    let skald_store = Arc::new(SkaldStore::new(64));
    let dispatcher = Dispatcher::new(
        Arc::clone(&repository) as Arc<dyn TaskRepository>,
        Arc::clone(&events) as Arc<dyn skalds_controller::events::EventBus>,
        Arc::clone(&skald_store),
        DispatcherConfig {
            interval: Duration::from_secs(5),
            policy,
            instance_id: "controller-test".to_string(),
        },
    );
    Harness {
        repository,
        events,
        skald_store,
        dispatcher,
    }
}

async fn seed_task(repository: &MemoryTaskRepository, id: &str, class: &str, priority: u8) {
    let now = Utc::now();
    let task = Task::new(
        TaskId::new(id).unwrap(),
        class,
        "test",
        TaskMode::Passive,
        priority,
        None,
        now,
        now + chrono::Duration::days(1),
    )
    .unwrap();
    repository.create_task(&task).await.unwrap();
}

fn seed_skald(store: &SkaldStore, id: &str, kind: SkaldKind, status: SkaldStatus, classes: &[&str], tasks: &[&str]) {
    let mut record = SkaldRecord::new(SkaldId::new(id).unwrap(), kind, Utc::now());
    record.status = status;
    for class in classes {
        record.supported_task_types.insert((*class).to_string());
    }
    for task in tasks {
        record.current_tasks.insert(TaskId::new(*task).unwrap());
    }
    store.upsert(record);
}

#[tokio::test]
async fn assignment_happy_path() {
    let h = harness(DispatchPolicyKind::LeastTasks);
    seed_task(&h.repository, "t1", "W", 5).await;
    seed_skald(&h.skald_store, "s1", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);

    let outcome = h.dispatcher.run_tick().await.unwrap();
    assert_eq!(outcome.assigned, 1);
    assert_eq!(outcome.unplaced, 0);

    let task = h
        .repository
        .get_task(&TaskId::new("t1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.lifecycle_status, TaskLifecycleStatus::Assigning);
    assert_eq!(task.executor.unwrap().as_str(), "s1");

    let published = h.events.published_on(EventTopic::TaskAssign);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key.as_str(), "t1");
    let payload = &published[0].payload;
    assert_eq!(payload.task_ids.len(), 1);
    assert_eq!(payload.task_ids[0].as_str(), "t1");
    assert_eq!(payload.recipient.as_ref().unwrap().as_str(), "s1");
    assert_eq!(payload.initiator.as_deref(), Some("controller-test"));
}

#[tokio::test]
async fn least_tasks_prefers_emptier_skald() {
    let h = harness(DispatchPolicyKind::LeastTasks);
    seed_task(&h.repository, "t1", "W", 5).await;
    seed_skald(&h.skald_store, "s1", SkaldKind::Node, SkaldStatus::Online, &["W"], &["a"]);
    seed_skald(&h.skald_store, "s2", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);

    h.dispatcher.run_tick().await.unwrap();

    let task = h
        .repository
        .get_task(&TaskId::new("t1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.executor.unwrap().as_str(), "s2");
}

#[tokio::test]
async fn least_tasks_spreads_burst_within_tick() {
    let h = harness(DispatchPolicyKind::LeastTasks);
    seed_task(&h.repository, "t1", "W", 5).await;
    seed_task(&h.repository, "t2", "W", 5).await;
    seed_skald(&h.skald_store, "s1", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);
    seed_skald(&h.skald_store, "s2", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);

    let outcome = h.dispatcher.run_tick().await.unwrap();
    assert_eq!(outcome.assigned, 2);

    let mut executors: Vec<String> = Vec::new();
    for id in ["t1", "t2"] {
        let task = h
            .repository
            .get_task(&TaskId::new(id).unwrap())
            .await
            .unwrap()
            .unwrap();
        executors.push(task.executor.unwrap().to_string());
    }
    executors.sort();
    assert_eq!(executors, vec!["s1", "s2"]);
}

#[tokio::test]
async fn ineligible_skalds_never_chosen() {
    let h = harness(DispatchPolicyKind::LeastTasks);
    seed_task(&h.repository, "t1", "W", 5).await;
    // Wrong kind, wrong status, wrong class: all ineligible.
    seed_skald(&h.skald_store, "edge", SkaldKind::Edge, SkaldStatus::Online, &["W"], &[]);
    seed_skald(&h.skald_store, "down", SkaldKind::Node, SkaldStatus::Offline, &["W"], &[]);
    seed_skald(&h.skald_store, "other", SkaldKind::Node, SkaldStatus::Online, &["X"], &[]);

    let outcome = h.dispatcher.run_tick().await.unwrap();
    assert_eq!(outcome.assigned, 0);
    assert_eq!(outcome.unplaced, 1);

    let task = h
        .repository
        .get_task(&TaskId::new("t1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.lifecycle_status, TaskLifecycleStatus::Created);
    assert!(task.executor.is_none());
    assert!(h.events.published().is_empty());
}

#[tokio::test]
async fn priority_orders_assignment_events() {
    let h = harness(DispatchPolicyKind::LeastTasks);
    seed_task(&h.repository, "low", "W", 1).await;
    seed_task(&h.repository, "high", "W", 9).await;
    seed_skald(&h.skald_store, "s1", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);

    h.dispatcher.run_tick().await.unwrap();

    let keys: Vec<String> = h
        .events
        .published_on(EventTopic::TaskAssign)
        .into_iter()
        .map(|event| event.key.to_string())
        .collect();
    assert_eq!(keys, vec!["high", "low"]);
}

#[tokio::test]
async fn round_robin_cursor_persists_across_ticks() {
    let h = harness(DispatchPolicyKind::RoundRobin);
    seed_skald(&h.skald_store, "s1", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);
    seed_skald(&h.skald_store, "s2", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);

    seed_task(&h.repository, "t1", "W", 5).await;
    seed_task(&h.repository, "t2", "W", 5).await;
    seed_task(&h.repository, "t3", "W", 5).await;
    h.dispatcher.run_tick().await.unwrap();

    let executor_of = |id: &str| {
        let repository = Arc::clone(&h.repository);
        let id = TaskId::new(id).unwrap();
        async move {
            repository
                .get_task(&id)
                .await
                .unwrap()
                .unwrap()
                .executor
                .unwrap()
                .to_string()
        }
    };
    assert_eq!(executor_of("t1").await, "s1");
    assert_eq!(executor_of("t2").await, "s2");
    assert_eq!(executor_of("t3").await, "s1");

    // The cursor carries into the next tick rather than restarting.
    seed_task(&h.repository, "t4", "W", 5).await;
    h.dispatcher.run_tick().await.unwrap();
    assert_eq!(executor_of("t4").await, "s2");
}

#[tokio::test]
async fn random_policy_respects_eligibility() {
    let h = harness(DispatchPolicyKind::Random);
    seed_skald(&h.skald_store, "s1", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);
    seed_skald(&h.skald_store, "nope", SkaldKind::Node, SkaldStatus::Online, &["X"], &[]);

    for i in 0..6 {
        seed_task(&h.repository, &format!("t{i}"), "W", 5).await;
    }
    let outcome = h.dispatcher.run_tick().await.unwrap();
    assert_eq!(outcome.assigned, 6);

    for i in 0..6 {
        let task = h
            .repository
            .get_task(&TaskId::new(format!("t{i}")).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.executor.unwrap().as_str(), "s1");
    }
}

#[tokio::test]
async fn one_event_per_task_per_tick() {
    let h = harness(DispatchPolicyKind::LeastTasks);
    seed_task(&h.repository, "t1", "W", 5).await;
    seed_skald(&h.skald_store, "s1", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);

    h.dispatcher.run_tick().await.unwrap();
    // The task is now Assigning, so the next tick finds nothing.
    let outcome = h.dispatcher.run_tick().await.unwrap();
    assert_eq!(outcome.assigned, 0);
    assert_eq!(h.events.published_on(EventTopic::TaskAssign).len(), 1);
}

#[tokio::test]
async fn paused_tasks_are_dispatchable() {
    let h = harness(DispatchPolicyKind::LeastTasks);
    seed_task(&h.repository, "t1", "W", 5).await;
    h.repository
        .update_lifecycle_status(
            &TaskId::new("t1").unwrap(),
            TaskLifecycleStatus::Paused,
            &[TaskLifecycleStatus::Created],
        )
        .await
        .unwrap();
    seed_skald(&h.skald_store, "s1", SkaldKind::Node, SkaldStatus::Online, &["W"], &[]);

    let outcome = h.dispatcher.run_tick().await.unwrap();
    assert_eq!(outcome.assigned, 1);

    let task = h
        .repository
        .get_task(&TaskId::new("t1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.lifecycle_status, TaskLifecycleStatus::Assigning);
}
