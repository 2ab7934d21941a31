//! Scheduler events flowing into the aggregator and out to disk.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use prism_core::{PrismResult, SchedulerConfig, StatusConfig};
use prism_scheduler::{Agent, AgentContext, BatchOptions, Scheduler, Task};
use prism_status::*;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Quick(&'static str);

#[async_trait]
impl Agent for Quick {
    fn id(&self) -> &str {
        self.0
    }

    async fn execute(&self, ctx: AgentContext) -> PrismResult<serde_json::Value> {
        ctx.progress.report(50.0, Some("scanning"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(serde_json::json!({ "agent": self.0 }))
    }
}

/// Ignores cancellation by blocking its thread, then reports progress.
struct Stubborn {
    woke: Arc<AtomicBool>,
}

#[async_trait]
impl Agent for Stubborn {
    fn id(&self) -> &str {
        "stubborn"
    }

    async fn execute(&self, ctx: AgentContext) -> PrismResult<serde_json::Value> {
        std::thread::sleep(Duration::from_millis(300));
        ctx.progress.report(42.0, Some("late"));
        self.woke.store(true, Ordering::SeqCst);
        Ok(serde_json::Value::Null)
    }
}

fn status_config(dir: &Path, persist_interval_ms: u64) -> StatusConfig {
    StatusConfig {
        data_dir: dir.to_path_buf(),
        persist_interval_ms,
        ..Default::default()
    }
}

/// Poll the store until `accept` holds for the persisted snapshot.
async fn wait_for_snapshot(
    store: &FileSnapshotStore,
    accept: impl Fn(&StatusSnapshot) -> bool,
) -> StatusSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Some(snapshot)) = store.load().await {
                if accept(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot never persisted")
}

#[tokio::test]
async fn test_completed_batch_is_persisted_and_restorable() {
    let tmp = tempfile::tempdir().unwrap();
    let config = status_config(tmp.path(), 60_000);
    let path = config.snapshot_path();
    let aggregator = Arc::new(StatusAggregator::new(
        config.clone(),
        Arc::new(FileSnapshotStore::new(&path)),
    ));

    let scheduler = Scheduler::new(SchedulerConfig::default());
    scheduler.register(Arc::new(Quick("security"))).unwrap();
    scheduler.register(Arc::new(Quick("quality"))).unwrap();
    let listener = aggregator.spawn_event_listener(scheduler.subscribe());

    let batch = scheduler
        .submit_batch(
            vec![Task::new("security"), Task::new("quality")],
            BatchOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(batch.summary.successful, 2);

    let store = FileSnapshotStore::new(&path);
    let persisted =
        wait_for_snapshot(&store, |s| s.global_status.phase == Phase::Complete).await;
    assert_eq!(persisted.agents.len(), 2);
    assert!(persisted.last_saved.is_some());
    assert!(persisted
        .operation_history
        .iter()
        .any(|e| e.kind == HistoryKind::BatchCompleted));

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(raw.get("operationHistory").is_some());
    assert!(raw.get("globalStatus").is_some());

    let restored = StatusAggregator::new(config, Arc::new(FileSnapshotStore::new(&path)));
    assert!(restored.restore().await);
    let summary = restored.summary();
    assert_eq!(summary.session_id, aggregator.session_id());
    assert_eq!(summary.agents.completed, 2);
    assert_eq!(summary.progress, 100.0);

    listener.abort();
}

#[tokio::test]
async fn test_notifications_follow_scheduler_events() {
    let aggregator = Arc::new(StatusAggregator::new(
        StatusConfig {
            persist_enabled: false,
            ..Default::default()
        },
        Arc::new(MemorySnapshotStore::new()),
    ));
    let mut notifications = aggregator.subscribe();

    let scheduler = Scheduler::new(SchedulerConfig::default());
    scheduler.register(Arc::new(Quick("structure"))).unwrap();
    let listener = aggregator.spawn_event_listener(scheduler.subscribe());

    scheduler
        .submit_batch(vec![Task::new("structure")], BatchOptions::new())
        .await
        .unwrap();

    let terminal = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let StatusNotification::StatusUpdated { global } =
                notifications.recv().await.unwrap()
            {
                if global.phase.is_terminal() {
                    return global;
                }
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(terminal.phase, Phase::Complete);
    assert_eq!(terminal.message.as_deref(), Some("1/1 task(s) succeeded"));
    assert_eq!(
        aggregator.snapshot().agents["structure"].state,
        AgentState::Completed
    );
    listener.abort();
}

#[tokio::test]
async fn test_periodic_persistence() {
    let tmp = tempfile::tempdir().unwrap();
    let config = status_config(tmp.path(), 20);
    let path = config.snapshot_path();
    let aggregator = Arc::new(StatusAggregator::new(
        config,
        Arc::new(FileSnapshotStore::new(&path)),
    ));
    aggregator.set_agent_state("security", AgentState::Running, Some(10.0), None);

    let handle = aggregator.spawn_persistence().unwrap();
    let persisted = wait_for_snapshot(&FileSnapshotStore::new(&path), |s| {
        s.agents.contains_key("security")
    })
    .await;
    assert_eq!(persisted.agents["security"].progress, 10.0);
    handle.abort();
}

#[tokio::test]
async fn test_disabled_persistence_spawns_nothing() {
    let aggregator = Arc::new(StatusAggregator::new(
        StatusConfig {
            persist_enabled: false,
            ..Default::default()
        },
        Arc::new(MemorySnapshotStore::new()),
    ));
    assert!(aggregator.spawn_persistence().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_agent_stays_failed() {
    let aggregator = Arc::new(StatusAggregator::new(
        StatusConfig {
            persist_enabled: false,
            ..Default::default()
        },
        Arc::new(MemorySnapshotStore::new()),
    ));
    let scheduler = Scheduler::new(SchedulerConfig::default());
    let woke = Arc::new(AtomicBool::new(false));
    scheduler
        .register(Arc::new(Stubborn {
            woke: Arc::clone(&woke),
        }))
        .unwrap();
    let listener = aggregator.spawn_event_listener(scheduler.subscribe());

    scheduler
        .submit_batch(
            vec![Task::new("stubborn")],
            BatchOptions::new()
                .timeout(Duration::from_millis(50))
                .retries(0),
        )
        .await
        .unwrap();
    drop(scheduler);
    // Every event is folded in once the stream closes.
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        aggregator.snapshot().agents["stubborn"].state,
        AgentState::Failed
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while !woke.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let status = aggregator.snapshot().agents["stubborn"].clone();
    assert_eq!(status.state, AgentState::Failed);
    assert_ne!(status.message.as_deref(), Some("late"));
}
