//! Batch scheduling behaviour: admission, concurrency bounds, timeouts,
//! retries, failure isolation, and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use prism_core::{PrismError, PrismResult, SchedulerConfig, SchedulerEvent};
use prism_scheduler::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Test agents
// ---------------------------------------------------------------------------

/// Shared tracker recording starts, ends, and the peak number of running agents.
#[derive(Default)]
struct Tracker {
    log: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Tracker {
    fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn position(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("missing log entry {entry}"))
    }
}

struct RunningGuard<'a>(&'a Tracker);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TimedAgent {
    id: String,
    delay: Duration,
    requirement: ResourceRequirement,
    tracker: Arc<Tracker>,
}

impl TimedAgent {
    fn new(id: &str, delay_ms: u64, tracker: &Arc<Tracker>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            delay: Duration::from_millis(delay_ms),
            requirement: ResourceRequirement::default(),
            tracker: Arc::clone(tracker),
        })
    }

    fn with_memory(id: &str, delay_ms: u64, memory: u64, tracker: &Arc<Tracker>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            delay: Duration::from_millis(delay_ms),
            requirement: ResourceRequirement::new(memory, 0.1),
            tracker: Arc::clone(tracker),
        })
    }
}

#[async_trait]
impl Agent for TimedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn requirements(&self) -> ResourceRequirement {
        self.requirement.clone()
    }

    async fn execute(&self, ctx: AgentContext) -> PrismResult<serde_json::Value> {
        let now = self.tracker.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.tracker);
        let label = ctx
            .params
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone());

        self.tracker.log.lock().push(format!("start:{label}"));
        tokio::time::sleep(self.delay).await;
        self.tracker.log.lock().push(format!("end:{label}"));
        Ok(serde_json::json!({ "agent": self.id }))
    }
}

/// Fails the first `failures` calls, then succeeds.
struct FlakyAgent {
    id: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyAgent {
    fn new(id: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _ctx: AgentContext) -> PrismResult<serde_json::Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(PrismError::Agent(format!("failure #{call}")));
        }
        Ok(serde_json::json!({ "calls": call }))
    }
}

/// Never settles.
struct HangingAgent {
    calls: AtomicU32,
}

#[async_trait]
impl Agent for HangingAgent {
    fn id(&self) -> &str {
        "hanging"
    }

    async fn execute(&self, _ctx: AgentContext) -> PrismResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

struct PanickingAgent;

#[async_trait]
impl Agent for PanickingAgent {
    fn id(&self) -> &str {
        "panicking"
    }

    async fn execute(&self, _ctx: AgentContext) -> PrismResult<serde_json::Value> {
        panic!("heuristic table corrupted");
    }
}

struct ProgressAgent;

#[async_trait]
impl Agent for ProgressAgent {
    fn id(&self) -> &str {
        "progress"
    }

    async fn execute(&self, ctx: AgentContext) -> PrismResult<serde_json::Value> {
        ctx.progress.report(50.0, Some("halfway"));
        Ok(serde_json::Value::Null)
    }
}

struct NeedsFiles {
    files: Vec<PathBuf>,
    calls: AtomicU32,
}

#[async_trait]
impl Agent for NeedsFiles {
    fn id(&self) -> &str {
        "needs-files"
    }

    fn requirements(&self) -> ResourceRequirement {
        ResourceRequirement::default().with_files(self.files.clone())
    }

    async fn execute(&self, _ctx: AgentContext) -> PrismResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::Value::Null)
    }
}

/// Blocks its worker thread, so aborting the attempt cannot stop it, then
/// reports progress once it wakes up.
struct StubbornAgent {
    block: Duration,
    woke: AtomicBool,
}

impl StubbornAgent {
    fn new(block_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            block: Duration::from_millis(block_ms),
            woke: AtomicBool::new(false),
        })
    }

    async fn wait_until_awake(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.woke.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("agent never woke up");
    }
}

#[async_trait]
impl Agent for StubbornAgent {
    fn id(&self) -> &str {
        "stubborn"
    }

    async fn execute(&self, ctx: AgentContext) -> PrismResult<serde_json::Value> {
        std::thread::sleep(self.block);
        ctx.progress.report(42.0, Some("late"));
        self.woke.store(true, Ordering::SeqCst);
        Ok(serde_json::Value::Null)
    }
}

fn scheduler(max_concurrency: usize) -> Scheduler {
    Scheduler::new(SchedulerConfig {
        max_concurrency,
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Admission and concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_third_task_waits_for_a_free_slot() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = scheduler(4);
    scheduler.register(TimedAgent::new("a", 100, &tracker)).unwrap();
    scheduler.register(TimedAgent::new("b", 150, &tracker)).unwrap();
    scheduler.register(TimedAgent::new("c", 100, &tracker)).unwrap();

    let batch = scheduler
        .submit_batch(
            vec![Task::new("a"), Task::new("b"), Task::new("c")],
            BatchOptions::new().max_concurrency(2),
        )
        .await
        .unwrap();

    assert_eq!(batch.summary.successful, 3);
    assert_eq!(batch.summary.achieved_concurrency, 2);
    assert!(tracker.position("start:c") > tracker.position("end:a"));
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_running_tasks_never_exceed_limit() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = scheduler(8);
    scheduler.register(TimedAgent::new("worker", 20, &tracker)).unwrap();

    let tasks: Vec<Task> = (0..10)
        .map(|i| Task::new("worker").with_params(serde_json::json!(format!("t{i}"))))
        .collect();
    let batch = scheduler
        .submit_batch(tasks, BatchOptions::new().max_concurrency(3))
        .await
        .unwrap();

    assert_eq!(batch.results.len(), 10);
    assert_eq!(batch.summary.achieved_concurrency, 3);
    assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
    assert!(batch.summary.queued_ms > 0);
}

#[tokio::test(start_paused = true)]
async fn test_pool_slots_cap_batch_limit() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = scheduler(2);
    scheduler.register(TimedAgent::new("worker", 10, &tracker)).unwrap();

    let tasks = (0..6).map(|_| Task::new("worker")).collect();
    let batch = scheduler
        .submit_batch(tasks, BatchOptions::new().max_concurrency(5))
        .await
        .unwrap();

    assert_eq!(batch.summary.achieved_concurrency, 2);
    assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_memory_budget_serializes_heavy_agents() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = Scheduler::new(SchedulerConfig {
        max_concurrency: 4,
        memory_budget: Some(100),
        ..Default::default()
    });
    scheduler
        .register(TimedAgent::with_memory("heavy", 30, 60, &tracker))
        .unwrap();

    let tasks = (0..3).map(|_| Task::new("heavy")).collect();
    let batch = scheduler
        .submit_batch(tasks, BatchOptions::new())
        .await
        .unwrap();

    assert_eq!(batch.summary.successful, 3);
    assert_eq!(batch.summary.achieved_concurrency, 1);
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_priority_then_submission_order() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = scheduler(1);
    scheduler.register(TimedAgent::new("w", 5, &tracker)).unwrap();

    let task = |label: &str, priority: i32| {
        Task::new("w")
            .with_params(serde_json::json!(label))
            .with_priority(priority)
    };
    scheduler
        .submit_batch(
            vec![
                task("low", 0),
                task("high-1", 10),
                task("mid", 5),
                task("high-2", 10),
            ],
            BatchOptions::new(),
        )
        .await
        .unwrap();

    let starts: Vec<String> = tracker
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("start:"))
        .collect();
    assert_eq!(
        starts,
        vec!["start:high-1", "start:high-2", "start:mid", "start:low"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_batches_share_the_pool() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = Arc::new(scheduler(2));
    scheduler.register(TimedAgent::new("w", 25, &tracker)).unwrap();

    let first = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let tasks = (0..3).map(|_| Task::new("w")).collect();
            scheduler.submit_batch(tasks, BatchOptions::new()).await
        })
    };
    let second = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let tasks = (0..3).map(|_| Task::new("w")).collect();
            scheduler.submit_batch(tasks, BatchOptions::new()).await
        })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.summary.successful + second.summary.successful, 6);
    assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(scheduler.status().slots_used, 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_occupancy_while_running() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = Arc::new(scheduler(2));
    scheduler.register(TimedAgent::new("w", 100, &tracker)).unwrap();

    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let tasks = (0..3).map(|_| Task::new("w")).collect();
            scheduler.submit_batch(tasks, BatchOptions::new()).await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = scheduler.status();
    assert_eq!(status.slots_used, 2);
    assert_eq!(status.slots_free(), 0);
    assert_eq!(status.queued, 1);
    assert_eq!(scheduler.running(), 2);

    handle.await.unwrap().unwrap();
    let status = scheduler.status();
    assert_eq!(status.slots_used, 0);
    assert_eq!(status.queued, 0);
}

// ---------------------------------------------------------------------------
// Timeouts, retries, and failure isolation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_never_settling_task_times_out_after_retries() {
    let scheduler = scheduler(2);
    let agent = Arc::new(HangingAgent {
        calls: AtomicU32::new(0),
    });
    scheduler.register(agent.clone()).unwrap();

    let batch = scheduler
        .submit_batch(
            vec![Task::new("hanging")],
            BatchOptions::new()
                .timeout(Duration::from_millis(100))
                .retries(1),
        )
        .await
        .unwrap();

    assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    let result = &batch.results[0];
    assert_eq!(result.outcome, TaskOutcome::Timeout);
    assert_eq!(result.retries, 1);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(batch.summary.timed_out, 1);
    assert_eq!(batch.summary.retries, 1);
    assert_eq!(scheduler.status().slots_used, 0);
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout_overrides_batch_timeout() {
    let scheduler = scheduler(1);
    scheduler
        .register(Arc::new(HangingAgent {
            calls: AtomicU32::new(0),
        }))
        .unwrap();

    let batch = scheduler
        .submit_batch(
            vec![Task::new("hanging").with_timeout(Duration::from_millis(50))],
            BatchOptions::new()
                .timeout(Duration::from_secs(3600))
                .retries(0),
        )
        .await
        .unwrap();

    assert_eq!(batch.results[0].outcome, TaskOutcome::Timeout);
    assert!(batch.summary.duration_ms < 1_000);
}

#[tokio::test]
async fn test_always_failing_agent_is_retried_exactly() {
    let scheduler = scheduler(2);
    let agent = FlakyAgent::new("broken", u32::MAX);
    scheduler.register(agent.clone()).unwrap();

    let batch = scheduler
        .submit_batch(vec![Task::new("broken")], BatchOptions::new().retries(3))
        .await
        .unwrap();

    assert_eq!(agent.calls.load(Ordering::SeqCst), 4);
    let result = &batch.results[0];
    assert_eq!(result.outcome, TaskOutcome::Failure);
    assert_eq!(result.retries, 3);
    assert!(result.error.as_deref().unwrap().contains("failure #4"));
    assert_eq!(scheduler.metrics()["broken"].failures, 4);
    assert_eq!(scheduler.metrics()["broken"].retries, 3);
}

#[tokio::test]
async fn test_flaky_agent_recovers_on_retry() {
    let scheduler = scheduler(2);
    scheduler.register(FlakyAgent::new("flaky", 1)).unwrap();

    let batch = scheduler
        .submit_batch(vec![Task::new("flaky")], BatchOptions::new().retries(2))
        .await
        .unwrap();

    let result = &batch.results[0];
    assert!(result.is_success());
    assert_eq!(result.retries, 1);
    assert_eq!(result.payload.as_ref().unwrap()["calls"], 2);
}

#[tokio::test]
async fn test_failures_never_abort_siblings() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = scheduler(4);
    scheduler.register(FlakyAgent::new("broken", u32::MAX)).unwrap();
    scheduler.register(Arc::new(PanickingAgent)).unwrap();
    scheduler.register(TimedAgent::new("ok", 5, &tracker)).unwrap();

    let batch = scheduler
        .submit_batch(
            vec![Task::new("broken"), Task::new("panicking"), Task::new("ok")],
            BatchOptions::new().retries(0),
        )
        .await
        .unwrap();

    assert_eq!(batch.results.len(), 3);
    assert_eq!(batch.summary.successful, 1);
    assert_eq!(batch.summary.failed, 2);
    assert_eq!(batch.results[0].agent_id, "broken");
    assert_eq!(batch.results[2].outcome, TaskOutcome::Success);
    assert!(batch.results[1]
        .error
        .as_deref()
        .unwrap()
        .contains("heuristic table corrupted"));
}

#[tokio::test]
async fn test_missing_input_fails_without_running() {
    let tmp = tempfile::tempdir().unwrap();
    let present = tmp.path().join("Cargo.toml");
    std::fs::write(&present, "[package]").unwrap();

    let scheduler = scheduler(1);
    let agent = Arc::new(NeedsFiles {
        files: vec![present, tmp.path().join("absent.lock")],
        calls: AtomicU32::new(0),
    });
    scheduler.register(agent.clone()).unwrap();

    let batch = scheduler
        .submit_batch(vec![Task::new("needs-files")], BatchOptions::new().retries(3))
        .await
        .unwrap();

    assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    assert_eq!(batch.results[0].outcome, TaskOutcome::Failure);
    assert_eq!(batch.results[0].retries, 0);
    assert!(batch.results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("absent.lock"));
}

#[tokio::test(start_paused = true)]
async fn test_counts_always_sum_to_batch_size() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = scheduler(3);
    scheduler.register(TimedAgent::new("ok", 5, &tracker)).unwrap();
    scheduler.register(FlakyAgent::new("broken", u32::MAX)).unwrap();
    scheduler
        .register(Arc::new(HangingAgent {
            calls: AtomicU32::new(0),
        }))
        .unwrap();

    let kinds = ["ok", "broken", "hanging"];
    for size in 1..=9 {
        let tasks = (0..size).map(|i| Task::new(kinds[i % 3])).collect();
        let batch = scheduler
            .submit_batch(
                tasks,
                BatchOptions::new()
                    .timeout(Duration::from_millis(20))
                    .retries(1),
            )
            .await
            .unwrap();
        let s = &batch.summary;
        assert_eq!(batch.results.len(), size);
        assert_eq!(s.total, size);
        assert_eq!(s.successful + s.failed + s.timed_out, size);
    }
}

// ---------------------------------------------------------------------------
// Events and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let scheduler = scheduler(1);
    scheduler.register(Arc::new(ProgressAgent)).unwrap();
    let mut events = scheduler.subscribe();

    scheduler
        .submit_batch(vec![Task::new("progress")], BatchOptions::new())
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "batch:started",
            "task:started",
            "task:progress",
            "task:completed",
            "batch:completed"
        ]
    );
}

#[tokio::test]
async fn test_failed_attempts_announce_retries() {
    let scheduler = scheduler(1);
    scheduler.register(FlakyAgent::new("broken", u32::MAX)).unwrap();
    let mut events = scheduler.subscribe();

    scheduler
        .submit_batch(vec![Task::new("broken")], BatchOptions::new().retries(1))
        .await
        .unwrap();

    let mut failures = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SchedulerEvent::TaskFailed {
            attempt,
            will_retry,
            ..
        } = event
        {
            failures.push((attempt, will_retry));
        }
    }
    assert_eq!(failures, vec![(1, true), (2, false)]);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_task_is_reported() {
    let tracker = Arc::new(Tracker::default());
    let scheduler = Scheduler::new(SchedulerConfig {
        max_concurrency: 1,
        stall_warning_ms: 50,
        ..Default::default()
    });
    scheduler.register(TimedAgent::new("slow", 200, &tracker)).unwrap();
    let mut events = scheduler.subscribe();

    scheduler
        .submit_batch(
            vec![Task::new("slow"), Task::new("slow")],
            BatchOptions::new(),
        )
        .await
        .unwrap();

    let mut stalled = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SchedulerEvent::TaskStalled { .. }) {
            stalled += 1;
        }
    }
    assert_eq!(stalled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_work_after_grace() {
    let scheduler = Arc::new(scheduler(1));
    scheduler
        .register(Arc::new(HangingAgent {
            calls: AtomicU32::new(0),
        }))
        .unwrap();

    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            scheduler
                .submit_batch(
                    vec![Task::new("hanging"), Task::new("hanging")],
                    BatchOptions::new().timeout(Duration::from_secs(3600)),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    scheduler.shutdown(Some(Duration::from_millis(50))).await;

    let batch = handle.await.unwrap().unwrap();
    assert_eq!(batch.results.len(), 2);
    assert_eq!(batch.summary.failed, 2);
    for result in &batch.results {
        assert!(result.error.as_deref().unwrap().contains("shut down"));
    }
    let status = scheduler.status();
    assert_eq!(status.slots_used, 0);
    assert_eq!(status.queued, 0);
}

// ---------------------------------------------------------------------------
// Abandoned attempts
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_attempt_cannot_report_progress() {
    let scheduler = scheduler(1);
    let agent = StubbornAgent::new(300);
    scheduler.register(agent.clone()).unwrap();
    let mut events = scheduler.subscribe();

    let batch = scheduler
        .submit_batch(
            vec![Task::new("stubborn")],
            BatchOptions::new()
                .timeout(Duration::from_millis(50))
                .retries(0),
        )
        .await
        .unwrap();
    assert_eq!(batch.results[0].outcome, TaskOutcome::Timeout);

    agent.wait_until_awake().await;

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::TaskFailed { timed_out, .. } => {
                assert!(timed_out);
                failed = true;
            }
            SchedulerEvent::TaskProgress { .. } => {
                panic!("progress delivered from an abandoned attempt");
            }
            _ => {}
        }
    }
    assert!(failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_scheduler_closes_event_stream() {
    let scheduler = scheduler(1);
    let agent = StubbornAgent::new(300);
    scheduler.register(agent.clone()).unwrap();
    let mut events = scheduler.subscribe();

    scheduler
        .submit_batch(
            vec![Task::new("stubborn")],
            BatchOptions::new()
                .timeout(Duration::from_millis(50))
                .retries(0),
        )
        .await
        .unwrap();
    // The agent is still blocked and holds its reporter.
    drop(scheduler);

    let mut names = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) => names.push(event.name()),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "event stream stayed open");
    assert_eq!(names.last().copied(), Some("batch:completed"));
    agent.wait_until_awake().await;
}
