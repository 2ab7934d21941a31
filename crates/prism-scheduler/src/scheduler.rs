use crate::agent::{Agent, AgentContext, ProgressReporter};
use crate::monitor::AgentMonitor;
use crate::pool::ResourcePool;
use crate::task_queue::AdmissionQueue;
use crate::types::{
    AgentMetrics, BatchOptions, BatchResult, ExecutionResult, PoolStatus, ResourceRequirement,
    Task, TaskError, TaskOutcome,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use prism_core::{BatchSummary, PrismError, PrismResult, SchedulerConfig, SchedulerEvent};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;
const MIN_STALL_CHECK: Duration = Duration::from_millis(10);

/// State shared by every batch running on one scheduler.
struct Shared {
    pool: Mutex<ResourcePool>,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    /// Bumped whenever a reservation is released.
    released: watch::Sender<u64>,
}

impl Shared {
    fn notify_released(&self) {
        self.released.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && self.queued.load(Ordering::SeqCst) == 0
    }
}

/// Resource-aware scheduler for registered agents.
///
/// Batches submitted concurrently share one resource pool. Within a batch,
/// tasks are admitted by priority and then submission order; a task that
/// fails or times out is retried through the same admission queue, and no
/// task failure ever aborts its siblings.
pub struct Scheduler {
    config: SchedulerConfig,
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    shared: Arc<Shared>,
    monitor: AgentMonitor,
    events: broadcast::Sender<SchedulerEvent>,
    shutdown: watch::Sender<bool>,
    accepting: AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (released, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pool: Mutex::new(ResourcePool::new(&config)),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            released,
        });

        Self {
            config,
            agents: RwLock::new(HashMap::new()),
            shared,
            monitor: AgentMonitor::new(),
            events,
            shutdown,
            accepting: AtomicBool::new(true),
        }
    }

    /// Register an agent under its identifier. Duplicates are rejected.
    pub fn register(&self, agent: Arc<dyn Agent>) -> PrismResult<()> {
        let id = agent.id().to_string();
        let mut agents = self.agents.write();
        if agents.contains_key(&id) {
            return Err(PrismError::DuplicateAgent(id));
        }
        info!(agent_id = %id, "Agent registered");
        agents.insert(id, agent);
        Ok(())
    }

    /// Remove an agent. Returns `false` if it was not registered.
    pub fn unregister(&self, agent_id: &str) -> bool {
        self.agents.write().remove(agent_id).is_some()
    }

    /// Identifiers of all registered agents, sorted.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Receive lifecycle events for every batch run from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Current pool occupancy. Never waits on running work.
    pub fn status(&self) -> PoolStatus {
        let queued = self.shared.queued.load(Ordering::SeqCst);
        self.shared.pool.lock().status(queued)
    }

    /// Attempts currently executing across all batches.
    pub fn running(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Per-agent execution counters.
    pub fn metrics(&self) -> HashMap<String, AgentMetrics> {
        self.monitor.snapshot()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every task to a terminal state and return the per-task results
    /// and the batch summary.
    ///
    /// Fails only when the submission itself is invalid: an empty task list,
    /// an unknown agent, a requirement larger than the whole pool, or a
    /// scheduler that is shutting down.
    pub async fn submit_batch(
        &self,
        tasks: Vec<Task>,
        options: BatchOptions,
    ) -> PrismResult<BatchResult> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(PrismError::ShuttingDown);
        }
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(self.config.max_concurrency);
        if max_concurrency == 0 {
            return Err(PrismError::InvalidSubmission(
                "max_concurrency must be at least 1".into(),
            ));
        }
        let retries = options.retries.unwrap_or(self.config.default_retries);
        let plans = self.plan(tasks, &options)?;

        let batch_id = Uuid::new_v4();
        info!(
            batch_id = %batch_id,
            tasks = plans.len(),
            max_concurrency,
            retries,
            "Batch started"
        );
        self.emit(SchedulerEvent::BatchStarted {
            batch_id,
            count: plans.len(),
        });

        let run = BatchRun::new(self, batch_id, plans, max_concurrency, retries);
        Ok(run.run().await)
    }

    /// Stop accepting batches, wait up to `grace` for in-flight work, then
    /// cancel whatever is left and release every reservation.
    pub async fn shutdown(&self, grace: Option<Duration>) {
        self.accepting.store(false, Ordering::SeqCst);
        let grace = grace.unwrap_or_else(|| self.config.shutdown_grace());
        info!(
            grace_ms = grace.as_millis() as u64,
            running = self.running(),
            "Scheduler shutting down"
        );

        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            warn!(
                running = self.running(),
                queued = self.shared.queued.load(Ordering::SeqCst),
                "Shutdown grace period elapsed, cancelling remaining tasks"
            );
            self.shutdown.send_replace(true);
            self.wait_idle().await;
        }

        self.shared.pool.lock().reset();
        let totals = self.monitor.aggregate();
        info!(
            runs = totals.runs,
            successes = totals.successes,
            failures = totals.failures,
            timeouts = totals.timeouts,
            retries = totals.retries,
            "Scheduler stopped"
        );
    }

    async fn wait_idle(&self) {
        let mut released = self.shared.released.subscribe();
        loop {
            if self.shared.is_idle() {
                return;
            }
            if released.changed().await.is_err() {
                return;
            }
        }
    }

    fn plan(&self, tasks: Vec<Task>, options: &BatchOptions) -> PrismResult<Vec<TaskPlan>> {
        if tasks.is_empty() {
            return Err(PrismError::InvalidSubmission(
                "batch contains no tasks".into(),
            ));
        }

        let agents = self.agents.read();
        let pool = self.shared.pool.lock();
        tasks
            .into_iter()
            .map(|task| {
                let agent = agents
                    .get(&task.agent_id)
                    .cloned()
                    .ok_or_else(|| PrismError::UnknownAgent(task.agent_id.clone()))?;
                let requirement = agent.requirements();
                if !pool.fits_capacity(&requirement) {
                    return Err(PrismError::InvalidSubmission(format!(
                        "agent '{}' requires more resources than the pool provides",
                        task.agent_id
                    )));
                }
                let priority = task.priority.unwrap_or_else(|| agent.priority());
                let timeout = task
                    .timeout_ms
                    .map(Duration::from_millis)
                    .or(options.timeout)
                    .or_else(|| agent.timeout_hint())
                    .unwrap_or_else(|| self.config.default_timeout());
                Ok(TaskPlan {
                    task,
                    agent,
                    requirement,
                    priority,
                    timeout,
                })
            })
            .collect()
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

struct TaskPlan {
    task: Task,
    agent: Arc<dyn Agent>,
    requirement: ResourceRequirement,
    priority: i32,
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Attempt {
    index: usize,
    number: u32,
}

struct AttemptReport {
    elapsed: Duration,
    outcome: Result<serde_json::Value, TaskError>,
}

/// Coordinator state for one batch. Lives on the submitting task only.
struct BatchRun<'a> {
    scheduler: &'a Scheduler,
    batch_id: Uuid,
    plans: Vec<TaskPlan>,
    max_concurrency: usize,
    retries: u32,
    queue: AdmissionQueue<Attempt>,
    join_set: JoinSet<AttemptReport>,
    running: HashMap<tokio::task::Id, Attempt>,
    results: Vec<Option<ExecutionResult>>,
    first_started: Vec<Option<DateTime<Utc>>>,
    stalled: HashSet<Attempt>,
    peak: usize,
    queued_ms: u64,
    aborting: bool,
}

impl<'a> BatchRun<'a> {
    fn new(
        scheduler: &'a Scheduler,
        batch_id: Uuid,
        plans: Vec<TaskPlan>,
        max_concurrency: usize,
        retries: u32,
    ) -> Self {
        let n = plans.len();
        Self {
            scheduler,
            batch_id,
            plans,
            max_concurrency,
            retries,
            queue: AdmissionQueue::new(),
            join_set: JoinSet::new(),
            running: HashMap::new(),
            results: vec![None; n],
            first_started: vec![None; n],
            stalled: HashSet::new(),
            peak: 0,
            queued_ms: 0,
            aborting: false,
        }
    }

    async fn run(mut self) -> BatchResult {
        let started = Instant::now();
        let shared = Arc::clone(&self.scheduler.shared);
        let mut released = shared.released.subscribe();
        let mut shutdown = self.scheduler.shutdown.subscribe();
        let stall_threshold = self.scheduler.config.stall_warning();
        let mut stall_check = tokio::time::interval(stall_threshold.max(MIN_STALL_CHECK));
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for index in 0..self.plans.len() {
            self.enqueue(Attempt { index, number: 1 });
        }

        loop {
            let stopping = *shutdown.borrow_and_update();
            if stopping {
                self.abort().await;
                break;
            }

            drop(released.borrow_and_update());
            self.admit();

            if self.running.is_empty() && self.queue.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = self.join_set.join_next_with_id(), if !self.running.is_empty() => {
                    match joined {
                        Ok((id, report)) => self.settle(id, Ok(report)),
                        Err(err) => self.settle(err.id(), Err(err)),
                    }
                }
                Ok(()) = released.changed(), if !self.queue.is_empty() => {}
                _ = stall_check.tick(), if !self.queue.is_empty() => {
                    self.check_stalls(stall_threshold);
                }
                Ok(()) = shutdown.changed() => {}
            }
        }

        self.finish(started.elapsed())
    }

    /// Start queued attempts while both the batch limit and the pool allow.
    fn admit(&mut self) {
        while self.running.len() < self.max_concurrency {
            let Some(head) = self.queue.peek() else {
                break;
            };
            let index = head.item.index;
            if !self
                .scheduler
                .shared
                .pool
                .lock()
                .try_acquire(&self.plans[index].requirement)
            {
                break;
            }
            let Some(entry) = self.queue.pop() else {
                break;
            };
            let shared = &self.scheduler.shared;
            shared.in_flight.fetch_add(1, Ordering::SeqCst);
            shared.queued.fetch_sub(1, Ordering::SeqCst);
            self.queued_ms += entry.waited().as_millis() as u64;
            self.spawn(entry.item);
        }
    }

    fn spawn(&mut self, attempt: Attempt) {
        let plan = &self.plans[attempt.index];
        let task_id = plan.task.id;
        let agent_id = plan.task.agent_id.clone();
        self.first_started[attempt.index].get_or_insert_with(Utc::now);

        debug!(
            batch_id = %self.batch_id,
            task_id = %task_id,
            agent_id = %agent_id,
            attempt = attempt.number,
            "Task admitted"
        );
        self.scheduler.emit(SchedulerEvent::TaskStarted {
            batch_id: self.batch_id,
            task_id,
            agent_id: agent_id.clone(),
            attempt: attempt.number,
        });

        let ctx = AgentContext {
            task_id,
            attempt: attempt.number,
            params: plan.task.params.clone(),
            progress: ProgressReporter::new(
                self.scheduler.events.clone(),
                self.batch_id,
                task_id,
                agent_id,
            ),
        };
        let agent = Arc::clone(&plan.agent);
        let timeout = plan.timeout;
        let files = plan.requirement.files.clone();

        let handle = self.join_set.spawn(async move {
            let clock = Instant::now();
            let outcome = run_attempt(agent, ctx, timeout, files).await;
            AttemptReport {
                elapsed: clock.elapsed(),
                outcome,
            }
        });
        self.running.insert(handle.id(), attempt);
        self.peak = self.peak.max(self.running.len());
    }

    fn settle(&mut self, id: tokio::task::Id, joined: Result<AttemptReport, JoinError>) {
        let Some(attempt) = self.running.remove(&id) else {
            return;
        };

        match joined {
            Ok(report) => self.record(attempt, report.elapsed, report.outcome),
            Err(err) => {
                let error = if err.is_cancelled() {
                    TaskError::Shutdown
                } else {
                    TaskError::Panicked(err.to_string())
                };
                self.record(attempt, Duration::ZERO, Err(error));
            }
        }

        // Retries are queued before the reservation is returned so the
        // scheduler never looks idle in between.
        let shared = &self.scheduler.shared;
        shared
            .pool
            .lock()
            .release(&self.plans[attempt.index].requirement);
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        shared.notify_released();
    }

    fn record(
        &mut self,
        attempt: Attempt,
        elapsed: Duration,
        outcome: Result<serde_json::Value, TaskError>,
    ) {
        let plan = &self.plans[attempt.index];
        let task_id = plan.task.id;
        let agent_id = plan.task.agent_id.clone();
        let elapsed_ms = elapsed.as_millis() as u64;
        let scheduler = self.scheduler;
        let monitor = &scheduler.monitor;

        match outcome {
            Ok(payload) => {
                monitor.record_success(&agent_id, elapsed_ms);
                info!(
                    batch_id = %self.batch_id,
                    task_id = %task_id,
                    agent_id = %agent_id,
                    duration_ms = elapsed_ms,
                    "Task completed"
                );
                self.scheduler.emit(SchedulerEvent::TaskCompleted {
                    batch_id: self.batch_id,
                    task_id,
                    agent_id,
                    duration_ms: elapsed_ms,
                });
                self.complete(attempt, TaskOutcome::Success, Some(payload), None);
            }
            Err(error) => {
                let timed_out = matches!(error, TaskError::Timeout { .. });
                monitor.record_failure(&agent_id, elapsed_ms, timed_out);
                let will_retry =
                    !self.aborting && error.is_retryable() && attempt.number <= self.retries;

                warn!(
                    batch_id = %self.batch_id,
                    task_id = %task_id,
                    agent_id = %agent_id,
                    attempt = attempt.number,
                    will_retry,
                    error = %error,
                    "Task attempt failed"
                );
                self.scheduler.emit(SchedulerEvent::TaskFailed {
                    batch_id: self.batch_id,
                    task_id,
                    agent_id: agent_id.clone(),
                    error: error.to_string(),
                    attempt: attempt.number,
                    will_retry,
                    timed_out,
                });

                if will_retry {
                    monitor.record_retry(&agent_id);
                    self.enqueue(Attempt {
                        index: attempt.index,
                        number: attempt.number + 1,
                    });
                } else {
                    self.complete(attempt, error.outcome(), None, Some(error.to_string()));
                }
            }
        }
    }

    fn enqueue(&mut self, attempt: Attempt) {
        self.scheduler.shared.queued.fetch_add(1, Ordering::SeqCst);
        self.queue.push(self.plans[attempt.index].priority, attempt);
    }

    /// Store the terminal result for a task. Later calls for the same task
    /// are ignored.
    fn complete(
        &mut self,
        attempt: Attempt,
        outcome: TaskOutcome,
        payload: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let slot = &mut self.results[attempt.index];
        if slot.is_some() {
            return;
        }
        let plan = &self.plans[attempt.index];
        let finished_at = Utc::now();
        *slot = Some(ExecutionResult {
            task_id: plan.task.id,
            agent_id: plan.task.agent_id.clone(),
            outcome,
            payload,
            error,
            started_at: self.first_started[attempt.index].unwrap_or(finished_at),
            finished_at,
            retries: attempt.number.saturating_sub(1),
        });
    }

    fn check_stalls(&mut self, threshold: Duration) {
        let newly_stalled: Vec<(Attempt, Duration)> = self
            .queue
            .iter()
            .filter(|entry| entry.waited() >= threshold && !self.stalled.contains(&entry.item))
            .map(|entry| (entry.item, entry.waited()))
            .collect();

        for (attempt, waited) in newly_stalled {
            self.stalled.insert(attempt);
            let plan = &self.plans[attempt.index];
            warn!(
                batch_id = %self.batch_id,
                task_id = %plan.task.id,
                agent_id = %plan.task.agent_id,
                waited_ms = waited.as_millis() as u64,
                "Task stalled waiting for resources"
            );
            self.scheduler.emit(SchedulerEvent::TaskStalled {
                batch_id: self.batch_id,
                task_id: plan.task.id,
                agent_id: plan.task.agent_id.clone(),
                waited_ms: waited.as_millis() as u64,
            });
        }
    }

    /// Cancel running attempts and fail everything still queued.
    async fn abort(&mut self) {
        self.aborting = true;
        self.join_set.abort_all();
        while let Some(joined) = self.join_set.join_next_with_id().await {
            match joined {
                Ok((id, report)) => self.settle(id, Ok(report)),
                Err(err) => self.settle(err.id(), Err(err)),
            }
        }

        for entry in self.queue.drain_ordered() {
            self.scheduler.shared.queued.fetch_sub(1, Ordering::SeqCst);
            let attempt = entry.item;
            let plan = &self.plans[attempt.index];
            self.scheduler.emit(SchedulerEvent::TaskFailed {
                batch_id: self.batch_id,
                task_id: plan.task.id,
                agent_id: plan.task.agent_id.clone(),
                error: TaskError::Shutdown.to_string(),
                attempt: attempt.number,
                will_retry: false,
                timed_out: false,
            });
            self.complete(
                attempt,
                TaskOutcome::Failure,
                None,
                Some(TaskError::Shutdown.to_string()),
            );
        }
        self.scheduler.shared.notify_released();
    }

    fn finish(self, elapsed: Duration) -> BatchResult {
        let results: Vec<ExecutionResult> = self
            .results
            .into_iter()
            .zip(&self.plans)
            .map(|(result, plan)| {
                result.unwrap_or_else(|| {
                    let now = Utc::now();
                    ExecutionResult {
                        task_id: plan.task.id,
                        agent_id: plan.task.agent_id.clone(),
                        outcome: TaskOutcome::Failure,
                        payload: None,
                        error: Some("task never reached a terminal state".into()),
                        started_at: now,
                        finished_at: now,
                        retries: 0,
                    }
                })
            })
            .collect();

        let mut summary = BatchSummary {
            total: results.len(),
            duration_ms: elapsed.as_millis() as u64,
            achieved_concurrency: self.peak,
            queued_ms: self.queued_ms,
            ..Default::default()
        };
        for result in &results {
            match result.outcome {
                TaskOutcome::Success => summary.successful += 1,
                TaskOutcome::Failure => summary.failed += 1,
                TaskOutcome::Timeout => summary.timed_out += 1,
            }
            summary.retries += result.retries;
        }

        info!(
            batch_id = %self.batch_id,
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            timed_out = summary.timed_out,
            success_rate = summary.success_rate(),
            duration_ms = summary.duration_ms,
            achieved_concurrency = summary.achieved_concurrency,
            "Batch completed"
        );
        self.scheduler.emit(SchedulerEvent::BatchCompleted {
            batch_id: self.batch_id,
            summary: summary.clone(),
        });

        BatchResult {
            batch_id: self.batch_id,
            results,
            summary,
        }
    }
}

/// Aborts the wrapped task when dropped, so a cancelled or timed-out attempt
/// never leaves the agent future running.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Retires an attempt's progress reporter when the attempt ends by any path,
/// including cancellation of the attempt task.
struct RetireOnDrop(ProgressReporter);

impl Drop for RetireOnDrop {
    fn drop(&mut self) {
        self.0.retire();
    }
}

async fn run_attempt(
    agent: Arc<dyn Agent>,
    ctx: AgentContext,
    timeout: Duration,
    files: Vec<PathBuf>,
) -> Result<serde_json::Value, TaskError> {
    let _retire = RetireOnDrop(ctx.progress.clone());
    for path in files {
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(TaskError::MissingInput(path));
        }
    }

    // A separate task isolates agent panics from the coordinator.
    let mut handle = AbortOnDrop(tokio::spawn(async move { agent.execute(ctx).await }));
    match tokio::time::timeout(timeout, &mut handle.0).await {
        Ok(Ok(Ok(payload))) => Ok(payload),
        Ok(Ok(Err(e))) => Err(TaskError::Execution(e.to_string())),
        Ok(Err(join_err)) => Err(TaskError::Panicked(panic_message(join_err))),
        Err(_) => Err(TaskError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
