use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate outcome of one submitted batch.
///
/// `successful + failed + timed_out` always equals `total`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Attempts beyond the first, summed over all tasks.
    pub retries: u32,
    /// Wall-clock time from submission until the last task settled.
    pub duration_ms: u64,
    /// Maximum number of tasks observed running at the same time.
    pub achieved_concurrency: usize,
    /// Time spent queued waiting for resources, summed over all attempts.
    pub queued_ms: u64,
}

impl BatchSummary {
    /// Fraction of tasks that succeeded, in `0.0..=1.0`.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successful as f64 / self.total as f64
    }
}

/// Lifecycle events emitted by the scheduler while a batch runs.
///
/// Consumers receive them in emission order over a broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    BatchStarted {
        batch_id: Uuid,
        count: usize,
    },
    TaskStarted {
        batch_id: Uuid,
        task_id: Uuid,
        agent_id: String,
        attempt: u32,
    },
    /// Only emitted for agents that report progress.
    TaskProgress {
        batch_id: Uuid,
        task_id: Uuid,
        agent_id: String,
        percent: f64,
        message: Option<String>,
    },
    TaskCompleted {
        batch_id: Uuid,
        task_id: Uuid,
        agent_id: String,
        duration_ms: u64,
    },
    /// An attempt failed. `will_retry` is false for the terminal failure.
    TaskFailed {
        batch_id: Uuid,
        task_id: Uuid,
        agent_id: String,
        error: String,
        attempt: u32,
        will_retry: bool,
        timed_out: bool,
    },
    /// A task has been waiting for resources longer than the stall threshold.
    TaskStalled {
        batch_id: Uuid,
        task_id: Uuid,
        agent_id: String,
        waited_ms: u64,
    },
    BatchCompleted {
        batch_id: Uuid,
        summary: BatchSummary,
    },
}

impl SchedulerEvent {
    /// Colon-separated event name, e.g. `task:started`.
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::BatchStarted { .. } => "batch:started",
            SchedulerEvent::TaskStarted { .. } => "task:started",
            SchedulerEvent::TaskProgress { .. } => "task:progress",
            SchedulerEvent::TaskCompleted { .. } => "task:completed",
            SchedulerEvent::TaskFailed { .. } => "task:failed",
            SchedulerEvent::TaskStalled { .. } => "task:stalled",
            SchedulerEvent::BatchCompleted { .. } => "batch:completed",
        }
    }

    /// The batch this event belongs to.
    pub fn batch_id(&self) -> Uuid {
        match self {
            SchedulerEvent::BatchStarted { batch_id, .. }
            | SchedulerEvent::TaskStarted { batch_id, .. }
            | SchedulerEvent::TaskProgress { batch_id, .. }
            | SchedulerEvent::TaskCompleted { batch_id, .. }
            | SchedulerEvent::TaskFailed { batch_id, .. }
            | SchedulerEvent::TaskStalled { batch_id, .. }
            | SchedulerEvent::BatchCompleted { batch_id, .. } => *batch_id,
        }
    }
}
