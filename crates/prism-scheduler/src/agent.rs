use crate::types::ResourceRequirement;
use async_trait::async_trait;
use parking_lot::RwLock;
use prism_core::{PrismResult, SchedulerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// A pluggable unit of analysis work.
///
/// The scheduler knows nothing about what an agent inspects; it only uses the
/// declared requirements, priority, and timeout hint to decide when and how
/// long the agent may run.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique identifier used to register and target the agent.
    fn id(&self) -> &str;

    /// Declared cost of one execution.
    fn requirements(&self) -> ResourceRequirement {
        ResourceRequirement::default()
    }

    /// Default priority of tasks targeting this agent. Higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Preferred timeout, used when neither the task nor the batch sets one.
    fn timeout_hint(&self) -> Option<Duration> {
        None
    }

    /// Run the agent once.
    ///
    /// The returned future may be dropped at any await point when the task
    /// times out or the scheduler shuts down.
    async fn execute(&self, ctx: AgentContext) -> PrismResult<serde_json::Value>;
}

/// Everything an agent receives for one attempt.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub task_id: Uuid,
    /// 1 for the first attempt, incremented on each retry.
    pub attempt: u32,
    pub params: serde_json::Value,
    pub progress: ProgressReporter,
}

/// Lets an agent publish optional progress while it runs.
///
/// Clones share one sender. Once the scheduler is done with the attempt the
/// sender is dropped and further reports are ignored, so an agent that keeps
/// running past its timeout cannot touch the task's status again.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    events: Arc<RwLock<Option<broadcast::Sender<SchedulerEvent>>>>,
    batch_id: Uuid,
    task_id: Uuid,
    agent_id: String,
}

impl ProgressReporter {
    pub(crate) fn new(
        events: broadcast::Sender<SchedulerEvent>,
        batch_id: Uuid,
        task_id: Uuid,
        agent_id: String,
    ) -> Self {
        Self {
            events: Arc::new(RwLock::new(Some(events))),
            batch_id,
            task_id,
            agent_id,
        }
    }

    /// Report completion percentage (clamped to `0..=100`) with an optional message.
    pub fn report(&self, percent: f64, message: Option<&str>) {
        // Held across the send so `retire` cannot complete mid-report.
        let events = self.events.read();
        let Some(events) = events.as_ref() else {
            debug!(
                task_id = %self.task_id,
                agent_id = %self.agent_id,
                percent,
                "Ignoring progress from a finished attempt"
            );
            return;
        };
        let _ = events.send(SchedulerEvent::TaskProgress {
            batch_id: self.batch_id,
            task_id: self.task_id,
            agent_id: self.agent_id.clone(),
            percent: percent.clamp(0.0, 100.0),
            message: message.map(str::to_string),
        });
    }

    /// Drop the sender for this attempt and every clone of the reporter.
    pub(crate) fn retire(&self) {
        self.events.write().take();
    }
}
