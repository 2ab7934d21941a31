//! Synthetic agents for `prism demo`.

use async_trait::async_trait;
use prism_core::PrismResult;
use prism_scheduler::{Agent, AgentContext, ExecutionResult, ResourceRequirement, Task};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Sleeps through a fixed number of steps, reporting progress after each, and
/// returns a canned score.
pub struct TimedAgent {
    id: &'static str,
    steps: u32,
    step: Duration,
    score: f64,
    priority: i32,
    requirement: ResourceRequirement,
}

impl TimedAgent {
    fn new(id: &'static str, steps: u32, step_ms: u64, score: f64) -> Self {
        Self {
            id,
            steps,
            step: Duration::from_millis(step_ms),
            score,
            priority: 0,
            requirement: ResourceRequirement::new(64 * MIB, 0.5),
        }
    }

    fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn requires(mut self, requirement: ResourceRequirement) -> Self {
        self.requirement = requirement;
        self
    }
}

#[async_trait]
impl Agent for TimedAgent {
    fn id(&self) -> &str {
        self.id
    }

    fn requirements(&self) -> ResourceRequirement {
        self.requirement.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn timeout_hint(&self) -> Option<Duration> {
        Some(self.step * (self.steps + 2))
    }

    async fn execute(&self, ctx: AgentContext) -> PrismResult<serde_json::Value> {
        for step in 1..=self.steps {
            tokio::time::sleep(self.step).await;
            let percent = f64::from(step) / f64::from(self.steps) * 100.0;
            ctx.progress
                .report(percent, Some(&format!("{} step {step}/{}", self.id, self.steps)));
        }
        Ok(json!({ "score": self.score, "attempt": ctx.attempt }))
    }
}

/// The agents registered by `prism demo`.
pub fn agents() -> Vec<Arc<dyn Agent>> {
    vec![
        Arc::new(
            TimedAgent::new("security", 5, 300, 72.0)
                .priority(10)
                .requires(ResourceRequirement::new(256 * MIB, 1.0)),
        ),
        Arc::new(TimedAgent::new("quality", 4, 250, 85.5)),
        Arc::new(TimedAgent::new("structure", 3, 200, 91.0)),
        Arc::new(
            TimedAgent::new("dependencies", 4, 350, 64.0)
                .requires(ResourceRequirement::new(32 * MIB, 0.25).with_network()),
        ),
        Arc::new(TimedAgent::new("documentation", 2, 150, 58.0).priority(-5)),
    ]
}

/// One task per demo agent.
pub fn tasks(agents: &[Arc<dyn Agent>]) -> Vec<Task> {
    agents.iter().map(|agent| Task::new(agent.id())).collect()
}

/// Overall score and per-agent category scores from a finished batch.
///
/// Agents that failed contribute zero to the overall mean and are left out of
/// the categories.
pub fn score(results: &[ExecutionResult]) -> (f64, BTreeMap<String, f64>) {
    let categories: BTreeMap<String, f64> = results
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| {
            let value = r.payload.as_ref()?.get("score")?.as_f64()?;
            Some((r.agent_id.clone(), value))
        })
        .collect();
    if results.is_empty() {
        return (0.0, categories);
    }
    let total: f64 = categories.values().sum();
    (total / results.len() as f64, categories)
}
