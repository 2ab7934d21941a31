use crate::types::AgentMetrics;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Execution counters for every agent the scheduler has run.
pub struct AgentMonitor {
    metrics: Mutex<HashMap<String, AgentMetrics>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, agent_id: &str, duration_ms: u64) {
        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(agent_id.to_string()).or_default();
        entry.runs += 1;
        entry.successes += 1;
        entry.duration_ms += duration_ms;
    }

    pub fn record_failure(&self, agent_id: &str, duration_ms: u64, timed_out: bool) {
        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(agent_id.to_string()).or_default();
        entry.runs += 1;
        if timed_out {
            entry.timeouts += 1;
        } else {
            entry.failures += 1;
        }
        entry.duration_ms += duration_ms;
    }

    pub fn record_retry(&self, agent_id: &str) {
        let mut metrics = self.metrics.lock();
        metrics.entry(agent_id.to_string()).or_default().retries += 1;
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.metrics.lock().get(agent_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, AgentMetrics> {
        self.metrics.lock().clone()
    }

    /// Totals across all agents.
    pub fn aggregate(&self) -> AgentMetrics {
        let metrics = self.metrics.lock();
        let mut total = AgentMetrics::default();
        for m in metrics.values() {
            total.runs += m.runs;
            total.successes += m.successes;
            total.failures += m.failures;
            total.timeouts += m.timeouts;
            total.retries += m.retries;
            total.duration_ms += m.duration_ms;
        }
        total
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
