use crate::snapshot::{
    AgentState, HistoryEntry, HistoryKind, Phase, Score, StatusSnapshot, StatusSummary,
};
use crate::store::SnapshotStore;
use crate::update::{StatusNotification, StatusUpdate};
use chrono::Utc;
use parking_lot::RwLock;
use prism_core::{PrismResult, SchedulerEvent, StatusConfig};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Score movement below this is not announced.
const MATERIAL_SCORE_DELTA: f64 = 0.5;
/// Category movement below this is left out of the delta list.
const MINOR_CATEGORY_DELTA: f64 = 0.1;
const PROGRESS_EPSILON: f64 = 1e-6;
const NOTIFICATION_CAPACITY: usize = 256;
const MIN_PERSIST_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
struct BatchProgress {
    total: usize,
    settled: usize,
}

struct State {
    snapshot: StatusSnapshot,
    history: VecDeque<HistoryEntry>,
    history_capacity: usize,
    batches: HashMap<Uuid, BatchProgress>,
}

impl State {
    fn new(snapshot: StatusSnapshot, history_capacity: usize) -> Self {
        Self {
            snapshot,
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            batches: HashMap::new(),
        }
    }

    /// Notifies only when phase or progress actually moved.
    fn update_global(
        &mut self,
        phase: Option<Phase>,
        progress: Option<f64>,
        out: &mut Vec<StatusNotification>,
    ) {
        let global = &mut self.snapshot.global_status;
        let mut changed = false;
        if let Some(phase) = phase {
            if global.phase != phase {
                global.phase = phase;
                changed = true;
            }
        }
        if let Some(progress) = progress {
            let progress = progress.clamp(0.0, 100.0);
            if (global.progress - progress).abs() > PROGRESS_EPSILON {
                global.progress = progress;
                changed = true;
            }
        }
        if changed {
            global.updated_at = Utc::now();
            out.push(StatusNotification::StatusUpdated {
                global: global.clone(),
            });
        }
    }

    fn update_agent(
        &mut self,
        agent_id: &str,
        state: AgentState,
        progress: Option<f64>,
        message: Option<String>,
        out: &mut Vec<StatusNotification>,
    ) {
        let now = Utc::now();
        let entry = self.snapshot.agents.entry(agent_id.to_string()).or_default();
        let before = entry.clone();
        let state_changed = entry.state != state;

        entry.progress = match progress {
            Some(p) => p.clamp(0.0, 100.0),
            None if state == AgentState::Completed => 100.0,
            None if state_changed && !state.is_settled() => 0.0,
            None => entry.progress,
        };
        if message.is_some() || state_changed {
            entry.message = message;
        }
        if state == AgentState::Running && (entry.started_at.is_none() || before.state.is_settled())
        {
            entry.started_at = Some(now);
            entry.finished_at = None;
        }
        if state.is_settled() && !before.state.is_settled() {
            entry.finished_at = Some(now);
        }
        entry.state = state;

        let changed = entry.state != before.state
            || entry.progress != before.progress
            || entry.message != before.message;
        if changed {
            entry.updated_at = now;
            out.push(StatusNotification::AgentUpdated {
                agent_id: agent_id.to_string(),
                status: entry.clone(),
            });
        }
    }

    fn push_history(&mut self, entry: HistoryEntry, out: &mut Vec<StatusNotification>) {
        if let Some(level) = entry.kind.alert_level() {
            out.push(StatusNotification::Alert {
                level,
                entry: entry.clone(),
            });
        }
        self.history.push_back(entry);
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }

    fn record_score(
        &mut self,
        value: f64,
        categories: BTreeMap<String, f64>,
        out: &mut Vec<StatusNotification>,
    ) {
        let previous = self.snapshot.score.current.take();
        let old = previous.as_ref().map(|p| p.value);
        let material = old.map_or(true, |old| (value - old).abs() > MATERIAL_SCORE_DELTA);

        if material {
            out.push(StatusNotification::ScoreUpdated {
                old,
                new: value,
                deltas: category_deltas(previous.as_ref(), &categories),
                categories: categories.clone(),
            });
        }
        self.snapshot.score.previous = previous;
        self.snapshot.score.current = Some(Score {
            value,
            categories,
            recorded_at: Utc::now(),
        });
    }

    /// Settled over total tasks across every active batch.
    fn batch_progress(&self) -> Option<f64> {
        let (total, settled) = self
            .batches
            .values()
            .fold((0, 0), |(t, s), b| (t + b.total, s + b.settled));
        (total > 0).then(|| settled as f64 / total as f64 * 100.0)
    }

    fn settle(&mut self, batch_id: &Uuid, out: &mut Vec<StatusNotification>) {
        if let Some(batch) = self.batches.get_mut(batch_id) {
            batch.settled = (batch.settled + 1).min(batch.total);
        }
        let progress = self.batch_progress();
        self.update_global(None, progress, out);
    }

    fn apply_event(&mut self, event: &SchedulerEvent, out: &mut Vec<StatusNotification>) {
        match event {
            SchedulerEvent::BatchStarted { batch_id, count } => {
                self.batches.insert(
                    *batch_id,
                    BatchProgress {
                        total: *count,
                        settled: 0,
                    },
                );
                let progress = self.batch_progress();
                self.snapshot.global_status.message = Some("Analysis in progress".into());
                self.update_global(Some(Phase::Analyzing), progress, out);
                self.push_history(
                    HistoryEntry::new(
                        HistoryKind::BatchStarted,
                        format!("Batch {batch_id} started with {count} task(s)"),
                    ),
                    out,
                );
            }
            SchedulerEvent::TaskStarted {
                agent_id, attempt, ..
            } => {
                let message = (*attempt > 1).then(|| format!("attempt {attempt}"));
                self.update_agent(agent_id, AgentState::Running, None, message, out);
            }
            SchedulerEvent::TaskProgress {
                agent_id,
                percent,
                message,
                ..
            } => {
                self.update_agent(
                    agent_id,
                    AgentState::Running,
                    Some(*percent),
                    message.clone(),
                    out,
                );
            }
            SchedulerEvent::TaskCompleted {
                batch_id,
                agent_id,
                duration_ms,
                ..
            } => {
                self.update_agent(
                    agent_id,
                    AgentState::Completed,
                    Some(100.0),
                    Some(format!("completed in {duration_ms}ms")),
                    out,
                );
                self.settle(batch_id, out);
            }
            SchedulerEvent::TaskFailed {
                batch_id,
                agent_id,
                error,
                attempt,
                will_retry,
                ..
            } => {
                if *will_retry {
                    self.update_agent(
                        agent_id,
                        AgentState::Pending,
                        None,
                        Some(format!("attempt {attempt} failed, retrying")),
                        out,
                    );
                    self.push_history(
                        HistoryEntry::new(
                            HistoryKind::Warning,
                            format!("Agent '{agent_id}' attempt {attempt} failed: {error}"),
                        ),
                        out,
                    );
                } else {
                    self.update_agent(
                        agent_id,
                        AgentState::Failed,
                        None,
                        Some(error.clone()),
                        out,
                    );
                    self.push_history(
                        HistoryEntry::new(
                            HistoryKind::Error,
                            format!("Agent '{agent_id}' failed: {error}"),
                        ),
                        out,
                    );
                    self.settle(batch_id, out);
                }
            }
            SchedulerEvent::TaskStalled {
                agent_id,
                waited_ms,
                ..
            } => {
                self.push_history(
                    HistoryEntry::new(
                        HistoryKind::Warning,
                        format!("Agent '{agent_id}' waited {waited_ms}ms for resources"),
                    ),
                    out,
                );
            }
            SchedulerEvent::BatchCompleted { batch_id, summary } => {
                self.batches.remove(batch_id);
                if self.batches.is_empty() {
                    let phase = if summary.total > 0 && summary.successful == 0 {
                        Phase::Error
                    } else {
                        Phase::Complete
                    };
                    self.snapshot.global_status.message = Some(format!(
                        "{}/{} task(s) succeeded",
                        summary.successful, summary.total
                    ));
                    self.update_global(Some(phase), Some(100.0), out);
                } else {
                    let progress = self.batch_progress();
                    self.update_global(None, progress, out);
                }
                self.push_history(
                    HistoryEntry::new(
                        HistoryKind::BatchCompleted,
                        format!(
                            "Batch {batch_id} completed: {} succeeded, {} failed, {} timed out in {}ms",
                            summary.successful,
                            summary.failed,
                            summary.timed_out,
                            summary.duration_ms
                        ),
                    ),
                    out,
                );
            }
        }
    }
}

fn category_deltas(previous: Option<&Score>, current: &BTreeMap<String, f64>) -> Vec<String> {
    current
        .iter()
        .filter_map(|(name, &new)| {
            match previous.and_then(|p| p.categories.get(name)).copied() {
                Some(old) if (new - old).abs() > MINOR_CATEGORY_DELTA => Some(format!(
                    "{name}: {old:.1} -> {new:.1} ({:+.1})",
                    new - old
                )),
                Some(_) => None,
                None => Some(format!("{name}: {new:.1} (new)")),
            }
        })
        .collect()
}

/// Folds scheduler events and explicit updates into one live
/// [`StatusSnapshot`], raising a [`StatusNotification`] for every material
/// change.
///
/// All mutation happens synchronously under one lock and notifications are
/// sent before the lock is released, so subscribers observe them in the
/// order they were raised. Persistence works on a copy and never holds the
/// lock across I/O.
pub struct StatusAggregator {
    config: StatusConfig,
    state: RwLock<State>,
    notifications: broadcast::Sender<StatusNotification>,
    store: Arc<dyn SnapshotStore>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl StatusAggregator {
    pub fn new(config: StatusConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let state = State::new(StatusSnapshot::default(), config.history_capacity);
        Self {
            config,
            state: RwLock::new(state),
            notifications,
            store,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StatusConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusNotification> {
        self.notifications.subscribe()
    }

    pub fn session_id(&self) -> String {
        self.state.read().snapshot.session_id.clone()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut State, &mut Vec<StatusNotification>) -> R) -> R {
        let mut state = self.state.write();
        let mut raised = Vec::new();
        let result = f(&mut state, &mut raised);
        for notification in raised {
            // Nobody listening is fine.
            let _ = self.notifications.send(notification);
        }
        result
    }

    /// Merge one typed update into the live snapshot.
    pub fn apply_update(&self, update: StatusUpdate) {
        self.mutate(|state, out| match update {
            StatusUpdate::PhaseChanged { phase } => state.update_global(Some(phase), None, out),
            StatusUpdate::ProgressChanged { progress } => {
                state.update_global(None, Some(progress), out);
            }
            StatusUpdate::MessageChanged { message } => {
                state.snapshot.global_status.message = message;
            }
            StatusUpdate::AgentStateChanged {
                agent_id,
                state: agent_state,
                progress,
                message,
            } => state.update_agent(&agent_id, agent_state, progress, message, out),
            StatusUpdate::ScoreChanged { score, categories } => {
                state.record_score(score, categories, out);
            }
        });
    }

    pub fn set_agent_state(
        &self,
        agent_id: &str,
        agent_state: AgentState,
        progress: Option<f64>,
        message: Option<String>,
    ) {
        self.mutate(|state, out| {
            state.update_agent(agent_id, agent_state, progress, message, out);
        });
    }

    /// Record a new aggregate score. The previous score is kept alongside it.
    pub fn record_score(&self, value: f64, categories: BTreeMap<String, f64>) {
        self.mutate(|state, out| state.record_score(value, categories, out));
    }

    /// Fold one scheduler lifecycle event into the snapshot.
    pub fn apply_event(&self, event: &SchedulerEvent) {
        self.mutate(|state, out| state.apply_event(event, out));
    }

    pub fn record_history(&self, kind: HistoryKind, message: impl Into<String>) {
        let entry = HistoryEntry::new(kind, message);
        self.mutate(|state, out| state.push_history(entry, out));
    }

    /// The `n` most recent history entries, oldest first.
    pub fn history(&self, n: usize) -> Vec<HistoryEntry> {
        let state = self.state.read();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Copy of the live snapshot, including the most recent history entries.
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.read();
        let mut snapshot = state.snapshot.clone();
        let skip = state
            .history
            .len()
            .saturating_sub(self.config.history_persisted);
        snapshot.operation_history = state.history.iter().skip(skip).cloned().collect();
        snapshot
    }

    pub fn summary(&self) -> StatusSummary {
        StatusSummary::from_snapshot(&self.snapshot(), self.config.history_persisted)
    }

    /// Replace the snapshot wholesale with an empty one for a new session.
    ///
    /// Returns the new session identifier.
    pub fn reset(&self, session_id: Option<String>) -> String {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(session_id = %session_id, "Status session reset");
        self.mutate(|state, out| {
            *state = State::new(
                StatusSnapshot::new(session_id.clone()),
                self.config.history_capacity,
            );
            out.push(StatusNotification::SessionReset {
                session_id: session_id.clone(),
            });
        });
        session_id
    }

    /// Write the current snapshot to the store.
    ///
    /// A failed write is logged and recorded as a warning; the in-memory
    /// snapshot stays authoritative either way.
    pub async fn persist(&self) -> PrismResult<()> {
        let _guard = self.persist_lock.lock().await;
        let saved_at = Utc::now();
        let mut snapshot = self.snapshot();
        snapshot.last_saved = Some(saved_at);

        match self.store.save(&snapshot).await {
            Ok(()) => {
                let mut state = self.state.write();
                if state.snapshot.session_id == snapshot.session_id {
                    state.snapshot.last_saved = Some(saved_at);
                }
                debug!(session_id = %snapshot.session_id, "Status snapshot persisted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist status snapshot");
                self.record_history(HistoryKind::Warning, format!("Snapshot not saved: {e}"));
                Err(e)
            }
        }
    }

    /// Load the last persisted snapshot. Returns whether one was restored.
    ///
    /// A missing or unreadable snapshot leaves a fresh, empty one in place.
    pub async fn restore(&self) -> bool {
        match self.store.load().await {
            Ok(Some(mut snapshot)) => {
                info!(
                    session_id = %snapshot.session_id,
                    agents = snapshot.agents.len(),
                    "Restored status snapshot"
                );
                let mut state = State::new(StatusSnapshot::default(), self.config.history_capacity);
                state.history = std::mem::take(&mut snapshot.operation_history).into();
                while state.history.len() > state.history_capacity {
                    state.history.pop_front();
                }
                state.snapshot = snapshot;
                *self.state.write() = state;
                true
            }
            Ok(None) => {
                debug!("No persisted status snapshot, starting fresh");
                false
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable status snapshot");
                *self.state.write() =
                    State::new(StatusSnapshot::default(), self.config.history_capacity);
                false
            }
        }
    }

    /// Consume scheduler events until the stream closes, persisting after
    /// each completed batch.
    pub fn spawn_event_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SchedulerEvent>,
    ) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        debug!(
                            event = event.name(),
                            batch_id = %event.batch_id(),
                            "Folding scheduler event"
                        );
                        aggregator.apply_event(&event);
                        if matches!(event, SchedulerEvent::BatchCompleted { .. })
                            && aggregator.config.persist_enabled
                        {
                            // Logged inside persist().
                            let _ = aggregator.persist().await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Status aggregator fell behind scheduler events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Scheduler event stream closed");
        })
    }

    /// Persist on a fixed interval. `None` when persistence is disabled.
    pub fn spawn_persistence(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.persist_enabled {
            return None;
        }
        let aggregator = Arc::clone(self);
        let period = self.config.persist_interval().max(MIN_PERSIST_INTERVAL);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = aggregator.persist().await;
            }
        }))
    }
}
