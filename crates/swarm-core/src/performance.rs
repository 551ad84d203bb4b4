//! Performance tracking — turns task outcomes into registry updates
//!
//! The tracker is the only writer of per-agent metrics. Each update runs under
//! the agent record's lock, so overlapping tasks on one agent cannot lose
//! increments.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::agents::AgentRegistry;
use crate::error::Result;
use crate::transport::{Transport, TransportEvent};
use crate::types::{AgentStatus, PerformanceMetrics};

/// Terminal outcome of one task
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskOutcome {
    Success { elapsed: Duration },
    Failure { configuration_fault: bool },
    /// Stopped by the client; not counted
    Cancelled,
}

/// Fold one outcome into the counters. Successes update the cumulative moving
/// average of response time; failures only bump `total_tasks`.
pub fn apply(metrics: &mut PerformanceMetrics, outcome: TaskOutcome, now: DateTime<Utc>) {
    match outcome {
        TaskOutcome::Success { elapsed } => {
            metrics.total_tasks += 1;
            metrics.successful_tasks += 1;
            let n = metrics.successful_tasks as f64;
            metrics.average_response_time += (elapsed.as_secs_f64() - metrics.average_response_time) / n;
        }
        TaskOutcome::Failure { .. } => {
            metrics.total_tasks += 1;
        }
        TaskOutcome::Cancelled => {}
    }
    metrics.last_active = Some(now);
}

#[derive(Clone)]
pub struct PerformanceTracker {
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn Transport>,
}

impl PerformanceTracker {
    pub fn new(registry: Arc<AgentRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// Mark a task as started and announce the status change.
    /// The returned guard must be finished with the task's outcome; dropping it
    /// unfinished (abort, panic) records a failure.
    pub fn begin(&self, agent_id: &str) -> Result<TaskGuard> {
        let (previous, status) = self.registry.begin_task(agent_id)?;
        if previous != status {
            self.transport.emit(TransportEvent::agent_status(agent_id, status));
        }
        Ok(TaskGuard {
            tracker: self.clone(),
            agent_id: agent_id.to_string(),
            finished: false,
        })
    }

    /// Record a terminal outcome. Returns the agent's status afterwards.
    pub fn record(&self, agent_id: &str, outcome: TaskOutcome) -> Result<AgentStatus> {
        let (previous, status) = self.registry.update(agent_id, |state| {
            let previous = state.status;
            state.in_flight = state.in_flight.saturating_sub(1);
            apply(&mut state.performance, outcome, Utc::now());

            if matches!(outcome, TaskOutcome::Failure { configuration_fault: true }) {
                state.status = AgentStatus::Error;
            } else if state.in_flight == 0 && state.status == AgentStatus::Busy {
                state.status = AgentStatus::Idle;
            }
            (previous, state.status)
        })?;

        debug!("PerformanceTracker: '{}' {:?} → {}", agent_id, outcome, status);
        if previous != status {
            self.transport.emit(TransportEvent::agent_status(agent_id, status));
        }
        Ok(status)
    }
}

/// One running task against one agent
#[must_use = "finish the guard with the task outcome"]
pub struct TaskGuard {
    tracker: PerformanceTracker,
    agent_id: String,
    finished: bool,
}

impl TaskGuard {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Record the terminal outcome. Returns the agent's status afterwards.
    pub fn finish(mut self, outcome: TaskOutcome) -> Option<AgentStatus> {
        self.finished = true;
        match self.tracker.record(&self.agent_id, outcome) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Failed to record outcome for '{}': {}", self.agent_id, e);
                None
            }
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Task for '{}' ended without an outcome, counting as failed", self.agent_id);
            let _ = self
                .tracker
                .record(&self.agent_id, TaskOutcome::Failure { configuration_fault: false });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentProfile;
    use crate::transport::{ChannelTransport, NullTransport, events};

    fn tracker() -> (PerformanceTracker, Arc<AgentRegistry>) {
        let registry = Arc::new(
            AgentRegistry::new(vec![AgentProfile::new("cathy", "Cathy")], "m").unwrap(),
        );
        (
            PerformanceTracker::new(registry.clone(), Arc::new(NullTransport)),
            registry,
        )
    }

    #[test]
    fn test_apply_moving_average() {
        let mut m = PerformanceMetrics::default();
        let now = Utc::now();
        apply(&mut m, TaskOutcome::Success { elapsed: Duration::from_secs(1) }, now);
        apply(&mut m, TaskOutcome::Success { elapsed: Duration::from_secs(3) }, now);
        apply(&mut m, TaskOutcome::Failure { configuration_fault: false }, now);

        assert_eq!(m.total_tasks, 3);
        assert_eq!(m.successful_tasks, 2);
        assert!((m.average_response_time - 2.0).abs() < 1e-9);
        assert_eq!(m.last_active, Some(now));
    }

    #[test]
    fn test_apply_cancelled_not_counted() {
        let mut m = PerformanceMetrics::default();
        apply(&mut m, TaskOutcome::Cancelled, Utc::now());
        assert_eq!(m.total_tasks, 0);
    }

    #[test]
    fn test_record_returns_to_idle() {
        let (tracker, registry) = tracker();
        let first = tracker.begin("cathy").unwrap();
        let second = tracker.begin("cathy").unwrap();

        let status = first.finish(TaskOutcome::Success { elapsed: Duration::from_millis(10) });
        assert_eq!(status, Some(AgentStatus::Busy));

        let status = second.finish(TaskOutcome::Failure { configuration_fault: false });
        assert_eq!(status, Some(AgentStatus::Idle));
        assert_eq!(registry.get("cathy").unwrap().in_flight, 0);
    }

    #[test]
    fn test_configuration_fault_sets_error() {
        let (tracker, registry) = tracker();
        let guard = tracker.begin("cathy").unwrap();
        let status = guard.finish(TaskOutcome::Failure { configuration_fault: true });
        assert_eq!(status, Some(AgentStatus::Error));

        // Errored agents stay dispatchable; a later success recovers them
        let guard = tracker.begin("cathy").unwrap();
        guard.finish(TaskOutcome::Success { elapsed: Duration::ZERO });
        assert_eq!(registry.status("cathy"), Some(AgentStatus::Idle));
    }

    #[test]
    fn test_offline_stays_offline() {
        let (tracker, registry) = tracker();
        let guard = tracker.begin("cathy").unwrap();
        registry.set_status("cathy", AgentStatus::Offline).unwrap();
        guard.finish(TaskOutcome::Success { elapsed: Duration::ZERO });
        assert_eq!(registry.status("cathy"), Some(AgentStatus::Offline));
    }

    #[test]
    fn test_dropped_guard_counts_failure() {
        let (tracker, registry) = tracker();
        drop(tracker.begin("cathy").unwrap());

        let snap = registry.get("cathy").unwrap();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.status, AgentStatus::Idle);
        assert_eq!(snap.performance.total_tasks, 1);
        assert_eq!(snap.performance.successful_tasks, 0);
    }

    #[tokio::test]
    async fn test_status_changes_announced() {
        let registry = Arc::new(
            AgentRegistry::new(vec![AgentProfile::new("cathy", "Cathy")], "m").unwrap(),
        );
        let (transport, mut rx) = ChannelTransport::new();
        let tracker = PerformanceTracker::new(registry, Arc::new(transport));

        let guard = tracker.begin("cathy").unwrap();
        guard.finish(TaskOutcome::Cancelled);

        let busy = rx.recv().await.unwrap();
        assert_eq!(busy.event, events::AGENT_STATUS_UPDATE);
        assert_eq!(busy.data["status"], "busy");
        let idle = rx.recv().await.unwrap();
        assert_eq!(idle.data["status"], "idle");
    }

    #[tokio::test]
    async fn test_overlapping_tasks_announce_busy_once() {
        let registry = Arc::new(
            AgentRegistry::new(vec![AgentProfile::new("cathy", "Cathy")], "m").unwrap(),
        );
        let (transport, mut rx) = ChannelTransport::new();
        let tracker = PerformanceTracker::new(registry, Arc::new(transport));

        let first = tracker.begin("cathy").unwrap();
        let second = tracker.begin("cathy").unwrap();
        first.finish(TaskOutcome::Cancelled);
        second.finish(TaskOutcome::Cancelled);
        drop(tracker);

        let mut statuses = Vec::new();
        while let Some(event) = rx.recv().await {
            statuses.push(event.data["status"].as_str().unwrap_or_default().to_string());
        }
        assert_eq!(statuses, vec!["busy", "idle"]);
    }

    #[test]
    fn test_unknown_agent() {
        let (tracker, _) = tracker();
        assert!(tracker.record("ghost", TaskOutcome::Cancelled).is_err());
    }
}
