//! Dispatch orchestrator — concurrent fan-out of one message to many agents
//!
//! Every target gets its own task. Tasks share a semaphore that caps how many
//! backend calls run at once across all batches; excess tasks queue. A failing
//! agent only ever produces a failure entry for itself. Results come back in
//! target order regardless of completion order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agents::AgentRegistry;
use crate::backend::{CompletionOptions, CompletionRequest, ModelBackend};
use crate::error::{BackendError, Result, SwarmError};
use crate::memory::{
    DEFAULT_CONTEXT_CHARS, DEFAULT_CONTEXT_LIMIT, InteractionRecord, MemoryStore,
    format_memory_context,
};
use crate::performance::{PerformanceTracker, TaskOutcome};
use crate::retry::RetryPolicy;

/// Limits and timeouts for dispatch
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Backend calls in flight at once, across all batches
    pub max_concurrent_dispatches: usize,
    pub max_targets_per_request: usize,
    /// Per backend call; expiry is a transient fault
    pub call_timeout: Duration,
    /// Unfinished tasks are aborted after this long
    pub batch_timeout: Option<Duration>,
    pub context_limit: usize,
    pub options: CompletionOptions,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: 8,
            max_targets_per_request: 10,
            call_timeout: Duration::from_secs(60),
            batch_timeout: None,
            context_limit: DEFAULT_CONTEXT_LIMIT,
            options: CompletionOptions::default(),
        }
    }
}

/// One message addressed to a set of agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub message: String,
    pub target_ids: Vec<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(message: impl Into<String>, target_ids: Vec<String>) -> Self {
        Self {
            message: message.into(),
            target_ids,
            conversation_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// One in-flight call to one agent
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub agent_id: String,
    pub message: String,
    pub conversation_id: Option<String>,
    pub attempt_count: u32,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Success,
    Failure,
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Outcome for one targeted agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub agent_id: String,
    pub agent_name: String,
    pub status: DispatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl DispatchOutcome {
    fn success(task: &DispatchTask, agent_name: String, content: String) -> Self {
        Self {
            agent_id: task.agent_id.clone(),
            agent_name,
            status: DispatchStatus::Success,
            content: Some(content),
            error: None,
            attempts: task.attempt_count,
            elapsed_ms: task.started_at.elapsed().as_millis() as u64,
        }
    }

    fn failure(
        agent_id: &str,
        agent_name: String,
        error: impl Into<String>,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            agent_name,
            status: DispatchStatus::Failure,
            content: None,
            error: Some(error.into()),
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DispatchStatus::Success
    }
}

/// Every targeted agent's outcome, in target order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub results: Vec<DispatchOutcome>,
    pub elapsed_ms: u64,
}

impl AggregatedResult {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }
}

enum Slot {
    Done(DispatchOutcome),
    Running {
        agent_id: String,
        agent_name: String,
        handle: JoinHandle<DispatchOutcome>,
    },
}

#[derive(Clone)]
pub struct DispatchOrchestrator {
    registry: Arc<AgentRegistry>,
    backend: Arc<dyn ModelBackend>,
    memory: Arc<dyn MemoryStore>,
    tracker: PerformanceTracker,
    retry: RetryPolicy,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
}

impl DispatchOrchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        backend: Arc<dyn ModelBackend>,
        memory: Arc<dyn MemoryStore>,
        tracker: PerformanceTracker,
        config: DispatchConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_dispatches.max(1)));
        Self {
            registry,
            backend,
            memory,
            tracker,
            retry: RetryPolicy::default(),
            config,
            permits,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Check the request and return the deduplicated target list
    fn validate(&self, request: &DispatchRequest) -> Result<Vec<String>> {
        if request.message.trim().is_empty() {
            return Err(SwarmError::Validation("message must not be empty".into()));
        }
        if request.target_ids.is_empty() {
            return Err(SwarmError::Validation("no target agents given".into()));
        }

        let mut seen = HashSet::new();
        let targets: Vec<String> = request
            .target_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
            .map(str::to_string)
            .collect();

        if targets.is_empty() {
            return Err(SwarmError::Validation("no target agents given".into()));
        }
        if targets.len() > self.config.max_targets_per_request {
            return Err(SwarmError::Validation(format!(
                "Too many targets: {} (max {})",
                targets.len(),
                self.config.max_targets_per_request
            )));
        }
        Ok(targets)
    }

    /// Fan the message out to every target and wait for all of them.
    /// Only validation errors are returned as `Err`; everything else becomes
    /// a failure entry.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<AggregatedResult> {
        let targets = self.validate(&request)?;
        let batch_started = Instant::now();
        info!("Dispatching to {} agents: {:?}", targets.len(), targets);

        let mut slots = Vec::with_capacity(targets.len());
        for agent_id in targets {
            let Some(profile) = self.registry.profile(&agent_id) else {
                debug!("Dispatch target '{}' is not registered", agent_id);
                slots.push(Slot::Done(DispatchOutcome::failure(
                    &agent_id,
                    agent_id.clone(),
                    "agent not found",
                    0,
                    Duration::ZERO,
                )));
                continue;
            };

            let agent_name = profile.name.clone();
            let task = DispatchTask {
                agent_id: agent_id.clone(),
                message: request.message.clone(),
                conversation_id: request.conversation_id.clone(),
                attempt_count: 0,
                started_at: Instant::now(),
            };
            let this = self.clone();
            let handle = tokio::spawn(async move { this.run_task(task).await });
            slots.push(Slot::Running {
                agent_id,
                agent_name,
                handle,
            });
        }

        let deadline = self
            .config
            .batch_timeout
            .map(|t| tokio::time::Instant::from_std(batch_started + t));

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            let outcome = match slot {
                Slot::Done(outcome) => outcome,
                Slot::Running {
                    agent_id,
                    agent_name,
                    mut handle,
                } => {
                    let joined = match deadline {
                        Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                            Ok(joined) => Some(joined),
                            Err(_) => {
                                handle.abort();
                                None
                            }
                        },
                        None => Some((&mut handle).await),
                    };

                    match joined {
                        Some(Ok(outcome)) => outcome,
                        Some(Err(e)) => {
                            warn!("Dispatch task for '{}' panicked: {}", agent_id, e);
                            DispatchOutcome::failure(
                                &agent_id,
                                agent_name,
                                "task panicked",
                                0,
                                batch_started.elapsed(),
                            )
                        }
                        None => {
                            warn!("Dispatch task for '{}' exceeded the batch timeout", agent_id);
                            DispatchOutcome::failure(
                                &agent_id,
                                agent_name,
                                "batch timed out",
                                0,
                                batch_started.elapsed(),
                            )
                        }
                    }
                }
            };
            results.push(outcome);
        }

        let aggregated = AggregatedResult {
            conversation_id: request.conversation_id,
            results,
            elapsed_ms: batch_started.elapsed().as_millis() as u64,
        };
        info!(
            "Dispatch finished: {} succeeded, {} failed in {}ms",
            aggregated.success_count(),
            aggregated.failure_count(),
            aggregated.elapsed_ms
        );
        Ok(aggregated)
    }

    /// Cross-agent context for the prompt; memory trouble only costs context
    pub(crate) async fn context_for(&self, agent_id: &str, message: &str) -> String {
        match self
            .memory
            .cross_agent_context(message, agent_id, self.config.context_limit)
            .await
        {
            Ok(snippets) => format_memory_context(&snippets, DEFAULT_CONTEXT_CHARS),
            Err(e) => {
                warn!("Cross-agent context unavailable for '{}': {}", agent_id, e);
                String::new()
            }
        }
    }

    /// Build the backend request for an agent
    pub(crate) async fn completion_request(
        &self,
        agent_id: &str,
        message: &str,
        model: Option<String>,
    ) -> Result<CompletionRequest> {
        let profile = self
            .registry
            .profile(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.to_string()))?;
        let context = self.context_for(agent_id, message).await;
        Ok(CompletionRequest {
            system_prompt: profile.system_prompt(Some(&context)),
            user_message: message.to_string(),
            model_id: model.unwrap_or_else(|| profile.model_or(self.registry.default_model()).to_string()),
            options: self.config.options,
        })
    }

    /// Best-effort persistence of a finished interaction
    pub(crate) async fn remember(&self, record: InteractionRecord) {
        let agent_id = record.agent_id.clone();
        if let Err(e) = self.memory.store(record).await {
            warn!("Failed to store interaction for '{}': {}", agent_id, e);
        }
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    pub(crate) fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    async fn run_task(&self, mut task: DispatchTask) -> DispatchOutcome {
        let agent_name = self
            .registry
            .profile(&task.agent_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| task.agent_id.clone());

        let Ok(_permit) = self.permits.acquire().await else {
            return DispatchOutcome::failure(
                &task.agent_id,
                agent_name,
                "dispatcher is shut down",
                0,
                task.started_at.elapsed(),
            );
        };

        let guard = match self.tracker.begin(&task.agent_id) {
            Ok(guard) => guard,
            Err(e) => {
                debug!("Not dispatching to '{}': {}", task.agent_id, e);
                let error = match e {
                    SwarmError::Validation(msg) => msg,
                    other => other.to_string(),
                };
                return DispatchOutcome::failure(
                    &task.agent_id,
                    agent_name,
                    error,
                    0,
                    task.started_at.elapsed(),
                );
            }
        };

        let request = match self
            .completion_request(&task.agent_id, &task.message, None)
            .await
        {
            Ok(request) => request,
            Err(e) => {
                guard.finish(TaskOutcome::Failure {
                    configuration_fault: false,
                });
                return DispatchOutcome::failure(
                    &task.agent_id,
                    agent_name,
                    e.to_string(),
                    0,
                    task.started_at.elapsed(),
                );
            }
        };

        let call_started = Instant::now();
        let call_timeout = self.config.call_timeout;
        let backend = &self.backend;
        let req = &request;
        let label = format!("dispatch[{}]", task.agent_id);
        let outcome = self
            .retry
            .run(&label, |_| async move {
                match tokio::time::timeout(call_timeout, backend.complete(req)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(call_timeout)),
                }
            })
            .await;
        task.attempt_count = outcome.attempts;

        match outcome.result {
            Ok(content) => {
                let elapsed = call_started.elapsed();
                guard.finish(TaskOutcome::Success { elapsed });
                debug!(
                    "Agent '{}' answered in {:?} after {} attempt(s)",
                    task.agent_id, elapsed, task.attempt_count
                );

                let mut record =
                    InteractionRecord::new(&task.agent_id, &task.message, &content)
                        .with_metadata("model", request.model_id.as_str())
                        .with_metadata("response_time", elapsed.as_secs_f64());
                if let Some(conversation_id) = &task.conversation_id {
                    record = record.with_metadata("conversation_id", conversation_id.as_str());
                }
                self.remember(record).await;

                DispatchOutcome::success(&task, agent_name, content)
            }
            Err(e) => {
                warn!(
                    "Agent '{}' failed after {} attempt(s): {}",
                    task.agent_id, task.attempt_count, e
                );
                guard.finish(TaskOutcome::Failure {
                    configuration_fault: e.is_configuration(),
                });
                DispatchOutcome::failure(
                    &task.agent_id,
                    agent_name,
                    e.sanitized(),
                    task.attempt_count,
                    task.started_at.elapsed(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySnippet, NoopMemory};
    use crate::test_support::{RecordingMemory, RecordingTransport, ScriptedBackend, registry};
    use crate::types::AgentStatus;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default().with_base_delay(Duration::from_millis(1))
    }

    fn orchestrator(
        registry: Arc<AgentRegistry>,
        backend: Arc<dyn ModelBackend>,
        memory: Arc<dyn MemoryStore>,
        config: DispatchConfig,
    ) -> DispatchOrchestrator {
        let tracker = PerformanceTracker::new(registry.clone(), Arc::new(RecordingTransport::default()));
        DispatchOrchestrator::new(registry, backend, memory, tracker, config).with_retry(fast_retry())
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dispatch_config_default() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_concurrent_dispatches, 8);
        assert_eq!(config.max_targets_per_request, 10);
        assert_eq!(config.call_timeout, Duration::from_secs(60));
        assert!(config.batch_timeout.is_none());
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let reg = registry(&["a"]);
        let orch = orchestrator(
            reg,
            Arc::new(ScriptedBackend::echo()),
            Arc::new(NoopMemory),
            DispatchConfig {
                max_targets_per_request: 2,
                ..Default::default()
            },
        );

        let err = orch.dispatch(DispatchRequest::new("   ", ids(&["a"]))).await.unwrap_err();
        assert!(matches!(err, SwarmError::Validation(_)));

        let err = orch.dispatch(DispatchRequest::new("hi", vec![])).await.unwrap_err();
        assert!(matches!(err, SwarmError::Validation(_)));

        let err = orch
            .dispatch(DispatchRequest::new("hi", ids(&["a", "b", "c"])))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Too many targets"));
    }

    #[tokio::test]
    async fn test_duplicates_collapsed() {
        let reg = registry(&["a", "b"]);
        let orch = orchestrator(
            reg,
            Arc::new(ScriptedBackend::echo()),
            Arc::new(NoopMemory),
            DispatchConfig::default(),
        );
        let result = orch
            .dispatch(DispatchRequest::new("hi", ids(&["b", "a", "b"])))
            .await
            .unwrap();
        let order: Vec<&str> = result.results.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_partial_failure_isolated() {
        let reg = registry(&["a", "b", "c", "d"]);
        let backend = ScriptedBackend::new(|req, _| {
            if req.model_id == "c" {
                Err(BackendError::Server {
                    status: 500,
                    message: "boom".into(),
                })
            } else {
                Ok(format!("{} ok", req.model_id))
            }
        });
        let orch = orchestrator(
            reg.clone(),
            Arc::new(backend),
            Arc::new(NoopMemory),
            DispatchConfig::default(),
        );

        let result = orch
            .dispatch(DispatchRequest::new("hello", ids(&["a", "b", "c", "d"])))
            .await
            .unwrap();

        assert_eq!(result.results.len(), 4);
        assert_eq!(result.success_count(), 3);
        assert_eq!(result.failure_count(), 1);

        let failed = &result.results[2];
        assert_eq!(failed.agent_id, "c");
        assert_eq!(failed.status, DispatchStatus::Failure);
        assert_eq!(failed.attempts, 3);
        assert!(!failed.error.as_deref().unwrap().contains("boom"));

        assert_eq!(result.results[0].content.as_deref(), Some("a ok"));
        assert_eq!(reg.status("c"), Some(AgentStatus::Idle));
        let perf = reg.performance("c").unwrap().performance;
        assert_eq!((perf.total_tasks, perf.successful_tasks), (1, 0));
    }

    #[tokio::test]
    async fn test_unknown_and_offline_targets() {
        let reg = registry(&["a", "b"]);
        reg.set_status("b", AgentStatus::Offline).unwrap();
        let backend = Arc::new(ScriptedBackend::echo());
        let orch = orchestrator(
            reg,
            backend.clone(),
            Arc::new(NoopMemory),
            DispatchConfig::default(),
        );

        let result = orch
            .dispatch(DispatchRequest::new("hi", ids(&["ghost", "a", "b"])))
            .await
            .unwrap();

        assert_eq!(result.results[0].error.as_deref(), Some("agent not found"));
        assert_eq!(result.results[0].attempts, 0);
        assert!(result.results[1].is_success());
        assert_eq!(result.results[2].error.as_deref(), Some("agent 'b' is offline"));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let reg = registry(&["a"]);
        let backend = Arc::new(ScriptedBackend::new(|_, n| {
            if n < 3 {
                Err(BackendError::Network("reset".into()))
            } else {
                Ok("finally".into())
            }
        }));
        let orch = orchestrator(reg, backend.clone(), Arc::new(NoopMemory), DispatchConfig::default());

        let result = orch.dispatch(DispatchRequest::new("hi", ids(&["a"]))).await.unwrap();
        assert!(result.results[0].is_success());
        assert_eq!(result.results[0].attempts, 3);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_configuration_fault_single_attempt_sets_error() {
        let reg = registry(&["a"]);
        let backend = Arc::new(ScriptedBackend::new(|_, _| Err(BackendError::MissingCredentials)));
        let orch = orchestrator(reg.clone(), backend.clone(), Arc::new(NoopMemory), DispatchConfig::default());

        let result = orch.dispatch(DispatchRequest::new("hi", ids(&["a"]))).await.unwrap();
        assert_eq!(result.results[0].attempts, 1);
        assert_eq!(backend.calls(), 1);
        assert_eq!(reg.status("a"), Some(AgentStatus::Error));
    }

    #[tokio::test]
    async fn test_call_timeout_is_transient() {
        let reg = registry(&["a"]);
        let backend = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(200)));
        let orch = orchestrator(
            reg,
            backend.clone(),
            Arc::new(NoopMemory),
            DispatchConfig {
                call_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let result = orch.dispatch(DispatchRequest::new("hi", ids(&["a"]))).await.unwrap();
        assert_eq!(result.results[0].status, DispatchStatus::Failure);
        assert_eq!(result.results[0].attempts, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_runs_concurrently() {
        let reg = registry(&["a", "b", "c", "d", "e"]);
        let backend = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(200)));
        let orch = orchestrator(reg, backend, Arc::new(NoopMemory), DispatchConfig::default());

        let started = Instant::now();
        let result = orch
            .dispatch(DispatchRequest::new("hi", ids(&["a", "b", "c", "d", "e"])))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.success_count(), 5);
        assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_ceiling_queues_excess() {
        let reg = registry(&["a", "b", "c", "d"]);
        let backend = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(100)));
        let orch = orchestrator(
            reg,
            backend,
            Arc::new(NoopMemory),
            DispatchConfig {
                max_concurrent_dispatches: 2,
                ..Default::default()
            },
        );

        let started = Instant::now();
        let result = orch
            .dispatch(DispatchRequest::new("hi", ids(&["a", "b", "c", "d"])))
            .await
            .unwrap();
        assert_eq!(result.success_count(), 4);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_batches_same_agent() {
        let reg = registry(&["a", "b"]);
        let backend = Arc::new(ScriptedBackend::new(|_, n| {
            if n % 3 == 0 {
                Err(BackendError::BadRequest("nope".into()))
            } else {
                Ok("ok".into())
            }
        }));
        let orch = orchestrator(
            reg.clone(),
            backend,
            Arc::new(NoopMemory),
            DispatchConfig {
                max_concurrent_dispatches: 16,
                ..Default::default()
            },
        );

        let mut batches = Vec::new();
        for _ in 0..20 {
            let orch = orch.clone();
            batches.push(tokio::spawn(async move {
                orch.dispatch(DispatchRequest::new("hi", ids(&["a", "b"]))).await
            }));
        }
        for batch in batches {
            assert_eq!(batch.await.unwrap().unwrap().results.len(), 2);
        }

        for id in ["a", "b"] {
            let snap = reg.get(id).unwrap();
            assert_eq!(snap.performance.total_tasks, 20);
            assert!(snap.performance.successful_tasks <= snap.performance.total_tasks);
            assert_eq!(snap.in_flight, 0);
            assert_eq!(snap.status, AgentStatus::Idle);
        }
    }

    #[tokio::test]
    async fn test_batch_timeout_aborts_stragglers() {
        let reg = registry(&["fast", "slow"]);
        let backend = Arc::new(ScriptedBackend::new(|req, _| Ok(req.model_id.clone())));
        let slow = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(500)));
        // Route by model: wrap two backends behind one
        struct Split(Arc<ScriptedBackend>, Arc<ScriptedBackend>);
        #[async_trait::async_trait]
        impl ModelBackend for Split {
            fn provider_name(&self) -> &str {
                "split"
            }
            async fn complete(&self, r: &CompletionRequest) -> std::result::Result<String, BackendError> {
                if r.model_id == "slow" { self.1.complete(r).await } else { self.0.complete(r).await }
            }
            async fn stream(
                &self,
                r: &CompletionRequest,
            ) -> std::result::Result<crate::backend::ChunkStream, BackendError> {
                self.0.stream(r).await
            }
        }

        let orch = orchestrator(
            reg.clone(),
            Arc::new(Split(backend, slow)),
            Arc::new(NoopMemory),
            DispatchConfig {
                batch_timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        );

        let result = orch
            .dispatch(DispatchRequest::new("hi", ids(&["fast", "slow"])))
            .await
            .unwrap();
        assert!(result.results[0].is_success());
        assert_eq!(result.results[1].error.as_deref(), Some("batch timed out"));

        // The aborted task releases the agent once it is dropped
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reg.get("slow").unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_memory_store_and_context() {
        let reg = registry(&["a"]);
        let memory = Arc::new(RecordingMemory {
            snippets: vec![MemorySnippet {
                agent_id: "b".into(),
                content: "earlier answer".into(),
                timestamp: None,
                score: 0.9,
            }],
            ..Default::default()
        });
        let seen_prompt = Arc::new(std::sync::Mutex::new(String::new()));
        let sp = seen_prompt.clone();
        let backend = ScriptedBackend::new(move |req, _| {
            *sp.lock().unwrap() = req.system_prompt.clone();
            Ok("answer".into())
        });
        let orch = orchestrator(reg, Arc::new(backend), memory.clone(), DispatchConfig::default());

        orch.dispatch(DispatchRequest::new("question", ids(&["a"])).with_conversation("conv-1"))
            .await
            .unwrap();

        assert!(seen_prompt.lock().unwrap().contains("earlier answer"));
        let stored = memory.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].response, "answer");
        assert_eq!(stored[0].metadata["conversation_id"], "conv-1");
        assert_eq!(stored[0].metadata["model"], "a");
    }

    #[tokio::test]
    async fn test_memory_failure_does_not_fail_task() {
        let reg = registry(&["a"]);
        let orch = orchestrator(
            reg,
            Arc::new(ScriptedBackend::echo()),
            Arc::new(RecordingMemory::failing()),
            DispatchConfig::default(),
        );
        let result = orch.dispatch(DispatchRequest::new("hi", ids(&["a"]))).await.unwrap();
        assert!(result.results[0].is_success());
    }

    #[test]
    fn test_aggregated_serialize() {
        let result = AggregatedResult {
            conversation_id: None,
            results: vec![DispatchOutcome::failure("x", "X".into(), "agent not found", 0, Duration::ZERO)],
            elapsed_ms: 3,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["results"][0]["status"], "failure");
        assert!(json["results"][0].get("content").is_none());
    }
}
