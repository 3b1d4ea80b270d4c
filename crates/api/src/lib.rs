//! AMP public API façade (in-process).
//!
//! Front ends (the CLI today) depend on [`AmpApi`] only. Stack operations
//! are guarded by the stack lifecycle record: a run first moves the stack to
//! `Starting` or `Redeploying` through compare-and-set, so a second caller
//! racing on the same stack is refused instead of driving a second loop.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use amp_core::{ClusterGraph, ClusterSnapshot, StateStore};
use amp_ops::{DownReport, Orchestrator, OrchestratorConfig, OrchestratorError, PullReport, SubstrateClient, UpReport};
use amp_store::{stack_rules, StackState, StateError, StateMachine};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use amp_ops::{CancelHandle, StreamHandle, UpOptions};

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    /// Lost a race or the resource is held by another caller; retry later.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("invalid_transition: {0}")]
    InvalidTransition(String),
    #[error("orchestration: {0}")]
    Orchestration(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::AlreadyExists(_) | StateError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            StateError::NotFound(_) => ApiError::NotFound(e.to_string()),
            StateError::InvalidTransition { .. } => ApiError::InvalidTransition(e.to_string()),
            StateError::UnknownState(_) => ApiError::Validation(e.to_string()),
            StateError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Graph(_) => ApiError::Validation(e.to_string()),
            OrchestratorError::ImageMissing { .. } | OrchestratorError::ServiceStartupTimeout { .. } => {
                ApiError::Orchestration(e.to_string())
            }
            OrchestratorError::Cancelled => ApiError::Cancelled,
            OrchestratorError::Substrate(_) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Caller-facing AMP surface.
#[async_trait::async_trait]
pub trait AmpApi: Send + Sync {
    async fn create_state(&self, id: &str, initial: &str) -> ApiResult<()>;
    async fn get_state(&self, id: &str) -> ApiResult<String>;
    /// Returns the state the record left.
    async fn transition(&self, id: &str, to: &str) -> ApiResult<String>;
    async fn delete_state(&self, id: &str) -> ApiResult<()>;

    /// Bring the stack named by the graph up. Refused with `Conflict` while
    /// another run holds the stack.
    async fn stack_up(&self, graph: &ClusterGraph, opts: UpOptions) -> ApiResult<UpReport>;
    /// Remove the stack's services. Refused with `Conflict` while a run
    /// holds the stack.
    async fn stack_down(&self, graph: &ClusterGraph) -> ApiResult<DownReport>;
    /// Re-run convergence on a running stack.
    async fn stack_redeploy(&self, graph: &ClusterGraph, opts: UpOptions) -> ApiResult<UpReport>;

    /// Live rows including discovered user services.
    async fn cluster_status(&self, graph: &ClusterGraph) -> ApiResult<ClusterSnapshot>;
    async fn monitor(&self, graph: &ClusterGraph, interval: Duration) -> ApiResult<StreamHandle<ClusterSnapshot>>;

    async fn pull_images(&self, graph: &ClusterGraph) -> ApiResult<PullReport>;
    /// Returns the volumes still present afterwards.
    async fn remove_volumes(&self, graph: &ClusterGraph) -> ApiResult<Vec<String>>;
}

// ----------------- In-process implementation -----------------

/// In-process implementation that calls the state machine and orchestrator
/// directly.
pub struct InProcApi {
    machine: StateMachine,
    orch: Arc<Orchestrator>,
    root: CancellationToken,
}

impl InProcApi {
    pub fn new(store: Arc<dyn StateStore>, client: Arc<dyn SubstrateClient>, cfg: OrchestratorConfig) -> Self {
        Self {
            machine: StateMachine::new(store, stack_rules()),
            orch: Arc::new(Orchestrator::new(client, cfg)),
            root: CancellationToken::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> { &self.orch }

    /// Cancels every in-flight stack run (e.g. on Ctrl-C).
    pub fn shutdown(&self) { self.root.cancel(); }

    pub fn cancel_token(&self) -> CancellationToken { self.root.clone() }

    /// Ensure a stack record exists; a fresh stack starts `Stopped`.
    async fn stack_record(&self, id: &str) -> ApiResult<StackState> {
        match self.machine.create_state(id, StackState::Stopped.as_str()).await {
            Ok(()) | Err(StateError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let raw = self.machine.get_state(id).await?;
        raw.parse::<StackState>().map_err(|_| ApiError::Internal(format!("stack {} has unknown state {}", id, raw)))
    }

    /// Claim the stack for a run by moving it from `expect` to `claim`.
    async fn claim(&self, id: &str, expect: &[StackState], claim: StackState) -> ApiResult<()> {
        let current = self.stack_record(id).await?;
        if current.is_busy() {
            return Err(ApiError::Conflict(format!("stack {} is {}; another run holds it", id, current)));
        }
        if !expect.contains(&current) {
            return Err(ApiError::InvalidTransition(format!("stack {} is {}, cannot move to {}", id, current, claim)));
        }
        match self.machine.transition_to(id, claim.as_str()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Err(ApiError::Conflict(format!("stack {} was claimed concurrently", id))),
            Err(e) => Err(e.into()),
        }
    }

    async fn run_claimed(&self, graph: &ClusterGraph, opts: &UpOptions) -> ApiResult<UpReport> {
        let id = graph.name();
        let t0 = Instant::now();
        let cancel = self.root.child_token();
        let res = self.orch.up(graph, opts, &cancel).await;
        histogram!("api_stack_up_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let settle = if res.is_ok() { StackState::Running } else { StackState::Stopped };
        if let Err(e) = self.machine.transition_retrying(id, settle.as_str(), 3).await {
            let held = self.machine.get_state(id).await.unwrap_or_else(|_| "unknown".to_string());
            warn!(stack = %id, to = %settle, held = %held, error = %e, "api: could not settle stack state");
            let outcome = match &res {
                Ok(_) => "converged".to_string(),
                Err(run) => format!("failed: {}", run),
            };
            return Err(ApiError::Internal(format!(
                "stack {} run {} but its record is stuck in {} (could not move to {}: {})",
                id, outcome, held, settle, e
            )));
        }
        match res {
            Ok(report) => {
                info!(stack = %id, ticks = report.ticks, took_ms = %t0.elapsed().as_millis(), "api: stack running");
                Ok(report)
            }
            Err(e) => {
                warn!(stack = %id, error = %e, "api: stack run failed");
                Err(e.into())
            }
        }
    }
}

#[async_trait::async_trait]
impl AmpApi for InProcApi {
    async fn create_state(&self, id: &str, initial: &str) -> ApiResult<()> {
        Ok(self.machine.create_state(id, initial).await?)
    }

    async fn get_state(&self, id: &str) -> ApiResult<String> { Ok(self.machine.get_state(id).await?) }

    async fn transition(&self, id: &str, to: &str) -> ApiResult<String> {
        Ok(self.machine.transition_to(id, to).await?)
    }

    async fn delete_state(&self, id: &str) -> ApiResult<()> { Ok(self.machine.delete_state(id).await?) }

    async fn stack_up(&self, graph: &ClusterGraph, opts: UpOptions) -> ApiResult<UpReport> {
        info!(stack = %graph.name(), "api: stack_up start");
        self.claim(graph.name(), &[StackState::Stopped], StackState::Starting).await?;
        self.run_claimed(graph, &opts).await
    }

    async fn stack_down(&self, graph: &ClusterGraph) -> ApiResult<DownReport> {
        let id = graph.name();
        info!(stack = %id, "api: stack_down start");
        let held = match self.machine.get_state(id).await {
            Ok(raw) => Some(
                raw.parse::<StackState>()
                    .map_err(|_| ApiError::Internal(format!("stack {} has unknown state {}", id, raw)))?,
            ),
            Err(StateError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(current) = held.filter(|s| s.is_busy()) {
            return Err(ApiError::Conflict(format!("stack {} is {}; another run holds it", id, current)));
        }
        let report = self.orch.down(graph, &self.root.child_token()).await?;
        if held == Some(StackState::Running) {
            match self.machine.transition_from(id, StackState::Running.as_str(), StackState::Stopped.as_str()).await {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    return Err(ApiError::Conflict(format!("stack {} was claimed while it was being taken down", id)))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }

    async fn stack_redeploy(&self, graph: &ClusterGraph, opts: UpOptions) -> ApiResult<UpReport> {
        info!(stack = %graph.name(), "api: stack_redeploy start");
        self.claim(graph.name(), &[StackState::Running], StackState::Redeploying).await?;
        self.run_claimed(graph, &opts).await
    }

    async fn cluster_status(&self, graph: &ClusterGraph) -> ApiResult<ClusterSnapshot> {
        let mut graph = graph.clone();
        self.orch.discover(&mut graph).await?;
        Ok(self.orch.snapshot(&graph).await?)
    }

    async fn monitor(&self, graph: &ClusterGraph, interval: Duration) -> ApiResult<StreamHandle<ClusterSnapshot>> {
        let mut graph = graph.clone();
        self.orch.discover(&mut graph).await?;
        Ok(amp_ops::monitor(self.orch.clone(), graph, interval))
    }

    async fn pull_images(&self, graph: &ClusterGraph) -> ApiResult<PullReport> {
        let timeout = self.orch.config().pull_timeout;
        Ok(amp_ops::pull_images(self.orch.client().clone(), &graph.images(), timeout).await)
    }

    async fn remove_volumes(&self, graph: &ClusterGraph) -> ApiResult<Vec<String>> {
        let left = amp_ops::remove_volumes(
            self.orch.client().as_ref(),
            graph.volumes(),
            self.orch.config(),
            &self.root.child_token(),
        )
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
        Ok(left)
    }
}

// ----------------- Mock implementation -----------------

/// Canned answers for front-end tests.
#[derive(Debug, Clone, Default)]
pub struct MockApi {
    pub states: std::collections::HashMap<String, String>,
    pub up: Option<UpReport>,
    pub down: Option<DownReport>,
    pub snapshot: Option<ClusterSnapshot>,
    pub pull: PullReport,
    pub volumes_left: Vec<String>,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }
}

#[async_trait::async_trait]
impl AmpApi for MockApi {
    async fn create_state(&self, id: &str, _initial: &str) -> ApiResult<()> {
        if self.states.contains_key(id) {
            return Err(ApiError::Conflict(format!("state already exists for {}", id)));
        }
        Ok(())
    }

    async fn get_state(&self, id: &str) -> ApiResult<String> {
        self.states.get(id).cloned().ok_or_else(|| ApiError::NotFound(id.to_string()))
    }

    async fn transition(&self, id: &str, _to: &str) -> ApiResult<String> { self.get_state(id).await }

    async fn delete_state(&self, id: &str) -> ApiResult<()> { self.get_state(id).await.map(|_| ()) }

    async fn stack_up(&self, _graph: &ClusterGraph, _opts: UpOptions) -> ApiResult<UpReport> {
        self.up.clone().ok_or_else(|| ApiError::Internal("no up report configured".into()))
    }

    async fn stack_down(&self, _graph: &ClusterGraph) -> ApiResult<DownReport> {
        Ok(self.down.clone().unwrap_or_default())
    }

    async fn stack_redeploy(&self, graph: &ClusterGraph, opts: UpOptions) -> ApiResult<UpReport> {
        self.stack_up(graph, opts).await
    }

    async fn cluster_status(&self, _graph: &ClusterGraph) -> ApiResult<ClusterSnapshot> {
        self.snapshot.clone().ok_or_else(|| ApiError::NotFound("no snapshot".into()))
    }

    async fn monitor(&self, _graph: &ClusterGraph, _interval: Duration) -> ApiResult<StreamHandle<ClusterSnapshot>> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        if let Some(snap) = self.snapshot.clone() {
            let _ = tx.try_send(snap);
        }
        Ok(StreamHandle { rx, cancel: CancelHandle::noop() })
    }

    async fn pull_images(&self, _graph: &ClusterGraph) -> ApiResult<PullReport> { Ok(self.pull.clone()) }

    async fn remove_volumes(&self, _graph: &ClusterGraph) -> ApiResult<Vec<String>> { Ok(self.volumes_left.clone()) }
}
