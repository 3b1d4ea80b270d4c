//! Per-service runtime tracking and the derived status vocabulary.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Orchestrator view of one declared service.
///
/// `Ready` and `Failing` are re-derived every tick and may flap; `Forced` is
/// sticky and counts as ready for dependents, but stays distinguishable from
/// a genuinely healthy service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceLifecycle {
    NotStarted,
    Starting,
    Ready,
    Failing,
    Forced,
}

impl ServiceLifecycle {
    pub fn satisfies_dependents(self) -> bool { matches!(self, ServiceLifecycle::Ready | ServiceLifecycle::Forced) }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceLifecycle::NotStarted => "not started",
            ServiceLifecycle::Starting => "starting",
            ServiceLifecycle::Ready => "ready",
            ServiceLifecycle::Failing => "failing",
            ServiceLifecycle::Forced => "forced",
        }
    }
}

impl std::fmt::Display for ServiceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Mutable record owned by the orchestrator control loop. Never persisted.
#[derive(Debug, Clone)]
pub struct ServiceRuntimeState {
    pub name: String,
    pub substrate_id: Option<String>,
    pub lifecycle: ServiceLifecycle,
    pub ready_to_start: bool,
    /// Start of the current uninterrupted failing streak.
    pub first_failure_at: Option<Instant>,
    pub ok_tasks: u32,
    pub failed_tasks: u32,
    /// Declared replicas; 0 for global services.
    pub desired: u32,
}

impl ServiceRuntimeState {
    pub fn new(name: impl Into<String>, desired: u32) -> Self {
        Self {
            name: name.into(),
            substrate_id: None,
            lifecycle: ServiceLifecycle::NotStarted,
            ready_to_start: false,
            first_failure_at: None,
            ok_tasks: 0,
            failed_tasks: 0,
            desired,
        }
    }

    pub fn is_created(&self) -> bool { self.substrate_id.is_some() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Failing,
    PartiallyRunning,
    Starting,
    Stopped,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Failing => "failing",
            ServiceStatus::PartiallyRunning => "partially running",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Running,
    #[default]
    Stopped,
    PartiallyRunning,
}

impl AggregateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateStatus::Running => "running",
            AggregateStatus::Stopped => "stopped",
            AggregateStatus::PartiallyRunning => "partially running",
        }
    }

    /// Process exit code for scripting: 0 only when everything runs.
    pub fn exit_code(self) -> i32 { if self == AggregateStatus::Running { 0 } else { 1 } }
}

impl std::fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    Replicated,
    Global,
}

impl ServiceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceMode::Replicated => "replicated",
            ServiceMode::Global => "global",
        }
    }
}

/// Display severity of a row, mapped to colors by front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Regular,
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRow {
    /// Substrate id prefix; empty when the service does not exist.
    pub id: String,
    pub name: String,
    pub status: ServiceStatus,
    pub mode: ServiceMode,
    pub ok: u32,
    pub desired: u32,
    pub failed: u32,
    pub forced: bool,
    /// Pre-existing service not declared by the graph.
    pub user: bool,
    pub severity: Severity,
}

impl StatusRow {
    /// `ok/desired`, or `ok/global` for global services.
    pub fn replicas(&self) -> String {
        match self.mode {
            ServiceMode::Replicated => format!("{}/{}", self.ok, self.desired),
            ServiceMode::Global => format!("{}/global", self.ok),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub epoch: u64,
    /// Milliseconds since the unix epoch.
    pub taken_at_ms: i64,
    pub rows: Vec<StatusRow>,
    pub aggregate: AggregateStatus,
}
