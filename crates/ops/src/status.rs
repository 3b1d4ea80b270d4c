//! Status derivation and the published cluster snapshot.
//!
//! Everything in here except [`StatusBoard`] is pure; it can be called at any
//! rate from monitor loops without touching orchestration state.

use std::sync::Arc;

use amp_core::columns::id_prefix;
use amp_core::{
    AggregateStatus, ClusterGraph, ClusterSnapshot, DiscoveredService, ServiceLifecycle, ServiceMode,
    ServiceRuntimeState, ServiceStatus, Severity, StatusRow,
};
use arc_swap::ArcSwap;
use tokio::sync::watch;

/// `running` when at least `desired` tasks run (or any task runs for a
/// global service), `failing` when nothing runs but something failed,
/// `partially running` when some but not all replicas run.
pub fn derive_status(ok: u32, desired: u32, failed: u32) -> ServiceStatus {
    if (desired > 0 && ok >= desired) || (desired == 0 && ok > 0) {
        ServiceStatus::Running
    } else if ok == 0 && failed > 0 {
        ServiceStatus::Failing
    } else if ok > 0 && ok < desired {
        ServiceStatus::PartiallyRunning
    } else {
        ServiceStatus::Stopped
    }
}

/// Aggregate over declared services by existence on the substrate.
/// An empty graph counts as stopped.
pub fn aggregate(existing: usize, declared: usize) -> AggregateStatus {
    if declared == 0 || existing == 0 {
        AggregateStatus::Stopped
    } else if existing >= declared {
        AggregateStatus::Running
    } else {
        AggregateStatus::PartiallyRunning
    }
}

pub fn severity(status: ServiceStatus, forced: bool) -> Severity {
    if forced {
        return Severity::Warn;
    }
    match status {
        ServiceStatus::Running => Severity::Success,
        ServiceStatus::Failing => Severity::Error,
        ServiceStatus::PartiallyRunning => Severity::Warn,
        ServiceStatus::Starting => Severity::Info,
        ServiceStatus::Stopped => Severity::Regular,
    }
}

fn mode(desired: u32) -> ServiceMode { if desired == 0 { ServiceMode::Global } else { ServiceMode::Replicated } }

/// Row for a declared service from the orchestrator's own bookkeeping.
pub fn row_from_runtime(state: &ServiceRuntimeState) -> StatusRow {
    let forced = state.lifecycle == ServiceLifecycle::Forced;
    let mut status = derive_status(state.ok_tasks, state.desired, state.failed_tasks);
    if status == ServiceStatus::Stopped && state.lifecycle == ServiceLifecycle::Starting {
        status = ServiceStatus::Starting;
    }
    StatusRow {
        id: state.substrate_id.as_deref().map(id_prefix).unwrap_or_default(),
        name: state.name.clone(),
        status,
        mode: mode(state.desired),
        ok: state.ok_tasks,
        desired: state.desired,
        failed: state.failed_tasks,
        forced,
        user: false,
        severity: severity(status, forced),
    }
}

/// Row for a pre-existing service the graph does not declare.
pub fn row_from_discovered(svc: &DiscoveredService, ok: u32, failed: u32) -> StatusRow {
    let desired = svc.replicas.unwrap_or(0);
    let status = derive_status(ok, desired, failed);
    StatusRow {
        id: id_prefix(&svc.id),
        name: svc.name.clone(),
        status,
        mode: mode(desired),
        ok,
        desired,
        failed,
        forced: false,
        user: true,
        severity: severity(status, false),
    }
}

/// Declared rows in dependency order. `states` may miss services that were
/// never observed; those render as stopped.
pub fn rows_for_graph<'a>(
    graph: &ClusterGraph,
    mut lookup: impl FnMut(&str) -> Option<&'a ServiceRuntimeState>,
) -> Vec<StatusRow> {
    graph
        .services()
        .map(|spec| match lookup(&spec.name) {
            Some(st) => row_from_runtime(st),
            None => row_from_runtime(&ServiceRuntimeState::new(spec.name.clone(), spec.replicas)),
        })
        .collect()
}

/// Aggregate from rows: declared rows with an id exist on the substrate.
pub fn aggregate_rows(rows: &[StatusRow]) -> AggregateStatus {
    let declared = rows.iter().filter(|r| !r.user);
    let (existing, total) = declared.fold((0, 0), |(e, t), r| (e + !r.id.is_empty() as usize, t + 1));
    aggregate(existing, total)
}

pub fn exit_code(agg: AggregateStatus) -> i32 { agg.exit_code() }

/// Latest snapshot plus an epoch channel. The orchestrator publishes once per
/// tick; readers load without blocking it and wait on the epoch for changes.
pub struct StatusBoard {
    current: ArcSwap<ClusterSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for StatusBoard {
    fn default() -> Self { Self::new() }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self { current: ArcSwap::from_pointee(ClusterSnapshot::default()), epoch_tx }
    }

    pub fn publish(&self, rows: Vec<StatusRow>) -> u64 {
        let epoch = self.current.load().epoch + 1;
        let aggregate = aggregate_rows(&rows);
        let snap = ClusterSnapshot { epoch, taken_at_ms: chrono::Utc::now().timestamp_millis(), rows, aggregate };
        self.current.store(Arc::new(snap));
        let _ = self.epoch_tx.send(epoch);
        epoch
    }

    pub fn load(&self) -> Arc<ClusterSnapshot> { self.current.load_full() }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}
