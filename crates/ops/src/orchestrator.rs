//! Dependency-ordered orchestration of a service graph.
//!
//! `up` is a level-triggered loop: every tick re-reads task state from the
//! substrate, so a restarted run adopts what an earlier run created and
//! missed observations heal on the next tick. One loop owns all
//! [`ServiceRuntimeState`]; task listings are fetched concurrently but applied
//! serially.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use amp_core::{
    ClusterGraph, ClusterSnapshot, DiscoveredService, GraphError, ServiceLifecycle, ServiceRuntimeState, ServiceSpec,
    StatusRow, AggregateStatus, LABEL_SERVICE,
};
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provision::{ensure_networks, pull_one};
use crate::status::{aggregate, row_from_discovered, rows_for_graph, StatusBoard};
use crate::substrate::{count_tasks, ServiceCreate, SubstrateClient, SubstrateService};
use crate::OrchestratorConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpOptions {
    /// Turn image-missing and startup-timeout failures into `Forced` services.
    pub force: bool,
    /// Never pull; only images already present count.
    pub local: bool,
    /// Log every service's lifecycle each tick.
    pub verbose: bool,
    /// No per-tick logging at all.
    pub silence: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpReport {
    pub ticks: u64,
    pub ready: Vec<String>,
    pub forced: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("image {image} for service {service} is not available locally")]
    ImageMissing { service: String, image: String },
    #[error("service {service} kept failing for {}s", .waited.as_secs())]
    ServiceStartupTimeout { service: String, waited: Duration },
    #[error("orchestration cancelled")]
    Cancelled,
    #[error("substrate: {0}")]
    Substrate(String),
}

impl OrchestratorError {
    fn substrate(e: anyhow::Error) -> Self { OrchestratorError::Substrate(format!("{:#}", e)) }
}

pub struct Orchestrator {
    client: Arc<dyn SubstrateClient>,
    cfg: OrchestratorConfig,
    board: Arc<StatusBoard>,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn SubstrateClient>, cfg: OrchestratorConfig) -> Self {
        Self { client, cfg, board: Arc::new(StatusBoard::new()) }
    }

    pub fn client(&self) -> &Arc<dyn SubstrateClient> { &self.client }

    pub fn config(&self) -> &OrchestratorConfig { &self.cfg }

    /// Snapshots published by `up`, one per tick.
    pub fn board(&self) -> &Arc<StatusBoard> { &self.board }

    /// Merge services created outside AMP into `graph` so status output can
    /// show them. They never take part in orchestration.
    pub async fn discover(&self, graph: &mut ClusterGraph) -> Result<usize, OrchestratorError> {
        let services = self.client.list_services().await.map_err(OrchestratorError::substrate)?;
        let mut merged = 0;
        for svc in services.into_iter().filter(|s| s.is_external()) {
            let d = DiscoveredService { id: svc.id, name: svc.name, image: svc.image, replicas: svc.replicas };
            if graph.merge_discovered(d) {
                merged += 1;
            }
        }
        debug!(graph = %graph.name(), merged, "orchestrator: discovered user services");
        Ok(merged)
    }

    /// Converge `graph` until every declared service is ready or forced.
    pub async fn up(
        &self,
        graph: &ClusterGraph,
        opts: &UpOptions,
        cancel: &CancellationToken,
    ) -> Result<UpReport, OrchestratorError> {
        let t0 = std::time::Instant::now();
        info!(graph = %graph.name(), services = graph.len(), force = opts.force, local = opts.local, "orchestrator: up start");
        ensure_networks(self.client.as_ref(), graph.networks()).await.map_err(OrchestratorError::substrate)?;

        let mut states: BTreeMap<String, ServiceRuntimeState> =
            graph.services().map(|s| (s.name.clone(), ServiceRuntimeState::new(s.name.clone(), s.replicas))).collect();
        self.adopt_existing(graph, &mut states).await?;

        let mut ticks = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            ticks += 1;
            counter!("orchestrator_ticks_total", 1u64);
            self.tick(graph, &mut states, opts).await?;
            self.board.publish(rows_for_graph(graph, |n| states.get(n)));
            log_tick(graph, &states, ticks, opts);

            if states.values().all(|s| s.lifecycle.satisfies_dependents()) {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = tokio::time::sleep(self.cfg.tick) => {}
            }
        }

        let mut report = UpReport { ticks, ..UpReport::default() };
        for name in graph.order() {
            match states.get(name).map(|s| s.lifecycle) {
                Some(ServiceLifecycle::Forced) => report.forced.push(name.clone()),
                Some(_) => report.ready.push(name.clone()),
                None => {}
            }
        }
        histogram!("orchestrator_up_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            graph = %graph.name(),
            ticks,
            ready = report.ready.len(),
            forced = report.forced.len(),
            took_ms = %t0.elapsed().as_millis(),
            "orchestrator: up converged"
        );
        Ok(report)
    }

    /// Record ids of declared services that already exist, e.g. from an
    /// interrupted earlier run.
    async fn adopt_existing(
        &self,
        graph: &ClusterGraph,
        states: &mut BTreeMap<String, ServiceRuntimeState>,
    ) -> Result<(), OrchestratorError> {
        let existing = self.client.list_services().await.map_err(OrchestratorError::substrate)?;
        for svc in existing {
            let Some(name) = declared_name(graph, &svc) else { continue };
            if let Some(st) = states.get_mut(&name) {
                if !svc.belongs_to(graph.name()) {
                    warn!(service = %name, "orchestrator: adopting service not labelled for this graph");
                }
                debug!(service = %name, id = %svc.id, "orchestrator: adopted existing service");
                st.substrate_id = Some(svc.id);
                st.lifecycle = ServiceLifecycle::Starting;
            }
        }
        Ok(())
    }

    async fn tick(
        &self,
        graph: &ClusterGraph,
        states: &mut BTreeMap<String, ServiceRuntimeState>,
        opts: &UpOptions,
    ) -> Result<(), OrchestratorError> {
        self.forget_vanished(states).await;

        // Observe every created, non-forced service concurrently.
        let targets: Vec<(String, String)> = states
            .values()
            .filter(|s| s.lifecycle != ServiceLifecycle::Forced)
            .filter_map(|s| s.substrate_id.clone().map(|id| (s.name.clone(), id)))
            .collect();
        let client = self.client.clone();
        let observed = join_all(targets.into_iter().map(|(name, id)| {
            let client = client.clone();
            async move { (name, client.list_tasks(&id).await) }
        }))
        .await;
        let now = Instant::now();
        for (name, res) in observed {
            let Some(st) = states.get_mut(&name) else { continue };
            match res {
                Ok(tasks) => apply_observation(st, count_tasks(&tasks), now),
                Err(e) => debug!(service = %name, error = %e, "orchestrator: task listing failed; retry next tick"),
            }
        }

        for spec in graph.services() {
            let ready_to_start = dependencies_satisfied(spec, states)?;
            let Some(st) = states.get_mut(&spec.name) else { continue };
            st.ready_to_start = ready_to_start;
            if !st.is_created() && st.lifecycle == ServiceLifecycle::NotStarted {
                if !ready_to_start {
                    debug!(service = %spec.name, "orchestrator: waiting on dependencies");
                    continue;
                }
                self.start_service(graph, spec, st, opts).await?;
            }
            self.check_failure_timeout(st, now, opts)?;
        }
        Ok(())
    }

    /// Services removed from the substrate behind our back go back to
    /// `NotStarted` so the start pass re-creates them.
    async fn forget_vanished(&self, states: &mut BTreeMap<String, ServiceRuntimeState>) {
        let existing = match self.client.list_services().await {
            Ok(services) => services,
            Err(e) => {
                debug!(error = %e, "orchestrator: service listing failed; retry next tick");
                return;
            }
        };
        for st in states.values_mut().filter(|s| s.lifecycle != ServiceLifecycle::Forced) {
            let Some(id) = st.substrate_id.as_deref() else { continue };
            if existing.iter().any(|svc| svc.id == id) {
                continue;
            }
            warn!(service = %st.name, id = %id, "orchestrator: service vanished from substrate; will re-create");
            let desired = st.desired;
            *st = ServiceRuntimeState::new(st.name.clone(), desired);
        }
    }

    async fn start_service(
        &self,
        graph: &ClusterGraph,
        spec: &ServiceSpec,
        st: &mut ServiceRuntimeState,
        opts: &UpOptions,
    ) -> Result<(), OrchestratorError> {
        let present = match self.image_available(&spec.image, opts).await {
            Ok(p) => p,
            Err(e) => {
                debug!(service = %spec.name, error = %e, "orchestrator: image check failed; retry next tick");
                return Ok(());
            }
        };
        if !present {
            if !opts.force {
                return Err(OrchestratorError::ImageMissing { service: spec.name.clone(), image: spec.image.clone() });
            }
            warn!(service = %spec.name, image = %spec.image, "orchestrator: image missing; service forced");
            self.force(st);
            return Ok(());
        }
        match self.client.create_service(ServiceCreate::from_spec(graph.name(), spec)).await {
            Ok(id) => {
                counter!("orchestrator_service_created_total", 1u64);
                info!(service = %spec.name, id = %id, "orchestrator: service created");
                st.substrate_id = Some(id);
                st.lifecycle = ServiceLifecycle::Starting;
            }
            Err(e) => warn!(service = %spec.name, error = %e, "orchestrator: create failed; retry next tick"),
        }
        Ok(())
    }

    /// Local lookup first; unless `local`, one bounded pull attempt.
    async fn image_available(&self, image: &str, opts: &UpOptions) -> anyhow::Result<bool> {
        if self.client.image_exists(image).await? {
            return Ok(true);
        }
        if opts.local {
            return Ok(false);
        }
        info!(image = %image, "orchestrator: pulling missing image");
        match tokio::time::timeout(self.cfg.pull_timeout, pull_one(self.client.as_ref(), image)).await {
            Ok(Ok(())) => self.client.image_exists(image).await,
            Ok(Err(e)) => {
                warn!(image = %image, error = %e, "orchestrator: pull failed");
                Ok(false)
            }
            Err(_) => {
                warn!(image = %image, "orchestrator: pull timed out");
                Ok(false)
            }
        }
    }

    fn check_failure_timeout(
        &self,
        st: &mut ServiceRuntimeState,
        now: Instant,
        opts: &UpOptions,
    ) -> Result<(), OrchestratorError> {
        if st.lifecycle != ServiceLifecycle::Failing {
            return Ok(());
        }
        let Some(since) = st.first_failure_at else { return Ok(()) };
        let waited = now.saturating_duration_since(since);
        if waited <= self.cfg.failure_timeout {
            return Ok(());
        }
        if !opts.force {
            return Err(OrchestratorError::ServiceStartupTimeout { service: st.name.clone(), waited });
        }
        warn!(service = %st.name, waited_secs = waited.as_secs(), "orchestrator: startup timeout; service forced");
        self.force(st);
        Ok(())
    }

    fn force(&self, st: &mut ServiceRuntimeState) {
        counter!("orchestrator_service_forced_total", 1u64);
        st.lifecycle = ServiceLifecycle::Forced;
    }

    /// Remove every declared service labelled for this graph, in reverse
    /// dependency order. Failures are reported, not fatal.
    pub async fn down(&self, graph: &ClusterGraph, cancel: &CancellationToken) -> Result<DownReport, OrchestratorError> {
        let t0 = std::time::Instant::now();
        let existing = self.client.list_services().await.map_err(OrchestratorError::substrate)?;
        let ours: Vec<&SubstrateService> =
            existing.iter().filter(|s| s.belongs_to(graph.name()) && graph.contains(&s.name)).collect();
        let mut report = DownReport::default();
        for name in graph.order().iter().rev() {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if !ours.iter().any(|s| &s.name == name) {
                continue;
            }
            match self.client.remove_service(name).await {
                Ok(()) => {
                    info!(service = %name, "orchestrator: service removed");
                    report.removed.push(name.clone());
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "orchestrator: removal failed");
                    report.failed.push((name.clone(), format!("{:#}", e)));
                }
            }
        }
        info!(
            graph = %graph.name(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            took_ms = %t0.elapsed().as_millis(),
            "orchestrator: down done"
        );
        Ok(report)
    }

    /// Read-only: which declared services exist right now.
    pub async fn status(&self, graph: &ClusterGraph) -> Result<AggregateStatus, OrchestratorError> {
        let existing = self.client.list_services().await.map_err(OrchestratorError::substrate)?;
        let present = graph.order().iter().filter(|n| existing.iter().any(|s| &s.name == *n)).count();
        Ok(aggregate(present, graph.len()))
    }

    /// Live status rows from the substrate, declared services first, then
    /// discovered user services. Does not publish to the board.
    pub async fn snapshot(&self, graph: &ClusterGraph) -> Result<ClusterSnapshot, OrchestratorError> {
        let existing = self.client.list_services().await.map_err(OrchestratorError::substrate)?;
        let mut states: BTreeMap<String, ServiceRuntimeState> = BTreeMap::new();
        for spec in graph.services() {
            let mut st = ServiceRuntimeState::new(spec.name.clone(), spec.replicas);
            if let Some(svc) = existing.iter().find(|s| s.name == spec.name) {
                st.substrate_id = Some(svc.id.clone());
                st.lifecycle = ServiceLifecycle::Starting;
            }
            states.insert(spec.name.clone(), st);
        }
        let ids: Vec<(String, String)> =
            states.values().filter_map(|s| s.substrate_id.clone().map(|id| (s.name.clone(), id))).collect();
        let client = self.client.clone();
        let observed = join_all(ids.into_iter().map(|(name, id)| {
            let client = client.clone();
            async move { (name, client.list_tasks(&id).await) }
        }))
        .await;
        for (name, res) in observed {
            if let (Some(st), Ok(tasks)) = (states.get_mut(&name), res) {
                let (ok, failed) = count_tasks(&tasks);
                st.ok_tasks = ok;
                st.failed_tasks = failed;
            }
        }
        let mut rows: Vec<StatusRow> = rows_for_graph(graph, |n| states.get(n));
        for d in graph.discovered() {
            let (ok, failed) = match self.client.list_tasks(&d.id).await {
                Ok(tasks) => count_tasks(&tasks),
                Err(_) => (0, 0),
            };
            rows.push(row_from_discovered(d, ok, failed));
        }
        let present = states.values().filter(|s| s.is_created()).count();
        Ok(ClusterSnapshot {
            epoch: 0,
            taken_at_ms: chrono::Utc::now().timestamp_millis(),
            rows,
            aggregate: aggregate(present, graph.len()),
        })
    }
}

/// Declared service name carried by `svc`: the service label when present,
/// else the substrate name.
fn declared_name(graph: &ClusterGraph, svc: &SubstrateService) -> Option<String> {
    let name = svc.label(LABEL_SERVICE).unwrap_or(&svc.name);
    graph.contains(name).then(|| name.to_string())
}

fn dependencies_satisfied(
    spec: &ServiceSpec,
    states: &BTreeMap<String, ServiceRuntimeState>,
) -> Result<bool, OrchestratorError> {
    for dep in &spec.dependencies {
        match states.get(dep) {
            None => {
                return Err(GraphError::DependencyNotFound { service: spec.name.clone(), dependency: dep.clone() }.into())
            }
            Some(d) if !d.lifecycle.satisfies_dependents() => return Ok(false),
            Some(_) => {}
        }
    }
    Ok(true)
}

fn log_tick(graph: &ClusterGraph, states: &BTreeMap<String, ServiceRuntimeState>, tick: u64, opts: &UpOptions) {
    if opts.silence {
        return;
    }
    if opts.verbose {
        for st in graph.order().iter().filter_map(|n| states.get(n)) {
            info!(
                tick,
                service = %st.name,
                lifecycle = %st.lifecycle,
                ok = st.ok_tasks,
                failed = st.failed_tasks,
                "orchestrator: service state"
            );
        }
    }
    let up = states.values().filter(|s| s.lifecycle.satisfies_dependents()).count();
    debug!(tick, up, total = states.len(), "orchestrator: tick done");
}

/// Re-derive lifecycle from one task listing. The failure streak only
/// resets once the service is ready again.
fn apply_observation(st: &mut ServiceRuntimeState, (ok, failed): (u32, u32), now: Instant) {
    st.ok_tasks = ok;
    st.failed_tasks = failed;
    if ok > 0 {
        st.lifecycle = ServiceLifecycle::Ready;
        st.first_failure_at = None;
    } else if failed > 0 {
        st.lifecycle = ServiceLifecycle::Failing;
        st.first_failure_at.get_or_insert(now);
    } else if st.lifecycle != ServiceLifecycle::Failing {
        st.lifecycle = ServiceLifecycle::Starting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    fn logged_tick(opts: &UpOptions) -> String {
        let graph = ClusterGraph::new("amp", vec![ServiceSpec::new("etcd", "etcd")], vec![], vec![]).unwrap();
        let mut states = BTreeMap::new();
        states.insert("etcd".to_string(), ServiceRuntimeState::new("etcd", 1));
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || log_tick(&graph, &states, 1, opts));
        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn tick_logging_follows_verbose_and_silence() {
        let plain = logged_tick(&UpOptions::default());
        assert!(plain.contains("tick done"), "{plain}");
        assert!(!plain.contains("service state"), "{plain}");

        let verbose = logged_tick(&UpOptions { verbose: true, ..UpOptions::default() });
        assert!(verbose.contains("service state"), "{verbose}");
        assert!(verbose.contains("etcd"), "{verbose}");

        let silent = logged_tick(&UpOptions { verbose: true, silence: true, ..UpOptions::default() });
        assert!(silent.is_empty(), "{silent}");
    }

    #[test]
    fn failure_streak_survives_pending_ticks() {
        let t0 = Instant::now();
        let mut st = ServiceRuntimeState::new("etcd", 1);
        st.substrate_id = Some("x".into());
        apply_observation(&mut st, (0, 1), t0);
        assert_eq!(st.lifecycle, ServiceLifecycle::Failing);
        apply_observation(&mut st, (0, 0), t0 + Duration::from_secs(5));
        assert_eq!(st.lifecycle, ServiceLifecycle::Failing);
        assert_eq!(st.first_failure_at, Some(t0));
        apply_observation(&mut st, (1, 1), t0 + Duration::from_secs(6));
        assert_eq!(st.lifecycle, ServiceLifecycle::Ready);
        assert_eq!(st.first_failure_at, None);
    }
}
