//! Simulated substrate for tests and the CLI's local mode.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use amp_core::ClusterGraph;
use anyhow::{anyhow, bail, Result};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use crate::substrate::{
    normalize_image, Labels, PullProgress, ServiceCreate, SubstrateClient, SubstrateService, TaskObservation, TaskState,
};

/// How a simulated service's tasks evolve, counted in `list_tasks` polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Pending until `after_polls` polls happened, then every replica runs.
    Healthy { after_polls: u32 },
    /// Every task is rejected, forever.
    Failing,
    /// Failing for `polls` polls, then healthy.
    FlakyThenHealthy { polls: u32 },
}

impl Default for Behavior {
    fn default() -> Self { Behavior::Healthy { after_polls: 1 } }
}

#[derive(Debug)]
struct SimService {
    svc: SubstrateService,
    behavior: Behavior,
    polls: u32,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    services: BTreeMap<String, SimService>,
    behaviors: HashMap<String, Behavior>,
    networks: BTreeSet<String>,
    /// name -> remaining failed removal attempts.
    volumes: BTreeMap<String, u32>,
    images: BTreeSet<String>,
    pullable: BTreeSet<String>,
    pull_delay: HashMap<String, Duration>,
    fail_removal: BTreeSet<String>,
    created: Vec<String>,
    removed: Vec<String>,
    task_errors: u32,
    nodes: u32,
}

/// In-memory [`SubstrateClient`]. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct MemorySubstrate {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemorySubstrate {
    fn default() -> Self { Self::new() }
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner { nodes: 1, ..Inner::default() })) }
    }

    /// Every image of `graph` present locally and every service healthy
    /// after its first poll.
    pub fn seeded_from(graph: &ClusterGraph) -> Self {
        let me = Self::new();
        for image in graph.images() {
            me.add_image(&image);
        }
        me
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("substrate state lock poisoned"))
    }

    // Setup helpers recover a poisoned lock; they never run inside the control loop.
    fn setup(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn add_image(&self, reference: &str) -> &Self {
        self.setup().images.insert(normalize_image(reference));
        self
    }

    /// Make `reference` available to `pull_image`, optionally taking `delay`.
    pub fn add_pullable(&self, reference: &str, delay: Option<Duration>) -> &Self {
        let mut g = self.setup();
        let r = normalize_image(reference);
        if let Some(d) = delay {
            g.pull_delay.insert(r.clone(), d);
        }
        g.pullable.insert(r);
        self
    }

    pub fn set_behavior(&self, service: &str, behavior: Behavior) -> &Self {
        self.setup().behaviors.insert(service.to_string(), behavior);
        self
    }

    pub fn set_nodes(&self, nodes: u32) -> &Self {
        self.setup().nodes = nodes.max(1);
        self
    }

    /// Volume that refuses removal `busy_attempts` times before going away.
    pub fn add_volume(&self, name: &str, busy_attempts: u32) -> &Self {
        self.setup().volumes.insert(name.to_string(), busy_attempts);
        self
    }

    pub fn add_network(&self, name: &str) -> &Self {
        self.setup().networks.insert(name.to_string());
        self
    }

    pub fn fail_removal_of(&self, name: &str) -> &Self {
        self.setup().fail_removal.insert(name.to_string());
        self
    }

    /// Next `n` `list_tasks` calls fail, whatever the service.
    pub fn fail_task_listing(&self, n: u32) -> &Self {
        self.setup().task_errors = n;
        self
    }

    /// Pre-existing service, e.g. created by a user or an earlier run.
    pub fn insert_service(&self, name: &str, image: &str, replicas: Option<u32>, labels: Labels) -> String {
        let mut g = self.setup();
        g.next_id += 1;
        let id = format!("{:012x}{:04}", g.next_id, 0);
        let behavior = g.behaviors.get(name).copied().unwrap_or_default();
        let svc = SubstrateService { id: id.clone(), name: name.to_string(), image: image.to_string(), replicas, labels };
        g.services.insert(name.to_string(), SimService { svc, behavior, polls: 0 });
        id
    }

    /// Names passed to `create_service`, in call order.
    pub fn created(&self) -> Vec<String> { self.setup().created.clone() }

    pub fn removed(&self) -> Vec<String> { self.setup().removed.clone() }

    pub fn service_names(&self) -> Vec<String> { self.setup().services.keys().cloned().collect() }

    pub fn networks(&self) -> Vec<String> { self.setup().networks.iter().cloned().collect() }

    pub fn has_image(&self, reference: &str) -> bool { self.setup().images.contains(&normalize_image(reference)) }
}

fn simulate(sim: &SimService, nodes: u32) -> Vec<TaskObservation> {
    let replicas = sim.svc.replicas.unwrap_or(nodes);
    let healthy = match sim.behavior {
        Behavior::Healthy { after_polls } => Some(sim.polls >= after_polls),
        Behavior::Failing => None,
        Behavior::FlakyThenHealthy { polls } => (sim.polls > polls).then_some(true),
    };
    let task = match healthy {
        Some(true) => TaskObservation::new(TaskState::Running, TaskState::Running),
        Some(false) => TaskObservation::new(TaskState::Running, TaskState::Pending),
        None => TaskObservation::new(TaskState::Shutdown, TaskState::Rejected),
    };
    vec![task; replicas as usize]
}

#[async_trait::async_trait]
impl SubstrateClient for MemorySubstrate {
    async fn list_services(&self) -> Result<Vec<SubstrateService>> {
        Ok(self.lock()?.services.values().map(|s| s.svc.clone()).collect())
    }

    async fn create_service(&self, spec: ServiceCreate) -> Result<String> {
        let mut g = self.lock()?;
        if g.services.contains_key(&spec.name) {
            bail!("service {} already exists", spec.name);
        }
        if !g.images.contains(&normalize_image(&spec.image)) {
            bail!("no such image: {}", spec.image);
        }
        g.next_id += 1;
        let id = format!("{:012x}{:04}", g.next_id, g.created.len());
        let behavior = g.behaviors.get(&spec.name).copied().unwrap_or_default();
        let svc = SubstrateService {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image,
            replicas: spec.replicas,
            labels: spec.labels,
        };
        g.created.push(spec.name.clone());
        g.services.insert(spec.name, SimService { svc, behavior, polls: 0 });
        Ok(id)
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        let mut g = self.lock()?;
        if g.fail_removal.contains(name) {
            bail!("removal of {} rejected", name);
        }
        g.services.remove(name).ok_or_else(|| anyhow!("service {} not found", name))?;
        g.removed.push(name.to_string());
        Ok(())
    }

    async fn list_tasks(&self, service_id: &str) -> Result<Vec<TaskObservation>> {
        let mut g = self.lock()?;
        if g.task_errors > 0 {
            g.task_errors -= 1;
            bail!("task listing unavailable");
        }
        let nodes = g.nodes;
        let sim = g
            .services
            .values_mut()
            .find(|s| s.svc.id == service_id)
            .ok_or_else(|| anyhow!("service {} not found", service_id))?;
        sim.polls += 1;
        Ok(simulate(sim, nodes))
    }

    async fn list_networks(&self) -> Result<Vec<String>> { Ok(self.lock()?.networks.iter().cloned().collect()) }

    async fn create_network(&self, name: &str) -> Result<()> {
        if !self.lock()?.networks.insert(name.to_string()) {
            bail!("network {} already exists", name);
        }
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<String>> { Ok(self.lock()?.volumes.keys().cloned().collect()) }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut g = self.lock()?;
        let busy = g.volumes.get_mut(name).ok_or_else(|| anyhow!("volume {} not found", name))?;
        if *busy > 0 {
            *busy -= 1;
            bail!("volume {} is in use", name);
        }
        g.volumes.remove(name);
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<BoxStream<'static, Result<PullProgress>>> {
        let image = normalize_image(reference);
        let delay = {
            let g = self.lock()?;
            if !g.pullable.contains(&image) {
                bail!("pull access denied for {}", reference);
            }
            g.pull_delay.get(&image).copied()
        };
        debug!(image = %image, "substrate: pull start");
        let inner = self.inner.clone();
        let first = PullProgress { image: image.clone(), status: "Pulling fs layer".into() };
        let done = stream::once(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            inner.lock().map_err(|_| anyhow!("substrate state lock poisoned"))?.images.insert(image.clone());
            Ok::<_, anyhow::Error>(PullProgress { image, status: "Downloaded newer image".into() })
        });
        Ok(stream::once(async move { Ok::<_, anyhow::Error>(first) }).chain(done).boxed())
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<String>> {
        let image = normalize_image(reference);
        Ok(self.lock()?.images.iter().filter(|i| **i == image).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthy_service_runs_after_first_poll() {
        let sub = MemorySubstrate::new();
        sub.add_image("etcd");
        let spec = amp_core::ServiceSpec::new("etcd", "etcd").replicas(3);
        let id = sub.create_service(ServiceCreate::from_spec("amp", &spec)).await.unwrap();
        let tasks = sub.list_tasks(&id).await.unwrap();
        assert_eq!(crate::substrate::count_tasks(&tasks), (3, 0));
        assert!(sub.create_service(ServiceCreate::from_spec("amp", &spec)).await.is_err());
    }

    #[tokio::test]
    async fn pull_makes_image_local() {
        let sub = MemorySubstrate::new();
        sub.add_pullable("amp/agent:1.0", None);
        assert!(!sub.has_image("amp/agent:1.0"));
        let events: Vec<_> = sub.pull_image("amp/agent:1.0").await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(sub.has_image("amp/agent:1.0"));
        assert!(sub.pull_image("private/thing").await.is_err());
    }

    #[tokio::test]
    async fn busy_volume_refuses_removal() {
        let sub = MemorySubstrate::new();
        sub.add_volume("data", 1);
        assert!(sub.remove_volume("data").await.is_err());
        sub.remove_volume("data").await.unwrap();
        assert!(sub.list_volumes().await.unwrap().is_empty());
    }
}
