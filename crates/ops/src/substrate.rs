//! Container substrate boundary (services, tasks, networks, volumes, images).

use amp_core::{Mount, ServiceSpec, LABEL_GRAPH, LABEL_SERVICE};
use anyhow::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Preparing,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Orphaned,
}

impl TaskState {
    /// Desired states that mean the scheduler gave up on the task.
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, TaskState::Shutdown | TaskState::Failed | TaskState::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskObservation {
    pub desired: TaskState,
    pub observed: TaskState,
}

impl TaskObservation {
    pub fn new(desired: TaskState, observed: TaskState) -> Self { Self { desired, observed } }

    pub fn is_ok(&self) -> bool { self.desired == TaskState::Running && self.observed == TaskState::Running }

    pub fn is_failed(&self) -> bool { self.desired.is_terminal_failure() }
}

/// (ok, failed) task counts.
pub fn count_tasks(tasks: &[TaskObservation]) -> (u32, u32) {
    tasks.iter().fold((0, 0), |(ok, failed), t| (ok + t.is_ok() as u32, failed + t.is_failed() as u32))
}

pub type Labels = SmallVec<[(String, String); 2]>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstrateService {
    pub id: String,
    pub name: String,
    pub image: String,
    /// `None` for global services.
    pub replicas: Option<u32>,
    pub labels: Labels,
}

impl SubstrateService {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Created by an orchestration run of `graph`.
    pub fn belongs_to(&self, graph: &str) -> bool { self.label(LABEL_GRAPH) == Some(graph) }

    /// Carries no graph label at all: created outside of AMP.
    pub fn is_external(&self) -> bool { self.label(LABEL_GRAPH).is_none() }
}

/// Create request derived from a declared service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCreate {
    pub name: String,
    pub image: String,
    pub replicas: Option<u32>,
    pub networks: Vec<String>,
    pub mounts: Vec<Mount>,
    pub constraints: Vec<String>,
    pub labels: Labels,
}

impl ServiceCreate {
    pub fn from_spec(graph: &str, spec: &ServiceSpec) -> Self {
        let mut labels = Labels::new();
        labels.push((LABEL_GRAPH.to_string(), graph.to_string()));
        labels.push((LABEL_SERVICE.to_string(), spec.name.clone()));
        Self {
            name: spec.name.clone(),
            image: spec.image.clone(),
            replicas: if spec.is_global() { None } else { Some(spec.replicas) },
            networks: spec.networks.clone(),
            mounts: spec.mounts.clone(),
            constraints: spec.constraints.clone(),
            labels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    pub image: String,
    pub status: String,
}

/// Operations the orchestrator needs from the container engine. Errors are
/// treated as transient by the control loop unless stated otherwise.
#[async_trait::async_trait]
pub trait SubstrateClient: Send + Sync {
    async fn list_services(&self) -> Result<Vec<SubstrateService>>;
    /// Returns the new service id.
    async fn create_service(&self, spec: ServiceCreate) -> Result<String>;
    async fn remove_service(&self, name: &str) -> Result<()>;
    async fn list_tasks(&self, service_id: &str) -> Result<Vec<TaskObservation>>;

    async fn list_networks(&self) -> Result<Vec<String>>;
    async fn create_network(&self, name: &str) -> Result<()>;

    async fn list_volumes(&self) -> Result<Vec<String>>;
    /// May fail while the volume is still in use.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    async fn pull_image(&self, reference: &str) -> Result<BoxStream<'static, Result<PullProgress>>>;
    /// Repo tags of local images matching `reference`.
    async fn list_images(&self, reference: &str) -> Result<Vec<String>>;

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(!self.list_images(reference).await?.is_empty())
    }
}

/// `nginx` and `nginx:latest` name the same image.
pub fn normalize_image(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') || last.contains('@') { reference.to_string() } else { format!("{}:latest", reference) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_classification() {
        use TaskState::*;
        let tasks = [
            TaskObservation::new(Running, Running),
            TaskObservation::new(Running, Starting),
            TaskObservation::new(Shutdown, Failed),
            TaskObservation::new(Rejected, Rejected),
            TaskObservation::new(Shutdown, Complete),
        ];
        assert_eq!(count_tasks(&tasks), (1, 3));
    }

    #[test]
    fn create_request_is_labelled() {
        let spec = ServiceSpec::new("agent", "amp/agent").global();
        let req = ServiceCreate::from_spec("amp", &spec);
        assert_eq!(req.replicas, None);
        let svc = SubstrateService { id: "1".into(), name: req.name, image: req.image, replicas: None, labels: req.labels };
        assert!(svc.belongs_to("amp"));
        assert!(!svc.belongs_to("other"));
        assert_eq!(svc.label(LABEL_SERVICE), Some("agent"));
    }

    #[test]
    fn image_normalization() {
        assert_eq!(normalize_image("nginx"), "nginx:latest");
        assert_eq!(normalize_image("nginx:1.25"), "nginx:1.25");
        assert_eq!(normalize_image("registry:5000/amp/etcd"), "registry:5000/amp/etcd:latest");
    }
}
