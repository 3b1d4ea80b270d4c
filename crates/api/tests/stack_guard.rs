use std::sync::Arc;

use amp_api::{AmpApi, ApiError, InProcApi, UpOptions};
use amp_core::{AggregateStatus, ClusterGraph, ServiceSpec, StateStore, StoreError, StoreResult};
use amp_ops::{Behavior, MemorySubstrate, OrchestratorConfig};
use amp_store::MemoryStateStore;

fn graph() -> ClusterGraph {
    ClusterGraph::new(
        "infra",
        vec![
            ServiceSpec::new("etcd", "appcelerator/etcd"),
            ServiceSpec::new("kafka", "appcelerator/kafka").depends_on(["etcd"]),
        ],
        vec![],
        vec!["etcd-data".into()],
    )
    .unwrap()
}

fn api(sub: &MemorySubstrate) -> InProcApi {
    InProcApi::new(Arc::new(MemoryStateStore::new()), Arc::new(sub.clone()), OrchestratorConfig::default())
}

#[tokio::test(start_paused = true)]
async fn up_then_down_walks_the_stack_lifecycle() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let api = api(&sub);

    let report = api.stack_up(&g, UpOptions::default()).await.unwrap();
    assert_eq!(report.ready, vec!["etcd", "kafka"]);
    assert_eq!(api.get_state("infra").await.unwrap(), "Running");
    assert_eq!(api.cluster_status(&g).await.unwrap().aggregate, AggregateStatus::Running);

    let err = api.stack_up(&g, UpOptions::default()).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidTransition(_)), "{err}");

    api.stack_redeploy(&g, UpOptions::default()).await.unwrap();
    assert_eq!(api.get_state("infra").await.unwrap(), "Running");

    let down = api.stack_down(&g).await.unwrap();
    assert_eq!(down.removed, vec!["kafka", "etcd"]);
    assert_eq!(api.get_state("infra").await.unwrap(), "Stopped");
}

#[tokio::test(start_paused = true)]
async fn concurrent_up_is_refused_while_a_run_holds_the_stack() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let api = api(&sub);

    let (a, b) = tokio::join!(api.stack_up(&g, UpOptions::default()), api.stack_up(&g, UpOptions::default()));
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(ApiError::Conflict(_)))));
    assert_eq!(sub.created(), vec!["etcd", "kafka"]);
}

#[tokio::test(start_paused = true)]
async fn stack_held_by_another_caller_is_not_orchestrated() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let api = api(&sub);
    api.create_state("infra", "Stopped").await.unwrap();
    api.transition("infra", "Starting").await.unwrap();

    let err = api.stack_up(&g, UpOptions::default()).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)), "{err}");
    assert!(sub.created().is_empty());
}

#[tokio::test(start_paused = true)]
async fn down_is_refused_while_a_run_holds_the_stack() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.set_behavior("etcd", Behavior::Healthy { after_polls: 10 });
    let api = Arc::new(api(&sub));
    let run = {
        let (api, g) = (api.clone(), g.clone());
        tokio::spawn(async move { api.stack_up(&g, UpOptions::default()).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    assert_eq!(api.get_state("infra").await.unwrap(), "Starting");

    let err = api.stack_down(&g).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)), "{err}");
    assert_eq!(api.get_state("infra").await.unwrap(), "Starting");
    assert!(sub.removed().is_empty());

    let err = api.stack_up(&g, UpOptions::default()).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)), "{err}");

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.ready, vec!["etcd", "kafka"]);
    assert_eq!(sub.created(), vec!["etcd", "kafka"]);

    api.stack_down(&g).await.unwrap();
    assert_eq!(api.get_state("infra").await.unwrap(), "Stopped");
}

/// Accepts claims but fails every write that would release a held stack.
struct StuckStore {
    inner: MemoryStateStore,
}

#[async_trait::async_trait]
impl StateStore for StuckStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> { self.inner.get(key).await }
    async fn create(&self, key: &str, value: &str) -> StoreResult<()> { self.inner.create(key, value).await }
    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> StoreResult<()> {
        if expected == "Starting" {
            return Err(StoreError::Backend("disk I/O error".into()));
        }
        self.inner.compare_and_set(key, expected, new).await
    }
    async fn delete(&self, key: &str) -> StoreResult<()> { self.inner.delete(key).await }
}

#[tokio::test(start_paused = true)]
async fn unsettled_run_is_reported_as_an_error() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let store = Arc::new(StuckStore { inner: MemoryStateStore::new() });
    let api = InProcApi::new(store, Arc::new(sub.clone()), OrchestratorConfig::default());

    let err = api.stack_up(&g, UpOptions::default()).await.unwrap_err();
    match err {
        ApiError::Internal(msg) => {
            assert!(msg.contains("stuck in Starting"), "{msg}");
            assert!(msg.contains("converged"), "{msg}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sub.created(), vec!["etcd", "kafka"]);
    assert_eq!(api.get_state("infra").await.unwrap(), "Starting");
}

#[tokio::test(start_paused = true)]
async fn failed_run_settles_back_to_stopped() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.set_behavior("etcd", Behavior::Failing);
    let api = api(&sub);

    let err = api.stack_up(&g, UpOptions::default()).await.unwrap_err();
    assert!(matches!(err, ApiError::Orchestration(_)), "{err}");
    assert_eq!(api.get_state("infra").await.unwrap(), "Stopped");
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_runs() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.set_behavior("etcd", Behavior::Failing);
    let api = Arc::new(api(&sub));
    let run = {
        let (api, g) = (api.clone(), g.clone());
        tokio::spawn(async move { api.stack_up(&g, UpOptions::default()).await })
    };
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    api.shutdown();
    assert_eq!(run.await.unwrap().unwrap_err(), ApiError::Cancelled);
    assert_eq!(api.get_state("infra").await.unwrap(), "Stopped");
}

#[tokio::test(start_paused = true)]
async fn provisioning_passthroughs() {
    let g = graph();
    let sub = MemorySubstrate::new();
    sub.add_pullable("appcelerator/etcd", None).add_pullable("appcelerator/kafka", None);
    sub.add_volume("etcd-data", 2);
    let api = api(&sub);

    let pulled = api.pull_images(&g).await.unwrap();
    assert!(pulled.is_complete());
    assert_eq!(pulled.pulled.len(), 2);
    assert!(api.remove_volumes(&g).await.unwrap().is_empty());
}

#[tokio::test]
async fn state_passthroughs_surface_typed_errors() {
    let sub = MemorySubstrate::new();
    let api = api(&sub);
    api.create_state("svc", "Stopped").await.unwrap();
    assert!(matches!(api.create_state("svc", "Stopped").await, Err(ApiError::Conflict(_))));
    assert!(matches!(api.transition("svc", "Running").await, Err(ApiError::InvalidTransition(_))));
    assert!(matches!(api.create_state("other", "Paused").await, Err(ApiError::Validation(_))));
    assert_eq!(api.transition("svc", "Starting").await.unwrap(), "Stopped");
    api.delete_state("svc").await.unwrap();
    assert!(matches!(api.get_state("svc").await, Err(ApiError::NotFound(_))));
}
