use std::sync::Arc;
use std::time::Duration;

use amp_core::{AggregateStatus, ClusterGraph, ServiceSpec, ServiceStatus};
use amp_ops::substrate::Labels;
use amp_ops::{
    Behavior, MemorySubstrate, Orchestrator, OrchestratorConfig, OrchestratorError, ServiceCreate, SubstrateClient,
    UpOptions,
};
use tokio_util::sync::CancellationToken;

fn graph() -> ClusterGraph {
    ClusterGraph::new(
        "amp",
        vec![
            ServiceSpec::new("etcd", "appcelerator/etcd:3.1"),
            ServiceSpec::new("kafka", "appcelerator/kafka").replicas(3).depends_on(["etcd"]),
            ServiceSpec::new("agent", "appcelerator/agent").global().depends_on(["etcd", "kafka"]),
        ],
        vec!["amp-infra".into()],
        vec![],
    )
    .unwrap()
}

fn orchestrator(sub: &MemorySubstrate) -> Orchestrator {
    Orchestrator::new(Arc::new(sub.clone()), OrchestratorConfig::default())
}

fn labels_for(graph: &ClusterGraph, name: &str) -> Labels {
    let spec = graph.service(name).unwrap();
    ServiceCreate::from_spec(graph.name(), spec).labels
}

#[tokio::test(start_paused = true)]
async fn healthy_graph_converges_in_dependency_order() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let orch = orchestrator(&sub);
    let report = orch.up(&g, &UpOptions::default(), &CancellationToken::new()).await.unwrap();
    assert_eq!(report.ready, vec!["etcd", "kafka", "agent"]);
    assert!(report.forced.is_empty());
    assert_eq!(sub.created(), vec!["etcd", "kafka", "agent"]);
    assert_eq!(sub.networks(), vec!["amp-infra"]);
    let snap = orch.board().load();
    assert_eq!(snap.aggregate, AggregateStatus::Running);
    assert!(snap.rows.iter().all(|r| r.status == ServiceStatus::Running), "{:?}", snap.rows);
}

#[tokio::test(start_paused = true)]
async fn dependents_wait_for_ready_dependencies() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.set_behavior("etcd", Behavior::FlakyThenHealthy { polls: 3 });
    let orch = Arc::new(orchestrator(&sub));

    let run = {
        let (orch, g) = (orch.clone(), g.clone());
        tokio::spawn(async move { orch.up(&g, &UpOptions::default(), &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(sub.created(), vec!["etcd"], "kafka and agent must not start before etcd is ready");

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.ready.len(), 3);
    assert_eq!(sub.created(), vec!["etcd", "kafka", "agent"]);
}

#[tokio::test(start_paused = true)]
async fn failing_service_times_out_without_force() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.set_behavior("etcd", Behavior::Failing);
    let err = orchestrator(&sub).up(&g, &UpOptions::default(), &CancellationToken::new()).await.unwrap_err();
    match err {
        OrchestratorError::ServiceStartupTimeout { service, waited } => {
            assert_eq!(service, "etcd");
            assert!(waited > Duration::from_secs(30));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sub.created(), vec!["etcd"]);
}

#[tokio::test(start_paused = true)]
async fn force_mode_forces_failing_service_and_starts_dependents() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.set_behavior("etcd", Behavior::Failing);
    let orch = orchestrator(&sub);
    let opts = UpOptions { force: true, ..UpOptions::default() };
    let report = orch.up(&g, &opts, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.forced, vec!["etcd"]);
    assert_eq!(report.ready, vec!["kafka", "agent"]);
    assert_eq!(sub.created(), vec!["etcd", "kafka", "agent"]);
    let snap = orch.board().load();
    let etcd = snap.rows.iter().find(|r| r.name == "etcd").unwrap();
    assert!(etcd.forced);
    assert_eq!(etcd.status, ServiceStatus::Failing);
}

#[tokio::test(start_paused = true)]
async fn missing_image_is_fatal_unless_forced() {
    let g = graph();
    let sub = MemorySubstrate::new();
    sub.add_image("appcelerator/etcd:3.1").add_image("appcelerator/agent");
    let local = UpOptions { local: true, ..UpOptions::default() };
    let err = orchestrator(&sub).up(&g, &local, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ImageMissing { ref service, .. } if service == "kafka"), "{err}");

    let sub = MemorySubstrate::new();
    sub.add_image("appcelerator/etcd:3.1").add_image("appcelerator/agent");
    let forced = UpOptions { local: true, force: true, ..UpOptions::default() };
    let report = orchestrator(&sub).up(&g, &forced, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.forced, vec!["kafka"]);
    assert_eq!(sub.created(), vec!["etcd", "agent"]);
}

#[tokio::test(start_paused = true)]
async fn missing_image_is_pulled_unless_local() {
    let g = graph();
    let sub = MemorySubstrate::new();
    sub.add_image("appcelerator/etcd:3.1").add_image("appcelerator/agent").add_pullable("appcelerator/kafka", None);
    let report = orchestrator(&sub).up(&g, &UpOptions::default(), &CancellationToken::new()).await.unwrap();
    assert_eq!(report.ready.len(), 3);
    assert!(sub.has_image("appcelerator/kafka:latest"));
}

#[tokio::test(start_paused = true)]
async fn restart_adopts_existing_services() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.insert_service("etcd", "appcelerator/etcd:3.1", Some(1), labels_for(&g, "etcd"));
    let report = orchestrator(&sub).up(&g, &UpOptions::default(), &CancellationToken::new()).await.unwrap();
    assert_eq!(report.ready.len(), 3);
    assert_eq!(sub.created(), vec!["kafka", "agent"]);
}

#[tokio::test(start_paused = true)]
async fn service_removed_mid_run_is_recreated() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.set_behavior("etcd", Behavior::Healthy { after_polls: 3 });
    let orch = Arc::new(orchestrator(&sub));
    let run = {
        let (orch, g) = (orch.clone(), g.clone());
        tokio::spawn(async move { orch.up(&g, &UpOptions::default(), &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(2500)).await;
    sub.remove_service("etcd").await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(60), run).await.expect("up must converge").unwrap().unwrap();
    assert_eq!(report.ready, vec!["etcd", "kafka", "agent"]);
    assert_eq!(sub.created(), vec!["etcd", "etcd", "kafka", "agent"]);
}

#[tokio::test(start_paused = true)]
async fn transient_substrate_errors_are_absorbed() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.fail_task_listing(4);
    let report = orchestrator(&sub).up(&g, &UpOptions::default(), &CancellationToken::new()).await.unwrap();
    assert_eq!(report.ready.len(), 3);
    assert!(report.ticks > 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_loop() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    sub.set_behavior("etcd", Behavior::Failing);
    let orch = orchestrator(&sub);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let err = orch.up(&g, &UpOptions::default(), &cancel).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
}

#[tokio::test]
async fn down_with_nothing_present_is_a_noop() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let report = orchestrator(&sub).down(&g, &CancellationToken::new()).await.unwrap();
    assert!(report.removed.is_empty());
    assert!(report.failed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn down_removes_only_our_services_and_continues_past_failures() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let orch = orchestrator(&sub);
    orch.up(&g, &UpOptions::default(), &CancellationToken::new()).await.unwrap();
    sub.insert_service("grafana", "grafana/grafana", Some(1), Labels::new());
    sub.fail_removal_of("kafka");

    let report = orch.down(&g, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.removed, vec!["agent", "etcd"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "kafka");
    assert_eq!(sub.service_names(), vec!["grafana", "kafka"]);
    assert_eq!(orch.status(&g).await.unwrap(), AggregateStatus::PartiallyRunning);
}

#[tokio::test(start_paused = true)]
async fn status_and_snapshot_are_read_only() {
    let mut g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let orch = orchestrator(&sub);
    assert_eq!(orch.status(&g).await.unwrap(), AggregateStatus::Stopped);

    orch.up(&g, &UpOptions::default(), &CancellationToken::new()).await.unwrap();
    sub.insert_service("grafana", "grafana/grafana", Some(1), Labels::new());
    assert_eq!(orch.discover(&mut g).await.unwrap(), 1);

    let created = sub.created();
    let snap = orch.snapshot(&g).await.unwrap();
    assert_eq!(sub.created(), created);
    assert_eq!(snap.aggregate, AggregateStatus::Running);
    assert_eq!(snap.rows.len(), 4);
    let grafana = snap.rows.last().unwrap();
    assert!(grafana.user);
    assert_eq!(grafana.status, ServiceStatus::Running);
    assert_eq!(orch.status(&g).await.unwrap(), AggregateStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn monitor_streams_snapshots_until_cancelled() {
    let g = graph();
    let sub = MemorySubstrate::seeded_from(&g);
    let orch = Arc::new(orchestrator(&sub));
    orch.up(&g, &UpOptions::default(), &CancellationToken::new()).await.unwrap();

    let mut handle = amp_ops::monitor(orch.clone(), g.clone(), Duration::from_secs(2));
    let first = handle.rx.recv().await.unwrap();
    let second = handle.rx.recv().await.unwrap();
    assert_eq!((first.epoch, second.epoch), (1, 2));
    assert_eq!(second.aggregate, AggregateStatus::Running);
    handle.cancel.cancel();
    assert!(handle.rx.recv().await.is_none());
}

#[tokio::test]
async fn substrate_client_is_object_safe() {
    let sub: Arc<dyn SubstrateClient> = Arc::new(MemorySubstrate::new());
    assert!(!sub.image_exists("nothing").await.unwrap());
}
