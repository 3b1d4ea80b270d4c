//! AMP ops: drives a service graph to convergence on a container substrate,
//! reports its status and provisions the networks, volumes and images around
//! it.

#![forbid(unsafe_code)]

pub mod config;
pub mod memory;
pub mod orchestrator;
pub mod provision;
pub mod status;
pub mod substrate;

use std::sync::Arc;
use std::time::Duration;

use amp_core::{ClusterGraph, ClusterSnapshot};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub use config::OrchestratorConfig;
pub use memory::{Behavior, MemorySubstrate};
pub use orchestrator::{DownReport, Orchestrator, OrchestratorError, UpOptions, UpReport};
pub use provision::{ensure_networks, pull_images, remove_volumes, PullReport};
pub use status::{aggregate, derive_status, StatusBoard};
pub use substrate::{PullProgress, ServiceCreate, SubstrateClient, SubstrateService, TaskObservation, TaskState};

/// Cancellation handle for a background stream task.
#[derive(Debug)]
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn noop() -> Self { Self { task: None } }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Receiver side of a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Follow-mode status: a fresh live snapshot every `interval` until the
/// receiver is dropped or the handle cancelled.
pub fn monitor(orch: Arc<Orchestrator>, graph: ClusterGraph, interval: Duration) -> StreamHandle<ClusterSnapshot> {
    let cap = std::env::var("AMP_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(16);
    let (tx, rx) = mpsc::channel(cap);
    let handle = tokio::spawn(async move {
        info!(graph = %graph.name(), interval_ms = %interval.as_millis(), "monitor: start");
        let mut epoch = 0u64;
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match orch.snapshot(&graph).await {
                Ok(mut snap) => {
                    epoch += 1;
                    snap.epoch = epoch;
                    if tx.send(snap).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "monitor: snapshot failed; retry next interval"),
            }
        }
        info!("monitor: ended");
    });
    StreamHandle { rx, cancel: CancelHandle { task: Some(handle) } }
}
