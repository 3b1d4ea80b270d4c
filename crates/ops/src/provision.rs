//! Network, volume and image provisioning around orchestration runs.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{OrchestratorConfig, SubstrateClient};

/// Create every network in `names` that does not exist yet. Returns the
/// networks actually created.
pub async fn ensure_networks(client: &dyn SubstrateClient, names: &[String]) -> Result<Vec<String>> {
    let existing: BTreeSet<String> = client.list_networks().await?.into_iter().collect();
    let mut created = Vec::new();
    for name in names.iter().filter(|n| !existing.contains(*n)) {
        client.create_network(name).await?;
        info!(network = %name, "provision: network created");
        created.push(name.clone());
    }
    Ok(created)
}

/// Best-effort removal of `names`, retried every `volume_poll` while the
/// substrate reports them in use. The `volume_timeout` window restarts each
/// time a volume disappears, so a slow but progressing teardown is not cut
/// short. Returns the volumes still present when the window closes.
pub async fn remove_volumes(
    client: &dyn SubstrateClient,
    names: &[String],
    cfg: &OrchestratorConfig,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let mut pending: BTreeSet<String> = names.iter().cloned().collect();
    let mut window_start = Instant::now();
    loop {
        let present: BTreeSet<String> = client.list_volumes().await?.into_iter().collect();
        let before = pending.len();
        pending.retain(|v| present.contains(v));
        if pending.len() < before {
            window_start = Instant::now();
        }
        if pending.is_empty() {
            info!(count = names.len(), "provision: volumes removed");
            return Ok(Vec::new());
        }
        for v in &pending {
            if let Err(e) = client.remove_volume(v).await {
                debug!(volume = %v, error = %e, "provision: volume removal deferred");
            }
        }
        if window_start.elapsed() >= cfg.volume_timeout {
            let left: Vec<String> = pending.into_iter().collect();
            warn!(volumes = ?left, "provision: volumes still present after timeout");
            return Ok(left);
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(pending.into_iter().collect());
            }
            _ = tokio::time::sleep(cfg.volume_poll) => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    pub pulled: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Still pulling when the overall timeout fired.
    pub timed_out: Vec<String>,
}

impl PullReport {
    pub fn is_complete(&self) -> bool { self.failed.is_empty() && self.timed_out.is_empty() }
}

/// Drain one pull stream to completion.
pub async fn pull_one(client: &dyn SubstrateClient, image: &str) -> Result<()> {
    let mut progress = client.pull_image(image).await?;
    while let Some(p) = progress.next().await {
        let p = p?;
        debug!(image = %p.image, status = %p.status, "provision: pull progress");
    }
    Ok(())
}

/// Pull every image in parallel, one task per image. Waits until all tasks
/// reported or `timeout` elapsed; tasks still running then are left to finish
/// on their own and reported as timed out.
pub async fn pull_images(client: Arc<dyn SubstrateClient>, images: &[String], timeout: Duration) -> PullReport {
    let t0 = std::time::Instant::now();
    let total = images.len();
    let done = Arc::new(AtomicUsize::new(0));
    let notify = Arc::new(Notify::new());
    let results: Arc<Mutex<Vec<(String, Result<(), String>)>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));

    for image in images.iter().cloned() {
        let (client, done, notify, results) = (client.clone(), done.clone(), notify.clone(), results.clone());
        tokio::spawn(async move {
            let res = pull_one(client.as_ref(), &image).await.map_err(|e| e.to_string());
            if let Ok(mut r) = results.lock() {
                r.push((image, res));
            }
            done.fetch_add(1, Ordering::SeqCst);
            notify.notify_one();
        });
    }

    let deadline = Instant::now() + timeout;
    while done.load(Ordering::SeqCst) < total {
        if tokio::time::timeout_at(deadline, notify.notified()).await.is_err() {
            break;
        }
    }

    let mut report = PullReport::default();
    let finished = results.lock().map(|r| r.clone()).unwrap_or_default();
    for (image, res) in finished {
        match res {
            Ok(()) => report.pulled.push(image),
            Err(e) => report.failed.push((image, e)),
        }
    }
    report.timed_out = images
        .iter()
        .filter(|i| !report.pulled.contains(i) && !report.failed.iter().any(|(f, _)| f == *i))
        .cloned()
        .collect();
    counter!("pull_images_total", report.pulled.len() as u64);
    histogram!("pull_images_ms", t0.elapsed().as_secs_f64() * 1000.0);
    if report.is_complete() {
        info!(count = total, took_ms = %t0.elapsed().as_millis(), "provision: images pulled");
    } else {
        warn!(failed = report.failed.len(), timed_out = report.timed_out.len(), "provision: image pull incomplete");
    }
    report
}
