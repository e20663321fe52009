//! Status file publishing.
//!
//! The port-forward manager and operators read tunnel health from a JSON
//! file instead of talking to the daemon. The file is replaced atomically
//! (write to a temp file, then rename) so readers never see a partial
//! document.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vortex_core::{epoch_secs, AggregateStatus, TunnelStatus};
use vortex_health::WatchdogCoordinator;

/// Document written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: u64,
    pub aggregate: AggregateStatus,
    pub tunnels: Vec<TunnelStatus>,
}

impl StatusReport {
    pub async fn collect(coordinator: &WatchdogCoordinator) -> Self {
        let tunnels = coordinator.snapshot().await;
        Self {
            generated_at: epoch_secs(),
            aggregate: AggregateStatus::from_statuses(&tunnels),
            tunnels,
        }
    }
}

/// Replace `path` with the JSON rendering of `report`.
pub async fn write_atomic(path: &Path, report: &StatusReport) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(report)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Periodically writes the coordinator's snapshot to a file.
pub struct StatusWriter {
    coordinator: Arc<WatchdogCoordinator>,
    path: PathBuf,
    interval: Duration,
}

impl StatusWriter {
    pub fn new(coordinator: Arc<WatchdogCoordinator>, path: PathBuf, interval: Duration) -> Self {
        Self {
            coordinator,
            path,
            interval,
        }
    }

    pub async fn write_once(&self) -> anyhow::Result<()> {
        let report = StatusReport::collect(&self.coordinator).await;
        write_atomic(&self.path, &report).await?;
        debug!(path = %self.path.display(), tunnels = report.tunnels.len(), "status file written");
        Ok(())
    }

    /// Run the write loop until shutdown, writing once more on the way out.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.path.display(),
            interval_secs = self.interval.as_secs(),
            "status writer started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.write_once().await {
                        warn!(error = %e, "status file write failed");
                    }
                }
                _ = shutdown.changed() => {
                    if let Err(e) = self.write_once().await {
                        warn!(error = %e, "final status file write failed");
                    }
                    debug!("status writer shutting down");
                    break;
                }
            }
        }
    }
}
