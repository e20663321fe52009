//! Watchdog coordinator: owns every tunnel supervisor.
//!
//! The coordinator spawns one background task per registered tunnel and
//! keeps a registry slot per tunnel: the task handle, its shutdown and
//! control channels, and the `watch` receiver the supervisor publishes
//! its status on. Status reads never touch a supervisor directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vortex_core::{AggregateStatus, TunnelName, TunnelSpec, TunnelStatus, WatchdogSettings};

use crate::error::CoordinatorError;
use crate::supervisor::{SupervisorCommand, SupervisorDeps, TunnelSupervisor};

const CONTROL_CAPACITY: usize = 8;

/// Registry entry of one running supervisor.
struct SupervisorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    control_tx: mpsc::Sender<SupervisorCommand>,
    status_rx: watch::Receiver<TunnelStatus>,
}

impl SupervisorSlot {
    fn stop(self) -> JoinHandle<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle
    }
}

/// Supervises all registered tunnels.
pub struct WatchdogCoordinator {
    settings: WatchdogSettings,
    deps: SupervisorDeps,
    /// Active supervisors: tunnel name → slot.
    supervisors: Arc<RwLock<HashMap<TunnelName, SupervisorSlot>>>,
    closed: AtomicBool,
}

impl WatchdogCoordinator {
    pub fn new(settings: WatchdogSettings, deps: SupervisorDeps) -> Self {
        Self {
            settings,
            deps,
            supervisors: Arc::new(RwLock::new(HashMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    /// Start supervising a tunnel.
    ///
    /// Registering a name that is already supervised replaces the old
    /// supervisor, which starts the tunnel over from a fresh record.
    pub async fn register(&self, spec: TunnelSpec) -> Result<(), CoordinatorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShutDown);
        }

        let name = spec.name.clone();
        let interface = spec.interface.clone();
        let (supervisor, status_rx) =
            TunnelSupervisor::new(spec, &self.settings, self.deps.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);

        let handle = tokio::spawn(supervisor.run(control_rx, shutdown_rx));

        let mut supervisors = self.supervisors.write().await;
        if let Some(old) = supervisors.insert(
            name.clone(),
            SupervisorSlot {
                handle,
                shutdown_tx,
                control_tx,
                status_rx,
            },
        ) {
            old.stop().abort();
            debug!(tunnel = %name, "replaced running supervisor");
        }

        info!(tunnel = %name, %interface, "tunnel supervision started");
        Ok(())
    }

    /// Stop supervising a tunnel.
    pub async fn deregister(&self, name: &str) -> Result<(), CoordinatorError> {
        let slot = self
            .supervisors
            .write()
            .await
            .remove(name)
            .ok_or_else(|| CoordinatorError::NotRegistered(name.to_string()))?;

        let mut handle = slot.stop();
        if tokio::time::timeout(self.settings.shutdown_grace, &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
        info!(tunnel = %name, "tunnel supervision stopped");
        Ok(())
    }

    /// Ask a supervisor to reset its record, leaving `Failed` if parked there.
    pub async fn reset(&self, name: &str) -> Result<(), CoordinatorError> {
        let control = {
            let supervisors = self.supervisors.read().await;
            let slot = supervisors
                .get(name)
                .ok_or_else(|| CoordinatorError::NotRegistered(name.to_string()))?;
            slot.control_tx.clone()
        };
        control
            .send(SupervisorCommand::Reset)
            .await
            .map_err(|_| CoordinatorError::SupervisorGone(name.to_string()))
    }

    /// Latest published status of one tunnel.
    pub async fn status(&self, name: &str) -> Option<TunnelStatus> {
        let supervisors = self.supervisors.read().await;
        supervisors.get(name).map(|slot| slot.status_rx.borrow().clone())
    }

    /// Subscribe to a tunnel's status updates.
    pub async fn subscribe(&self, name: &str) -> Option<watch::Receiver<TunnelStatus>> {
        let supervisors = self.supervisors.read().await;
        supervisors.get(name).map(|slot| slot.status_rx.clone())
    }

    /// Status of every supervised tunnel, sorted by name.
    pub async fn snapshot(&self) -> Vec<TunnelStatus> {
        let supervisors = self.supervisors.read().await;
        let mut statuses: Vec<TunnelStatus> = supervisors
            .values()
            .map(|slot| slot.status_rx.borrow().clone())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn aggregate(&self) -> AggregateStatus {
        AggregateStatus::from_statuses(&self.snapshot().await)
    }

    /// Names of supervised tunnels, sorted.
    pub async fn active_tunnels(&self) -> Vec<TunnelName> {
        let supervisors = self.supervisors.read().await;
        let mut names: Vec<TunnelName> = supervisors.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_supervising(&self, name: &str) -> bool {
        let supervisors = self.supervisors.read().await;
        supervisors.contains_key(name)
    }

    /// Stop every supervisor.
    ///
    /// Signals all of them at once, waits up to the shutdown grace period
    /// for in-flight cycles to finish, then aborts whatever is left.
    /// Returns the number of supervisors that had to be aborted.
    pub async fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let handles: Vec<(TunnelName, JoinHandle<()>)> = {
            let mut supervisors = self.supervisors.write().await;
            supervisors
                .drain()
                .map(|(name, slot)| (name, slot.stop()))
                .collect()
        };

        let deadline = tokio::time::Instant::now() + self.settings.shutdown_grace;
        let mut aborted = 0;
        for (name, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(tunnel = %name, "supervisor did not stop within grace period, aborting");
                handle.abort();
                aborted += 1;
            } else {
                debug!(tunnel = %name, "supervisor stopped");
            }
        }
        info!(aborted, "all tunnel supervisors stopped");
        aborted
    }
}
