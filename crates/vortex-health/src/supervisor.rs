//! Per-tunnel supervisor.
//!
//! A supervisor owns one [`Tunnel`] record and drives it through the
//! cycle below, once per probe interval. Cycles of one tunnel never
//! overlap; different tunnels run in independent tasks.
//!
//! ```text
//! probe ─► classify ─► plan ─┬─ NoAction
//!                            ├─ ApplyRoutingFix ─► RoutingFixer
//!                            ├─ RestartTunnel ───► TunnelProvisioner
//!                            └─ EscalateFailed ──► AlertSink
//!                                   │
//!               record ◄────────────┘
//!                 │
//!               publish status (watch) + transition events
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use vortex_core::{
    epoch_secs, HealthState, ProbeResult, RemediationAction, RemediationOutcome,
    RemediationRecord, SupervisorState, TunnelSpec, TunnelStatus, WatchdogSettings,
};

use crate::alert::{AlertSink, HealthEvent};
use crate::classifier::{HealthClassifier, ProbeWindow, Verdict};
use crate::command::CommandRunner;
use crate::error::{EscalationRequired, ProbeError, RemediationError};
use crate::fixer::RoutingFixer;
use crate::planner::{PlanInput, RemediationPlan, RemediationPlanner};
use crate::probe::{ProbeEngine, TunnelProbe};
use crate::provision::{IpL2tpProvisioner, TunnelProvisioner};

/// Collaborators shared by every supervisor.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub probe: Arc<dyn TunnelProbe>,
    pub fixer: Arc<RoutingFixer>,
    pub provisioner: Arc<dyn TunnelProvisioner>,
    pub alerts: Arc<dyn AlertSink>,
}

impl SupervisorDeps {
    /// Stock collaborators for a live host: `ip`/`ping` probes and fixes,
    /// `ip l2tp` provisioning, all through `runner`.
    pub fn system(
        runner: Arc<dyn CommandRunner>,
        settings: &WatchdogSettings,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            probe: Arc::new(ProbeEngine::new(runner.clone(), settings.probe_timeout)),
            fixer: Arc::new(RoutingFixer::new(runner.clone(), settings.action_timeout)),
            provisioner: Arc::new(IpL2tpProvisioner::new(runner, settings.action_timeout)),
            alerts,
        }
    }
}

/// Requests a running supervisor accepts between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Clear counters and history and leave `Failed`.
    Reset,
}

/// Runtime record of one tunnel, owned by its supervisor.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub spec: TunnelSpec,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_success_at: Option<u64>,
    /// Most recent remediation, kept after history is pruned.
    pub last_action: Option<RemediationRecord>,
    pub backoff_level: u32,
    /// Remediation history, oldest first.
    pub history: Vec<RemediationRecord>,
    pub window: ProbeWindow,
    pub last_probe: Option<ProbeResult>,
}

impl Tunnel {
    pub fn new(spec: TunnelSpec, window_capacity: usize) -> Self {
        Self {
            spec,
            state: HealthState::Unreachable,
            consecutive_failures: 0,
            last_success_at: None,
            last_action: None,
            backoff_level: 0,
            history: Vec::new(),
            window: ProbeWindow::new(window_capacity),
            last_probe: None,
        }
    }

    pub fn status(&self, now: u64) -> TunnelStatus {
        TunnelStatus {
            state: SupervisorState::Active(self.state),
            consecutive_failures: self.consecutive_failures,
            backoff_level: self.backoff_level,
            last_action: self.last_action.clone(),
            last_success_at: self.last_success_at,
            last_probe: self.last_probe,
            ..TunnelStatus::registered(&self.spec, now)
        }
    }
}

/// What one cycle observed and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub verdict: Verdict,
    pub plan: RemediationPlan,
    /// State at the end of the cycle.
    pub state: HealthState,
}

pub struct TunnelSupervisor {
    tunnel: Tunnel,
    classifier: HealthClassifier,
    planner: RemediationPlanner,
    settings: WatchdogSettings,
    deps: SupervisorDeps,
    status_tx: watch::Sender<TunnelStatus>,
}

impl TunnelSupervisor {
    /// Build a supervisor and the receiver its status is published on.
    pub fn new(
        spec: TunnelSpec,
        settings: &WatchdogSettings,
        deps: SupervisorDeps,
    ) -> (Self, watch::Receiver<TunnelStatus>) {
        let classifier =
            HealthClassifier::new(settings.failure_threshold, settings.recovery_threshold);
        let tunnel = Tunnel::new(spec, classifier.window_capacity());
        let (status_tx, status_rx) = watch::channel(tunnel.status(epoch_secs()));
        let supervisor = Self {
            tunnel,
            classifier,
            planner: RemediationPlanner::from_settings(settings),
            settings: settings.clone(),
            deps,
            status_tx,
        };
        (supervisor, status_rx)
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Run one probe → classify → plan → remediate cycle at time `now`.
    pub async fn run_cycle(&mut self, now: u64) -> CycleReport {
        let probe_timeout = self.settings.probe_timeout;
        let outcome = tokio::time::timeout(probe_timeout, self.deps.probe.probe(&self.tunnel.spec))
            .await
            .unwrap_or(Err(ProbeError::Timeout(probe_timeout)));
        let verdict = Verdict::of_outcome(&outcome);
        match outcome {
            Ok(result) => self.tunnel.last_probe = Some(result),
            Err(e) => {
                warn!(tunnel = %self.tunnel.spec.name, error = %e, "probe failed");
                self.tunnel.last_probe = Some(ProbeResult::dark(now));
            }
        }

        let next = self
            .classifier
            .classify(self.tunnel.state, verdict, &self.tunnel.window);
        self.tunnel.window.push(verdict);
        if verdict.is_pass() {
            self.tunnel.consecutive_failures = 0;
            self.tunnel.last_success_at = Some(now);
        } else {
            self.tunnel.consecutive_failures = self.tunnel.consecutive_failures.saturating_add(1);
        }
        self.transition(next, now);

        let decision = self.planner.plan(&PlanInput {
            tunnel: &self.tunnel.spec.name,
            state: self.tunnel.state,
            consecutive_failures: self.tunnel.consecutive_failures,
            backoff_level: self.tunnel.backoff_level,
            last_success_at: self.tunnel.last_success_at,
            history: &self.tunnel.history,
            now,
        });
        self.tunnel.backoff_level = decision.backoff_level;

        debug!(
            tunnel = %self.tunnel.spec.name,
            ?verdict,
            state = %self.tunnel.state,
            failures = self.tunnel.consecutive_failures,
            plan = ?decision.plan,
            "cycle"
        );

        match decision.plan {
            RemediationPlan::NoAction => {}
            RemediationPlan::ApplyRoutingFix => self.apply_routing_fix(now).await,
            RemediationPlan::RestartTunnel => self.restart(now).await,
            RemediationPlan::EscalateFailed => self.escalate(now),
        }

        self.prune_history(now);
        self.publish(now);

        CycleReport {
            verdict,
            plan: decision.plan,
            state: self.tunnel.state,
        }
    }

    /// Forget counters, history, and the probe window; state `Unreachable`.
    pub fn reset(&mut self, now: u64) {
        info!(tunnel = %self.tunnel.spec.name, state = %self.tunnel.state, "supervisor reset");
        let t = &mut self.tunnel;
        t.consecutive_failures = 0;
        t.backoff_level = 0;
        t.history.clear();
        t.window.clear();
        self.transition(HealthState::Unreachable, now);
        self.publish(now);
    }

    /// Drive cycles on the probe interval until `shutdown` fires.
    ///
    /// Publishes `Stopped` on the way out.
    pub async fn run(
        mut self,
        mut control: mpsc::Receiver<SupervisorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.settings.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(tunnel = %self.tunnel.spec.name, interval = ?self.settings.probe_interval, "supervisor starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle(epoch_secs()).await;
                }
                Some(command) = control.recv() => match command {
                    SupervisorCommand::Reset => self.reset(epoch_secs()),
                },
                _ = shutdown.changed() => {
                    debug!(tunnel = %self.tunnel.spec.name, "supervisor shutting down");
                    break;
                }
            }
        }

        let mut status = self.tunnel.status(epoch_secs());
        status.state = SupervisorState::Stopped;
        self.status_tx.send_replace(status);
    }

    async fn apply_routing_fix(&mut self, now: u64) {
        let timeout = self.settings.action_timeout;
        let result = tokio::time::timeout(timeout, self.deps.fixer.apply_fix(&self.tunnel.spec))
            .await
            .unwrap_or(Err(RemediationError::Timeout(timeout)));

        let outcome = match result {
            Ok(_) => RemediationOutcome::Succeeded,
            Err(e) => {
                warn!(tunnel = %self.tunnel.spec.name, error = %e, "routing fix failed");
                RemediationOutcome::Failed(e.to_string())
            }
        };
        self.record(RemediationAction::RoutingFix, outcome, now);
    }

    async fn restart(&mut self, now: u64) {
        self.transition(HealthState::Recovering, now);
        self.publish(now);

        let spec = &self.tunnel.spec;
        let provisioner = &self.deps.provisioner;
        let timeout = self.settings.action_timeout;
        let result = tokio::time::timeout(timeout, async {
            if let Err(e) = provisioner.teardown(spec).await {
                debug!(tunnel = %spec.name, error = %e, "teardown before restart failed");
            }
            provisioner.create_or_restart(spec).await
        })
        .await;

        let outcome = match result {
            Ok(Ok(session)) => {
                info!(
                    tunnel = %spec.name,
                    interface = %session.interface,
                    session_id = session.session_id,
                    "tunnel restarted"
                );
                RemediationOutcome::Succeeded
            }
            Ok(Err(e)) => {
                let e = RemediationError::from(e);
                warn!(tunnel = %spec.name, error = %e, "tunnel restart failed");
                RemediationOutcome::Failed(e.to_string())
            }
            Err(_) => {
                let e = RemediationError::Timeout(timeout);
                warn!(tunnel = %spec.name, error = %e, "tunnel restart failed");
                RemediationOutcome::Failed(e.to_string())
            }
        };
        self.record(RemediationAction::RestartTunnel, outcome, now);
        // Probes from before the restart say nothing about the new session.
        self.tunnel.window.clear();
    }

    fn escalate(&mut self, now: u64) {
        let escalation = EscalationRequired {
            tunnel: self.tunnel.spec.name.clone(),
            attempts: self.planner.attempts_in_window(&self.tunnel.history, now),
            window_secs: self.settings.retry_window.as_secs(),
        };
        error!(tunnel = %escalation.tunnel, attempts = escalation.attempts, "escalating");
        self.record(
            RemediationAction::Escalate,
            RemediationOutcome::Failed(escalation.to_string()),
            now,
        );
        self.transition(HealthState::Failed, now);
        self.deps.alerts.notify(HealthEvent::Escalated(escalation));
    }

    fn record(&mut self, action: RemediationAction, outcome: RemediationOutcome, now: u64) {
        let record = RemediationRecord {
            action,
            outcome,
            timestamp: now,
            backoff_level: self.tunnel.backoff_level,
        };
        self.tunnel.last_action = Some(record.clone());
        self.tunnel.history.push(record);
    }

    /// Drop records no longer needed for the retry budget or the fix cooldown.
    fn prune_history(&mut self, now: u64) {
        let keep = self
            .settings
            .retry_window
            .max(self.settings.fix_cooldown)
            .as_secs();
        self.tunnel
            .history
            .retain(|r| now.saturating_sub(r.timestamp) < keep);
    }

    fn transition(&mut self, next: HealthState, now: u64) {
        let prev = self.tunnel.state;
        if prev == next {
            return;
        }
        self.tunnel.state = next;
        info!(tunnel = %self.tunnel.spec.name, from = %prev, to = %next, "state transition");
        self.deps.alerts.notify(HealthEvent::Transition {
            tunnel: self.tunnel.spec.name.clone(),
            from: prev,
            to: next,
            at: now,
        });
    }

    fn publish(&self, now: u64) {
        self.status_tx.send_replace(self.tunnel.status(now));
    }
}
