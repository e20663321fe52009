//! Routing and interface fixes.
//!
//! Each step reads the current value first and only writes when it
//! differs, so a second pass over an already fixed tunnel changes
//! nothing. Global settings (`ip_forward`) are shared by every tunnel;
//! concurrent supervisors may write them at the same time, which is fine
//! because every writer converges on the same value.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use vortex_core::TunnelSpec;

use crate::command::{args, CommandOutput, CommandRunner};
use crate::error::{CommandError, RemediationError};
use crate::probe::{query_link, LinkFlags, LinkQuery};

/// One corrective step, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixStep {
    /// Loose reverse-path filtering on the tunnel interface.
    RpFilter,
    /// Global IPv4 forwarding.
    IpForward,
    LinkUp,
    Promisc,
    Arp,
    /// Route for the tunnel subnet via the interface.
    Route,
}

impl FixStep {
    pub const ALL: [FixStep; 6] = [
        FixStep::RpFilter,
        FixStep::IpForward,
        FixStep::LinkUp,
        FixStep::Promisc,
        FixStep::Arp,
        FixStep::Route,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FixStep::RpFilter => "rp_filter",
            FixStep::IpForward => "ip_forward",
            FixStep::LinkUp => "link_up",
            FixStep::Promisc => "promisc",
            FixStep::Arp => "arp",
            FixStep::Route => "route",
        }
    }
}

impl fmt::Display for FixStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The setting was changed.
    Applied,
    /// The setting already had the desired value.
    AlreadySet,
    Failed(String),
    /// Not attempted because an earlier step failed hard.
    Skipped,
}

/// Per-step outcomes of one fix pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixReport {
    pub steps: Vec<(FixStep, StepOutcome)>,
}

impl FixReport {
    pub fn outcome(&self, step: FixStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }

    pub fn failed_steps(&self) -> Vec<FixStep> {
        self.steps
            .iter()
            .filter(|(_, o)| matches!(o, StepOutcome::Failed(_)))
            .map(|(s, _)| *s)
            .collect()
    }

    /// Steps that changed host state.
    pub fn applied_steps(&self) -> Vec<FixStep> {
        self.steps
            .iter()
            .filter(|(_, o)| *o == StepOutcome::Applied)
            .map(|(s, _)| *s)
            .collect()
    }
}

/// A step failure; hard failures end the pass.
enum StepError {
    Soft(String),
    Hard(String),
}

impl From<CommandError> for StepError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Spawn { .. } => StepError::Hard(e.to_string()),
            CommandError::Timeout { .. } => StepError::Soft(e.to_string()),
        }
    }
}

fn check(out: &CommandOutput) -> Result<(), StepError> {
    if out.success {
        Ok(())
    } else {
        Err(StepError::Soft(format!(
            "exit {:?}: {}",
            out.code,
            out.stderr.trim()
        )))
    }
}

/// Applies rp_filter, forwarding, link flags, and the subnet route.
pub struct RoutingFixer {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl RoutingFixer {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Run every step once, best effort.
    ///
    /// Returns the report on full success; otherwise an error naming the
    /// failed steps and carrying the report.
    pub async fn apply_fix(&self, spec: &TunnelSpec) -> Result<FixReport, RemediationError> {
        let mut report = FixReport::default();

        let flags = match query_link(self.runner.as_ref(), &spec.interface, self.timeout).await {
            Ok(LinkQuery::Present(flags)) => Some(flags),
            Ok(LinkQuery::Missing) => {
                warn!(tunnel = %spec.name, interface = %spec.interface, "cannot fix missing interface");
                None
            }
            Err(e) => {
                warn!(tunnel = %spec.name, error = %e, "link query failed before fix");
                None
            }
        };

        let mut stopped = flags.is_none();
        if stopped {
            report.steps.push((
                FixStep::RpFilter,
                StepOutcome::Failed(format!("interface {} unavailable", spec.interface)),
            ));
        }

        for step in FixStep::ALL {
            if report.outcome(step).is_some() {
                continue;
            }
            if stopped {
                report.steps.push((step, StepOutcome::Skipped));
                continue;
            }
            let flags = flags.unwrap_or_default();
            let outcome = match self.apply_step(step, spec, flags).await {
                Ok(outcome) => outcome,
                Err(StepError::Soft(reason)) => StepOutcome::Failed(reason),
                Err(StepError::Hard(reason)) => {
                    stopped = true;
                    StepOutcome::Failed(reason)
                }
            };
            debug!(tunnel = %spec.name, %step, ?outcome, "fix step");
            report.steps.push((step, outcome));
        }

        let failed = report.failed_steps();
        if failed.is_empty() {
            info!(
                tunnel = %spec.name,
                applied = ?report.applied_steps(),
                "routing fix complete"
            );
            Ok(report)
        } else {
            Err(RemediationError::StepsFailed { failed, report })
        }
    }

    async fn apply_step(
        &self,
        step: FixStep,
        spec: &TunnelSpec,
        flags: LinkFlags,
    ) -> Result<StepOutcome, StepError> {
        let iface = spec.interface.as_str();
        match step {
            FixStep::RpFilter => {
                self.ensure_sysctl(&format!("net.ipv4.conf.{iface}.rp_filter"), "2")
                    .await
            }
            FixStep::IpForward => self.ensure_sysctl("net.ipv4.ip_forward", "1").await,
            FixStep::LinkUp if flags.up => Ok(StepOutcome::AlreadySet),
            FixStep::LinkUp => self.ip(&["link", "set", "dev", iface, "up"]).await,
            FixStep::Promisc if flags.promisc => Ok(StepOutcome::AlreadySet),
            FixStep::Promisc => self.ip(&["link", "set", "dev", iface, "promisc", "on"]).await,
            FixStep::Arp if !flags.noarp => Ok(StepOutcome::AlreadySet),
            FixStep::Arp => self.ip(&["link", "set", "dev", iface, "arp", "on"]).await,
            FixStep::Route => {
                let cidr = spec.subnet_cidr();
                let out = self
                    .runner
                    .run("ip", &args(&["route", "show", &cidr, "dev", iface]), self.timeout)
                    .await?;
                check(&out)?;
                if !out.stdout.trim().is_empty() {
                    return Ok(StepOutcome::AlreadySet);
                }
                self.ip(&["route", "replace", &cidr, "dev", iface]).await
            }
        }
    }

    async fn ip(&self, parts: &[&str]) -> Result<StepOutcome, StepError> {
        let out = self.runner.run("ip", &args(parts), self.timeout).await?;
        check(&out)?;
        Ok(StepOutcome::Applied)
    }

    /// Set a sysctl to `value` unless it already holds it.
    async fn ensure_sysctl(&self, key: &str, value: &str) -> Result<StepOutcome, StepError> {
        let current = self
            .runner
            .run("sysctl", &args(&["-n", key]), self.timeout)
            .await?;
        check(&current)?;
        if current.stdout.trim() == value {
            return Ok(StepOutcome::AlreadySet);
        }
        let assignment = format!("{key}={value}");
        let out = self
            .runner
            .run("sysctl", &args(&["-w", &assignment]), self.timeout)
            .await?;
        check(&out)?;
        Ok(StepOutcome::Applied)
    }
}
