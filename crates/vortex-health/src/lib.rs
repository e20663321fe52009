//! vortex-health: tunnel health checking and automatic recovery.
//!
//! Probes each L2TP tunnel on an interval, classifies its health with
//! hysteresis, and escalates remediation from a routing fix to a tunnel
//! restart to a parked `Failed` state once the retry budget is spent.
//!
//! # Architecture
//!
//! ```text
//! WatchdogCoordinator
//!   ├── Per-tunnel background task (TunnelSupervisor)
//!   │   ├── ProbeEngine        → ProbeOutcome
//!   │   ├── HealthClassifier   → HealthState (N down / M up hysteresis)
//!   │   ├── RemediationPlanner → NoAction | RoutingFix | Restart | Escalate
//!   │   ├── RoutingFixer / TunnelProvisioner
//!   │   └── publish TunnelStatus over a watch channel
//!   └── snapshot() / aggregate() for the port-forward manager
//! ```
//!
//! Every kernel interaction goes through [`CommandRunner`], so the whole
//! pipeline can run against an in-memory host in tests.
//!
//! # Backoff
//!
//! Each remediation attempt raises the tunnel's backoff level; the next
//! attempt waits `base · 2^(level-1)`, capped. The level drops back to
//! zero only when the tunnel is classified `Healthy` again.

pub mod alert;
pub mod classifier;
pub mod command;
pub mod coordinator;
pub mod error;
pub mod fixer;
pub mod planner;
pub mod probe;
pub mod provision;
pub mod supervisor;

#[cfg(test)]
mod testkit;

pub use alert::{AlertSink, ChannelAlertSink, FanoutAlertSink, HealthEvent, LogAlertSink};
pub use classifier::{HealthClassifier, ProbeWindow, Verdict};
pub use command::{BoxFuture, CommandOutput, CommandRunner, SystemRunner};
pub use coordinator::WatchdogCoordinator;
pub use error::{
    CommandError, CoordinatorError, EscalationRequired, ProbeError, ProvisionError,
    RemediationError,
};
pub use fixer::{FixReport, FixStep, RoutingFixer, StepOutcome};
pub use planner::{BackoffPolicy, PlanDecision, PlanInput, RemediationPlan, RemediationPlanner};
pub use probe::{ProbeEngine, ProbeOutcome, TunnelProbe};
pub use provision::{IpL2tpProvisioner, SessionInfo, TunnelProvisioner};
pub use supervisor::{CycleReport, SupervisorCommand, SupervisorDeps, Tunnel, TunnelSupervisor};
