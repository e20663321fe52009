//! Error taxonomy of the health subsystem.
//!
//! None of these errors escape a supervisor: each is converted into a
//! probe verdict, a remediation record, or an alert event.

use std::time::Duration;

use thiserror::Error;

use crate::fixer::{FixReport, FixStep};

/// Failure to run an external command at all.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` timed out after {after:?}")]
    Timeout { program: String, after: Duration },
}

/// A probe could not observe the tunnel (distinct from a negative probe).
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("interface query failed: {0}")]
    Query(#[from] CommandError),

    #[error("unexpected `{command}` output: {detail}")]
    Unexpected { command: &'static str, detail: String },

    #[error("probe did not finish within {0:?}")]
    Timeout(Duration),
}

/// A remediation action did not complete.
#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("routing fix failed at step(s) {}", format_steps(.failed))]
    StepsFailed {
        failed: Vec<FixStep>,
        report: FixReport,
    },

    #[error("tunnel provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("remediation timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the tunnel-creation collaborator.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("`{command}` exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Retry budget exhausted; carried to the alert sink on escalation.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[error("tunnel `{tunnel}` exhausted {attempts} remediation attempts within {window_secs}s")]
pub struct EscalationRequired {
    pub tunnel: String,
    pub attempts: u32,
    pub window_secs: u64,
}

/// Errors returned by the coordinator's control surface.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("tunnel not registered: {0}")]
    NotRegistered(String),

    #[error("supervisor for `{0}` is no longer running")]
    SupervisorGone(String),

    #[error("coordinator is shut down")]
    ShutDown,
}

fn format_steps(steps: &[FixStep]) -> String {
    steps
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
