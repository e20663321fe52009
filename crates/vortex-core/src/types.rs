//! Domain types shared by the watchdog and its consumers.
//!
//! Tunnel specs are resolved once from configuration and never change
//! while a tunnel is supervised. Probe results and remediation records
//! are immutable values; status snapshots are copies published by each
//! supervisor for read-only consumers.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique tunnel identity (the configured tunnel name).
pub type TunnelName = String;

// ── Tunnel ────────────────────────────────────────────────────────

/// Which side of the link this host is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Iran,
    Kharej,
}

/// Fully resolved specification of one supervised tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub name: TunnelName,
    /// Kernel interface carrying the session (e.g. `l2tpeth0`).
    pub interface: String,
    pub role: Role,
    /// Public address of this host.
    pub local_ip: Ipv4Addr,
    /// Public address of the peer.
    pub remote_ip: Ipv4Addr,
    /// Address assigned to the local end of the tunnel interface.
    pub iface_ip: Ipv4Addr,
    /// Address of the peer end; target of ARP and ICMP probes.
    pub peer_iface_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub tunnel_id: u32,
    pub peer_tunnel_id: u32,
    pub session_id: u32,
    pub peer_session_id: u32,
    /// Ports forwarded over this tunnel by the port-forward manager.
    pub forwarded_ports: Vec<u16>,
    pub enabled: bool,
}

impl TunnelSpec {
    /// Network address of the tunnel subnet.
    pub fn subnet_addr(&self) -> Ipv4Addr {
        let mask = match self.prefix_len {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p.min(32))),
        };
        Ipv4Addr::from(u32::from(self.iface_ip) & mask)
    }

    /// Tunnel subnet in CIDR notation, as `ip route` prints it.
    pub fn subnet_cidr(&self) -> String {
        if self.prefix_len == 32 {
            self.subnet_addr().to_string()
        } else {
            format!("{}/{}", self.subnet_addr(), self.prefix_len)
        }
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Health state of a supervised tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Partial signal loss: the link is there but traffic does not pass.
    Degraded,
    /// No usable signal from the tunnel.
    Unreachable,
    /// A tunnel restart is in flight.
    Recovering,
    /// Automated recovery exhausted; waits for an explicit reset.
    Failed,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unreachable => "unreachable",
            HealthState::Recovering => "recovering",
            HealthState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State reported for a supervisor: a health state, or stopped once the
/// tunnel has been deregistered or the watchdog shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Active(HealthState),
    Stopped,
}

impl SupervisorState {
    pub fn health(&self) -> Option<HealthState> {
        match self {
            SupervisorState::Active(h) => Some(*h),
            SupervisorState::Stopped => None,
        }
    }
}

/// Result of one successful probe run against a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub interface_up: bool,
    pub ip_assigned: bool,
    pub arp_present: bool,
    pub icmp_reachable: bool,
    /// ICMP round-trip time in microseconds, when the ping succeeded.
    pub latency_us: Option<u64>,
    /// Unix timestamp (seconds) when the probe completed.
    pub timestamp: u64,
}

impl ProbeResult {
    /// A probe that saw nothing at all (missing interface, for example).
    pub fn dark(timestamp: u64) -> Self {
        Self {
            interface_up: false,
            ip_assigned: false,
            arp_present: false,
            icmp_reachable: false,
            latency_us: None,
            timestamp,
        }
    }
}

// ── Remediation ───────────────────────────────────────────────────

/// Corrective action taken by a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    RoutingFix,
    RestartTunnel,
    Escalate,
}

impl RemediationAction {
    /// Whether the action counts against the retry budget.
    pub fn is_attempt(&self) -> bool {
        !matches!(self, RemediationAction::Escalate)
    }
}

/// How a remediation action ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum RemediationOutcome {
    Succeeded,
    Failed(String),
}

impl RemediationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RemediationOutcome::Succeeded)
    }
}

/// Append-only log entry of one remediation action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub action: RemediationAction,
    pub outcome: RemediationOutcome,
    /// Unix timestamp (seconds) when the action was taken.
    pub timestamp: u64,
    /// Backoff level after the action.
    pub backoff_level: u32,
}

// ── Status ────────────────────────────────────────────────────────

/// Point-in-time status of one tunnel, as published by its supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub name: TunnelName,
    pub interface: String,
    /// Local tunnel endpoint used by the port-forward manager.
    pub local_endpoint: Ipv4Addr,
    pub forwarded_ports: Vec<u16>,
    pub state: SupervisorState,
    pub consecutive_failures: u32,
    pub backoff_level: u32,
    pub last_action: Option<RemediationRecord>,
    pub last_success_at: Option<u64>,
    pub last_probe: Option<ProbeResult>,
    /// Unix timestamp of the last status change.
    pub updated_at: u64,
}

impl TunnelStatus {
    /// Status of a tunnel that has not been probed yet.
    pub fn registered(spec: &TunnelSpec, now: u64) -> Self {
        Self {
            name: spec.name.clone(),
            interface: spec.interface.clone(),
            local_endpoint: spec.iface_ip,
            forwarded_ports: spec.forwarded_ports.clone(),
            state: SupervisorState::Active(HealthState::Unreachable),
            consecutive_failures: 0,
            backoff_level: 0,
            last_action: None,
            last_success_at: None,
            last_probe: None,
            updated_at: now,
        }
    }
}

/// Counts of tunnels per state, for monitoring consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStatus {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unreachable: usize,
    pub recovering: usize,
    pub failed: usize,
    pub stopped: usize,
}

impl AggregateStatus {
    /// Tally a set of tunnel statuses.
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a TunnelStatus>) -> Self {
        let mut agg = AggregateStatus::default();
        for status in statuses {
            agg.total += 1;
            match status.state {
                SupervisorState::Active(HealthState::Healthy) => agg.healthy += 1,
                SupervisorState::Active(HealthState::Degraded) => agg.degraded += 1,
                SupervisorState::Active(HealthState::Unreachable) => agg.unreachable += 1,
                SupervisorState::Active(HealthState::Recovering) => agg.recovering += 1,
                SupervisorState::Active(HealthState::Failed) => agg.failed += 1,
                SupervisorState::Stopped => agg.stopped += 1,
            }
        }
        agg
    }

    /// True when every supervised tunnel is healthy.
    pub fn all_healthy(&self) -> bool {
        self.healthy == self.total - self.stopped
    }
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
