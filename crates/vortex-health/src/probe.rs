//! Tunnel probes.
//!
//! A probe is a read-only look at one tunnel: is the interface up, does
//! it carry its address, does the kernel hold a neighbor entry for the
//! peer, and does the peer answer a ping. All four queries share one
//! deadline, so a whole probe never outlives the probe timeout. Nothing
//! here changes host configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use vortex_core::{epoch_secs, ProbeResult, TunnelSpec};

use crate::command::{args, BoxFuture, CommandOutput, CommandRunner};
use crate::error::{CommandError, ProbeError};

/// Outcome of one probe: a (possibly negative) result, or a failure to observe.
pub type ProbeOutcome = Result<ProbeResult, ProbeError>;

/// Something that can probe a tunnel.
pub trait TunnelProbe: Send + Sync {
    fn probe<'a>(&'a self, spec: &'a TunnelSpec) -> BoxFuture<'a, ProbeOutcome>;
}

/// Link flags parsed from `ip -o link show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkFlags {
    pub up: bool,
    pub lower_up: bool,
    pub promisc: bool,
    pub noarp: bool,
}

impl LinkFlags {
    /// Parse the `<FLAG,FLAG,...>` section of a link line.
    pub fn parse(line: &str) -> Option<Self> {
        let start = line.find('<')?;
        let end = line[start..].find('>')? + start;
        let mut flags = LinkFlags::default();
        for flag in line[start + 1..end].split(',') {
            match flag {
                "UP" => flags.up = true,
                "LOWER_UP" => flags.lower_up = true,
                "PROMISC" => flags.promisc = true,
                "NOARP" => flags.noarp = true,
                _ => {}
            }
        }
        Some(flags)
    }
}

/// Result of querying a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuery {
    Missing,
    Present(LinkFlags),
}

/// Query a link's flags; a missing device is a normal answer, not an error.
pub(crate) async fn query_link(
    runner: &dyn CommandRunner,
    interface: &str,
    timeout: Duration,
) -> Result<LinkQuery, ProbeError> {
    let out = runner
        .run("ip", &args(&["-o", "link", "show", "dev", interface]), timeout)
        .await?;
    parse_link_output(&out)
}

fn parse_link_output(out: &CommandOutput) -> Result<LinkQuery, ProbeError> {
    if !out.success {
        let stderr = out.stderr.to_ascii_lowercase();
        if stderr.contains("does not exist") || stderr.contains("cannot find device") {
            return Ok(LinkQuery::Missing);
        }
        return Err(ProbeError::Unexpected {
            command: "ip link show",
            detail: out.stderr.trim().to_string(),
        });
    }
    match LinkFlags::parse(&out.stdout) {
        Some(flags) => Ok(LinkQuery::Present(flags)),
        None if out.stdout.trim().is_empty() => Ok(LinkQuery::Missing),
        None => Err(ProbeError::Unexpected {
            command: "ip link show",
            detail: out.stdout.trim().to_string(),
        }),
    }
}

/// Whether `ip neigh show` output holds a usable entry.
fn neighbor_present(stdout: &str) -> bool {
    stdout.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.contains("FAILED") && !line.contains("INCOMPLETE")
    })
}

/// Extract `time=<ms> ms` from ping output, in microseconds.
fn parse_ping_latency(stdout: &str) -> Option<u64> {
    let rest = &stdout[stdout.find("time=")? + "time=".len()..];
    let value: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let ms: f64 = value.parse().ok()?;
    Some((ms * 1000.0).round() as u64)
}

/// Probes tunnels through `ip` and `ping`.
pub struct ProbeEngine {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ProbeEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Run one query, giving up at the probe's deadline.
    async fn query(
        &self,
        deadline: Instant,
        program: &str,
        parts: &[&str],
    ) -> Result<CommandOutput, CommandError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let argv = args(parts);
        match tokio::time::timeout_at(deadline, self.runner.run(program, &argv, budget)).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Timeout {
                program: program.to_string(),
                after: self.timeout,
            }),
        }
    }

    async fn run_probe(&self, spec: &TunnelSpec) -> ProbeOutcome {
        let deadline = Instant::now() + self.timeout;
        let iface = spec.interface.as_str();

        let link = self
            .query(deadline, "ip", &["-o", "link", "show", "dev", iface])
            .await?;
        let flags = match parse_link_output(&link)? {
            LinkQuery::Missing => {
                debug!(tunnel = %spec.name, %iface, "interface missing");
                return Ok(ProbeResult::dark(epoch_secs()));
            }
            LinkQuery::Present(flags) => flags,
        };

        let addr = self
            .query(deadline, "ip", &["-o", "-4", "addr", "show", "dev", iface])
            .await?;
        let needle = format!("inet {}/", spec.iface_ip);
        let ip_assigned = addr.success && addr.stdout.contains(&needle);

        let peer = spec.peer_iface_ip.to_string();
        let neigh = self
            .query(deadline, "ip", &["neigh", "show", &peer, "dev", iface])
            .await?;
        let arp_present = neigh.success && neighbor_present(&neigh.stdout);

        let (icmp_reachable, latency_us) = self.ping(spec, deadline).await?;

        let result = ProbeResult {
            interface_up: flags.up,
            ip_assigned,
            arp_present,
            icmp_reachable,
            latency_us,
            timestamp: epoch_secs(),
        };
        debug!(tunnel = %spec.name, ?result, "probe complete");
        Ok(result)
    }

    /// One ICMP echo to the peer with whatever budget is left; a timeout
    /// means unreachable.
    async fn ping(
        &self,
        spec: &TunnelSpec,
        deadline: Instant,
    ) -> Result<(bool, Option<u64>), ProbeError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let wait_secs = (budget.as_secs_f64().ceil().max(1.0) as u64).to_string();
        let peer = spec.peer_iface_ip.to_string();
        let ping_args = [
            "-n",
            "-c",
            "1",
            "-W",
            wait_secs.as_str(),
            "-I",
            spec.interface.as_str(),
            peer.as_str(),
        ];
        match self.query(deadline, "ping", &ping_args).await {
            Ok(out) if out.success => Ok((true, parse_ping_latency(&out.stdout))),
            Ok(_) => Ok((false, None)),
            Err(CommandError::Timeout { .. }) => {
                debug!(tunnel = %spec.name, "ping timed out");
                Ok((false, None))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl TunnelProbe for ProbeEngine {
    fn probe<'a>(&'a self, spec: &'a TunnelSpec) -> BoxFuture<'a, ProbeOutcome> {
        Box::pin(self.run_probe(spec))
    }
}
