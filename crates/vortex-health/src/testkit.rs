//! In-memory collaborators for unit tests.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use vortex_core::{ProbeResult, Role, TunnelSpec, WatchdogSettings};

use crate::alert::{ChannelAlertSink, HealthEvent};
use crate::command::testing::{spawn_error, FnRunner};
use crate::command::{BoxFuture, CommandOutput};
use crate::error::{ProbeError, ProvisionError};
use crate::fixer::RoutingFixer;
use crate::probe::{ProbeOutcome, TunnelProbe};
use crate::provision::{SessionInfo, TunnelProvisioner};
use crate::supervisor::SupervisorDeps;

pub(crate) fn spec(name: &str) -> TunnelSpec {
    TunnelSpec {
        name: name.to_string(),
        interface: "l2tpeth0".to_string(),
        role: Role::Iran,
        local_ip: Ipv4Addr::new(203, 0, 113, 10),
        remote_ip: Ipv4Addr::new(198, 51, 100, 20),
        iface_ip: Ipv4Addr::new(10, 30, 30, 1),
        peer_iface_ip: Ipv4Addr::new(10, 30, 30, 2),
        prefix_len: 30,
        tunnel_id: 1000,
        peer_tunnel_id: 2000,
        session_id: 10,
        peer_session_id: 20,
        forwarded_ports: vec![443],
        enabled: true,
    }
}

/// Default thresholds with a fast probe loop.
pub(crate) fn settings() -> WatchdogSettings {
    WatchdogSettings {
        probe_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_secs(1),
        action_timeout: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(1),
        ..WatchdogSettings::default()
    }
}

/// What a scripted probe reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scripted {
    Pass,
    Partial,
    Dead,
    Error,
}

pub(crate) struct ScriptedProbe {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub(crate) fn new(script: impl IntoIterator<Item = Scripted>, fallback: Scripted) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn always(fallback: Scripted) -> Self {
        Self::new([], fallback)
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn observed(up: bool, ip: bool, arp: bool, icmp: bool) -> ProbeResult {
    ProbeResult {
        interface_up: up,
        ip_assigned: ip,
        arp_present: arp,
        icmp_reachable: icmp,
        latency_us: icmp.then_some(12_000),
        timestamp: 0,
    }
}

impl TunnelProbe for ScriptedProbe {
    fn probe<'a>(&'a self, _spec: &'a TunnelSpec) -> BoxFuture<'a, ProbeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        let outcome = match next {
            Scripted::Pass => Ok(observed(true, true, true, true)),
            Scripted::Partial => Ok(observed(true, true, true, false)),
            Scripted::Dead => Ok(ProbeResult::dark(0)),
            Scripted::Error => Err(ProbeError::Query(spawn_error("ip"))),
        };
        Box::pin(async move { outcome })
    }
}

/// A probe that never answers.
pub(crate) struct HangingProbe;

impl TunnelProbe for HangingProbe {
    fn probe<'a>(&'a self, _spec: &'a TunnelSpec) -> BoxFuture<'a, ProbeOutcome> {
        Box::pin(std::future::pending())
    }
}

#[derive(Default)]
pub(crate) struct FakeProvisioner {
    pub(crate) fail: AtomicBool,
    pub(crate) creates: AtomicU32,
    pub(crate) teardowns: AtomicU32,
}

impl FakeProvisioner {
    pub(crate) fn failing() -> Self {
        let p = Self::default();
        p.fail.store(true, Ordering::SeqCst);
        p
    }

    pub(crate) fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }
}

impl TunnelProvisioner for FakeProvisioner {
    fn create_or_restart<'a>(
        &'a self,
        spec: &'a TunnelSpec,
    ) -> BoxFuture<'a, Result<SessionInfo, ProvisionError>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(ProvisionError::Failed {
                command: "ip l2tp add tunnel".to_string(),
                code: Some(2),
                stderr: "RTNETLINK answers: File exists".to_string(),
            })
        } else {
            Ok(SessionInfo {
                tunnel_id: spec.tunnel_id,
                session_id: spec.session_id,
                interface: spec.interface.clone(),
            })
        };
        Box::pin(async move { result })
    }

    fn teardown<'a>(&'a self, _spec: &'a TunnelSpec) -> BoxFuture<'a, Result<(), ProvisionError>> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// A fixer on a host where every setting is already correct.
pub(crate) fn settled_fixer() -> Arc<RoutingFixer> {
    let runner = FnRunner::new(|program: &str, args: &[String]| {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = match (program, argv.as_slice()) {
            ("sysctl", ["-n", key]) if key.ends_with("rp_filter") => CommandOutput::ok("2\n"),
            ("sysctl", ["-n", _]) => CommandOutput::ok("1\n"),
            ("ip", ["-o", "link", ..]) => CommandOutput::ok(
                "7: l2tpeth0: <BROADCAST,MULTICAST,PROMISC,UP,LOWER_UP> mtu 1446\n",
            ),
            ("ip", ["route", "show", ..]) => CommandOutput::ok("10.30.30.0/30 dev l2tpeth0 scope link\n"),
            _ => CommandOutput::ok(""),
        };
        Ok(out)
    });
    Arc::new(RoutingFixer::new(Arc::new(runner), Duration::from_secs(1)))
}

/// A fixer on a host without the `ip`/`sysctl` binaries.
pub(crate) fn broken_fixer() -> Arc<RoutingFixer> {
    let runner = FnRunner::new(|program: &str, _: &[String]| Err(spawn_error(program)));
    Arc::new(RoutingFixer::new(Arc::new(runner), Duration::from_secs(1)))
}

pub(crate) fn deps(
    probe: Arc<dyn TunnelProbe>,
    fixer: Arc<RoutingFixer>,
    provisioner: Arc<dyn TunnelProvisioner>,
) -> (SupervisorDeps, mpsc::Receiver<HealthEvent>) {
    let (sink, events) = ChannelAlertSink::new(256);
    let deps = SupervisorDeps {
        probe,
        fixer,
        provisioner,
        alerts: Arc::new(sink),
    };
    (deps, events)
}

/// Drain everything currently queued on an event receiver.
pub(crate) fn drain(events: &mut mpsc::Receiver<HealthEvent>) -> Vec<HealthEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
