//! Tunnel creation collaborator.
//!
//! The watchdog restarts tunnels through [`TunnelProvisioner`] and never
//! builds sessions itself. [`IpL2tpProvisioner`] is the stock
//! implementation: a static (unmanaged) L2TPv3 tunnel over IP built
//! with `ip l2tp`, which is how VortexL2 links are set up.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use vortex_core::TunnelSpec;

use crate::command::{args, BoxFuture, CommandRunner};
use crate::error::ProvisionError;

/// Identifiers of an established session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub tunnel_id: u32,
    pub session_id: u32,
    pub interface: String,
}

/// Creates and tears down tunnel sessions.
pub trait TunnelProvisioner: Send + Sync {
    /// Bring the session up. Callers tear down any previous session first.
    fn create_or_restart<'a>(
        &'a self,
        spec: &'a TunnelSpec,
    ) -> BoxFuture<'a, Result<SessionInfo, ProvisionError>>;

    /// Remove the session; removing an absent session is not an error.
    fn teardown<'a>(&'a self, spec: &'a TunnelSpec) -> BoxFuture<'a, Result<(), ProvisionError>>;
}

/// Builds static L2TPv3 tunnels with `ip l2tp`.
pub struct IpL2tpProvisioner {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl IpL2tpProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    async fn ip(&self, parts: &[&str]) -> Result<(), ProvisionError> {
        let out = self.runner.run("ip", &args(parts), self.timeout).await?;
        if out.success {
            Ok(())
        } else {
            Err(ProvisionError::Failed {
                command: format!("ip {}", parts.join(" ")),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    async fn remove(&self, spec: &TunnelSpec) -> Result<(), ProvisionError> {
        let tunnel_id = spec.tunnel_id.to_string();
        let session_id = spec.session_id.to_string();
        let steps: [&[&str]; 2] = [
            &["l2tp", "del", "session", "tunnel_id", &tunnel_id, "session_id", &session_id],
            &["l2tp", "del", "tunnel", "tunnel_id", &tunnel_id],
        ];
        for step in steps {
            match self.ip(step).await {
                Ok(()) => {}
                // Already gone.
                Err(ProvisionError::Failed { .. }) => {
                    debug!(tunnel = %spec.name, command = ?step, "nothing to remove");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &TunnelSpec) -> Result<SessionInfo, ProvisionError> {
        let tunnel_id = spec.tunnel_id.to_string();
        let peer_tunnel_id = spec.peer_tunnel_id.to_string();
        let session_id = spec.session_id.to_string();
        let peer_session_id = spec.peer_session_id.to_string();
        let local = spec.local_ip.to_string();
        let remote = spec.remote_ip.to_string();
        let address = format!("{}/{}", spec.iface_ip, spec.prefix_len);
        let iface = spec.interface.as_str();

        self.ip(&[
            "l2tp", "add", "tunnel", "tunnel_id", &tunnel_id, "peer_tunnel_id", &peer_tunnel_id,
            "encap", "ip", "local", &local, "remote", &remote,
        ])
        .await?;
        self.ip(&[
            "l2tp", "add", "session", "name", iface, "tunnel_id", &tunnel_id, "session_id",
            &session_id, "peer_session_id", &peer_session_id,
        ])
        .await?;
        self.ip(&["addr", "replace", &address, "dev", iface]).await?;
        self.ip(&["link", "set", "dev", iface, "up"]).await?;

        info!(tunnel = %spec.name, %iface, tunnel_id = spec.tunnel_id, "l2tp session created");
        Ok(SessionInfo {
            tunnel_id: spec.tunnel_id,
            session_id: spec.session_id,
            interface: spec.interface.clone(),
        })
    }
}

impl TunnelProvisioner for IpL2tpProvisioner {
    fn create_or_restart<'a>(
        &'a self,
        spec: &'a TunnelSpec,
    ) -> BoxFuture<'a, Result<SessionInfo, ProvisionError>> {
        Box::pin(self.create(spec))
    }

    fn teardown<'a>(&'a self, spec: &'a TunnelSpec) -> BoxFuture<'a, Result<(), ProvisionError>> {
        Box::pin(self.remove(spec))
    }
}
