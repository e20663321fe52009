//! config.toml parser and tunnel resolution.
//!
//! The file has a `[watchdog]` table of tuning knobs (all optional) and
//! one `[[tunnels]]` entry per supervised link. Tunnel entries are
//! written from the point of view of both hosts (`ip_iran`, `ip_kharej`)
//! and resolved into a [`TunnelSpec`] using this host's `role`.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{Role, TunnelSpec};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vortexl2/config.toml";

const MAX_IFNAME_LEN: usize = 15;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VortexConfig {
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// Raw `[watchdog]` table. Durations are strings like `"10s"`, `"500ms"`, `"5m"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub probe_interval: Option<String>,
    pub probe_timeout: Option<String>,
    pub action_timeout: Option<String>,
    pub failure_threshold: Option<u32>,
    pub recovery_threshold: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_window: Option<String>,
    pub fix_cooldown: Option<String>,
    pub backoff_base: Option<String>,
    pub backoff_max: Option<String>,
    pub shutdown_grace: Option<String>,
}

/// Raw `[[tunnels]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    pub role: Role,
    pub ip_iran: String,
    pub ip_kharej: String,
    pub interface: Option<String>,
    pub iran_iface_ip: Option<String>,
    pub kharej_iface_ip: Option<String>,
    pub prefix_len: Option<u8>,
    pub tunnel_id: Option<u32>,
    pub peer_tunnel_id: Option<u32>,
    pub session_id: Option<u32>,
    pub peer_session_id: Option<u32>,
    #[serde(default)]
    pub forwarded_ports: Vec<u16>,
    pub enabled: Option<bool>,
}

/// Resolved watchdog tuning used by the health subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogSettings {
    /// Time between two probe cycles of one tunnel.
    pub probe_interval: Duration,
    /// Upper bound for each probe query.
    pub probe_timeout: Duration,
    /// Upper bound for a remediation action.
    pub action_timeout: Duration,
    /// Consecutive failing probes before a downgrade.
    pub failure_threshold: u32,
    /// Consecutive passing probes before an upgrade.
    pub recovery_threshold: u32,
    /// Remediation attempts allowed inside `retry_window`.
    pub max_retries: u32,
    pub retry_window: Duration,
    /// A routing fix is not repeated inside this window.
    pub fix_cooldown: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long shutdown waits for in-flight cycles.
    pub shutdown_grace: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            action_timeout: Duration::from_secs(10),
            failure_threshold: 3,
            recovery_threshold: 2,
            max_retries: 5,
            retry_window: Duration::from_secs(600),
            fix_cooldown: Duration::from_secs(120),
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl VortexConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Resolve the watchdog settings, failing on the first invalid knob.
    pub fn settings(&self) -> ConfigResult<WatchdogSettings> {
        self.watchdog.resolve()
    }

    /// Resolve every tunnel entry, including disabled ones.
    ///
    /// Names must be unique across the file.
    pub fn tunnel_specs(&self) -> ConfigResult<Vec<TunnelSpec>> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.tunnels.len());
        for tunnel in &self.tunnels {
            let spec = tunnel.resolve()?;
            if !seen.insert(spec.name.clone()) {
                return Err(ConfigError::Tunnel {
                    tunnel: spec.name,
                    reason: "duplicate tunnel name".to_string(),
                });
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Scaffold a single-tunnel config for the given role.
    pub fn scaffold(role: Role, ip_iran: &str, ip_kharej: &str) -> Self {
        VortexConfig {
            watchdog: WatchdogConfig {
                probe_interval: Some("10s".to_string()),
                probe_timeout: Some("2s".to_string()),
                failure_threshold: Some(3),
                recovery_threshold: Some(2),
                max_retries: Some(5),
                ..WatchdogConfig::default()
            },
            tunnels: vec![TunnelConfig {
                name: "vortex1".to_string(),
                role,
                ip_iran: ip_iran.to_string(),
                ip_kharej: ip_kharej.to_string(),
                interface: None,
                iran_iface_ip: None,
                kharej_iface_ip: None,
                prefix_len: None,
                tunnel_id: None,
                peer_tunnel_id: None,
                session_id: None,
                peer_session_id: None,
                forwarded_ports: Vec::new(),
                enabled: None,
            }],
        }
    }
}

impl WatchdogConfig {
    pub fn resolve(&self) -> ConfigResult<WatchdogSettings> {
        let d = WatchdogSettings::default();
        let settings = WatchdogSettings {
            probe_interval: duration_or("probe_interval", &self.probe_interval, d.probe_interval)?,
            probe_timeout: duration_or("probe_timeout", &self.probe_timeout, d.probe_timeout)?,
            action_timeout: duration_or("action_timeout", &self.action_timeout, d.action_timeout)?,
            failure_threshold: self.failure_threshold.unwrap_or(d.failure_threshold),
            recovery_threshold: self.recovery_threshold.unwrap_or(d.recovery_threshold),
            max_retries: self.max_retries.unwrap_or(d.max_retries),
            retry_window: duration_or("retry_window", &self.retry_window, d.retry_window)?,
            fix_cooldown: duration_or("fix_cooldown", &self.fix_cooldown, d.fix_cooldown)?,
            backoff_base: duration_or("backoff_base", &self.backoff_base, d.backoff_base)?,
            backoff_max: duration_or("backoff_max", &self.backoff_max, d.backoff_max)?,
            shutdown_grace: duration_or("shutdown_grace", &self.shutdown_grace, d.shutdown_grace)?,
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl WatchdogSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        let nonzero = [
            ("failure_threshold", self.failure_threshold),
            ("recovery_threshold", self.recovery_threshold),
            ("max_retries", self.max_retries),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Watchdog {
                    key,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::Watchdog {
                key: "probe_interval",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Watchdog {
                key: "probe_timeout",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::Watchdog {
                key: "backoff_base",
                reason: format!(
                    "{:?} exceeds backoff_max {:?}",
                    self.backoff_base, self.backoff_max
                ),
            });
        }
        Ok(())
    }
}

/// Role-based L2TP identifiers: (tunnel_id, peer_tunnel_id, session_id, peer_session_id).
fn role_ids(role: Role) -> (u32, u32, u32, u32) {
    match role {
        Role::Iran => (1000, 2000, 10, 20),
        Role::Kharej => (2000, 1000, 20, 10),
    }
}

impl TunnelConfig {
    /// Resolve this entry into a concrete spec for the local host.
    pub fn resolve(&self) -> ConfigResult<TunnelSpec> {
        let invalid = |reason: String| ConfigError::Tunnel {
            tunnel: self.name.clone(),
            reason,
        };

        let name = self.name.trim();
        if name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }

        let interface = self.interface.clone().unwrap_or_else(|| "l2tpeth0".to_string());
        if interface.is_empty() || interface.len() > MAX_IFNAME_LEN {
            return Err(invalid(format!(
                "interface name {interface:?} must be 1-{MAX_IFNAME_LEN} bytes"
            )));
        }

        let parse_ip = |field: &str, value: &str| -> ConfigResult<Ipv4Addr> {
            value
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| invalid(format!("{field} {value:?} is not an IPv4 address")))
        };

        let ip_iran = parse_ip("ip_iran", &self.ip_iran)?;
        let ip_kharej = parse_ip("ip_kharej", &self.ip_kharej)?;
        let iran_iface_ip = parse_ip(
            "iran_iface_ip",
            self.iran_iface_ip.as_deref().unwrap_or("10.30.30.1"),
        )?;
        let kharej_iface_ip = parse_ip(
            "kharej_iface_ip",
            self.kharej_iface_ip.as_deref().unwrap_or("10.30.30.2"),
        )?;

        if iran_iface_ip == kharej_iface_ip {
            return Err(invalid(
                "iran_iface_ip and kharej_iface_ip must differ".to_string(),
            ));
        }

        let prefix_len = self.prefix_len.unwrap_or(30);
        if !(1..=32).contains(&prefix_len) {
            return Err(invalid(format!("prefix_len {prefix_len} out of range 1-32")));
        }

        let (local_ip, remote_ip, iface_ip, peer_iface_ip) = match self.role {
            Role::Iran => (ip_iran, ip_kharej, iran_iface_ip, kharej_iface_ip),
            Role::Kharej => (ip_kharej, ip_iran, kharej_iface_ip, iran_iface_ip),
        };

        let (tunnel_id, peer_tunnel_id, session_id, peer_session_id) = role_ids(self.role);

        Ok(TunnelSpec {
            name: name.to_string(),
            interface,
            role: self.role,
            local_ip,
            remote_ip,
            iface_ip,
            peer_iface_ip,
            prefix_len,
            tunnel_id: self.tunnel_id.unwrap_or(tunnel_id),
            peer_tunnel_id: self.peer_tunnel_id.unwrap_or(peer_tunnel_id),
            session_id: self.session_id.unwrap_or(session_id),
            peer_session_id: self.peer_session_id.unwrap_or(peer_session_id),
            forwarded_ports: self.forwarded_ports.clone(),
            enabled: self.enabled.unwrap_or(true),
        })
    }
}

fn duration_or(
    key: &'static str,
    value: &Option<String>,
    default: Duration,
) -> ConfigResult<Duration> {
    match value {
        None => Ok(default),
        Some(s) => parse_duration(s).ok_or_else(|| ConfigError::Duration {
            key,
            value: s.clone(),
        }),
    }
}

/// Parse a duration string like "5s", "500ms", "1m", or plain seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[watchdog]
probe_interval = "15s"
probe_timeout = "1500ms"
failure_threshold = 4
fix_cooldown = "3m"

[[tunnels]]
name = "vortex1"
role = "iran"
ip_iran = "203.0.113.10"
ip_kharej = "198.51.100.20"
forwarded_ports = [443, 8443]

[[tunnels]]
name = "vortex2"
role = "kharej"
ip_iran = "203.0.113.11"
ip_kharej = "198.51.100.21"
interface = "l2tpeth1"
iran_iface_ip = "10.40.40.1"
kharej_iface_ip = "10.40.40.2"
tunnel_id = 3000
enabled = false
"#;

    #[test]
    fn parse_sample_config() {
        let config = VortexConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.tunnels.len(), 2);

        let settings = config.settings().unwrap();
        assert_eq!(settings.probe_interval, Duration::from_secs(15));
        assert_eq!(settings.probe_timeout, Duration::from_millis(1500));
        assert_eq!(settings.failure_threshold, 4);
        assert_eq!(settings.fix_cooldown, Duration::from_secs(180));
        // Untouched keys keep their defaults.
        assert_eq!(settings.recovery_threshold, 2);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.backoff_max, Duration::from_secs(300));
    }

    #[test]
    fn empty_watchdog_table_uses_defaults() {
        let config = VortexConfig::from_toml("").unwrap();
        assert_eq!(config.settings().unwrap(), WatchdogSettings::default());
        assert!(config.tunnel_specs().unwrap().is_empty());
    }

    #[test]
    fn iran_role_resolves_local_side() {
        let config = VortexConfig::from_toml(SAMPLE).unwrap();
        let specs = config.tunnel_specs().unwrap();
        let t = &specs[0];
        assert_eq!(t.role, Role::Iran);
        assert_eq!(t.local_ip, Ipv4Addr::new(203, 0, 113, 10));
        assert_eq!(t.remote_ip, Ipv4Addr::new(198, 51, 100, 20));
        assert_eq!(t.iface_ip, Ipv4Addr::new(10, 30, 30, 1));
        assert_eq!(t.peer_iface_ip, Ipv4Addr::new(10, 30, 30, 2));
        assert_eq!(t.interface, "l2tpeth0");
        assert_eq!(
            (t.tunnel_id, t.peer_tunnel_id, t.session_id, t.peer_session_id),
            (1000, 2000, 10, 20)
        );
        assert_eq!(t.forwarded_ports, vec![443, 8443]);
        assert!(t.enabled);
    }

    #[test]
    fn kharej_role_swaps_sides_and_ids() {
        let config = VortexConfig::from_toml(SAMPLE).unwrap();
        let specs = config.tunnel_specs().unwrap();
        let t = &specs[1];
        assert_eq!(t.local_ip, Ipv4Addr::new(198, 51, 100, 21));
        assert_eq!(t.remote_ip, Ipv4Addr::new(203, 0, 113, 11));
        assert_eq!(t.iface_ip, Ipv4Addr::new(10, 40, 40, 2));
        assert_eq!(t.peer_iface_ip, Ipv4Addr::new(10, 40, 40, 1));
        // Explicit tunnel_id wins, the rest follow the role.
        assert_eq!(
            (t.tunnel_id, t.peer_tunnel_id, t.session_id, t.peer_session_id),
            (3000, 1000, 20, 10)
        );
        assert!(!t.enabled);
    }

    #[test]
    fn duplicate_names_rejected() {
        let toml_str = r#"
[[tunnels]]
name = "a"
role = "iran"
ip_iran = "1.1.1.1"
ip_kharej = "2.2.2.2"

[[tunnels]]
name = "a"
role = "iran"
ip_iran = "1.1.1.1"
ip_kharej = "2.2.2.2"
"#;
        let config = VortexConfig::from_toml(toml_str).unwrap();
        let err = config.tunnel_specs().unwrap_err();
        assert!(matches!(err, ConfigError::Tunnel { ref reason, .. } if reason.contains("duplicate")));
    }

    #[test]
    fn bad_ip_rejected() {
        let mut config = VortexConfig::scaffold(Role::Iran, "1.1.1.1", "not-an-ip");
        let err = config.tunnel_specs().unwrap_err();
        assert!(err.to_string().contains("ip_kharej"));

        config.tunnels[0].ip_kharej = "2.2.2.2".to_string();
        config.tunnels[0].iran_iface_ip = Some("10.0.0.9".to_string());
        config.tunnels[0].kharej_iface_ip = Some("10.0.0.9".to_string());
        assert!(config.tunnel_specs().is_err());
    }

    #[test]
    fn long_interface_name_rejected() {
        let mut config = VortexConfig::scaffold(Role::Iran, "1.1.1.1", "2.2.2.2");
        config.tunnels[0].interface = Some("l2tpeth-way-too-long".to_string());
        assert!(config.tunnel_specs().is_err());
    }

    #[test]
    fn prefix_out_of_range_rejected() {
        let mut config = VortexConfig::scaffold(Role::Iran, "1.1.1.1", "2.2.2.2");
        config.tunnels[0].prefix_len = Some(33);
        assert!(config.tunnel_specs().is_err());
        config.tunnels[0].prefix_len = Some(0);
        assert!(config.tunnel_specs().is_err());
    }

    #[test]
    fn invalid_duration_is_fatal() {
        let config = VortexConfig::from_toml("[watchdog]\nprobe_interval = \"soon\"\n").unwrap();
        let err = config.settings().unwrap_err();
        assert!(matches!(err, ConfigError::Duration { key: "probe_interval", .. }));
    }

    #[test]
    fn overflowing_minutes_are_fatal() {
        let toml = format!("[watchdog]\nretry_window = \"{}m\"\n", u64::MAX);
        let config = VortexConfig::from_toml(&toml).unwrap();
        let err = config.settings().unwrap_err();
        assert!(matches!(err, ConfigError::Duration { key: "retry_window", .. }));
    }

    #[test]
    fn zero_threshold_is_fatal() {
        let config = VortexConfig::from_toml("[watchdog]\nfailure_threshold = 0\n").unwrap();
        assert!(matches!(
            config.settings().unwrap_err(),
            ConfigError::Watchdog { key: "failure_threshold", .. }
        ));
    }

    #[test]
    fn backoff_base_above_cap_is_fatal() {
        let toml_str = "[watchdog]\nbackoff_base = \"10m\"\nbackoff_max = \"5m\"\n";
        let config = VortexConfig::from_toml(toml_str).unwrap();
        assert!(config.settings().is_err());
    }

    #[test]
    fn unknown_role_fails_to_parse() {
        let toml_str = r#"
[[tunnels]]
name = "a"
role = "moon"
ip_iran = "1.1.1.1"
ip_kharej = "2.2.2.2"
"#;
        assert!(matches!(
            VortexConfig::from_toml(toml_str),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn scaffold_round_trips_through_toml() {
        let config = VortexConfig::scaffold(Role::Kharej, "1.1.1.1", "2.2.2.2");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("kharej"));
        let back = VortexConfig::from_toml(&toml_str).unwrap();
        assert_eq!(back.tunnel_specs().unwrap(), config.tunnel_specs().unwrap());
    }

    #[test]
    fn from_file_reads_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = VortexConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tunnels[0].name, "vortex1");
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = VortexConfig::from_file(Path::new("/nonexistent/vortexl2.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("later"), None);
        // Minutes that overflow u64 seconds are rejected, not wrapped.
        assert_eq!(parse_duration(&format!("{}m", u64::MAX / 60 + 1)), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
    }
}
