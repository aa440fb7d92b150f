//! Configuration types and loading logic.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use guard_tracing::TracingConfig;
use serde::Deserialize;

use crate::relay::probe::ProbeOptions;
use crate::relay::SelectionPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub directory: DirectoryConfig,
    pub status: StatusConfig,
    pub probe: ProbeConfig,
    pub selection: SelectionConfig,
    pub supervisor: SupervisorConfig,
    pub tunnel: TunnelConfig,
    pub network: NetworkConfig,
    pub tracing: TracingConfig,

    /// Query the status endpoint once and exit. Set via CLI `--status`.
    #[serde(skip)]
    pub status_only: bool,
}

/// Relay directory endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_relays_url")]
    pub relays_url: String,

    /// Relay type every candidate must offer.
    #[serde(default = "default_capability")]
    pub capability: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Status oracle endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_url")]
    pub url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Latency probing.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_port")]
    pub port: u16,

    #[serde(default = "default_coarse_timeout_ms")]
    pub coarse_timeout_ms: u64,

    #[serde(default = "default_refined_timeout_ms")]
    pub refined_timeout_ms: u64,

    #[serde(default = "default_refined_attempts")]
    pub refined_attempts: u32,

    /// Upper bound on probes in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Share of coarse survivors (percent, rounded up) that get refined.
    #[serde(default = "default_refine_percent")]
    pub refine_percent: usize,

    #[serde(default = "default_refine_floor")]
    pub refine_floor: usize,
}

/// Which relay to use. `server_name` beats `country`, which beats ranking.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub country: Option<String>,

    #[serde(default = "default_true")]
    pub use_latency_ranking: bool,

    #[serde(default)]
    pub multihop: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Tunnel commands. `{interface}` is replaced with `interface_name`; the
/// selected hops arrive as `RELAY_ENTRY_*` / `RELAY_EXIT_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_interface")]
    pub interface_name: String,

    /// WireGuard port on every relay, used for `RELAY_*_PEER`.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    #[serde(default = "default_up_command")]
    pub up_command: Vec<String>,

    #[serde(default = "default_down_command")]
    pub down_command: Vec<String>,
}

/// Host routing and resolver changes made while connected.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_true")]
    pub manage_routes: bool,

    #[serde(default = "default_true")]
    pub manage_dns: bool,

    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,

    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: String,

    #[serde(default = "default_route_add_command")]
    pub route_add_command: Vec<String>,

    #[serde(default = "default_route_delete_command")]
    pub route_delete_command: Vec<String>,
}

fn default_relays_url() -> String {
    "https://api.mullvad.net/www/relays/all/".to_string()
}

fn default_capability() -> String {
    "wireguard".to_string()
}

fn default_status_url() -> String {
    "https://am.i.mullvad.net/json".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_probe_port() -> u16 {
    443
}

fn default_coarse_timeout_ms() -> u64 {
    500
}

fn default_refined_timeout_ms() -> u64 {
    2000
}

fn default_refined_attempts() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    50
}

fn default_refine_percent() -> usize {
    10
}

fn default_refine_floor() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    300
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn default_peer_port() -> u16 {
    51820
}

/// Bring the interface up, then point its peer at the entry relay.
fn default_up_command() -> Vec<String> {
    argv(&[
        "sh",
        "-c",
        "wg-quick up \"$0\" && wg set \"$0\" peer \"$RELAY_ENTRY_PUBKEY\" \
         endpoint \"$RELAY_ENTRY_PEER\" allowed-ips 0.0.0.0/0,::/0",
        "{interface}",
    ])
}

fn default_down_command() -> Vec<String> {
    argv(&["wg-quick", "down", "{interface}"])
}

fn default_dns_servers() -> Vec<String> {
    argv(&["10.64.0.1"])
}

fn default_resolv_conf() -> String {
    "/etc/resolv.conf".to_string()
}

fn default_route_add_command() -> Vec<String> {
    argv(&["route", "add", "default", "{interface}"])
}

fn default_route_delete_command() -> Vec<String> {
    argv(&["route", "delete", "default"])
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            relays_url: default_relays_url(),
            capability: default_capability(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            url: default_status_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: default_probe_port(),
            coarse_timeout_ms: default_coarse_timeout_ms(),
            refined_timeout_ms: default_refined_timeout_ms(),
            refined_attempts: default_refined_attempts(),
            max_concurrent: default_max_concurrent(),
            refine_percent: default_refine_percent(),
            refine_floor: default_refine_floor(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            country: None,
            use_latency_ranking: true,
            multihop: false,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface_name: default_interface(),
            peer_port: default_peer_port(),
            up_command: default_up_command(),
            down_command: default_down_command(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            manage_routes: true,
            manage_dns: true,
            dns_servers: default_dns_servers(),
            resolv_conf: default_resolv_conf(),
            route_add_command: default_route_add_command(),
            route_delete_command: default_route_delete_command(),
        }
    }
}

impl GuardConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (GUARD_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config: GuardConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("GUARD_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the prober and supervisor cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.probe.max_concurrent == 0 {
            anyhow::bail!("probe.max_concurrent must be at least 1");
        }
        if self.probe.refined_attempts == 0 {
            anyhow::bail!("probe.refined_attempts must be at least 1");
        }
        if !(1..=100).contains(&self.probe.refine_percent) {
            anyhow::bail!(
                "probe.refine_percent must be between 1 and 100, got {}",
                self.probe.refine_percent
            );
        }
        if self.supervisor.poll_interval_secs == 0 {
            anyhow::bail!("supervisor.poll_interval_secs must be at least 1");
        }
        if self.tunnel.up_command.is_empty() || self.tunnel.down_command.is_empty() {
            anyhow::bail!("tunnel.up_command and tunnel.down_command must not be empty");
        }
        if self.network.manage_routes
            && (self.network.route_add_command.is_empty()
                || self.network.route_delete_command.is_empty())
        {
            anyhow::bail!("network route commands must not be empty when manage_routes is on");
        }
        Ok(())
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            port: self.probe.port,
            coarse_timeout: Duration::from_millis(self.probe.coarse_timeout_ms),
            refined_timeout: Duration::from_millis(self.probe.refined_timeout_ms),
            refined_attempts: self.probe.refined_attempts,
            max_concurrent: self.probe.max_concurrent,
            refine_percent: self.probe.refine_percent,
            refine_floor: self.probe.refine_floor,
        }
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            explicit_hostname: self.selection.server_name.clone(),
            region: self.selection.country.clone(),
            use_latency_ranking: self.selection.use_latency_ranking,
            multi_hop: self.selection.multihop,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor.poll_interval_secs)
    }
}
