//! relay-guard: picks the lowest-latency VPN relay, brings the tunnel up, and
//! fails over to a fresh relay whenever the path stops being secure.

mod config;
mod error;
mod relay;
mod state;
mod stats;
mod supervisor;
mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use config::GuardConfig;
use error::SupervisorError;
use relay::catalog::HttpRelayCatalog;
use relay::probe::{LatencyProber, TcpPinger};
use relay::selector::ServerSelector;
use supervisor::{shutdown_channel, ConnectionSupervisor, Termination};
use tunnel::driver::CommandTunnelDriver;
use tunnel::network::SystemNetwork;
use tunnel::status::{HttpStatusOracle, StatusOracle};

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();
    let flag_value = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1).cloned())
    };

    let config_path = flag_value("--config")
        .or_else(|| std::env::var("RELAY_GUARD_CONFIG").ok())
        .unwrap_or_else(|| "relay-guard.toml".to_string());

    let server_override = flag_value("--server");
    let country_override = flag_value("--country");
    let dns_override = flag_value("--dns");
    let multihop = args.iter().any(|a| a == "--multihop");
    let no_latency = args.iter().any(|a| a == "--no-latency");
    let status_only = args.iter().any(|a| a == "--status");

    // Load configuration
    let mut config = GuardConfig::load(&config_path)?;

    // Apply CLI overrides (take precedence over TOML and env vars)
    if server_override.is_some() {
        config.selection.server_name = server_override;
    }
    if country_override.is_some() {
        config.selection.country = country_override;
    }
    if let Some(servers) = dns_override {
        config.network.dns_servers = parse_dns_servers(&servers);
    }
    if multihop {
        config.selection.multihop = true;
    }
    if no_latency {
        config.selection.use_latency_ranking = false;
    }
    config.status_only = status_only;
    config.validate()?;

    // Build the tokio runtime first: the tonic gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let tracing_guard = guard_tracing::init_tracing(&config.tracing);

        if config.status_only {
            return status(&config).await;
        }

        let policy = config.selection_policy();
        tracing::info!(
            config_path = %config_path,
            branch = policy.branch(),
            multihop = policy.multi_hop,
            relays_url = %config.directory.relays_url,
            interface = %config.tunnel.interface_name,
            span_export = tracing_guard.exporting(),
            "Starting relay-guard"
        );

        run(config).await
    })
}

/// `--status`: one oracle query, printed for the user.
async fn status(config: &GuardConfig) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.status.timeout_secs))
        .build()?;

    let report = HttpStatusOracle::new(client, config.status.url.clone())
        .check()
        .await?;
    println!("{report}");
    Ok(())
}

async fn run(config: GuardConfig) -> anyhow::Result<()> {
    // Directory and status endpoints get their own clients and timeouts
    let directory_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.directory.timeout_secs))
        .build()?;
    let status_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.status.timeout_secs))
        .build()?;

    let catalog = Arc::new(HttpRelayCatalog::new(
        directory_client,
        config.directory.relays_url.clone(),
    ));
    let prober = LatencyProber::new(Arc::new(TcpPinger), config.probe_options());
    tracing::debug!(
        port = prober.options().port,
        max_concurrent = prober.options().max_concurrent,
        refined_attempts = prober.options().refined_attempts,
        "Latency prober configured"
    );
    let selector = ServerSelector::new(catalog, prober, config.directory.capability.clone());

    let oracle = Arc::new(HttpStatusOracle::new(status_client, config.status.url.clone()));
    let driver = Arc::new(CommandTunnelDriver::new(
        config.tunnel.interface_name.clone(),
        config.tunnel.peer_port,
        config.tunnel.up_command.clone(),
        config.tunnel.down_command.clone(),
    ));
    let network =
        Arc::new(SystemNetwork::capture(&config.tunnel.interface_name, &config.network).await?);

    // Listen for CTRL+C before touching the tunnel so setup can be cancelled too
    let (trigger, mut signal) = shutdown_channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.trigger();
    });

    let supervisor = match ConnectionSupervisor::establish(
        selector,
        config.selection_policy(),
        oracle,
        driver,
        network,
        config.poll_interval(),
        &mut signal,
    )
    .await
    {
        Ok(supervisor) => supervisor,
        Err(SupervisorError::Cancelled) => {
            tracing::info!("Shutdown before the tunnel was established");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let state = supervisor.state_handle();
    tracing::info!(
        relay = %supervisor.active().describe(),
        state = ?state.get(),
        "Supervising connection"
    );

    let report = supervisor.run(signal).await;

    tracing::info!(
        state = ?state.get(),
        stats = %serde_json::to_string(&report.stats)?,
        "relay-guard stopped"
    );

    match report.termination {
        Termination::Shutdown => Ok(()),
        Termination::FailStop(e) => Err(anyhow::Error::new(e).context("supervision stopped")),
    }
}

/// `--dns 10.64.0.1,10.64.0.2`: comma-separated, blanks ignored.
fn parse_dns_servers(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_string)
        .collect()
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, tearing down tunnel...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dns_servers_splits_and_trims() {
        assert_eq!(
            parse_dns_servers("10.64.0.1, 10.64.0.2,,"),
            vec!["10.64.0.1", "10.64.0.2"]
        );
        assert!(parse_dns_servers("").is_empty());
    }
}
