//! `mqtt-rate-proxyd`: a transparent, rate-limiting TCP proxy for MQTT.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mqtt_rate_proxy::{PrometheusMetricsSink, ProxyConfig, ProxyServer};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Transparent TCP reverse proxy for MQTT that rate-limits per-client
/// publish traffic.
#[derive(Parser, Debug)]
#[command(name = "mqtt-rate-proxyd", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the listen address.
    #[arg(long)]
    listen_address: Option<IpAddr>,

    /// Overrides the listen port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Overrides the upstream broker host.
    #[arg(long)]
    broker_host: Option<String>,

    /// Overrides the upstream broker port.
    #[arg(long)]
    broker_port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let mut config = ProxyConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.listen_address {
        config = config.with_listen_address(addr);
    }
    if let Some(port) = cli.listen_port {
        config = config.with_listen_port(port);
    }
    if let Some(host) = cli.broker_host {
        config = config.with_broker_host(host);
    }
    if let Some(port) = cli.broker_port {
        config = config.with_broker_port(port);
    }

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(PrometheusMetricsSink::new(registry)?);

    let server = ProxyServer::new(config, metrics);
    println!("mqtt-rate-proxyd is ready. Press Ctrl+C to stop.");
    server.run_with_signal_handling()?;

    Ok(())
}
