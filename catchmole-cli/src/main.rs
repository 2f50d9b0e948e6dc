//! Daemon entry point: configuration, wiring, and shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use catchmole_config::{CatchmoleConfig, DEFAULT_CONFIG_PATH};
use catchmole_monitor::{ConntrackMonitor, NeighborResolver};
use catchmole_stats::Aggregator;
use catchmole_telemetry::{EventLogger, MetricsRecorder};
use catchmole_web::{run_server, AppState};

#[derive(Parser)]
#[command(version, about = "LAN traffic accounting from kernel conntrack")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Also account LAN-to-LAN traffic
    #[arg(long)]
    lan: bool,

    /// Tick interval in seconds (overrides config)
    #[arg(long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    EventLogger::init();

    let (config_path, explicit) = match cli.config {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let mut config = CatchmoleConfig::load(&config_path, explicit)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(interval) = cli.interval {
        config.interval = interval.max(1);
    }
    if cli.lan {
        config.ignore_lan = false;
    }

    info!("starting catchmole");
    let interval = Duration::from_secs(config.interval);

    let resolver = Arc::new(NeighborResolver::new());

    // Conntrack needs root or CAP_NET_ADMIN; failing to open the sockets or
    // to enlarge the listen buffer is fatal.
    let mut monitor = ConntrackMonitor::start(interval).context("starting conntrack monitor")?;

    let aggregator = Arc::new(Aggregator::new(resolver));
    if let Some(interface) = &config.interface {
        match aggregator.set_interface(interface) {
            Ok(()) => info!("monitoring interface {interface}"),
            Err(e) => warn!("failed to set interface {interface}: {e}"),
        }
    }
    aggregator.set_ignore_lan(config.ignore_lan);
    if config.ignore_lan {
        info!("LAN-to-LAN traffic accounting disabled (default)");
    } else {
        info!("LAN-to-LAN traffic accounting enabled");
    }
    aggregator.set_flow_ttl(Duration::from_secs(config.flow_ttl));
    aggregator.set_device_names(&config.devices);

    let workers = aggregator.start(monitor.events(), interval);

    let state = AppState {
        aggregator: aggregator.clone(),
        metrics: MetricsRecorder::new(),
        ip_tools: config.ip_tools.clone(),
    };
    let listen = config.normalized_listen();
    let server = run_server(&listen, state).with_context(|| format!("binding {listen}"))?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("shutting down");

    server_handle.stop(true).await;
    monitor.stop();
    for worker in workers {
        worker.abort();
    }
    match server_task.await {
        Ok(result) => result.context("web server error")?,
        Err(e) if e.is_cancelled() => {}
        Err(e) => return Err(e).context("web server task"),
    }

    Ok(())
}
