use std::path::PathBuf;
use std::sync::Arc;

use agent::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use agent::device::SystemDeviceControl;
use agent::identity::DeviceIdentity;
use agent::metrics::SystemMetrics;
use agent::playback::Drivers;
use agent::Agent;
use clap::{Arg, Command};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("Display Agent")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Keeps a display node connected to its controller and plays what it is told to")
        .arg(
            Arg::new("config")
                .help("Path to the agent TOML config")
                .long("config")
                .short('c')
                .value_name("path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    info!(version = env!("CARGO_PKG_VERSION"), "agent starting");

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let cfg = match load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                server = %cfg.server.url,
                content_dir = %cfg.storage.content_dir.display(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let identity = DeviceIdentity::detect(&cfg.device.interface, cfg.display_name.clone());
    info!(
        device_id = %identity.device_id,
        mac_address = %identity.mac_address,
        "device identity derived"
    );

    let drivers = Drivers::system(&cfg.players);
    let device = Arc::new(SystemDeviceControl::new(&cfg.device));
    let sampler = Arc::new(SystemMetrics::new());

    let agent = match Agent::new(cfg, identity, drivers, device, sampler) {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent_task = tokio::spawn(agent.run(shutdown_rx));

    // Wait for Ctrl-C or SIGTERM
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
                    _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
                }
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }

    shutdown_tx.send(true).ok();
    if let Err(e) = agent_task.await {
        error!("agent task failed: {}", e);
    }

    info!("agent shutdown complete");
}
