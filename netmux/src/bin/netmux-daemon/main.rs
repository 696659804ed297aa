use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use netmux::cluster::{ClusterCache, ClusterHandle};
use netmux::config::{DaemonConfig, DEFAULT_CONFIG_PATH, PLUGIN_TYPE};
use netmux::delegate::{DelegateDispatcher, SubprocessExecutor};
use netmux::engine::DelegationEngine;
use netmux::readiness::ReadinessGate;
use netmux::resolver::Resolver;
use netmux::transport::Server;

/// Long-running daemon that serves CNI requests forwarded by the netmux shim
#[derive(Parser)]
#[clap(name = "netmux-daemon", author, version, about)]
struct Cli {
    /// Path to the daemon configuration file
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory for the daemon socket, overriding the configuration file
    #[clap(long)]
    socket_dir: Option<PathBuf>,

    /// Enable verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let mut config = if cli.config.exists() {
        DaemonConfig::load(&cli.config)?
    } else {
        warn!(
            "Config file {} not found, using defaults",
            cli.config.display()
        );
        DaemonConfig::default()
    };
    if let Some(socket_dir) = cli.socket_dir {
        config.socket_dir = socket_dir;
    }

    let cache = ClusterCache::load_dir(&config.store_dir)
        .with_context(|| format!("Failed to load cluster store {}", config.store_dir.display()))?;
    let cluster = ClusterHandle::from_cache(Arc::new(cache));

    let resolver = Resolver::new(&config.cni_conf_dir)
        .with_isolation(config.isolation_policy())
        .with_system_namespace(&config.system_namespace)
        .with_cni_version(&config.cni_version);
    let subprocess = SubprocessExecutor::new(config.cni_bin_dirs.clone())
        .with_timeout(config.delegate_timeout());
    let executor = DelegateDispatcher::new(Arc::new(subprocess), PLUGIN_TYPE);

    let engine = DelegationEngine::new(resolver, Arc::new(executor), cluster)
        .with_cluster_defaults(config.cluster_defaults())
        .with_cni_version(&config.cni_version);

    let mut server = Server::new(Arc::new(engine), &config.socket_dir);
    if let Some(indicator) = &config.readiness_indicator_file {
        info!("Gating ADD on readiness indicator {}", indicator.display());
        let gate = ReadinessGate::new(
            indicator,
            config.readiness_timeout(),
            config.readiness_poll_interval(),
        )
        .check_every_add(config.readiness_check_every_add);
        server = server.with_readiness_gate(Arc::new(gate));
    }

    let listener = server.bind().context("Failed to bind daemon socket")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
        }
        let _ = shutdown_tx.send(true);
    });

    Arc::new(server).serve(listener, shutdown_rx).await?;
    info!("Daemon stopped");
    Ok(())
}
