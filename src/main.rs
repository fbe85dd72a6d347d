use clap::Parser;
use forkgate::cli::Cli;
use forkgate::config::{Config, WORKER_CONFIG_ENV};
use forkgate::gateway::{GatewayServer, GatewayState};
use forkgate::pool::{PoolConfig, WorkerCommand, WorkerPool};
use forkgate::{worker, PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Time a worker gets to exit after SIGTERM during shutdown
const WORKER_GRACE_PERIOD: Duration = Duration::from_secs(5);

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("forkgate=debug".parse().expect("valid log directive"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The same binary runs as a worker when the coordinator hands it a startup context
    if std::env::var_os(WORKER_CONFIG_ENV).is_some() {
        // stdout carries the reply channel, so workers log to stderr
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .init();
        return worker::run_from_env().await;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter()).init();

    let config_path = Cli::parse().config;

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.listen)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.listen, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let pool_config = PoolConfig {
        size: config.server.worker_count(),
        restart_backoff: config.limits.restart_backoff(),
        shutdown_grace_period: WORKER_GRACE_PERIOD,
    };
    let pool = WorkerPool::start(
        WorkerCommand::current_exe()?,
        config.to_worker_context()?,
        pool_config,
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(GatewayState::new(config, Arc::clone(&pool))?);

    let sweep_state = Arc::clone(&state);
    let sweep_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        sweep_loop(sweep_state, sweep_shutdown_rx).await;
    });

    let server = GatewayServer::new(bind_addr, state, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping workers...");
    pool.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn sweep_loop(state: Arc<GatewayState>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = state.config().limits.cache_sweep_interval();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                state.sweep();
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.listen,
        workers = config.server.worker_count(),
        static_root = %config.server.static_root.display(),
        "Server configuration"
    );
    info!(
        reject_threshold = config.limits.rate_limit_threshold,
        throttle_threshold = config.limits.throttle_threshold,
        throttle_delay_ms = config.limits.throttle_delay_ms,
        window_secs = config.limits.window_secs,
        "Rate limit settings"
    );
    info!(
        cache_ttl_secs = config.limits.cache_ttl_secs,
        reply_timeout_secs = config.limits.reply_timeout_secs,
        upstream_timeout_secs = config.limits.upstream_timeout_secs,
        "Cache and timeout settings"
    );
    info!(
        upstreams = ?config.server.upstreams.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(),
        rules = config.server.rules.len(),
        headers = config.server.headers.len(),
        "Routing table"
    );
}
