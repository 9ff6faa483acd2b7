//! `Stockgate` Daemon
//!
//! Keeps the SSH tunnel to the private Postgres instance up, serves the
//! health endpoint, and connects the database pool once the tunnel is ready.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use stockgate_core::config::load_config;
use stockgate_daemon::{database, health, tunnel};
use stockgate_tunnel::{Credential, SshTransport, TunnelManager, TunnelReadiness};

#[derive(Parser, Debug)]
#[command(name = "stockgate")]
#[command(version, about = "Stockgate - resilient SSH tunnel to a private database")]
struct Args {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, env = "STOCKGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Health endpoint bind address (defaults to 0.0.0.0 on `PORT`, 3000)
    #[arg(long, env = "STOCKGATE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Log level filter (e.g. "info", "debug", "warn"); overrides the settings file.
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "STOCKGATE_LOG_JSON")]
    log_json: bool,

    /// Seconds the database pool waits for the tunnel before giving up
    /// (waits indefinitely when unset).
    #[arg(long, env = "STOCKGATE_READY_TIMEOUT")]
    ready_timeout: Option<u64>,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "STOCKGATE_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.log_level.clone_from(level);
    }

    let log_filter = format!("stockgate={},russh=warn", config.log_level);
    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    #[cfg(feature = "metrics")]
    let metrics_guard = stockgate_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        args.metrics_endpoint.as_deref(),
    );
    #[cfg(not(feature = "metrics"))]
    stockgate_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting stockgate");

    config.validate()?;
    let key = config.tunnel.resolve_private_key()?;
    let tunnel_config = tunnel::tunnel_config(&config, Credential::from(key))?;
    let local_addr = tunnel_config.local_addr;

    let manager = TunnelManager::new(SshTransport::new());
    let readiness = manager.readiness();

    #[cfg(feature = "metrics")]
    let recorder = stockgate_daemon::telemetry::spawn_recorder(&readiness);

    info!(
        host = tunnel_config.host.as_str(),
        port = tunnel_config.port,
        %local_addr,
        "Starting SSH tunnel"
    );
    tunnel::establish_or_continue(&manager, tunnel_config).await;

    let listen = match args.listen {
        Some(addr) => addr,
        None => {
            let ip: IpAddr = config
                .server
                .bind_addr
                .parse()
                .with_context(|| format!("invalid server bind address {:?}", config.server.bind_addr))?;
            SocketAddr::new(ip, config.server.port)
        }
    };
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind health endpoint {listen}"))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let router = health::build_router(readiness.clone());
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    let ready_timeout = args
        .ready_timeout
        .or(config.database.ready_timeout_secs)
        .map(Duration::from_secs);
    let database = tokio::spawn(connect_database(
        readiness.clone(),
        config.database.clone(),
        ready_timeout,
    ));

    // Serve until shutdown signal
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(
        addr = %listen,
        tunnel = %readiness.status().state,
        "Health endpoint ready"
    );

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => warn!("Health server stopped unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "Health server failed"),
                Err(e) => error!(error = %e, "Health server task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Dependents first, then the tunnel, so the port is released last.
    let _ = shutdown_tx.send(true);
    if database.is_finished() {
        if let Ok(Some(pool)) = database.await {
            pool.close().await;
        }
    } else {
        database.abort();
    }
    manager.shutdown().await;
    if !server.is_finished() {
        let _ = server.await;
    }

    #[cfg(feature = "metrics")]
    {
        let _ = recorder.await;
        if let Some(guard) = metrics_guard
            && let Err(e) = guard.shutdown()
        {
            warn!(error = %e, "OpenTelemetry shutdown failed");
        }
    }

    info!(%local_addr, "Stockgate stopped");
    Ok(())
}

/// Open the pool once the tunnel is ready. Failures are logged; the daemon
/// keeps serving health checks either way.
async fn connect_database(
    readiness: TunnelReadiness,
    settings: stockgate_core::DatabaseSettings,
    deadline: Option<Duration>,
) -> Option<PgPool> {
    match database::open_pool(&readiness, &settings, deadline).await {
        Ok(pool) => {
            if let Err(e) = database::ping(&pool).await {
                warn!(error = %e, "Database ping failed");
            }
            Some(pool)
        }
        Err(e) => {
            error!(error = %e, "Database unavailable");
            None
        }
    }
}
