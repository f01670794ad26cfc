//! rotor entry point
//!
//! Starts the forward proxy, management API, health monitor, and rotator,
//! and shuts them down gracefully on SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rotor::api::ApiServer;
use rotor::monitor::Monitor;
use rotor::pool::Pool;
use rotor::proxy::server::ProxyServer;
use rotor::rotator::Rotator;
use rotor::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rotor=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;

    // Pool
    info!("loading proxy list from {}", config.file.display());
    let pool = Arc::new(Pool::new(config.latency_sort));
    pool.load_file(&config.file)?;
    info!("loaded {} proxies", pool.len());

    // Health monitor; the initial pass runs in the background so startup
    // is instant and the rotator begins with all proxies assumed alive.
    let monitor = Arc::new(Monitor::new(pool.clone(), config.monitor.clone()));
    {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            info!("running initial health check in the background");
            monitor.run_once().await;
        });
    }

    // Rotator
    let rotator = Arc::new(Rotator::new(pool.clone(), config.rotator.clone())?);
    let rotator_handle = rotator.start();

    let (shutdown_tx, _) = watch::channel(false);

    // Management API
    let api_server = ApiServer::new(config.api.clone(), pool.clone(), rotator.clone());
    let api_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = api_server.run(shutdown).await {
                error!("API server error: {}", e);
            }
        })
    };

    let monitor_handle = monitor.start(shutdown_tx.subscribe());

    // Proxy server
    let proxy_server = ProxyServer::bind(config.server.clone(), rotator.clone()).await?;
    let proxy_addr = proxy_server.local_addr()?;

    print_banner(
        &proxy_addr.to_string(),
        config.api.port,
        &pool,
        &rotator,
        config.server.credentials.is_some(),
    );

    let proxy_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = proxy_server.run(shutdown).await {
                error!("proxy server error: {}", e);
            }
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    rotator_handle.shutdown().await;
    monitor_handle.stopped().await;
    let _ = tokio::join!(proxy_task, api_task);

    info!("rotor stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_banner(proxy_addr: &str, api_port: u16, pool: &Pool, rotator: &Rotator, auth: bool) {
    let current = rotator
        .current()
        .map(|cur| cur.to_string())
        .unwrap_or_else(|| "<none>".to_string());
    let api_addr = format!("127.0.0.1:{}", api_port);

    println!();
    println!("rotor {}", env!("CARGO_PKG_VERSION"));
    println!("  proxy server : {}", proxy_addr);
    println!("  api server   : http://{}", api_addr);
    println!("  auth         : {}", if auth { "enabled" } else { "disabled" });
    println!("  pool         : {} proxies ({} alive)", pool.len(), pool.alive_len());
    println!("  active proxy : {}", current);
    println!("  api endpoints:");
    println!("    GET  http://{}/api/current", api_addr);
    println!("    GET  http://{}/api/pool", api_addr);
    println!("    POST http://{}/api/rotate", api_addr);
    println!("    POST http://{}/api/status", api_addr);
    println!();
}
