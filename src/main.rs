//! sandbox-poold: VM-pool control plane for a sandboxed code-execution
//! service.
//!
//! Wires together the Network Fabric, Pool Manager, Execution
//! Dispatcher, and host HTTP surface, and exits non-zero on any fatal
//! startup error (bridge missing, zero VMs started, listener bind
//! failure).

mod config;
mod dispatch;
mod firecracker;
mod http;
mod network;
mod pool;
mod state;

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use dispatch::Dispatcher;
use pool::Pool;
use state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting sandbox-poold");

    let pool = match Pool::new(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to build VM pool");
            return ExitCode::FAILURE;
        }
    };

    let dispatcher = Dispatcher::new(pool.clone(), &config);
    let state = AppState::new(dispatcher);
    let app = http::create_router(state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr, "failed to bind listener");
            pool.cleanup().await;
            return ExitCode::FAILURE;
        }
    };

    info!(addr, "listening for connections");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        error!(error = %e, "server error");
    }

    info!("shutting down, draining pool");
    pool.cleanup().await;
    info!("shutdown complete");

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received shutdown signal");
}
