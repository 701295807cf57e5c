//! Codegate Server entry point.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use codegate_server::config::{self, Config};
use codegate_server::{AppState, ServiceState};
use codegate_service::Generators;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let config = Config::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let addr = config.bind_addr().expect("invalid bind address");
    let service_config = config.service_config().expect("failed to load window policy");
    let clock = config::system_clock();
    let ledgers = config
        .connect_ledgers(clock.clone())
        .await
        .expect("failed to connect quota ledgers");
    let generators =
        Generators::gemini(config.gemini_config()).expect("failed to build Gemini client");

    let service = ServiceState::with_clock(
        service_config,
        ledgers,
        config.principal_resolver(),
        generators,
        clock,
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        volatile = service.volatile_backend(),
        durable = service.durable_backend(),
        model = %config.gemini_model,
        "Codegate Server starting",
    );

    let state = AppState::new(
        service.clone(),
        config.cors_origins.clone(),
        config.trust_forwarded_for,
    );
    let app = codegate_server::router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    // Spawn expired counter cleanup task
    let cleanup_state = service.clone();
    let cleanup = tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = cleanup_state.cleanup_expired_counters().await;
            if removed > 0 {
                tracing::info!(removed, "Cleaned up expired counters");
            }
        }
    });

    tracing::info!(%addr, "Codegate Server ready");

    if let Err(e) = codegate_server::serve(listener, app, shutdown_signal()).await {
        tracing::error!(error = %e, "Server error");
    }

    cleanup.abort();
    if let Err(e) = service.shutdown().await {
        tracing::error!(error = %e, "Failed to close quota ledgers cleanly");
    }

    tracing::info!("Codegate Server shut down");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install signal handler");
    tracing::info!("Shutdown signal received");
}
