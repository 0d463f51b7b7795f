//! Result Listener Service
//!
//! Consumes image processing results published by the image processor.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (image:process:result)
//!   ↓ (Consumer Group: gateway)
//! Orchestrator (reader + stealer + worker pool)
//!   ↓
//! ImageProcessResultHandler
//! ```
//!
//! ## Features
//!
//! - Consumer group support for horizontal scaling
//! - Recovery of entries abandoned by crashed replicas
//! - Poison entries dropped after `IMAGE_RESULT_MAX_DELIVERY_ATTEMPT` deliveries
//! - Graceful shutdown handling
//! - Health check endpoint for Kubernetes probes

mod handler;

pub use handler::{ImageProcessResult, ImageProcessResultHandler, ProcessStatus};

use axum::Router;
use core_config::redis::RedisConfig;
use core_config::server::ServerConfig;
use core_config::tracing::{init_tracing, LogConfig};
use core_config::{env_parse_or, Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use stream_consumer::{
    connect_with_retry, health_router, init_metrics, HealthState, Orchestrator,
    OrchestratorConfig, PrometheusMetrics, StreamStore,
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of the consumer environment variables (`IMAGE_RESULT_STREAM_KEY`, ...)
pub const CONFIG_PREFIX: &str = "IMAGE_RESULT";

/// Start the health HTTP server
///
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Stream monitoring: `/stream/info`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, server: ServerConfig) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the result listener
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev)
/// 2. Connects to Redis with retry
/// 3. Initializes the consumer group and reaps dead consumers
/// 4. Consumes until SIGINT/SIGTERM, then drains in-flight results
pub async fn run() -> Result<()> {
    init_tracing(&LogConfig::from_env().with_component(APP_NAME));
    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let environment = Environment::from_env();
    info!(name = APP_NAME, version = APP_VERSION, ?environment, "Starting result listener");

    let config = OrchestratorConfig::from_env_prefixed(CONFIG_PREFIX)
        .wrap_err("Failed to load consumer configuration")?;
    let server = ServerConfig::health_from_env().wrap_err("Failed to load health server config")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    let attempts: u32 = env_parse_or("REDIS_CONNECT_ATTEMPTS", 5)?;
    info!(attempts, "Connecting to Redis...");
    let store: Arc<dyn StreamStore> = Arc::new(
        connect_with_retry(&redis_config.build_url(), attempts, Duration::from_millis(500))
            .await
            .wrap_err("Failed to connect to Redis")?,
    );
    info!("Connected to Redis successfully");

    let metrics = Arc::new(PrometheusMetrics::new(&config.stream_key, &config.group_name));
    let health_state = HealthState::new(
        store.clone(),
        APP_NAME,
        APP_VERSION,
        config.stream_key.clone(),
        config.group_name.clone(),
    );

    let mut orchestrator =
        Orchestrator::new(store, config, Arc::new(ImageProcessResultHandler))?
            .with_metrics(metrics);
    info!(
        stream = %orchestrator.identity().stream(),
        group = %orchestrator.identity().group(),
        consumer = %orchestrator.identity().name(),
        "Consumer configuration loaded"
    );

    orchestrator
        .initialize()
        .await
        .wrap_err("Failed to initialize consumer group")?;

    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, server).await {
            error!(error = %e, "Health server failed");
        }
    });

    orchestrator.run()?;
    shutdown_signal().await?;

    orchestrator
        .shutdown()
        .await
        .wrap_err("Failed to shut down consumer")?;

    info!("Result listener stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
