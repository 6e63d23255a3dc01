//! App Operator
//!
//! Main entry point for the operator. Reads the configuration, sets up the
//! Kubernetes client and runs the configured controllers until shutdown.

use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use app_operator::{
    config::{ControllerKind, OperatorConfig},
    controllers::{self, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting App Operator");

    let config = OperatorConfig::from_env()?;
    info!(
        workers = config.workers,
        max_retries = config.max_retries,
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        explicit_cleanup = config.explicit_cleanup,
        "Loaded configuration"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let metrics_port = config.metrics_port;
    let context = Arc::new(Context::new(client, config));

    // Start metrics server
    let mut metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    let shutdown = CancellationToken::new();
    let mut controllers = JoinSet::new();
    for kind in context.config.controllers.clone() {
        metrics::CONTROLLERS_SYNCING.inc();
        let ctx = context.clone();
        let token = shutdown.clone();
        match kind {
            ControllerKind::ServiceIngress => {
                controllers.spawn(async move {
                    (kind, controllers::run_service_ingress_controller(ctx, token).await)
                });
            }
            ControllerKind::App => {
                controllers.spawn(async move {
                    (kind, controllers::run_app_controller(ctx, token).await)
                });
            }
        }
    }

    // Handle graceful shutdown
    tokio::select! {
        Some(exited) = controllers.join_next() => {
            match exited {
                Ok((kind, Ok(()))) => error!(controller = ?kind, "Controller exited unexpectedly"),
                Ok((kind, Err(e))) => error!(controller = ?kind, error = %e, "Controller failed"),
                Err(e) => error!(error = %e, "Controller task panicked"),
            }
            metrics::OPERATOR_HEALTH.set(0.0);
        }
        result = &mut metrics_handle => {
            error!(result = ?result, "Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    // Let in-flight reconciles finish before exiting
    shutdown.cancel();
    while let Some(result) = controllers.join_next().await {
        if let Ok((kind, Err(e))) = result {
            error!(controller = ?kind, error = %e, "Controller failed during shutdown");
        }
    }
    metrics_handle.abort();

    info!("App Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
