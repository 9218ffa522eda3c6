pub mod handlers;
pub mod routes;

use crate::bridge::ProcessSupervisor;
use crate::config::AppConfig;
use anyhow::{Context, Result};
use axum::Router;
use handlers::ApiState;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

pub async fn start_server(config: AppConfig) -> Result<()> {
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let prefix = config.http.route_prefix.clone();

    let supervisor = Arc::new(ProcessSupervisor::new(config.bridge.clone()));

    if config.bridge.auto_start {
        let snapshot = supervisor
            .start()
            .await
            .context("Failed to start the MCP process")?;
        info!(
            "MCP bridge ready: {} tools, {} resources, {} prompts",
            snapshot.tool_names.len(),
            snapshot.resource_names.len(),
            snapshot.prompt_names.len()
        );
    } else {
        info!("Auto-start disabled; POST {}/bridge/start to launch the MCP process", prefix);
    }

    let app = build_router(ApiState::new(supervisor.clone()), &prefix);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Health check: http://{}{}/health", addr, prefix);
    info!("Bridge status: http://{}{}/status", addr, prefix);
    info!("Tool calls: POST http://{}{}/call-tool", addr, prefix);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await?;

    Ok(())
}

/// Assemble every route, nested under `route_prefix` when it is non-empty.
pub fn build_router(state: ApiState, route_prefix: &str) -> Router {
    let api = Router::new()
        .merge(routes::health_routes())
        .merge(routes::management_routes())
        .merge(routes::mcp_routes());

    let app = if route_prefix.is_empty() {
        api
    } else {
        Router::new().nest(route_prefix, api)
    };

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(supervisor: Arc<ProcessSupervisor>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM signal, shutting down...");
        },
    }

    if let Err(e) = supervisor.stop().await {
        error!("Error stopping MCP process during shutdown: {}", e);
    }
}
