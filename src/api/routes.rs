use crate::api::handlers::ApiState;
use axum::{
    Router,
    routing::{get, post},
};

pub fn health_routes() -> Router<ApiState> {
    Router::new()
        .route("/health", get(super::handlers::health_check))
        .route("/info", get(super::handlers::server_info))
}

pub fn management_routes() -> Router<ApiState> {
    Router::new()
        .route("/status", get(super::handlers::bridge_status))
        .route("/bridge/start", post(super::handlers::start_bridge))
        .route("/bridge/stop", post(super::handlers::stop_bridge))
        .route("/bridge/restart", post(super::handlers::restart_bridge))
        .route(
            "/capabilities/refresh",
            post(super::handlers::refresh_capabilities),
        )
}

pub fn mcp_routes() -> Router<ApiState> {
    Router::new()
        .route("/tools", get(super::handlers::list_tools))
        .route("/call-tool", post(super::handlers::call_tool))
        .route("/resources", get(super::handlers::list_resources))
        .route("/resources/{*uri}", get(super::handlers::read_resource))
        .route("/prompts", get(super::handlers::list_prompts))
        .route("/prompts/{name}", post(super::handlers::get_prompt))
}
