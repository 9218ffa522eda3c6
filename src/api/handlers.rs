use crate::bridge::{ProcessState, ProcessSupervisor};
use crate::error::BridgeError;
use crate::mcp::{ToolCallRequest, ToolCallResponse};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<ProcessSupervisor>,
}

impl ApiState {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }
}

pub(crate) async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    let connected = state.supervisor.state().await == ProcessState::Ready;
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "bridge_connected": connected,
    }))
}

pub(crate) async fn server_info() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "authors": env!("CARGO_PKG_AUTHORS"),
    }))
}

pub(crate) async fn bridge_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.supervisor.status().await)
}

pub(crate) async fn start_bridge(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, BridgeError> {
    info!("Received request to start the MCP bridge");

    state.supervisor.start().await?;
    Ok(lifecycle_response("start", &state).await)
}

pub(crate) async fn stop_bridge(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, BridgeError> {
    info!("Received request to stop the MCP bridge");

    state.supervisor.stop().await?;
    Ok(lifecycle_response("stop", &state).await)
}

pub(crate) async fn restart_bridge(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, BridgeError> {
    info!("Received request to restart the MCP bridge");

    state.supervisor.restart().await?;
    Ok(lifecycle_response("restart", &state).await)
}

async fn lifecycle_response(action: &str, state: &ApiState) -> Json<Value> {
    Json(json!({
        "action": action,
        "status": "success",
        "bridge": state.supervisor.status().await,
    }))
}

// MCP pass-through handlers

pub(crate) async fn list_tools(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, BridgeError> {
    let tools = state.supervisor.list_tools().await?;
    Ok(Json(json!({ "tools": tools })))
}

/// Always answers 200: a failed call becomes an error-shaped tool result.
pub(crate) async fn call_tool(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<impl IntoResponse, BridgeError> {
    let request: ToolCallRequest =
        serde_json::from_slice(&body).map_err(BridgeError::invalid_request)?;

    info!("Calling tool: {}", request.name);

    let arguments = if request.arguments.is_null() {
        json!({})
    } else {
        request.arguments
    };

    let response = match state.supervisor.call_tool(&request.name, arguments).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Tool call {} failed: {}", request.name, e);
            ToolCallResponse::error_text(format!("Error calling tool {}: {}", request.name, e))
        }
    };

    Ok(Json(response))
}

pub(crate) async fn list_resources(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, BridgeError> {
    let resources = state.supervisor.list_resources().await?;
    Ok(Json(json!({ "resources": resources })))
}

pub(crate) async fn read_resource(
    State(state): State<ApiState>,
    Path(uri): Path<String>,
) -> Result<impl IntoResponse, BridgeError> {
    let content = state.supervisor.read_resource(&uri).await?;
    Ok(Json(json!({ "uri": uri, "content": content })))
}

pub(crate) async fn list_prompts(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, BridgeError> {
    let prompts = state.supervisor.list_prompts().await?;
    Ok(Json(json!({ "prompts": prompts })))
}

pub(crate) async fn get_prompt(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, BridgeError> {
    let arguments: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(BridgeError::invalid_request)?
    };

    let prompt = state.supervisor.get_prompt(&name, arguments).await?;
    Ok(Json(prompt))
}

pub(crate) async fn refresh_capabilities(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, BridgeError> {
    let snapshot = state.supervisor.refresh_capabilities().await?;
    Ok(Json(snapshot))
}
