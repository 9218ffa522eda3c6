#![allow(dead_code)]

use axum::Router;
use chattt_bridge::{
    ProcessSupervisor,
    api::{build_router, handlers::ApiState},
    config::{AppConfig, BridgeConfig, HttpConfig},
};
use std::{sync::Arc, time::Duration};

// ──────────────────────────────────────────────
// Configs
// ──────────────────────────────────────────────

pub const MOCK_SERVER: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/mock_mcp_server.sh"
);

/// Bridge config for the `sh` mock child with short settle delays.
pub fn mock_bridge_config(mode: &str) -> BridgeConfig {
    let mut config = BridgeConfig::new("sh", vec![MOCK_SERVER.to_string()]);
    config.env.insert("MOCK_MODE".to_string(), mode.to_string());
    config.auto_start = false;
    config.handshake_timeout_ms = 5_000;
    config.initialize_settle_ms = 10;
    config.catalog_settle_ms = 10;
    config.request_timeout_ms = 2_000;
    config.restart_delay_ms = 10;
    config
}

/// Config whose command is never launched; safe for routing and error paths.
pub fn create_offline_config() -> AppConfig {
    AppConfig {
        http: HttpConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
            route_prefix: String::new(),
        },
        logging: Default::default(),
        bridge: mock_bridge_config("default"),
    }
}

// ──────────────────────────────────────────────
// Shared helpers
// ──────────────────────────────────────────────

pub fn build_supervisor(config: &AppConfig) -> Arc<ProcessSupervisor> {
    Arc::new(ProcessSupervisor::new(config.bridge.clone()))
}

/// Build a test Router (no HTTP server, uses tower::oneshot).
pub fn build_test_app(config: &AppConfig, supervisor: Arc<ProcessSupervisor>) -> Router {
    build_router(ApiState::new(supervisor), &config.http.route_prefix)
}

/// Poll until `pending_calls` reaches `expected`.
pub async fn wait_for_pending(supervisor: &ProcessSupervisor, expected: usize) {
    for _ in 0..400 {
        if supervisor.status().await.pending_calls == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {} pending call(s)", expected);
}

/// Helper to extract JSON from a response body.
pub async fn response_json(response: axum::http::Response<axum::body::Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
