use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix all API routes are nested under, e.g. "/api". Empty means root.
    #[serde(default)]
    pub route_prefix: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            route_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Settings for the supervised MCP child process and the stdio protocol
/// spoken with it.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    /// Text the child writes (stdout or stderr) once it is accepting requests.
    #[serde(default = "default_readiness_marker")]
    pub readiness_marker: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_initialize_settle_ms")]
    pub initialize_settle_ms: u64,
    #[serde(default = "default_catalog_settle_ms")]
    pub catalog_settle_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_auto_start() -> bool {
    true
}

fn default_readiness_marker() -> String {
    "Starting chattt-ai".to_string()
}

fn default_protocol_version() -> String {
    "2025-06-18".to_string()
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_initialize_settle_ms() -> u64 {
    1_000
}

fn default_catalog_settle_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

fn default_max_message_bytes() -> usize {
    8 * 1024 * 1024
}

impl BridgeConfig {
    /// Build a config for `command` with every other knob at its default.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            working_dir: None,
            auto_start: default_auto_start(),
            readiness_marker: default_readiness_marker(),
            protocol_version: default_protocol_version(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            initialize_settle_ms: default_initialize_settle_ms(),
            catalog_settle_ms: default_catalog_settle_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            max_message_bytes: default_max_message_bytes(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn initialize_settle(&self) -> Duration {
        Duration::from_millis(self.initialize_settle_ms)
    }

    pub fn catalog_settle(&self) -> Duration {
        Duration::from_millis(self.catalog_settle_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}
