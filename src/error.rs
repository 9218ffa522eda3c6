use crate::bridge::ProcessState;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("MCP process is not running (state: {0})")]
    ProcessNotRunning(ProcessState),

    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("MCP process exited before '{method}' completed")]
    ProcessExited { method: String },

    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(String),

    #[error("Handshake failed during {step}: {reason}")]
    HandshakeFailed { step: &'static str, reason: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Remote error{}: {message}", code_suffix(.code))]
    RemoteError { code: Option<i64>, message: String },

    #[error("Unexpected '{method}' result: {reason}")]
    UnexpectedResult { method: String, reason: String },

    #[error("Failed to spawn MCP process: {0}")]
    SpawnFailed(String),

    #[error("Invalid process state transition: {from} -> {to}")]
    InvalidStateTransition { from: ProcessState, to: ProcessState },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|c| format!(" {}", c)).unwrap_or_default()
}

impl BridgeError {
    pub(crate) fn timeout(method: &str, timeout: Duration) -> Self {
        BridgeError::Timeout {
            method: method.to_string(),
            timeout,
        }
    }

    pub(crate) fn process_exited(method: &str) -> Self {
        BridgeError::ProcessExited {
            method: method.to_string(),
        }
    }

    pub(crate) fn invalid_request(err: impl std::fmt::Display) -> Self {
        BridgeError::InvalidRequest(err.to_string())
    }

    /// Equivalent error for every caller that waited on the same operation.
    ///
    /// `io::Error` and `serde_json::Error` are not `Clone`; their copies keep
    /// the kind and message.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            BridgeError::ProcessNotRunning(state) => BridgeError::ProcessNotRunning(*state),
            BridgeError::Timeout { method, timeout } => BridgeError::Timeout {
                method: method.clone(),
                timeout: *timeout,
            },
            BridgeError::ProcessExited { method } => BridgeError::process_exited(method),
            BridgeError::HandshakeTimeout(reason) => BridgeError::HandshakeTimeout(reason.clone()),
            BridgeError::HandshakeFailed { step, reason } => BridgeError::HandshakeFailed {
                step: *step,
                reason: reason.clone(),
            },
            BridgeError::MalformedMessage(reason) => BridgeError::MalformedMessage(reason.clone()),
            BridgeError::RemoteError { code, message } => BridgeError::RemoteError {
                code: *code,
                message: message.clone(),
            },
            BridgeError::UnexpectedResult { method, reason } => BridgeError::UnexpectedResult {
                method: method.clone(),
                reason: reason.clone(),
            },
            BridgeError::SpawnFailed(reason) => BridgeError::SpawnFailed(reason.clone()),
            BridgeError::InvalidStateTransition { from, to } => {
                BridgeError::InvalidStateTransition { from: *from, to: *to }
            }
            BridgeError::Io(e) => BridgeError::Io(std::io::Error::new(e.kind(), e.to_string())),
            BridgeError::Json(e) => {
                BridgeError::Json(<serde_json::Error as serde::de::Error>::custom(e))
            }
            BridgeError::InvalidRequest(reason) => BridgeError::InvalidRequest(reason.clone()),
            BridgeError::Internal(reason) => BridgeError::Internal(reason.clone()),
        }
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            BridgeError::ProcessNotRunning(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::ProcessExited { .. } => StatusCode::BAD_GATEWAY,
            BridgeError::HandshakeTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::HandshakeFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::MalformedMessage(_) => StatusCode::BAD_GATEWAY,
            BridgeError::RemoteError { .. } => StatusCode::BAD_GATEWAY,
            BridgeError::UnexpectedResult { .. } => StatusCode::BAD_GATEWAY,
            BridgeError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            BridgeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Json(_) => StatusCode::BAD_REQUEST,
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement conversion from anyhow::Error for convenience
impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

impl axum::response::IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16(),
            "isError": true,
        });

        (status, axum::Json(body)).into_response()
    }
}
