use super::correlator::RequestCorrelator;
use super::types::CapabilitySnapshot;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// Whether the child has announced it is ready for traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Waiting,
    Ready,
    Exited,
}

/// One-shot readiness latch shared by the reader tasks and the handshake.
#[derive(Clone)]
pub(crate) struct ReadinessSignal {
    tx: Arc<watch::Sender<Readiness>>,
}

impl ReadinessSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(Readiness::Waiting);
        Self { tx: Arc::new(tx) }
    }

    /// Only the first signal counts; later ones (or ones after exit) are ignored.
    pub(crate) fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == Readiness::Waiting {
                *current = Readiness::Ready;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_exited(&self) {
        self.tx.send_if_modified(|current| {
            if *current == Readiness::Exited {
                false
            } else {
                *current = Readiness::Exited;
                true
            }
        });
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Readiness> {
        self.tx.subscribe()
    }
}

/// Looks for the readiness marker in a byte stream, across chunk boundaries.
pub(crate) struct MarkerScanner {
    marker: Vec<u8>,
    tail: Vec<u8>,
    found: bool,
}

impl MarkerScanner {
    pub(crate) fn new(marker: &str) -> Self {
        Self {
            marker: marker.as_bytes().to_vec(),
            tail: Vec::new(),
            found: false,
        }
    }

    /// True exactly once: on the chunk that completes the first occurrence.
    pub(crate) fn observe(&mut self, chunk: &[u8]) -> bool {
        if self.found || self.marker.is_empty() {
            return false;
        }

        self.tail.extend_from_slice(chunk);
        if self
            .tail
            .windows(self.marker.len())
            .any(|window| window == self.marker.as_slice())
        {
            self.found = true;
            self.tail = Vec::new();
            return true;
        }

        let keep = self.marker.len() - 1;
        if self.tail.len() > keep {
            let cut = self.tail.len() - keep;
            self.tail.drain(..cut);
        }
        false
    }
}

/// Drives the MCP initialization exchange against a freshly spawned child
#[derive(Debug, Clone)]
pub struct HandshakeOrchestrator {
    handshake_timeout: Duration,
    initialize_settle: Duration,
    catalog_settle: Duration,
    request_timeout: Duration,
    protocol_version: String,
    client_name: String,
    client_version: String,
}

impl HandshakeOrchestrator {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            initialize_settle: config.initialize_settle(),
            catalog_settle: config.catalog_settle(),
            request_timeout: config.request_timeout(),
            protocol_version: config.protocol_version.clone(),
            client_name: config.client_name.clone(),
            client_version: config.client_version.clone(),
        }
    }

    /// readiness -> initialize -> initialized -> catalog listing
    pub(crate) async fn run(
        &self,
        correlator: &RequestCorrelator,
        readiness: watch::Receiver<Readiness>,
    ) -> Result<CapabilitySnapshot> {
        self.wait_until_ready(readiness).await?;
        tokio::time::sleep(self.initialize_settle).await;

        let server_info = self.initialize(correlator).await?;

        correlator
            .notify_internal(INITIALIZED_NOTIFICATION, json!({}))
            .await
            .map_err(|e| BridgeError::HandshakeFailed {
                step: "initialized",
                reason: e.to_string(),
            })?;

        tokio::time::sleep(self.catalog_settle).await;

        let mut snapshot = self.list_catalog(correlator).await;
        snapshot.server_info = server_info;

        info!(
            "Handshake complete: {} tools, {} resources, {} prompts",
            snapshot.tool_names.len(),
            snapshot.resource_names.len(),
            snapshot.prompt_names.len()
        );
        Ok(snapshot)
    }

    async fn wait_until_ready(&self, mut readiness: watch::Receiver<Readiness>) -> Result<()> {
        debug!("Waiting up to {:?} for MCP readiness", self.handshake_timeout);

        let outcome = match tokio::time::timeout(
            self.handshake_timeout,
            readiness.wait_for(|state| *state != Readiness::Waiting),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => Readiness::Exited,
            Err(_) => {
                return Err(BridgeError::HandshakeTimeout(format!(
                    "no readiness signal within {:?}",
                    self.handshake_timeout
                )));
            }
        };

        match outcome {
            Readiness::Ready => Ok(()),
            _ => Err(BridgeError::HandshakeFailed {
                step: "readiness",
                reason: "process exited before signalling readiness".to_string(),
            }),
        }
    }

    async fn initialize(&self, correlator: &RequestCorrelator) -> Result<Value> {
        let params = json!({
            "protocolVersion": self.protocol_version,
            "capabilities": {
                "tools": {},
                "resources": {},
                "prompts": {}
            },
            "clientInfo": {
                "name": self.client_name,
                "version": self.client_version
            }
        });

        let result = correlator
            .call_internal("initialize", params, self.handshake_timeout)
            .await
            .map_err(|e| match e {
                BridgeError::Timeout { timeout, .. } => BridgeError::HandshakeTimeout(format!(
                    "initialize did not answer within {:?}",
                    timeout
                )),
                BridgeError::RemoteError { .. } => BridgeError::HandshakeFailed {
                    step: "initialize",
                    reason: e.to_string(),
                },
                other => other,
            })?;

        Ok(server_info_of(result))
    }

    /// List tools, resources and prompts. Each failure degrades to an empty list.
    pub(crate) async fn list_catalog(&self, correlator: &RequestCorrelator) -> CapabilitySnapshot {
        let tool_names = self
            .list_names(correlator, "tools/list", "tools", &["name"])
            .await;
        let resource_names = self
            .list_names(correlator, "resources/list", "resources", &["uri", "name"])
            .await;
        let prompt_names = self
            .list_names(correlator, "prompts/list", "prompts", &["name"])
            .await;

        CapabilitySnapshot {
            server_info: Value::Null,
            tool_names,
            resource_names,
            prompt_names,
        }
    }

    async fn list_names(
        &self,
        correlator: &RequestCorrelator,
        method: &str,
        key: &str,
        fields: &[&str],
    ) -> Vec<String> {
        match correlator
            .call_internal(method, json!({}), self.request_timeout)
            .await
        {
            Ok(result) => extract_names(&result, key, fields),
            Err(e) => {
                warn!("{} failed, continuing with an empty list: {}", method, e);
                Vec::new()
            }
        }
    }
}

fn server_info_of(mut result: Value) -> Value {
    match result.get_mut("serverInfo") {
        Some(info) => info.take(),
        None => result,
    }
}

fn extract_names(result: &Value, key: &str, fields: &[&str]) -> Vec<String> {
    result
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    fields
                        .iter()
                        .find_map(|field| item.get(*field).and_then(Value::as_str))
                })
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
