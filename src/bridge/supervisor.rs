use super::io;
use super::state::SharedState;
use super::ProcessState;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::mcp::correlator::RequestCorrelator;
use crate::mcp::framer::{Framer, LogLines};
use crate::mcp::handshake::{HandshakeOrchestrator, MarkerScanner, Readiness, ReadinessSignal};
use crate::mcp::notifications::NotificationDispatcher;
use crate::mcp::types::{
    CapabilitySnapshot, Notification, PromptDefinition, PromptResult, ResourceDefinition,
    ToolCallResponse, ToolDefinition,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tasks and kill switch belonging to one spawned child
struct ChildHandle {
    generation: u64,
    kill: CancellationToken,
    exit: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChildHandle {
    /// Kill the child if it is still alive and wait for its exit handler.
    async fn terminate(self) {
        self.kill.cancel();
        if let Err(e) = self.exit.await {
            error!(
                "Exit watcher for MCP process generation {} failed: {}",
                self.generation, e
            );
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Point-in-time view of the bridge for status endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub connected: bool,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Value>,
    pub counts: CapabilityCounts,
    pub pending_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Published once a restart finishes; `None` while it runs.
type RestartOutcome = Option<Result<CapabilitySnapshot>>;

/// Held by the caller driving a restart. Clears the in-flight slot when the
/// restart finishes or its future is dropped.
struct RestartLease<'a> {
    in_flight: &'a StdMutex<Option<watch::Receiver<RestartOutcome>>>,
    outcome: watch::Sender<RestartOutcome>,
}

impl RestartLease<'_> {
    fn publish(self, result: &Result<CapabilitySnapshot>) {
        let shared = match result {
            Ok(snapshot) => Ok(snapshot.clone()),
            Err(e) => Err(e.replicate()),
        };
        self.outcome.send_replace(Some(shared));
    }
}

impl Drop for RestartLease<'_> {
    fn drop(&mut self) {
        *self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CapabilityCounts {
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

/// Owns the MCP child process: spawn, handshake, stop, restart.
///
/// Lifecycle operations are serialized by `lifecycle`; calls go straight to
/// the correlator and never wait on it.
pub struct ProcessSupervisor {
    config: BridgeConfig,
    shared: SharedState,
    correlator: RequestCorrelator,
    dispatcher: NotificationDispatcher,
    handshake: HandshakeOrchestrator,
    lifecycle: Mutex<Option<ChildHandle>>,
    generation: AtomicU64,
    restart_in_flight: StdMutex<Option<watch::Receiver<RestartOutcome>>>,
}

impl ProcessSupervisor {
    pub fn new(config: BridgeConfig) -> Self {
        let shared = SharedState::new();
        let correlator = RequestCorrelator::new(shared.clone(), config.request_timeout());
        let handshake = HandshakeOrchestrator::new(&config);

        Self {
            config,
            shared,
            correlator,
            dispatcher: NotificationDispatcher::new(),
            handshake,
            lifecycle: Mutex::new(None),
            generation: AtomicU64::new(0),
            restart_in_flight: StdMutex::new(None),
        }
    }

    pub async fn state(&self) -> ProcessState {
        self.shared.state().await
    }

    /// Spawn the child and run the handshake. Returns the cached snapshot
    /// if the process is already ready.
    pub async fn start(&self) -> Result<CapabilitySnapshot> {
        let mut slot = self.lifecycle.lock().await;
        self.start_locked(&mut slot).await
    }

    /// Terminate the child. Stopping a stopped bridge does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.lifecycle.lock().await;
        self.stop_locked(&mut slot).await
    }

    /// Stop, wait the restart delay, start again.
    ///
    /// A restart requested while one is running waits for it and returns its
    /// outcome instead of cycling the process twice.
    pub async fn restart(&self) -> Result<CapabilitySnapshot> {
        let lease = match self.claim_restart() {
            Ok(lease) => lease,
            Err(outcome) => return wait_for_restart(outcome).await,
        };

        let mut slot = self.lifecycle.lock().await;
        info!("Restarting MCP process");

        let result = match self.stop_locked(&mut slot).await {
            Ok(()) => {
                tokio::time::sleep(self.config.restart_delay()).await;
                self.start_locked(&mut slot).await
            }
            Err(e) => Err(e),
        };

        lease.publish(&result);
        result
    }

    /// Become the restart driver, or get the outcome of the one already running.
    fn claim_restart(
        &self,
    ) -> std::result::Result<RestartLease<'_>, watch::Receiver<RestartOutcome>> {
        let mut in_flight = self
            .restart_in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = in_flight.as_ref() {
            return Err(outcome.clone());
        }

        let (tx, rx) = watch::channel(None);
        *in_flight = Some(rx);
        Ok(RestartLease {
            in_flight: &self.restart_in_flight,
            outcome: tx,
        })
    }

    async fn start_locked(&self, slot: &mut Option<ChildHandle>) -> Result<CapabilitySnapshot> {
        {
            let inner = self.shared.lock().await;
            if inner.state == ProcessState::Ready {
                debug!("MCP process already ready");
                return Ok(inner.snapshot.clone().unwrap_or_default());
            }
        }

        // The previous child may have died on its own; reap what is left of it.
        if let Some(stale) = slot.take() {
            stale.terminate().await;
        }
        self.correlator.detach_writer().await;

        self.shared.lock().await.transition(ProcessState::Starting)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Starting MCP process (generation {}): {} {}",
            generation,
            self.config.command,
            self.config.args.join(" ")
        );

        let readiness = match self.spawn_child(generation).await {
            Ok((handle, readiness)) => {
                *slot = Some(handle);
                readiness
            }
            Err(e) => {
                self.mark_stopped().await;
                return Err(e);
            }
        };

        let outcome = match self.handshake.run(&self.correlator, readiness).await {
            Ok(snapshot) => {
                let mut inner = self.shared.lock().await;
                if inner.live_generation == Some(generation) {
                    inner.transition(ProcessState::Ready)?;
                    inner.snapshot = Some(snapshot.clone());
                    info!("MCP process ready (pid {:?})", inner.pid);
                    return Ok(snapshot);
                }
                Err(BridgeError::HandshakeFailed {
                    step: "ready",
                    reason: "process exited during handshake".to_string(),
                })
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            error!("MCP handshake failed: {}", e);
        }
        self.teardown(slot).await;
        outcome
    }

    async fn stop_locked(&self, slot: &mut Option<ChildHandle>) -> Result<()> {
        if slot.is_none() && self.state().await == ProcessState::Stopped {
            debug!("MCP process already stopped");
            return Ok(());
        }

        info!("Stopping MCP process");
        self.teardown(slot).await;
        info!("MCP process stopped");
        Ok(())
    }

    /// Kill the child, wait for its exit handler, close stdin, land in Stopped.
    async fn teardown(&self, slot: &mut Option<ChildHandle>) {
        // Kill first: a write blocked on a full stdin pipe holds the writer
        // lock until the child is gone.
        if let Some(handle) = slot.take() {
            handle.terminate().await;
        }
        self.correlator.detach_writer().await;
        self.mark_stopped().await;
    }

    async fn mark_stopped(&self) {
        let mut inner = self.shared.lock().await;
        inner.snapshot = None;
        if let Err(e) = inner.transition(ProcessState::Stopped) {
            warn!("{}", e);
        }
    }

    async fn spawn_child(
        &self,
        generation: u64,
    ) -> Result<(ChildHandle, watch::Receiver<Readiness>)> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {}", self.config.command, e);
            BridgeError::SpawnFailed(format!("{}: {}", self.config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("child stderr unavailable".to_string()))?;

        {
            let mut inner = self.shared.lock().await;
            inner.live_generation = Some(generation);
            inner.pid = child.id();
        }
        self.correlator.attach_writer(Box::new(stdin)).await;

        let readiness = ReadinessSignal::new();
        let readiness_rx = readiness.subscribe();
        let (tx, rx) = mpsc::channel(io::MESSAGE_BUFFER);
        let marker = &self.config.readiness_marker;

        let tasks = vec![
            tokio::spawn(io::pump_stdout(
                stdout,
                Framer::new(self.config.max_message_bytes),
                MarkerScanner::new(marker),
                readiness.clone(),
                tx,
            )),
            tokio::spawn(io::pump_stderr(
                stderr,
                LogLines::new(self.config.max_message_bytes),
                MarkerScanner::new(marker),
                readiness.clone(),
            )),
            tokio::spawn(io::route_messages(
                rx,
                self.correlator.clone(),
                self.dispatcher.clone(),
            )),
        ];

        let kill = CancellationToken::new();
        let exit = tokio::spawn(io::watch_exit(
            child,
            generation,
            kill.clone(),
            self.shared.clone(),
            readiness,
        ));

        Ok((
            ChildHandle {
                generation,
                kill,
                exit,
                tasks,
            },
            readiness_rx,
        ))
    }

    /// Re-list tools, resources and prompts against the running process.
    pub async fn refresh_capabilities(&self) -> Result<CapabilitySnapshot> {
        let generation = {
            let inner = self.shared.lock().await;
            if inner.state != ProcessState::Ready {
                return Err(BridgeError::ProcessNotRunning(inner.state));
            }
            inner.live_generation
        };

        let mut fresh = self.handshake.list_catalog(&self.correlator).await;

        let mut inner = self.shared.lock().await;
        if inner.state != ProcessState::Ready || inner.live_generation != generation {
            return Err(BridgeError::ProcessNotRunning(inner.state));
        }
        fresh.server_info = inner
            .snapshot
            .as_ref()
            .map(|s| s.server_info.clone())
            .unwrap_or_default();
        inner.snapshot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Raw request pass-through using the configured request timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.correlator.call(method, params, None).await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResponse> {
        debug!("Calling tool: {}", name);
        let result = self
            .call(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
            )
            .await?;
        decode("tools/call", result)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        self.list_paginated("tools/list", "tools").await
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDefinition>> {
        self.list_paginated("resources/list", "resources").await
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDefinition>> {
        self.list_paginated("prompts/list", "prompts").await
    }

    /// Text of a resource, joining multiple text parts with newlines.
    pub async fn read_resource(&self, uri: &str) -> Result<String> {
        let result = self.call("resources/read", json!({ "uri": uri })).await?;

        let contents = result
            .get("contents")
            .and_then(Value::as_array)
            .ok_or_else(|| BridgeError::UnexpectedResult {
                method: "resources/read".to_string(),
                reason: "missing contents".to_string(),
            })?;

        let text: Vec<&str> = contents
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        Ok(text.join("\n"))
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<PromptResult> {
        let params = if arguments.is_null() {
            json!({ "name": name })
        } else {
            json!({ "name": name, "arguments": arguments })
        };
        let result = self.call("prompts/get", params).await?;
        decode("prompts/get", result)
    }

    async fn list_paginated<T: DeserializeOwned>(&self, method: &str, key: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let mut result = self.call(method, params).await?;

            let page = result.get_mut(key).map(Value::take).unwrap_or_default();
            let page: Vec<T> = if page.is_null() {
                Vec::new()
            } else {
                decode(method, page)?
            };
            items.extend(page);

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        debug!("{} returned {} item(s)", method, items.len());
        Ok(items)
    }

    pub async fn status(&self) -> BridgeStatus {
        let inner = self.shared.lock().await;
        let counts = inner
            .snapshot
            .as_ref()
            .map(|s| CapabilityCounts {
                tools: s.tool_names.len(),
                resources: s.resource_names.len(),
                prompts: s.prompt_names.len(),
            })
            .unwrap_or_default();

        BridgeStatus {
            connected: inner.state == ProcessState::Ready,
            state: inner.state,
            server_info: inner.snapshot.as_ref().map(|s| s.server_info.clone()),
            counts,
            pending_calls: inner.pending.len(),
            pid: inner.pid,
        }
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.dispatcher.subscribe()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.lifecycle.get_mut().take() {
            handle.kill.cancel();
        }
    }
}

async fn wait_for_restart(
    mut outcome: watch::Receiver<RestartOutcome>,
) -> Result<CapabilitySnapshot> {
    info!("Restart already in progress, waiting for it");
    let finished = match outcome.wait_for(Option::is_some).await {
        Ok(finished) => finished,
        Err(_) => {
            return Err(BridgeError::Internal(
                "restart in progress was abandoned".to_string(),
            ))
        }
    };

    match &*finished {
        Some(Ok(snapshot)) => Ok(snapshot.clone()),
        Some(Err(e)) => Err(e.replicate()),
        None => Err(BridgeError::Internal(
            "restart finished without an outcome".to_string(),
        )),
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| BridgeError::UnexpectedResult {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_supervisor_is_stopped() {
        let supervisor = ProcessSupervisor::new(BridgeConfig::new("mock", vec![]));
        let status = supervisor.status().await;

        assert!(!status.connected);
        assert_eq!(status.state, ProcessState::Stopped);
        assert_eq!(status.pending_calls, 0);
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn test_calls_fail_fast_when_stopped() {
        let supervisor = ProcessSupervisor::new(BridgeConfig::new("mock", vec![]));

        let result = supervisor.list_tools().await;
        assert!(matches!(
            result,
            Err(BridgeError::ProcessNotRunning(ProcessState::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let supervisor = ProcessSupervisor::new(BridgeConfig::new("mock", vec![]));
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_to_stopped() {
        let supervisor = ProcessSupervisor::new(BridgeConfig::new(
            "/nonexistent/chattt-mcp-server-binary",
            vec![],
        ));

        let result = supervisor.start().await;
        assert!(matches!(result, Err(BridgeError::SpawnFailed(_))));
        assert_eq!(supervisor.state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_restarts_share_the_failure() {
        let mut config = BridgeConfig::new("/nonexistent/chattt-mcp-server-binary", vec![]);
        config.restart_delay_ms = 50;
        let supervisor = ProcessSupervisor::new(config);

        let (first, second) = tokio::join!(supervisor.restart(), supervisor.restart());

        assert!(matches!(first, Err(BridgeError::SpawnFailed(_))));
        match second {
            Err(BridgeError::SpawnFailed(reason)) => {
                assert!(reason.contains("chattt-mcp-server-binary"))
            }
            other => panic!("expected the shared spawn failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(supervisor.state().await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_slot_is_released_after_completion() {
        let supervisor = ProcessSupervisor::new(BridgeConfig::new(
            "/nonexistent/chattt-mcp-server-binary",
            vec![],
        ));

        assert!(supervisor.restart().await.is_err());
        assert!(supervisor
            .restart_in_flight
            .lock()
            .unwrap()
            .is_none());
        // A later restart drives its own attempt instead of replaying the old one.
        assert!(supervisor.claim_restart().is_ok());
    }

    #[tokio::test]
    async fn test_refresh_requires_ready() {
        let supervisor = ProcessSupervisor::new(BridgeConfig::new("mock", vec![]));
        assert!(matches!(
            supervisor.refresh_capabilities().await,
            Err(BridgeError::ProcessNotRunning(_))
        ));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = BridgeStatus {
            connected: false,
            state: ProcessState::Stopped,
            server_info: None,
            counts: CapabilityCounts::default(),
            pending_calls: 0,
            pid: None,
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["state"], "stopped");
        assert_eq!(value["pendingCalls"], 0);
        assert!(value.get("pid").is_none());
    }

    #[test]
    fn test_decode_maps_shape_errors() {
        let err = decode::<ToolCallResponse>("tools/call", json!({"content": "nope"})).unwrap_err();
        assert!(matches!(err, BridgeError::UnexpectedResult { .. }));
    }
}
