use super::types::{
    JSONRPC_VERSION, JsonRpcNotification, JsonRpcRequest, RequestId, RpcError,
};
use crate::bridge::ProcessState;
use crate::bridge::state::{BridgeInner, SharedState};
use crate::error::{BridgeError, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An in-flight request awaiting its response
pub(crate) struct PendingCall {
    pub(crate) id: RequestId,
    pub(crate) method: String,
    pub(crate) created_at: Instant,
    pub(crate) deadline: Instant,
    completion: oneshot::Sender<Result<Value>>,
}

impl PendingCall {
    fn complete(self, outcome: Result<Value>) {
        // The caller may have given up already; nothing to do then.
        let _ = self.completion.send(outcome);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPolicy {
    /// Regular callers: only once the handshake finished.
    ReadyOnly,
    /// Handshake and catalog refresh traffic.
    Internal,
}

impl CallPolicy {
    fn permits(self, state: ProcessState) -> bool {
        match self {
            CallPolicy::ReadyOnly => state == ProcessState::Ready,
            CallPolicy::Internal => {
                matches!(state, ProcessState::Starting | ProcessState::Ready)
            }
        }
    }
}

/// Matches responses from the child to the requests that caused them.
///
/// Writes go through a single writer lock and ids are allocated while it is
/// held, so the child sees requests in id order. Responses may come back in
/// any order.
#[derive(Clone)]
pub struct RequestCorrelator {
    shared: SharedState,
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    default_timeout: Duration,
}

impl RequestCorrelator {
    pub(crate) fn new(shared: SharedState, default_timeout: Duration) -> Self {
        Self {
            shared,
            writer: Arc::new(Mutex::new(None)),
            default_timeout,
        }
    }

    pub(crate) async fn attach_writer(&self, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Take the stdin handle away, closing it so the child sees EOF.
    pub(crate) async fn detach_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Closing MCP stdin failed: {}", e);
            }
        }
    }

    /// Send a request and wait for its response, its deadline, or process exit.
    ///
    /// Fails fast with `ProcessNotRunning` unless the process is ready.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        self.call_with_policy(method, params, timeout, CallPolicy::ReadyOnly)
            .await
    }

    /// Like [`call`](Self::call) but also allowed while the handshake runs.
    pub(crate) async fn call_internal(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.call_with_policy(method, params, timeout, CallPolicy::Internal)
            .await
    }

    /// Fire-and-forget message; nothing is registered and nothing comes back.
    ///
    /// Fails fast with `ProcessNotRunning` unless the process is ready.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.notify_with_policy(method, params, CallPolicy::ReadyOnly)
            .await
    }

    /// Like [`notify`](Self::notify) but also allowed while the handshake runs.
    pub(crate) async fn notify_internal(&self, method: &str, params: Value) -> Result<()> {
        self.notify_with_policy(method, params, CallPolicy::Internal)
            .await
    }

    async fn notify_with_policy(
        &self,
        method: &str,
        params: Value,
        policy: CallPolicy,
    ) -> Result<()> {
        let line = encode_line(&JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION,
            method,
            params: &params,
        })?;

        let mut writer = self.writer.lock().await;
        let state = self.shared.state().await;
        let stream = match writer.as_mut() {
            Some(stream) if policy.permits(state) => stream,
            _ => return Err(BridgeError::ProcessNotRunning(state)),
        };

        debug!("Sending notification: {}", method);
        write_line(stream, &line).await.map_err(|e| {
            warn!("Failed to write notification '{}': {}", method, e);
            BridgeError::process_exited(method)
        })
    }

    async fn call_with_policy(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        policy: CallPolicy,
    ) -> Result<Value> {
        let (tx, mut rx) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + timeout;

        let mut writer = self.writer.lock().await;
        let (id, line) = {
            let mut inner = self.shared.lock().await;
            if writer.is_none() || !policy.permits(inner.state) {
                return Err(BridgeError::ProcessNotRunning(inner.state));
            }

            let id = inner.allocate_id()?;
            let line = encode_line(&JsonRpcRequest {
                jsonrpc: JSONRPC_VERSION,
                id,
                method,
                params: &params,
            })?;
            inner.pending.insert(
                id,
                PendingCall {
                    id,
                    method: method.to_string(),
                    created_at,
                    deadline,
                    completion: tx,
                },
            );
            (id, line)
        };

        debug!("Sending request {}: {}", id, method);
        let written = match writer.as_mut() {
            Some(stream) => tokio::time::timeout_at(deadline, write_line(stream, &line)).await,
            None => Ok(Err(std::io::ErrorKind::NotConnected.into())),
        };
        drop(writer);

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Failed to write request {} ({}): {}", id, method, e);
                if self.forget(id).await {
                    return Err(BridgeError::process_exited(method));
                }
            }
            Err(_) => {
                if self.forget(id).await {
                    return Err(BridgeError::timeout(method, timeout));
                }
            }
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::process_exited(method)),
            Err(_) => {
                if self.forget(id).await {
                    warn!("Request {} ({}) timed out after {:?}", id, method, timeout);
                    return Err(BridgeError::timeout(method, timeout));
                }
                // Resolved between the deadline firing and the removal above.
                rx.await
                    .unwrap_or_else(|_| Err(BridgeError::process_exited(method)))
            }
        }
    }

    /// Drop a pending call. Returns false if something else resolved it first.
    async fn forget(&self, id: RequestId) -> bool {
        self.shared.lock().await.pending.remove(&id).is_some()
    }

    /// Route a response to its pending call. Unknown ids are logged and dropped.
    pub(crate) async fn resolve(
        &self,
        id: RequestId,
        outcome: std::result::Result<Value, RpcError>,
    ) -> bool {
        let call = self.shared.lock().await.pending.remove(&id);
        match call {
            Some(call) => {
                let now = Instant::now();
                debug!(
                    "Request {} ({}) resolved in {:?}{}",
                    call.id,
                    call.method,
                    now - call.created_at,
                    if now > call.deadline { " (past deadline)" } else { "" }
                );
                call.complete(outcome.map_err(BridgeError::from));
                true
            }
            None => {
                warn!(
                    "Discarding response for unknown or expired request id {}",
                    id
                );
                false
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.lock().await.pending.len()
    }
}

/// Fail every pending call with `ProcessExited`. Caller holds the state lock.
pub(crate) fn reject_all(inner: &mut BridgeInner) -> usize {
    let calls: Vec<PendingCall> = inner.pending.drain().map(|(_, call)| call).collect();
    let count = calls.len();
    for call in calls {
        let err = BridgeError::process_exited(&call.method);
        call.complete(Err(err));
    }
    count
}

fn encode_line<T: serde::Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

async fn write_line(stream: &mut BoxedWriter, line: &[u8]) -> std::io::Result<()> {
    stream.write_all(line).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    async fn correlator_in(state: ProcessState) -> (RequestCorrelator, SharedState) {
        let shared = SharedState::new();
        {
            let mut inner = shared.lock().await;
            inner.transition(ProcessState::Starting).unwrap();
            if state == ProcessState::Ready {
                inner.transition(ProcessState::Ready).unwrap();
            }
        }
        let correlator = RequestCorrelator::new(shared.clone(), Duration::from_secs(5));
        (correlator, shared)
    }

    async fn wired(state: ProcessState) -> (RequestCorrelator, SharedState, Lines<BufReader<DuplexStream>>) {
        let (correlator, shared) = correlator_in(state).await;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        correlator.attach_writer(Box::new(ours)).await;
        (correlator, shared, BufReader::new(theirs).lines())
    }

    async fn next_request(lines: &mut Lines<BufReader<DuplexStream>>) -> Value {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn wait_for_pending(correlator: &RequestCorrelator, expected: usize) {
        for _ in 0..200 {
            if correlator.pending_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} pending calls", expected);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (correlator, _shared, mut lines) = wired(ProcessState::Ready).await;

        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let correlator = correlator.clone();
            handles.push(tokio::spawn(async move {
                correlator
                    .call("tools/call", json!({"name": name}), None)
                    .await
            }));
        }

        let mut ids = std::collections::HashMap::new();
        for _ in 0..3 {
            let request = next_request(&mut lines).await;
            let name = request["params"]["name"].as_str().unwrap().to_string();
            ids.insert(name, request["id"].as_u64().unwrap());
        }

        for name in ["c", "a", "b"] {
            assert!(
                correlator
                    .resolve(ids[name], Ok(json!({"answer": name})))
                    .await
            );
        }

        for (handle, name) in handles.into_iter().zip(["a", "b", "c"]) {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result, json!({"answer": name}));
        }
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_ids_increase_and_wire_format_is_one_line() {
        let (correlator, _shared, mut lines) = wired(ProcessState::Ready).await;

        for expected in 1..=2u64 {
            let correlator_clone = correlator.clone();
            let call = tokio::spawn(async move {
                correlator_clone.call("ping", json!({}), None).await
            });

            let request = next_request(&mut lines).await;
            assert_eq!(request["jsonrpc"], "2.0");
            assert_eq!(request["id"], expected);
            assert_eq!(request["method"], "ping");

            correlator.resolve(expected, Ok(json!({}))).await;
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_exact_request_bytes() {
        let (correlator, _shared) = correlator_in(ProcessState::Ready).await;
        let mock = tokio_test::io::Builder::new()
            .write(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\",\"params\":{}}\n")
            .build();
        correlator.attach_writer(Box::new(mock)).await;

        let result = correlator
            .call("tools/list", json!({}), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_notify_writes_without_registering() {
        let (correlator, _shared) = correlator_in(ProcessState::Starting).await;
        let mock = tokio_test::io::Builder::new()
            .write(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\",\"params\":{}}\n")
            .build();
        correlator.attach_writer(Box::new(mock)).await;

        correlator
            .notify_internal("notifications/initialized", json!({}))
            .await
            .unwrap();
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_public_notify_rejected_while_starting() {
        let (correlator, _shared) = correlator_in(ProcessState::Starting).await;
        // No writes expected: the mock panics on any unexpected write.
        correlator
            .attach_writer(Box::new(tokio_test::io::Builder::new().build()))
            .await;

        let result = correlator
            .notify("notifications/cancelled", json!({"requestId": 1}))
            .await;
        assert!(matches!(
            result,
            Err(BridgeError::ProcessNotRunning(ProcessState::Starting))
        ));
    }

    #[tokio::test]
    async fn test_unmatched_response_is_discarded() {
        let (correlator, _shared, mut lines) = wired(ProcessState::Ready).await;

        let correlator_clone = correlator.clone();
        let call = tokio::spawn(async move {
            correlator_clone.call("tools/list", json!({}), None).await
        });
        let request = next_request(&mut lines).await;
        let id = request["id"].as_u64().unwrap();

        assert!(!correlator.resolve(id + 100, Ok(json!("stray"))).await);
        assert_eq!(correlator.pending_count().await, 1);

        assert!(correlator.resolve(id, Ok(json!({"tools": []}))).await);
        assert_eq!(call.await.unwrap().unwrap(), json!({"tools": []}));
    }

    #[tokio::test]
    async fn test_timeout_rejects_once_and_late_reply_is_discarded() {
        let (correlator, _shared, mut lines) = wired(ProcessState::Ready).await;

        let correlator_clone = correlator.clone();
        let call = tokio::spawn(async move {
            correlator_clone
                .call("tools/call", json!({}), Some(Duration::from_millis(50)))
                .await
        });
        let request = next_request(&mut lines).await;
        let id = request["id"].as_u64().unwrap();

        match call.await.unwrap() {
            Err(BridgeError::Timeout { method, timeout }) => {
                assert_eq!(method, "tools/call");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        assert_eq!(correlator.pending_count().await, 0);
        assert!(!correlator.resolve(id, Ok(json!("late"))).await);
    }

    #[tokio::test]
    async fn test_remote_error_rejects_with_message() {
        let (correlator, _shared, mut lines) = wired(ProcessState::Ready).await;

        let correlator_clone = correlator.clone();
        let call = tokio::spawn(async move {
            correlator_clone.call("prompts/get", json!({}), None).await
        });
        let id = next_request(&mut lines).await["id"].as_u64().unwrap();

        correlator
            .resolve(
                id,
                Err(RpcError {
                    code: Some(-32602),
                    message: "Missing prompt name".to_string(),
                    data: None,
                }),
            )
            .await;

        match call.await.unwrap() {
            Err(BridgeError::RemoteError { code, message }) => {
                assert_eq!(code, Some(-32602));
                assert_eq!(message, "Missing prompt name");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_rejected_unless_ready() {
        let (correlator, _shared, _lines) = wired(ProcessState::Starting).await;

        let result = correlator.call("tools/list", json!({}), None).await;
        assert!(matches!(
            result,
            Err(BridgeError::ProcessNotRunning(ProcessState::Starting))
        ));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_internal_calls_allowed_while_starting() {
        let (correlator, _shared, mut lines) = wired(ProcessState::Starting).await;

        let correlator_clone = correlator.clone();
        let call = tokio::spawn(async move {
            correlator_clone
                .call_internal("initialize", json!({}), Duration::from_secs(1))
                .await
        });
        let request = next_request(&mut lines).await;
        assert_eq!(request["method"], "initialize");

        correlator
            .resolve(request["id"].as_u64().unwrap(), Ok(json!({"serverInfo": {}})))
            .await;
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_call_without_writer_is_not_running() {
        let (correlator, _shared) = correlator_in(ProcessState::Ready).await;

        let result = correlator.call("tools/list", json!({}), None).await;
        assert!(matches!(result, Err(BridgeError::ProcessNotRunning(_))));
    }

    #[tokio::test]
    async fn test_reject_all_fails_every_pending_call() {
        let (correlator, shared, _lines) = wired(ProcessState::Ready).await;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let correlator = correlator.clone();
            handles.push(tokio::spawn(async move {
                correlator.call("tools/call", json!({}), None).await
            }));
        }
        wait_for_pending(&correlator, 2).await;

        let rejected = reject_all(&mut *shared.lock().await);
        assert_eq!(rejected, 2);

        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(BridgeError::ProcessExited { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_write_failure_rejects_as_process_exited() {
        let (correlator, _shared) = correlator_in(ProcessState::Ready).await;
        let (ours, theirs) = tokio::io::duplex(64);
        drop(theirs);
        correlator.attach_writer(Box::new(ours)).await;

        let result = correlator.call("tools/list", json!({}), None).await;
        assert!(matches!(result, Err(BridgeError::ProcessExited { .. })));
        assert_eq!(correlator.pending_count().await, 0);
    }
}
