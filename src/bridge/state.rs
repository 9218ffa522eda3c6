use crate::error::{BridgeError, Result};
use crate::mcp::correlator::PendingCall;
use crate::mcp::{CapabilitySnapshot, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Lifecycle state of the supervised MCP process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Disconnected,
}

impl ProcessState {
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Ready)
                | (Starting, Stopped)
                | (Ready, Disconnected)
                | (Disconnected, Starting)
                | (Disconnected, Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

/// Everything callers and I/O tasks mutate concurrently. Guarded by one mutex.
pub(crate) struct BridgeInner {
    pub(crate) state: ProcessState,
    pub(crate) pending: HashMap<RequestId, PendingCall>,
    next_id: RequestId,
    pub(crate) snapshot: Option<CapabilitySnapshot>,
    /// Generation of the process currently alive, cleared by its exit handler.
    pub(crate) live_generation: Option<u64>,
    pub(crate) pid: Option<u32>,
}

impl BridgeInner {
    pub(crate) fn transition(&mut self, next: ProcessState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Process state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Next request id. Ids start at 1 and are never handed out twice.
    pub(crate) fn allocate_id(&mut self) -> Result<RequestId> {
        let id = self.next_id;
        self.next_id = id
            .checked_add(1)
            .ok_or_else(|| BridgeError::Internal("request id space exhausted".to_string()))?;
        Ok(id)
    }
}

/// Handle to the bridge's single synchronization point
#[derive(Clone)]
pub(crate) struct SharedState {
    inner: Arc<Mutex<BridgeInner>>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BridgeInner {
                state: ProcessState::Stopped,
                pending: HashMap::new(),
                next_id: 1,
                snapshot: None,
                live_generation: None,
                pid: None,
            })),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, BridgeInner> {
        self.inner.lock().await
    }

    pub(crate) async fn state(&self) -> ProcessState {
        self.inner.lock().await.state
    }
}
