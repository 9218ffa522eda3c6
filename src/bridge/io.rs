use super::state::SharedState;
use super::ProcessState;
use crate::mcp::correlator::{reject_all, RequestCorrelator};
use crate::mcp::framer::{Frame, Framer, LogLines};
use crate::mcp::handshake::{MarkerScanner, ReadinessSignal};
use crate::mcp::notifications::NotificationDispatcher;
use crate::mcp::types::Message;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the stdout reader -> router channel.
pub(crate) const MESSAGE_BUFFER: usize = 64;

/// Longest slice of a stray stdout line echoed into the log.
const LOG_PREVIEW_CHARS: usize = 256;

/// Log target for lines the child writes to stderr.
const CHILD_STDERR_TARGET: &str = "child_stderr";

/// Frame stdout and forward messages to the router.
pub(crate) async fn pump_stdout<R>(
    stdout: R,
    framer: Framer,
    mut scanner: MarkerScanner,
    readiness: ReadinessSignal,
    tx: mpsc::Sender<Message>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(stdout, framer);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Frame::Message(message)) => {
                // Any well-formed message means the child is talking protocol.
                readiness.mark_ready();
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Ok(Frame::Text(line)) => {
                if observe_line(&mut scanner, &line) {
                    if readiness.mark_ready() {
                        info!("Readiness marker seen on MCP stdout");
                    }
                } else {
                    let preview: String = line.chars().take(LOG_PREVIEW_CHARS).collect();
                    warn!("Ignoring non-protocol line on MCP stdout: {}", preview);
                }
            }
            Err(e) => {
                warn!("Error reading MCP stdout: {}", e);
                return;
            }
        }
    }
    debug!("MCP stdout closed");
}

/// Forward stderr lines to the log and watch them for the readiness marker.
pub(crate) async fn pump_stderr<R>(
    stderr: R,
    lines: LogLines,
    mut scanner: MarkerScanner,
    readiness: ReadinessSignal,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stderr, lines);
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if observe_line(&mut scanner, &line) && readiness.mark_ready() {
                    info!("Readiness marker seen on MCP stderr");
                }
                let text = line.trim_end();
                if !text.is_empty() {
                    info!(target: CHILD_STDERR_TARGET, "{}", text);
                }
            }
            Err(e) => {
                warn!("Error reading MCP stderr: {}", e);
                break;
            }
        }
    }
}

/// Scan one whole line; the trailing newline keeps matches from spanning lines.
fn observe_line(scanner: &mut MarkerScanner, line: &str) -> bool {
    scanner.observe(line.as_bytes()) | scanner.observe(b"\n")
}

/// Deliver framed messages in arrival order.
pub(crate) async fn route_messages(
    mut rx: mpsc::Receiver<Message>,
    correlator: RequestCorrelator,
    dispatcher: NotificationDispatcher,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Response { id, outcome } => {
                correlator.resolve(id, outcome).await;
            }
            Message::Notification(notification) => dispatcher.dispatch(notification),
            Message::Request { id, method, .. } => {
                warn!(
                    "Ignoring request '{}' (id {}) from MCP process: server-initiated requests are not supported",
                    method, id
                );
            }
        }
    }
}

/// Own the child until it exits or `kill` fires, then run the exit handler.
pub(crate) async fn watch_exit(
    mut child: Child,
    generation: u64,
    kill: CancellationToken,
    shared: SharedState,
    readiness: ReadinessSignal,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            info!("Terminating MCP process");
            if let Err(e) = child.start_kill() {
                warn!("Failed to signal MCP process: {}", e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => info!("MCP process exited: {}", status),
        Err(e) => error!("Failed waiting for MCP process: {}", e),
    }

    readiness.mark_exited();
    handle_exit(&shared, generation).await;
}

/// Reject everything in flight and leave Ready. Stale generations are ignored.
pub(crate) async fn handle_exit(shared: &SharedState, generation: u64) {
    let mut inner = shared.lock().await;
    if inner.live_generation != Some(generation) {
        debug!("Ignoring exit of stale MCP process generation {}", generation);
        return;
    }

    inner.live_generation = None;
    inner.pid = None;
    inner.snapshot = None;
    if inner.state == ProcessState::Ready {
        if let Err(e) = inner.transition(ProcessState::Disconnected) {
            warn!("{}", e);
        }
    }

    let rejected = reject_all(&mut inner);
    if rejected > 0 {
        warn!(
            "Rejected {} pending call(s) after MCP process exit",
            rejected
        );
    }
}
