use super::types::Notification;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const NOTIFICATION_BUFFER: usize = 64;

/// Fans server-initiated notifications out to diagnostics and any subscribers.
///
/// Subscribers that fall behind lose the oldest notifications; the reader
/// never waits on them.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: broadcast::Sender<Notification>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn dispatch(&self, notification: Notification) {
        log_notification(&notification);

        // No receivers is the common case.
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn log_notification(notification: &Notification) {
    if notification.method != "notifications/message" {
        debug!(
            method = %notification.method,
            params = %notification.params,
            "MCP notification"
        );
        return;
    }

    // Log records forwarded by the child: {level, logger?, data}
    let params = &notification.params;
    let logger = params
        .get("logger")
        .and_then(|l| l.as_str())
        .unwrap_or("mcp");
    let data = params.get("data").cloned().unwrap_or_default();

    match params.get("level").and_then(|l| l.as_str()).unwrap_or("info") {
        "debug" => debug!(logger, %data, "MCP log"),
        "notice" | "info" => info!(logger, %data, "MCP log"),
        "warning" => warn!(logger, %data, "MCP log"),
        "error" | "critical" | "alert" | "emergency" => error!(logger, %data, "MCP log"),
        other => info!(logger, level = other, %data, "MCP log"),
    }
}
