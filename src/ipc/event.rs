use serde_json::Value;
use tokio::sync::broadcast;

/// Broadcasts JSON-RPC notification strings to all connected WebSocket
/// clients. Lagging receivers drop events; the sender never blocks.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Send a JSON-RPC notification to all connected clients.
    pub fn broadcast(&self, method: &str, params: Value) {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        // Ignore errors — no subscribers is fine
        let _ = self
            .tx
            .send(serde_json::to_string(&notification).unwrap_or_default());
    }

    /// Subscribe to all broadcast events.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// `exec.approval.requested` — a new approval is waiting for an operator.
    pub fn approval_requested(&self, record: Value) {
        self.broadcast("exec.approval.requested", record);
    }

    /// `exec.approval.resolved` — an approval reached a final decision.
    pub fn approval_resolved(&self, event: Value) {
        self.broadcast("exec.approval.resolved", event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscriber_as_jsonrpc() {
        let b = EventBroadcaster::new();
        let mut rx = b.subscribe();
        b.approval_resolved(serde_json::json!({"id": "ap-1"}));
        let raw = rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["method"], "exec.approval.resolved");
        assert_eq!(v["params"]["id"], "ap-1");
    }

    #[test]
    fn broadcast_without_subscribers_is_fine() {
        let b = EventBroadcaster::new();
        b.broadcast("kernel.ready", serde_json::json!({}));
    }
}
