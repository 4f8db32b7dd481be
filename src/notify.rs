use serde::Serialize;
use tokio::sync::broadcast;

/// A single notification emitted by a subsystem (checkpoint created, hook failed, ...).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: String,
    pub body: String,
    pub metadata: serde_json::Value,
}

/// Minimal broadcast hub standing in for the operational notification layer. Subsystems
/// only need to emit; rendering/delivery to a UI is outside this crate.
pub struct NotificationCenter {
    sender: broadcast::Sender<Notification>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn notify(&self, kind: &str, body: &str, metadata: serde_json::Value) {
        let notification = Notification {
            kind: kind.to_string(),
            body: body.to_string(),
            metadata,
        };
        // No receivers is the common case when nothing has subscribed yet; not an error.
        let _ = self.sender.send(notification);
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_notifications() {
        let center = NotificationCenter::new();
        let mut rx = center.subscribe();

        center.notify("checkpoint", "created", serde_json::json!({"id": "c1"}));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, "checkpoint");
        assert_eq!(received.body, "created");
    }

    #[tokio::test]
    async fn notify_without_subscribers_does_not_panic() {
        let center = NotificationCenter::new();
        center.notify("hook", "ran", serde_json::Value::Null);
    }
}
