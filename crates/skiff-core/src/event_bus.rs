use tokio::sync::broadcast;

use skiff_types::CanonicalMessage;

/// Broadcast fan-out of canonical messages for decoupled observers; the
/// synchronous per-message callback on `execute` remains the primary
/// delivery path.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CanonicalMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CanonicalMessage> {
        self.tx.subscribe()
    }

    pub fn publish(&self, message: CanonicalMessage) {
        let _ = self.tx.send(message);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_messages() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(CanonicalMessage::Text {
            session_id: "s1".to_string(),
            text: "hi".to_string(),
        });
        let received = rx.recv().await.expect("receive");
        assert_eq!(received.session_id(), "s1");
    }

    #[test]
    fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new();
        bus.publish(CanonicalMessage::Text {
            session_id: "s1".to_string(),
            text: "dropped".to_string(),
        });
    }
}
