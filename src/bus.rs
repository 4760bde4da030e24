use crate::entity::SessionId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SyncEvent {
    /// A visitor transcript changed (poll result or local echo)
    TranscriptUpdated { session_id: SessionId },

    /// An explicit send failed; the echo stays until resent or dismissed
    SendFailed {
        session_id: SessionId,
        echo_id: Uuid,
        reason: String,
    },

    /// The admin conversation list was refreshed
    ConversationsUpdated,

    /// The admin detail view changed
    SelectionUpdated { session_id: Option<SessionId> },

    /// The admin console dropped its credential
    AdminLoggedOut { reason: String },
}

#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
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
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        bus.publish(SyncEvent::ConversationsUpdated);

        let mut rx = bus.subscribe();
        bus.publish(SyncEvent::SelectionUpdated { session_id: None });
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::SelectionUpdated { session_id: None }
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let sid = SessionId::parse("ses_abc").unwrap();
        let value = serde_json::to_value(SyncEvent::TranscriptUpdated { session_id: sid }).unwrap();
        assert_eq!(
            value,
            json!({ "type": "TranscriptUpdated", "data": { "session_id": "ses_abc" } })
        );

        let value = serde_json::to_value(SyncEvent::ConversationsUpdated).unwrap();
        assert_eq!(value["type"], "ConversationsUpdated");
    }
}
