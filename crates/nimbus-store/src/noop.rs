//! No-op message store for environments without durable storage
//!
//! Accepts writes and returns empty reads: delivery degrades to
//! in-memory-only for the session, which is exactly the best-effort
//! behavior the outbox falls back to when a durable save fails.

use async_trait::async_trait;
use nimbus_core::message::Message;
use nimbus_core::store::{MessageStore, Namespace, StoreError};
use uuid::Uuid;

pub struct NoopMessageStore;

#[async_trait]
impl MessageStore for NoopMessageStore {
    async fn save(&self, _ns: Namespace, _batch: &[Message]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_all(&self, _ns: Namespace, _endpoint_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _ns: Namespace, _ids: &[Uuid]) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn accepts_writes_returns_empty_reads() {
        let store = NoopMessageStore;
        let mut attributes = serde_json::Map::new();
        attributes.insert("temperature".into(), json!(1));
        let msg = Message::data("device-1", attributes);

        store.save(Namespace::Messages, &[msg.clone()]).await.unwrap();
        assert!(store
            .load_all(Namespace::Messages, "device-1")
            .await
            .unwrap()
            .is_empty());
        store.delete(Namespace::Messages, &[msg.id]).await.unwrap();
    }
}
