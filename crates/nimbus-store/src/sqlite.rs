//! SQLite-backed message store
//!
//! One record per message: `{event_time, endpoint_id, message_id (primary
//! key), body}`, in one table per namespace. The primary key gives the
//! insert-if-absent dedup the outbox contract requires; `INSERT OR IGNORE`
//! makes a duplicate save a silent no-op.

use async_trait::async_trait;
use nimbus_core::message::Message;
use nimbus_core::store::{MessageStore, Namespace, StoreError};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Durable outbox store on an embedded SQLite database.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(io_error)?;
        Self::with_connection(conn)
    }

    /// In-memory database; useful for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(io_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        for ns in Namespace::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    message_id TEXT PRIMARY KEY,
                    endpoint_id TEXT NOT NULL,
                    event_time INTEGER NOT NULL,
                    body TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_endpoint
                    ON {table}(endpoint_id, event_time);",
                table = ns.as_str()
            ))
            .map_err(io_error)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn io_error(e: rusqlite::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save(&self, ns: Namespace, batch: &[Message]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction().map_err(io_error)?;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT OR IGNORE INTO {} (message_id, endpoint_id, event_time, body)
                     VALUES (?1, ?2, ?3, ?4)",
                    ns.as_str()
                ))
                .map_err(io_error)?;
            for message in batch {
                let body = serde_json::to_string(message)
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                stmt.execute(rusqlite::params![
                    message.id.to_string(),
                    message.endpoint_id,
                    message.event_time.timestamp_millis(),
                    body,
                ])
                .map_err(io_error)?;
            }
        }
        tx.commit().map_err(io_error)?;
        debug!(namespace = ns.as_str(), count = batch.len(), "Messages saved");
        Ok(())
    }

    async fn load_all(&self, ns: Namespace, endpoint_id: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT message_id, body FROM {}
                 WHERE endpoint_id = ?1
                 ORDER BY event_time ASC, message_id ASC",
                ns.as_str()
            ))
            .map_err(io_error)?;

        let rows = stmt
            .query_map(rusqlite::params![endpoint_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(io_error)?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, body) = row.map_err(io_error)?;
            let message: Message =
                serde_json::from_str(&body).map_err(|e| StoreError::Corrupt {
                    id,
                    reason: e.to_string(),
                })?;
            messages.push(message);
        }
        Ok(messages)
    }

    async fn delete(&self, ns: Namespace, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction().map_err(io_error)?;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "DELETE FROM {} WHERE message_id = ?1",
                    ns.as_str()
                ))
                .map_err(io_error)?;
            for id in ids {
                stmt.execute(rusqlite::params![id.to_string()])
                    .map_err(io_error)?;
            }
        }
        tx.commit().map_err(io_error)?;
        debug!(namespace = ns.as_str(), count = ids.len(), "Messages deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn message(endpoint: &str, event_secs: i64) -> Message {
        let mut attributes = serde_json::Map::new();
        attributes.insert("temperature".into(), json!(23));
        Message::data(endpoint, attributes)
            .with_event_time(Utc.timestamp_opt(event_secs, 0).unwrap())
    }

    #[tokio::test]
    async fn duplicate_save_leaves_one_record() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        let msg = message("device-1", 100);

        store.save(Namespace::Messages, &[msg.clone()]).await.unwrap();
        store.save(Namespace::Messages, &[msg.clone()]).await.unwrap();

        let loaded = store.load_all(Namespace::Messages, "device-1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, msg.id);
    }

    #[tokio::test]
    async fn load_orders_by_ascending_event_time() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        let late = message("device-1", 300);
        let early = message("device-1", 100);
        let middle = message("device-1", 200);

        store
            .save(Namespace::Messages, &[late.clone(), early.clone(), middle.clone()])
            .await
            .unwrap();

        let loaded = store.load_all(Namespace::Messages, "device-1").await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![early.id, middle.id, late.id]);
    }

    #[tokio::test]
    async fn load_filters_by_endpoint() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        store
            .save(Namespace::Messages, &[message("device-1", 1), message("device-2", 2)])
            .await
            .unwrap();

        let loaded = store.load_all(Namespace::Messages, "device-1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].endpoint_id, "device-1");
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        store
            .save(Namespace::Messages, &[message("device-1", 1)])
            .await
            .unwrap();
        store
            .save(Namespace::PolicyBatches, &[message("device-1", 2)])
            .await
            .unwrap();

        assert_eq!(store.load_all(Namespace::Messages, "device-1").await.unwrap().len(), 1);
        assert_eq!(store.load_all(Namespace::PolicyBatches, "device-1").await.unwrap().len(), 1);

        let batch_ids: Vec<Uuid> = store
            .load_all(Namespace::PolicyBatches, "device-1")
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        store.delete(Namespace::PolicyBatches, &batch_ids).await.unwrap();

        assert_eq!(store.load_all(Namespace::Messages, "device-1").await.unwrap().len(), 1);
        assert!(store.load_all(Namespace::PolicyBatches, "device-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_delete_removes_only_named_ids() {
        let store = SqliteMessageStore::open_in_memory().unwrap();
        let keep = message("device-1", 1);
        let remove_a = message("device-1", 2);
        let remove_b = message("device-1", 3);
        store
            .save(
                Namespace::Messages,
                &[keep.clone(), remove_a.clone(), remove_b.clone()],
            )
            .await
            .unwrap();

        store
            .delete(Namespace::Messages, &[remove_a.id, remove_b.id])
            .await
            .unwrap();

        let loaded = store.load_all(Namespace::Messages, "device-1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, keep.id);
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");
        let msg = message("device-1", 100);

        {
            let store = SqliteMessageStore::open(&path).unwrap();
            store.save(Namespace::Messages, &[msg.clone()]).await.unwrap();
        }

        let store = SqliteMessageStore::open(&path).unwrap();
        let loaded = store.load_all(Namespace::Messages, "device-1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, msg.id);
    }
}
