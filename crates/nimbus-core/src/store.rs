//! Boundary trait for the durable message outbox
//!
//! Implementations live in `nimbus-store`: a SQLite-backed store for
//! durable environments and a no-op store for everything else. Selection is
//! a caller concern.

use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Record namespaces. Plain outgoing messages and batched policy output
/// coexist in the same store but are never cross-queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Messages,
    PolicyBatches,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Messages => "messages",
            Namespace::PolicyBatches => "policy_batches",
        }
    }

    /// Both namespaces, in replay order.
    pub const ALL: [Namespace; 2] = [Namespace::Messages, Namespace::PolicyBatches];
}

/// Backing-store failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backing store I/O failure: {0}")]
    Io(String),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Durable outbox contract.
///
/// `save` must be idempotent under the message-id primary key: inserting an
/// id that already exists is a silent no-op, not an error. `load_all`
/// returns an endpoint's messages ordered by ascending event time.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, ns: Namespace, batch: &[Message]) -> Result<(), StoreError>;

    async fn load_all(&self, ns: Namespace, endpoint_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn delete(&self, ns: Namespace, ids: &[Uuid]) -> Result<(), StoreError>;
}
