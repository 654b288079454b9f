//! Message store implementations for the Nimbus IoT SDK
//!
//! Two implementations of the `nimbus-core` [`MessageStore`] contract:
//!
//! - [`SqliteMessageStore`] - durable, crash-tolerant, deduplicated by
//!   message id
//! - [`NoopMessageStore`] - for environments without durable storage
//!
//! Which one a session uses is a configuration concern of the embedding
//! application.
//!
//! [`MessageStore`]: nimbus_core::store::MessageStore

pub mod noop;
pub mod sqlite;

pub use noop::NoopMessageStore;
pub use sqlite::SqliteMessageStore;
