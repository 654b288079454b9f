//! Storage transfer queue for the Nimbus IoT SDK
//!
//! Binary content referenced by a storage URI bypasses the message outbox
//! and flows through this crate: a bounded, priority-ordered queue of
//! upload/download jobs with a monotonic progress state machine, driven by
//! the shared session monitor.

pub mod dispatcher;
pub mod job;
pub mod queue;

pub use dispatcher::{
    DispatcherConfig, StorageTransport, TransferDispatcher, TransferProgress, TransferStats,
};
pub use job::{StorageObject, TransferDirection, TransferError, TransferHandle, TransferState};
pub use queue::TransferQueue;
