//! Transfer jobs and their progress state machine

use nimbus_core::transport::TransportError;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Reference to binary content addressed by a storage URI. The content
/// itself bypasses the message outbox and flows through the transfer
/// queue.
#[derive(Debug, Clone)]
pub struct StorageObject {
    pub uri: String,
    pub name: String,
    pub content_type: String,
    pub length: u64,
}

impl StorageObject {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            content_type: "application/octet-stream".to_string(),
            length: 0,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.length = length;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Progress states. Transitions are monotonic:
/// `Queued -> InProgress -> {Completed | Failed}`, or `Queued ->
/// Cancelled`; a terminal state is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Transfer queue errors.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The job has already been enqueued, started, or finished
    #[error("job is not in a queueable state")]
    IllegalState,

    /// The queue is at capacity
    #[error("transfer queue is full")]
    QueueFull,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct JobState {
    state: TransferState,
    bytes_transferred: u64,
    enqueued: bool,
}

/// Shared handle to one transfer job. Once the job is dequeued the
/// progress state is shared between the queue and the transport completion
/// path, so the handle lives behind an `Arc`.
pub struct TransferHandle {
    object: StorageObject,
    direction: TransferDirection,
    priority: u8,
    inner: Mutex<JobState>,
}

impl TransferHandle {
    pub fn new(object: StorageObject, direction: TransferDirection, priority: u8) -> Arc<Self> {
        Arc::new(Self {
            object,
            direction,
            priority,
            inner: Mutex::new(JobState {
                state: TransferState::Queued,
                bytes_transferred: 0,
                enqueued: false,
            }),
        })
    }

    pub fn object(&self) -> &StorageObject {
        &self.object
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn state(&self) -> TransferState {
        self.inner.lock().state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.inner.lock().bytes_transferred
    }

    /// Claim the job for the queue. Fails unless the job is newly created.
    pub(crate) fn try_enqueue(&self) -> Result<(), TransferError> {
        let mut inner = self.inner.lock();
        if inner.enqueued || inner.state != TransferState::Queued {
            return Err(TransferError::IllegalState);
        }
        inner.enqueued = true;
        Ok(())
    }

    /// `Queued -> Cancelled`. Returns false (no-op) when the job is
    /// already running or terminal - a mid-transfer job finishes or fails
    /// naturally.
    pub(crate) fn cancel_if_queued(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransferState::Queued {
            inner.state = TransferState::Cancelled;
            true
        } else {
            false
        }
    }

    /// `Queued -> InProgress`. Returns false when the job was cancelled
    /// between dequeue and start.
    pub(crate) fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransferState::Queued {
            inner.state = TransferState::InProgress;
            true
        } else {
            false
        }
    }

    pub(crate) fn record_bytes(&self, bytes_transferred: u64) {
        self.inner.lock().bytes_transferred = bytes_transferred;
    }

    /// `InProgress -> {Completed | Failed}`. Terminal states stick.
    pub(crate) fn finish(&self, state: TransferState) {
        debug_assert!(state.is_terminal());
        let mut inner = self.inner.lock();
        if inner.state == TransferState::InProgress {
            inner.state = state;
        }
    }
}
