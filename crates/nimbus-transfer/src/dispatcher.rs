//! Tick-driven transfer dispatcher
//!
//! On each monitor tick the dispatcher drains the ready jobs up to a batch
//! limit, marks them in progress, and hands the byte transfer to the
//! storage transport on spawned tasks. Progress, completion, and failure
//! are reported through a caller-supplied callback.
//!
//! An authorization failure triggers one credential refresh and a single
//! automatic retry; any other (or repeated) failure marks the job failed
//! and is surfaced, never retried automatically.

use crate::job::{StorageObject, TransferDirection, TransferError, TransferHandle, TransferState};
use crate::queue::TransferQueue;
use async_trait::async_trait;
use nimbus_core::monitor::{Monitor, Registration};
use nimbus_core::transport::{CredentialSource, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Byte-transfer primitive for storage content, consumed by the
/// dispatcher. The progress sink is invoked with the running byte count.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    async fn transfer(
        &self,
        object: &StorageObject,
        direction: TransferDirection,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, TransportError>;
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub uri: String,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

/// Caller-supplied monitoring callback.
pub type ProgressFn = Box<dyn Fn(&TransferProgress) + Send + Sync>;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Jobs started per tick
    pub max_batch_per_tick: usize,

    /// Queue capacity; `enqueue` fails beyond this
    pub max_queued: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_per_tick: 4,
            max_queued: crate::queue::DEFAULT_CAPACITY,
        }
    }
}

/// Transfer counters.
#[derive(Default)]
pub struct TransferStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub auth_retries: AtomicU64,
}

/// Point-in-time view of [`TransferStats`].
#[derive(Debug, Clone, Default)]
pub struct TransferStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub auth_retries: u64,
}

impl TransferStats {
    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            auth_retries: self.auth_retries.load(Ordering::Relaxed),
        }
    }
}

/// Priority-ordered storage transfer dispatcher.
pub struct TransferDispatcher {
    queue: TransferQueue,
    transport: Arc<dyn StorageTransport>,
    credentials: Option<Arc<dyn CredentialSource>>,
    config: DispatcherConfig,
    on_progress: Mutex<Option<ProgressFn>>,
    stats: TransferStats,
}

impl TransferDispatcher {
    pub fn new(
        transport: Arc<dyn StorageTransport>,
        credentials: Option<Arc<dyn CredentialSource>>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: TransferQueue::with_capacity(config.max_queued),
            transport,
            credentials,
            config,
            on_progress: Mutex::new(None),
            stats: TransferStats::default(),
        })
    }

    /// Set the monitoring callback.
    pub fn set_on_progress(&self, callback: impl Fn(&TransferProgress) + Send + Sync + 'static) {
        *self.on_progress.lock() = Some(Box::new(callback));
    }

    /// Queue a storage transfer. Fails unless the job is newly created.
    pub fn enqueue(&self, handle: Arc<TransferHandle>) -> Result<(), TransferError> {
        self.queue.enqueue(handle)
    }

    /// Cancel a queued job. A job already running or terminal is left
    /// untouched: mid-transfer cancellation is not preemptible.
    pub fn cancel(&self, handle: &TransferHandle) {
        if handle.cancel_if_queued() {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            self.report(handle, None);
        }
    }

    /// Register the tick callback with the session monitor.
    pub fn attach(self: &Arc<Self>, monitor: &Monitor) -> Registration {
        let dispatcher = self.clone();
        monitor.register("transfer-dispatcher", move |_now| {
            dispatcher.tick();
            Ok(())
        })
    }

    /// One tick: drain ready jobs up to the batch limit, mark them in
    /// progress, and hand each transfer to a spawned task.
    pub fn tick(self: &Arc<Self>) {
        for handle in self.queue.pop_ready(self.config.max_batch_per_tick) {
            if !handle.begin() {
                continue;
            }
            self.report(&handle, None);

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.run_job(handle).await;
            });
        }
    }

    /// Execute one transfer to completion and report the outcome.
    pub async fn run_job(&self, handle: Arc<TransferHandle>) {
        let result = self.transfer_with_auth_retry(&handle).await;
        match result {
            Ok(bytes) => {
                handle.record_bytes(bytes);
                handle.finish(TransferState::Completed);
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(uri = handle.object().uri.as_str(), bytes, "Transfer completed");
                self.report(&handle, None);
            }
            Err(e) => {
                handle.finish(TransferState::Failed);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(uri = handle.object().uri.as_str(), error = %e, "Transfer failed");
                self.report(&handle, Some(e.to_string()));
            }
        }
    }

    async fn transfer_with_auth_retry(
        &self,
        handle: &Arc<TransferHandle>,
    ) -> Result<u64, TransportError> {
        let progress = {
            let handle = handle.clone();
            move |bytes: u64| handle.record_bytes(bytes)
        };

        match self
            .transport
            .transfer(handle.object(), handle.direction(), &progress)
            .await
        {
            Err(TransportError::AuthExpired) => {
                self.stats.auth_retries.fetch_add(1, Ordering::Relaxed);
                if let Some(credentials) = &self.credentials {
                    if let Err(e) = credentials.refresh().await {
                        warn!(error = %e, "Credential refresh failed");
                    }
                } else {
                    warn!("Authorization expired and no credential source configured");
                }
                self.transport
                    .transfer(handle.object(), handle.direction(), &progress)
                    .await
            }
            other => other,
        }
    }

    fn report(&self, handle: &TransferHandle, error: Option<String>) {
        if let Some(callback) = self.on_progress.lock().as_ref() {
            callback(&TransferProgress {
                uri: handle.object().uri.clone(),
                state: handle.state(),
                bytes_transferred: handle.bytes_transferred(),
                error,
            });
        }
    }

    /// Jobs still waiting in the queue.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}
