//! Outbox-backed message delivery
//!
//! Guaranteed messages are saved to the backing store before the first send
//! attempt and deleted only once the transport acknowledges them, so a
//! crash between the two leaves a replayable record. Entries left over from
//! a prior process lifetime are staged ahead of new traffic at startup.
//!
//! The staged queue is drained on monitor ticks. One drain is in flight at
//! a time; the tick only spawns the async work and never blocks in it.

use crate::message::Message;
use crate::monitor::{Monitor, Registration};
use crate::store::{MessageStore, Namespace, StoreError};
use crate::transport::{CredentialSource, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delivery queue configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Maximum messages handed to the transport per drain cycle
    pub max_batch: usize,

    /// When set, a failed outbox save fails `queue` instead of degrading
    /// to in-memory-only delivery for the session
    pub strict_persistence: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_batch: 16,
            strict_persistence: false,
        }
    }
}

/// Delivery errors surfaced to callers.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Outbox save failed and strict persistence is enabled
    #[error("persisting message failed: {0}")]
    Persistence(#[from] StoreError),

    /// Startup replay could not read the store; the outbox cannot assume a
    /// consistent state, so nothing was staged
    #[error("startup replay failed: {0}")]
    Replay(StoreError),
}

/// Callback invoked when a message is dropped (fatal transport failure or
/// exhausted retries).
pub type FailureFn = Box<dyn Fn(&Message, &TransportError) + Send + Sync>;

/// Delivery counters.
#[derive(Default)]
pub struct DeliveryStats {
    pub queued: AtomicU64,
    pub sent: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub replayed: AtomicU64,
    pub auth_refreshes: AtomicU64,
}

/// Point-in-time view of [`DeliveryStats`].
#[derive(Debug, Clone, Default)]
pub struct DeliveryStatsSnapshot {
    pub queued: u64,
    pub sent: u64,
    pub retried: u64,
    pub dropped: u64,
    pub replayed: u64,
    pub auth_refreshes: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            auth_refreshes: self.auth_refreshes.load(Ordering::Relaxed),
        }
    }
}

/// The durable outbox plus its in-memory staging queue.
pub struct DeliveryQueue {
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    credentials: Option<Arc<dyn CredentialSource>>,
    config: DeliveryConfig,
    staged: Mutex<VecDeque<(Namespace, Message)>>,
    in_flight: AtomicBool,
    on_failure: Mutex<Option<FailureFn>>,
    stats: DeliveryStats,
}

impl DeliveryQueue {
    pub fn new(
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        credentials: Option<Arc<dyn CredentialSource>>,
        config: DeliveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            credentials,
            config,
            staged: Mutex::new(VecDeque::new()),
            in_flight: AtomicBool::new(false),
            on_failure: Mutex::new(None),
            stats: DeliveryStats::default(),
        })
    }

    /// Set the dropped-message callback.
    pub fn set_on_failure(&self, callback: impl Fn(&Message, &TransportError) + Send + Sync + 'static) {
        *self.on_failure.lock() = Some(Box::new(callback));
    }

    /// Stage a message in [`Namespace::Messages`].
    pub async fn queue(&self, message: Message) -> Result<Uuid, DeliveryError> {
        self.queue_in(Namespace::Messages, message).await
    }

    /// Stage a message in a specific namespace. Guaranteed messages are
    /// saved to the store first; the save failure policy is configurable
    /// (best-effort by default).
    pub async fn queue_in(&self, ns: Namespace, message: Message) -> Result<Uuid, DeliveryError> {
        let id = message.id;

        if message.is_guaranteed() {
            if let Err(e) = self.store.save(ns, std::slice::from_ref(&message)).await {
                if self.config.strict_persistence {
                    return Err(DeliveryError::Persistence(e));
                }
                warn!(
                    message_id = %id,
                    error = %e,
                    "Outbox save failed, message is in-memory only for this session"
                );
            }
        }

        self.staged.lock().push_back((ns, message));
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Reload both namespaces for an endpoint and stage the recovered
    /// messages ahead of new traffic, ordered by ascending event time. A
    /// store read failure is a hard error: nothing is staged and the caller
    /// decides whether to proceed without replay.
    pub async fn replay(&self, endpoint_id: &str) -> Result<usize, DeliveryError> {
        let mut recovered = Vec::new();
        for ns in Namespace::ALL {
            let messages = self
                .store
                .load_all(ns, endpoint_id)
                .await
                .map_err(DeliveryError::Replay)?;
            recovered.extend(messages.into_iter().map(|m| (ns, m)));
        }
        recovered.sort_by_key(|(_, m)| m.event_time);

        let count = recovered.len();
        let mut staged = self.staged.lock();
        for entry in recovered.into_iter().rev() {
            staged.push_front(entry);
        }
        drop(staged);

        self.stats.replayed.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            info!(endpoint_id, count, "Outbox replay staged");
        }
        Ok(count)
    }

    /// Register the tick callback with the session monitor.
    pub fn attach(self: &Arc<Self>, monitor: &Monitor) -> Registration {
        let queue = self.clone();
        monitor.register("delivery", move |_now| {
            queue.tick();
            Ok(())
        })
    }

    /// One tick: spawn a drain if messages are staged and none is running.
    pub fn tick(self: &Arc<Self>) {
        if self.in_flight.load(Ordering::Acquire) {
            return;
        }
        if self.staged.lock().is_empty() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            queue.drain().await;
        });
    }

    /// Drain staged messages until none remain (shutdown / test path).
    pub async fn flush(&self) {
        loop {
            if self.drain().await == 0 && self.staged.lock().is_empty() {
                if self.in_flight.load(Ordering::Acquire) {
                    tokio::task::yield_now().await;
                    continue;
                }
                return;
            }
        }
    }

    /// Send up to one batch of staged messages. Returns the number of
    /// messages processed; 0 when another drain is in flight or nothing is
    /// staged.
    pub async fn drain(&self) -> usize {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let processed = self.drain_batch().await;
        self.in_flight.store(false, Ordering::Release);
        processed
    }

    async fn drain_batch(&self) -> usize {
        let batch: Vec<(Namespace, Message)> = {
            let mut staged = self.staged.lock();
            let take = staged.len().min(self.config.max_batch);
            staged.drain(..take).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let mut acked: Vec<(Namespace, Uuid)> = Vec::new();
        let mut dropped: Vec<(Namespace, Uuid)> = Vec::new();
        let mut requeue: Vec<(Namespace, Message)> = Vec::new();
        let processed = batch.len();

        for (ns, mut message) in batch {
            match self.send_with_auth_retry(&message).await {
                Ok(()) => {
                    debug!(message_id = %message.id, "Message acknowledged");
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                    acked.push((ns, message.id));
                }
                Err(e) if e.is_retryable() && message.remaining_retries > 0 => {
                    message.remaining_retries -= 1;
                    debug!(
                        message_id = %message.id,
                        remaining = message.remaining_retries,
                        error = %e,
                        "Send failed, message kept for retry"
                    );
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    requeue.push((ns, message));
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Message dropped");
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    dropped.push((ns, message.id));
                    if let Some(callback) = self.on_failure.lock().as_ref() {
                        callback(&message, &e);
                    }
                }
            }
        }

        // Re-stage retryable messages at the front, preserving their order.
        if !requeue.is_empty() {
            let mut staged = self.staged.lock();
            for entry in requeue.into_iter().rev() {
                staged.push_front(entry);
            }
        }

        // Delete only after the transport acknowledged (or permanently
        // rejected) the message; the save happened back in `queue_in`.
        self.delete_batch(&acked).await;
        self.delete_batch(&dropped).await;

        processed
    }

    async fn delete_batch(&self, entries: &[(Namespace, Uuid)]) {
        for ns in Namespace::ALL {
            let ids: Vec<Uuid> = entries
                .iter()
                .filter(|(entry_ns, _)| *entry_ns == ns)
                .map(|(_, id)| *id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            if let Err(e) = self.store.delete(ns, &ids).await {
                // The messages were already settled with the server; a
                // failed delete means a duplicate replay attempt later,
                // which the idempotent insert absorbs.
                warn!(namespace = ns.as_str(), error = %e, "Outbox delete failed");
            }
        }
    }

    /// Send one message, refreshing credentials and retrying once on auth
    /// expiry.
    async fn send_with_auth_retry(&self, message: &Message) -> Result<(), TransportError> {
        match self.transport.send(message).await {
            Err(TransportError::AuthExpired) => {
                self.stats.auth_refreshes.fetch_add(1, Ordering::Relaxed);
                if let Some(credentials) = &self.credentials {
                    if let Err(e) = credentials.refresh().await {
                        warn!(error = %e, "Credential refresh failed");
                    }
                } else {
                    warn!("Authorization expired and no credential source configured");
                }
                self.transport.send(message).await
            }
            other => other,
        }
    }

    /// Number of staged (not yet settled) messages.
    pub fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }
}
