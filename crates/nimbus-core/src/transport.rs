//! Boundary traits for the wire transport
//!
//! The pipeline never talks HTTP/MQTT itself; it consumes a send primitive
//! whose failures are classified into retryable and fatal. Only retryable
//! failures leave the outbox entry in place.

use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;

/// Transport failure classification.
///
/// The split drives outbox behavior: `Retryable` and `AuthExpired` keep the
/// persisted entry alive, `Fatal` removes it and reports the loss.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transient failure (connectivity, 5xx-class responses)
    #[error("retryable transport failure: {0}")]
    Retryable(String),

    /// Bearer token rejected; refresh credentials and retry once
    #[error("authorization expired")]
    AuthExpired,

    /// Permanent failure (malformed payload, 4xx-class responses)
    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the failed message should survive for a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::AuthExpired)
    }
}

/// Message send primitive, consumed by the delivery queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message; `Ok` is an acknowledgment from the server.
    async fn send(&self, message: &Message) -> Result<(), TransportError>;
}

/// Bearer-credential refresh, invoked on [`TransportError::AuthExpired`].
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<()>;
}
