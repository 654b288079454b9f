//! Message envelope - the unit of delivery between device and cloud

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// An outgoing message staged for delivery.
///
/// The `id` is globally unique and doubles as the deduplication key in the
/// outbox: saving the same message twice leaves exactly one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (outbox primary key)
    pub id: Uuid,

    /// Endpoint (device) this message belongs to
    pub endpoint_id: String,

    /// Wall-clock time the triggering event occurred
    pub event_time: DateTime<Utc>,

    /// Server-side destination (topic / resource path)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,

    /// Delivery priority
    pub priority: MessagePriority,

    /// Delivery reliability class
    pub reliability: Reliability,

    /// Retries left for retryable transport failures
    pub remaining_retries: u32,

    /// Logical sender (attribute pipeline, alert stage, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,

    /// Type-specific payload
    pub payload: MessagePayload,
}

/// Payload variants carried by a [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Attribute values coalesced from one evaluation batch
    Data { attributes: Map<String, Value> },

    /// Alert raised by a pipeline stage
    Alert {
        urn: String,
        severity: AlertSeverity,
        fields: Map<String, Value>,
    },
}

/// Delivery priority; higher values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Lowest,
    Low,
    Medium,
    High,
    Highest,
}

/// Reliability class; only guaranteed messages go through the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    BestEffort,
    GuaranteedDelivery,
}

/// Severity attached to alert messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Normal,
    Significant,
    Critical,
}

/// Default retry budget for retryable transport failures.
pub const DEFAULT_RETRIES: u32 = 3;

impl Message {
    /// Create a data message for a set of attribute values.
    pub fn data(endpoint_id: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint_id: endpoint_id.into(),
            event_time: Utc::now(),
            destination: String::new(),
            priority: MessagePriority::Medium,
            reliability: Reliability::GuaranteedDelivery,
            remaining_retries: DEFAULT_RETRIES,
            sender: String::new(),
            payload: MessagePayload::Data { attributes },
        }
    }

    /// Create an alert message.
    pub fn alert(
        endpoint_id: impl Into<String>,
        urn: impl Into<String>,
        severity: AlertSeverity,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint_id: endpoint_id.into(),
            event_time: Utc::now(),
            destination: String::new(),
            priority: MessagePriority::High,
            reliability: Reliability::GuaranteedDelivery,
            remaining_retries: DEFAULT_RETRIES,
            sender: String::new(),
            payload: MessagePayload::Alert {
                urn: urn.into(),
                severity,
                fields,
            },
        }
    }

    /// Set the destination
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the reliability class
    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    /// Set the event time
    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }

    /// Set the logical sender
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.remaining_retries = retries;
        self
    }

    /// Whether the message must survive a process restart.
    pub fn is_guaranteed(&self) -> bool {
        self.reliability == Reliability::GuaranteedDelivery
    }
}
