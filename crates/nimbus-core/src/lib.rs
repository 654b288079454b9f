//! Nimbus Core - the device-side data pipeline of the Nimbus IoT SDK
//!
//! This crate turns raw attribute updates on a modeled device into reliably
//! delivered cloud messages:
//!
//! - **Policy**: server-configured per-attribute function pipelines,
//!   parsed once and replaced wholesale
//! - **Pipeline**: ordered stage evaluation with filtering, computed
//!   metrics, alerts, and windowed aggregation
//! - **Window**: sliding-deadline re-evaluation of windowed stages
//! - **Delivery**: a durable, deduplicated outbox drained over a pluggable
//!   transport with retry-on-auth-failure semantics
//! - **Monitor**: one shared cooperative tick driving all periodic work
//!
//! Store and transport are boundary traits; implementations live in
//! `nimbus-store` and the embedding application.

pub mod delivery;
pub mod message;
pub mod monitor;
pub mod pipeline;
pub mod policy;
pub mod store;
pub mod time;
pub mod transport;
pub mod window;

// Re-export commonly used types
pub use delivery::{DeliveryConfig, DeliveryError, DeliveryQueue};
pub use message::{AlertSeverity, Message, MessagePayload, MessagePriority, Reliability};
pub use monitor::{Monitor, Registration};
pub use pipeline::{DevicePipeline, Emission, PipelineConfig};
pub use policy::{DevicePolicy, FunctionKind, ParseMode, PipelineFunction, PolicyError, PolicyRegistry};
pub use store::{MessageStore, Namespace, StoreError};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
pub use transport::{CredentialSource, Transport, TransportError};
pub use window::{WindowFire, WindowKey, WindowScheduler};

/// SDK version
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
