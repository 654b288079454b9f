//! Device pipeline - orchestrates the flow from attribute update to
//! delivered message
//!
//! An attribute update runs through its policy pipeline immediately;
//! stateless stages execute inline, windowed stages park the sample with
//! the window scheduler and finish later on a monitor tick. Values that
//! complete within one evaluation batch coalesce into a single outgoing
//! data message, which is staged with the delivery queue before any send is
//! attempted.

use crate::delivery::{DeliveryConfig, DeliveryError, DeliveryQueue};
use crate::message::Message;
use crate::monitor::{Monitor, Registration};
use crate::policy::executor::{self, ActionRequest, AlertEvent, StageOutcome};
use crate::policy::{DevicePolicy, ParseMode, PipelineFunction, PolicyError, PolicyRegistry};
use crate::store::{MessageStore, Namespace};
use crate::time::{Clock, Timestamp};
use crate::transport::{CredentialSource, Transport};
use crate::window::{WindowFire, WindowScheduler};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Endpoint (device) identity stamped on outgoing messages
    pub endpoint_id: String,

    /// Device model this session evaluates policies for
    pub device_model_urn: String,

    /// Policy document parse mode
    pub parse_mode: ParseMode,

    /// Delivery queue tuning
    pub delivery: DeliveryConfig,
}

impl PipelineConfig {
    pub fn new(endpoint_id: impl Into<String>, device_model_urn: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            device_model_urn: device_model_urn.into(),
            parse_mode: ParseMode::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

/// Decision returned to the caller for one attribute update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// Value passed the pipeline and was queued for delivery
    Emitted,
    /// An event filter suppressed the update (not an error)
    Suppressed,
    /// A windowed stage holds the sample; the result arrives on a later
    /// tick through the window-fire path
    Deferred,
}

/// Observer for window-fire batches.
pub type WindowFireFn = Box<dyn Fn(&[WindowFire]) + Send + Sync>;

/// Observer for device actions requested by `action` stages.
pub type ActionFn = Box<dyn Fn(&ActionRequest) + Send + Sync>;

/// The device-side pipeline for one endpoint session.
pub struct DevicePipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    registry: PolicyRegistry,
    windows: WindowScheduler,
    delivery: Arc<DeliveryQueue>,
    /// Raw last value per attribute, for noChange / prior-value semantics
    last_values: Mutex<HashMap<String, Value>>,
    window_fire_hook: Mutex<Option<WindowFireFn>>,
    action_hook: Mutex<Option<ActionFn>>,
    registrations: Mutex<Vec<Registration>>,
}

impl DevicePipeline {
    pub fn new(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        credentials: Option<Arc<dyn CredentialSource>>,
    ) -> Arc<Self> {
        let delivery = DeliveryQueue::new(store, transport, credentials, config.delivery.clone());
        let registry = PolicyRegistry::new(config.parse_mode);

        Arc::new(Self {
            config,
            clock,
            registry,
            windows: WindowScheduler::new(),
            delivery,
            last_values: Mutex::new(HashMap::new()),
            window_fire_hook: Mutex::new(None),
            action_hook: Mutex::new(None),
            registrations: Mutex::new(Vec::new()),
        })
    }

    /// Register the delivery and window tick callbacks with the session
    /// monitor. Call once after construction.
    pub fn attach(self: &Arc<Self>, monitor: &Monitor) {
        let mut registrations = self.registrations.lock();
        registrations.push(self.delivery.attach(monitor));

        let pipeline = self.clone();
        registrations.push(monitor.register("window-scheduler", move |now| {
            pipeline.window_tick(now);
            Ok(())
        }));
        info!(endpoint_id = self.config.endpoint_id.as_str(), "Device pipeline attached");
    }

    /// Policy registry for this session; the policy source feeds documents
    /// through it.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Install a policy document for this session's device model. The
    /// replacement is wholesale: window slots accumulated under the
    /// previous policy are cancelled without firing.
    pub fn apply_policy_document(&self, json: &str) -> Result<Arc<DevicePolicy>, PolicyError> {
        let policy = self
            .registry
            .apply_document(&self.config.device_model_urn, json)?;
        self.windows.clear();
        Ok(policy)
    }

    /// Delivery queue, exposed for replay and direct queuing.
    pub fn delivery(&self) -> &Arc<DeliveryQueue> {
        &self.delivery
    }

    /// Set the window-fire observer.
    pub fn on_window_fire(&self, callback: impl Fn(&[WindowFire]) + Send + Sync + 'static) {
        *self.window_fire_hook.lock() = Some(Box::new(callback));
    }

    /// Set the device-action observer.
    pub fn on_action(&self, callback: impl Fn(&ActionRequest) + Send + Sync + 'static) {
        *self.action_hook.lock() = Some(Box::new(callback));
    }

    /// Apply the active policy to one attribute update.
    pub async fn apply_policy(
        &self,
        attribute: &str,
        value: Value,
    ) -> Result<Emission, DeliveryError> {
        let mut outcomes = self
            .apply_updates(vec![(attribute.to_string(), value)])
            .await?;
        Ok(outcomes.pop().expect("one outcome per update"))
    }

    /// Apply the active policy to a batch of attribute updates, in order.
    /// Every value that completes in this batch is coalesced into a single
    /// outgoing data message.
    pub async fn apply_updates(
        &self,
        updates: Vec<(String, Value)>,
    ) -> Result<Vec<Emission>, DeliveryError> {
        let now = self.clock.now();
        let policy = self.registry.get(&self.config.device_model_urn);
        let policy = policy.as_deref().filter(|p| p.enabled);

        let mut outcomes = Vec::with_capacity(updates.len());
        let mut emitted = Map::new();
        let mut alerts = Vec::new();
        let mut actions = Vec::new();

        for (attribute, value) in updates {
            let pipeline: &[PipelineFunction] =
                policy.map(|p| p.pipeline(&attribute)).unwrap_or(&[]);
            let prior = self.last_values.lock().get(&attribute).cloned();

            let run = executor::apply(pipeline, &attribute, &value, prior.as_ref(), now);

            // The prior value tracks raw updates, independent of what the
            // pipeline made of them.
            self.last_values.lock().insert(attribute.clone(), value);

            alerts.extend(run.alerts);
            actions.extend(run.actions);

            match run.outcome {
                StageOutcome::Emit(result) => {
                    emitted.insert(attribute, result);
                    outcomes.push(Emission::Emitted);
                }
                StageOutcome::Suppressed => {
                    debug!(attribute = attribute.as_str(), "Update suppressed by policy");
                    outcomes.push(Emission::Suppressed);
                }
                StageOutcome::Deferred(request) => {
                    self.windows.submit(request, now);
                    outcomes.push(Emission::Deferred);
                }
            }
        }

        self.emit_side_effects(alerts, actions).await?;

        if !emitted.is_empty() {
            let message = Message::data(&self.config.endpoint_id, emitted)
                .with_sender("attribute-pipeline");
            self.delivery.queue(message).await?;
        }

        Ok(outcomes)
    }

    /// Queue a caller-built message directly.
    pub async fn queue_for_delivery(&self, message: Message) -> Result<(), DeliveryError> {
        self.delivery.queue(message).await.map(|_| ())
    }

    /// Close the session: detach from the monitor and drop all pending
    /// window slots without firing them.
    pub fn close(&self) {
        self.registrations.lock().clear();
        self.windows.clear();
        info!(endpoint_id = self.config.endpoint_id.as_str(), "Device pipeline closed");
    }

    /// Monitor tick: fire due windows and resume their pipelines past the
    /// windowed stage. All values completing in one tick coalesce into a
    /// single policy-batch message.
    fn window_tick(self: &Arc<Self>, now: Timestamp) {
        let fires = self.windows.poll(now);
        if fires.is_empty() {
            return;
        }

        if let Some(hook) = self.window_fire_hook.lock().as_ref() {
            hook(&fires);
        }

        let policy = self.registry.get(&self.config.device_model_urn);
        let policy = policy.as_deref().filter(|p| p.enabled);

        let mut emitted = Map::new();
        let mut alerts = Vec::new();
        let mut actions = Vec::new();

        for fire in fires {
            let pipeline: &[PipelineFunction] =
                policy.map(|p| p.pipeline(&fire.attribute)).unwrap_or(&[]);
            let prior = self.last_values.lock().get(&fire.attribute).cloned();

            let run = executor::apply_from(
                pipeline,
                &fire.attribute,
                &fire.value,
                prior.as_ref(),
                now,
                fire.resume_from,
            );

            alerts.extend(run.alerts);
            actions.extend(run.actions);

            match run.outcome {
                StageOutcome::Emit(result) => {
                    emitted.insert(fire.attribute, result);
                }
                StageOutcome::Suppressed => {}
                // A second windowed stage downstream of the first
                StageOutcome::Deferred(request) => self.windows.submit(request, now),
            }
        }

        for action in actions {
            if let Some(hook) = self.action_hook.lock().as_ref() {
                hook(&action);
            }
        }
        for alert in alerts {
            self.queue_deferred(
                Namespace::Messages,
                self.alert_message(alert).with_sender("windowed-pipeline"),
            );
        }

        if !emitted.is_empty() {
            let message = Message::data(&self.config.endpoint_id, emitted)
                .with_sender("windowed-pipeline");
            self.queue_deferred(Namespace::PolicyBatches, message);
        }
    }

    /// Deliver alert/action side effects from the synchronous apply path.
    async fn emit_side_effects(
        &self,
        alerts: Vec<AlertEvent>,
        actions: Vec<ActionRequest>,
    ) -> Result<(), DeliveryError> {
        for action in actions {
            if let Some(hook) = self.action_hook.lock().as_ref() {
                hook(&action);
            }
        }
        for alert in alerts {
            self.delivery
                .queue(self.alert_message(alert).with_sender("attribute-pipeline"))
                .await?;
        }
        Ok(())
    }

    fn alert_message(&self, alert: AlertEvent) -> Message {
        Message::alert(&self.config.endpoint_id, alert.urn, alert.severity, alert.fields)
    }

    /// Queue from a tick callback: the async save/stage runs on a spawned
    /// task so the tick never blocks on store I/O.
    fn queue_deferred(self: &Arc<Self>, ns: Namespace, message: Message) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.delivery.queue_in(ns, message).await {
                tracing::warn!(error = %e, "Deferred queue failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use crate::time::ManualClock;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    struct NullStore;

    #[async_trait]
    impl MessageStore for NullStore {
        async fn save(&self, _ns: Namespace, _batch: &[Message]) -> Result<(), StoreError> {
            Ok(())
        }
        async fn load_all(&self, _ns: Namespace, _endpoint: &str) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _ns: Namespace, _ids: &[Uuid]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Transport for CapturingTransport {
        async fn send(&self, message: &Message) -> Result<(), TransportError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    fn pipeline_with_clock(
        clock: Arc<ManualClock>,
    ) -> (Arc<DevicePipeline>, Arc<CapturingTransport>) {
        let transport = Arc::new(CapturingTransport::default());
        let pipeline = DevicePipeline::new(
            PipelineConfig::new("device-1", "urn:nimbus:model:thermostat"),
            clock,
            Arc::new(NullStore),
            transport.clone(),
            None,
        );
        (pipeline, transport)
    }

    #[tokio::test]
    async fn no_policy_passes_value_through() {
        let (pipeline, _) = pipeline_with_clock(Arc::new(ManualClock::new(0)));
        let emission = pipeline.apply_policy("temperature", json!(23)).await.unwrap();
        assert_eq!(emission, Emission::Emitted);
        assert_eq!(pipeline.delivery().staged_len(), 1);
    }

    #[tokio::test]
    async fn no_change_filter_suppresses_repeat() {
        let (pipeline, _) = pipeline_with_clock(Arc::new(ManualClock::new(0)));
        pipeline
            .registry()
            .apply_document(
                "urn:nimbus:model:thermostat",
                r#"{"id": "p", "pipelines": [{
                    "attributeName": "temperature",
                    "pipeline": [{"id": "eventFilter", "parameters": {"condition": "noChange"}}]
                }]}"#,
            )
            .unwrap();

        assert_eq!(
            pipeline.apply_policy("temperature", json!(23)).await.unwrap(),
            Emission::Emitted
        );
        assert_eq!(
            pipeline.apply_policy("temperature", json!(23)).await.unwrap(),
            Emission::Suppressed
        );
        assert_eq!(
            pipeline.apply_policy("temperature", json!(24)).await.unwrap(),
            Emission::Emitted
        );
    }

    #[tokio::test]
    async fn batch_updates_coalesce_into_one_message() {
        let (pipeline, transport) = pipeline_with_clock(Arc::new(ManualClock::new(0)));
        pipeline
            .apply_updates(vec![
                ("temperature".to_string(), json!(23)),
                ("humidity".to_string(), json!(40)),
            ])
            .await
            .unwrap();

        pipeline.delivery().flush().await;
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            crate::message::MessagePayload::Data { attributes } => {
                assert_eq!(attributes["temperature"], json!(23));
                assert_eq!(attributes["humidity"], json!(40));
            }
            _ => panic!("expected data payload"),
        }
    }

    #[tokio::test]
    async fn windowed_stage_defers_then_fires_mean() {
        let clock = Arc::new(ManualClock::new(0));
        let (pipeline, transport) = pipeline_with_clock(clock.clone());
        pipeline
            .registry()
            .apply_document(
                "urn:nimbus:model:thermostat",
                r#"{"id": "p", "pipelines": [{
                    "attributeName": "temperature",
                    "pipeline": [{"id": "mean", "parameters": {"window": 10000, "slide": 5000}}]
                }]}"#,
            )
            .unwrap();

        assert_eq!(
            pipeline.apply_policy("temperature", json!(30.0)).await.unwrap(),
            Emission::Deferred
        );
        assert_eq!(
            pipeline.apply_policy("temperature", json!(40.0)).await.unwrap(),
            Emission::Deferred
        );
        assert_eq!(pipeline.delivery().staged_len(), 0);

        // Before the slide deadline: nothing fires.
        clock.set(4_999);
        pipeline.window_tick(4_999);
        assert_eq!(pipeline.delivery().staged_len(), 0);

        // At the deadline the mean is emitted as one policy-batch message.
        clock.set(5_000);
        pipeline.window_tick(5_000);
        // queue_deferred runs on a spawned task
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        pipeline.delivery().flush().await;

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        match &sent[0].payload {
            crate::message::MessagePayload::Data { attributes } => {
                assert_eq!(attributes["temperature"], json!(35.0));
            }
            _ => panic!("expected data payload"),
        }
    }

    #[tokio::test]
    async fn alert_stage_queues_alert_message() {
        let (pipeline, transport) = pipeline_with_clock(Arc::new(ManualClock::new(0)));
        pipeline
            .registry()
            .apply_document(
                "urn:nimbus:model:thermostat",
                r#"{"id": "p", "pipelines": [{
                    "attributeName": "temperature",
                    "pipeline": [{"id": "alert", "parameters": {
                        "urn": "urn:nimbus:alert:overheat",
                        "severity": "critical",
                        "fields": {"temp": "$(value)"}
                    }}]
                }]}"#,
            )
            .unwrap();

        pipeline.apply_policy("temperature", json!(95)).await.unwrap();
        pipeline.delivery().flush().await;

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().any(|m| matches!(
            &m.payload,
            crate::message::MessagePayload::Alert { urn, .. } if urn == "urn:nimbus:alert:overheat"
        )));
    }

    #[tokio::test]
    async fn policy_replacement_cancels_pending_windows() {
        let clock = Arc::new(ManualClock::new(0));
        let (pipeline, _) = pipeline_with_clock(clock);
        pipeline
            .apply_policy_document(
                r#"{"id": "v1", "pipelines": [{
                    "attributeName": "temperature",
                    "pipeline": [{"id": "mean", "parameters": {"window": 5000}}]
                }]}"#,
            )
            .unwrap();

        pipeline.apply_policy("temperature", json!(30.0)).await.unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        pipeline.on_window_fire(move |_| {
            fired_clone.store(true, std::sync::atomic::Ordering::Relaxed);
        });

        // New document replaces the policy wholesale; the accumulated
        // sample never fires.
        pipeline
            .apply_policy_document(r#"{"id": "v2", "pipelines": []}"#)
            .unwrap();
        pipeline.window_tick(60_000);
        assert!(!fired.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(pipeline.delivery().staged_len(), 0);
    }

    #[tokio::test]
    async fn window_fire_hook_observes_batches() {
        let clock = Arc::new(ManualClock::new(0));
        let (pipeline, _) = pipeline_with_clock(clock.clone());
        pipeline
            .registry()
            .apply_document(
                "urn:nimbus:model:thermostat",
                r#"{"id": "p", "pipelines": [{
                    "attributeName": "temperature",
                    "pipeline": [{"id": "mean", "parameters": {"window": 2000}}]
                }]}"#,
            )
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        pipeline.on_window_fire(move |fires| {
            seen_clone.lock().extend(fires.iter().cloned());
        });

        pipeline.apply_policy("temperature", json!(10.0)).await.unwrap();
        pipeline.window_tick(2_000);

        let fires = seen.lock();
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].attribute, "temperature");
        assert_eq!(fires[0].value, json!(10.0));
    }
}
