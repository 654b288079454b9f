//! Per-device-model policy registry
//!
//! Policies are swapped wholesale: a new document replaces the previous
//! [`DevicePolicy`] atomically, and a document that fails to parse leaves
//! the previous policy in force.

use super::parser::{self, ParseMode, PolicyError};
use super::DevicePolicy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of active policies, keyed by device-model URN.
pub struct PolicyRegistry {
    mode: ParseMode,
    policies: RwLock<HashMap<String, Arc<DevicePolicy>>>,
}

impl PolicyRegistry {
    pub fn new(mode: ParseMode) -> Self {
        Self {
            mode,
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Parse and install a policy document, replacing any previous policy
    /// for the same URN. On parse failure the previous policy is kept and
    /// the error returned to the caller.
    pub fn apply_document(
        &self,
        device_model_urn: &str,
        json: &str,
    ) -> Result<Arc<DevicePolicy>, PolicyError> {
        match parser::parse(device_model_urn, json, self.mode) {
            Ok(policy) => {
                let policy = Arc::new(policy);
                info!(
                    urn = device_model_urn,
                    policy_id = policy.id.as_str(),
                    pipelines = policy.pipelines.len(),
                    "Policy installed"
                );
                self.policies
                    .write()
                    .insert(device_model_urn.to_string(), policy.clone());
                Ok(policy)
            }
            Err(e) => {
                warn!(
                    urn = device_model_urn,
                    error = %e,
                    "Policy document rejected, keeping previous policy"
                );
                Err(e)
            }
        }
    }

    /// Remove the policy for a device model (device de-registration).
    pub fn remove(&self, device_model_urn: &str) -> bool {
        self.policies.write().remove(device_model_urn).is_some()
    }

    /// Active policy for a device model, if any. Absence means "no policy:
    /// pass values through unchanged".
    pub fn get(&self, device_model_urn: &str) -> Option<Arc<DevicePolicy>> {
        self.policies.read().get(device_model_urn).cloned()
    }

    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(ParseMode::default())
    }
}
