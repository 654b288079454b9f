//! Device policy model and evaluation
//!
//! A policy is a parsed-once, immutable description of the function
//! pipelines a server has attached to a device model. The module is split
//! into:
//! - `function` - the closed set of pipeline function kinds
//! - `parser` - JSON document parsing (strict / lenient)
//! - `registry` - wholesale per-URN policy replacement
//! - `executor` - ordered stage evaluation against incoming values

pub mod executor;
pub mod function;
pub mod parser;
pub mod registry;

pub use executor::{ActionRequest, AlertEvent, PipelineRun, StageOutcome};
pub use function::{FunctionKind, PipelineFunction};
pub use parser::{parse, ParseMode, PolicyError, WILDCARD_ATTRIBUTE};
pub use registry::PolicyRegistry;

use std::collections::HashMap;

/// An installed device policy. Immutable after parsing; replaced wholesale
/// when the server pushes a new document.
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    pub id: String,
    pub device_model_urn: String,
    pub description: String,
    pub enabled: bool,
    /// Server-side modification time (epoch milliseconds)
    pub last_modified: i64,
    /// At most one pipeline per attribute, plus an optional wildcard under
    /// [`WILDCARD_ATTRIBUTE`]
    pub pipelines: HashMap<String, Vec<PipelineFunction>>,
}

impl DevicePolicy {
    /// The pipeline for an attribute: the attribute's own, else the
    /// wildcard, else empty. Absence is not an error.
    pub fn pipeline(&self, attribute: &str) -> &[PipelineFunction] {
        self.pipelines
            .get(attribute)
            .or_else(|| self.pipelines.get(WILDCARD_ATTRIBUTE))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
