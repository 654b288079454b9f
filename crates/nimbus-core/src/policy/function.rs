//! Pipeline function model
//!
//! A pipeline is an ordered list of functions applied to one attribute's
//! updates. Function ids form a closed set; ids unknown to this build are
//! retained as opaque pass-through stages when parsing leniently, so newer
//! server policies keep working on older devices.

use serde_json::{Map, Value};

/// Known pipeline function kinds, plus an opaque escape hatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    /// Suppress propagation when a condition matches
    EventFilter,
    /// Transform the value with an arithmetic formula
    ComputedMetric,
    /// Raise an alert message as a side effect
    Alert,
    /// Request a named device action as a side effect
    Action,
    /// Windowed arithmetic mean
    Mean,
    /// Windowed min/max/mean/count summary
    Stats,
    /// Windowed representative sample
    Sampling,
    /// Unknown id retained in lenient mode; passes values through
    Opaque(String),
}

impl FunctionKind {
    /// Resolve a wire-format function id. Returns `None` for unknown ids;
    /// the parser decides whether that is an error (strict) or an
    /// [`FunctionKind::Opaque`] stage (lenient).
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "eventFilter" => Some(Self::EventFilter),
            "computedMetric" => Some(Self::ComputedMetric),
            "alert" => Some(Self::Alert),
            "action" => Some(Self::Action),
            "mean" => Some(Self::Mean),
            "stats" => Some(Self::Stats),
            "sampling" => Some(Self::Sampling),
            _ => None,
        }
    }

    /// Wire-format id.
    pub fn as_str(&self) -> &str {
        match self {
            Self::EventFilter => "eventFilter",
            Self::ComputedMetric => "computedMetric",
            Self::Alert => "alert",
            Self::Action => "action",
            Self::Mean => "mean",
            Self::Stats => "stats",
            Self::Sampling => "sampling",
            Self::Opaque(id) => id,
        }
    }

    /// Whether this stage accumulates samples over a time window instead of
    /// emitting synchronously.
    pub fn is_windowed(&self) -> bool {
        matches!(self, Self::Mean | Self::Stats | Self::Sampling)
    }
}

/// One stage of a pipeline: a function id plus its parameters.
#[derive(Debug, Clone)]
pub struct PipelineFunction {
    pub kind: FunctionKind,
    pub parameters: Map<String, Value>,
}

impl PipelineFunction {
    pub fn new(kind: FunctionKind) -> Self {
        Self {
            kind,
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// String parameter, if present and a string.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Numeric parameter, if present and numeric.
    pub fn f64_param(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(Value::as_f64)
    }

    /// Duration parameter in milliseconds.
    pub fn duration_ms_param(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }

    /// Object parameter, if present and an object.
    pub fn object_param(&self, key: &str) -> Option<&Map<String, Value>> {
        self.parameters.get(key).and_then(Value::as_object)
    }
}
