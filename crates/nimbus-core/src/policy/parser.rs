//! JSON policy document parser
//!
//! Policy documents arrive from the server per device-model URN. Parsing
//! happens once; the resulting [`DevicePolicy`] is immutable and replaced
//! wholesale when the server pushes a change.

use super::function::{FunctionKind, PipelineFunction};
use super::DevicePolicy;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Attribute name that matches any attribute without its own pipeline.
pub const WILDCARD_ATTRIBUTE: &str = "*";

/// Policy parsing errors. Parse failures are reported, never retried; the
/// affected device model keeps its previous policy (or none).
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("malformed policy document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("pipeline entry {index} is missing an attribute name")]
    MissingAttribute { index: usize },

    #[error("duplicate pipeline for attribute {0:?}")]
    DuplicateAttribute(String),

    #[error("unknown function id {0:?}")]
    UnknownFunction(String),
}

/// How to treat function ids this build does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Reject the document
    Strict,
    /// Keep the stage as an opaque pass-through
    #[default]
    Lenient,
}

/// Wire format of a policy document.
#[derive(Debug, Deserialize)]
struct PolicyDocument {
    id: String,

    #[serde(default)]
    description: Option<String>,

    #[serde(default = "default_enabled")]
    enabled: bool,

    #[serde(default, rename = "lastModified")]
    last_modified: Option<i64>,

    #[serde(default)]
    pipelines: Vec<PipelineEntry>,
}

fn default_enabled() -> bool {
    true
}

/// Wire format of one per-attribute pipeline.
#[derive(Debug, Deserialize)]
struct PipelineEntry {
    #[serde(default, rename = "attributeName")]
    attribute_name: Option<String>,

    #[serde(default)]
    pipeline: Vec<FunctionEntry>,
}

/// Wire format of one pipeline function.
#[derive(Debug, Deserialize)]
struct FunctionEntry {
    id: String,

    #[serde(default)]
    parameters: Map<String, Value>,
}

/// Parse a policy document for a device model.
pub fn parse(
    device_model_urn: &str,
    json: &str,
    mode: ParseMode,
) -> Result<DevicePolicy, PolicyError> {
    let doc: PolicyDocument = serde_json::from_str(json)?;

    let mut pipelines: HashMap<String, Vec<PipelineFunction>> = HashMap::new();

    for (index, entry) in doc.pipelines.into_iter().enumerate() {
        let attribute = entry
            .attribute_name
            .filter(|name| !name.is_empty())
            .ok_or(PolicyError::MissingAttribute { index })?;

        if pipelines.contains_key(&attribute) {
            return Err(PolicyError::DuplicateAttribute(attribute));
        }

        let mut stages = Vec::with_capacity(entry.pipeline.len());
        for function in entry.pipeline {
            let kind = match FunctionKind::from_id(&function.id) {
                Some(kind) => kind,
                None if mode == ParseMode::Strict => {
                    return Err(PolicyError::UnknownFunction(function.id));
                }
                None => FunctionKind::Opaque(function.id),
            };
            stages.push(PipelineFunction {
                kind,
                parameters: function.parameters,
            });
        }

        pipelines.insert(attribute, stages);
    }

    Ok(DevicePolicy {
        id: doc.id,
        device_model_urn: device_model_urn.to_string(),
        description: doc.description.unwrap_or_default(),
        enabled: doc.enabled,
        last_modified: doc.last_modified.unwrap_or(0),
        pipelines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const URN: &str = "urn:nimbus:model:thermostat";

    #[test]
    fn parses_attribute_and_wildcard_pipelines() {
        let json = r#"{
            "id": "policy-1",
            "description": "thermostat rules",
            "lastModified": 1700000000000,
            "pipelines": [
                {
                    "attributeName": "temperature",
                    "pipeline": [
                        {"id": "eventFilter", "parameters": {"condition": "noChange"}},
                        {"id": "computedMetric", "parameters": {"formula": "value * 2"}}
                    ]
                },
                {
                    "attributeName": "*",
                    "pipeline": [
                        {"id": "eventFilter", "parameters": {"condition": "noChange"}}
                    ]
                }
            ]
        }"#;

        let policy = parse(URN, json, ParseMode::Strict).unwrap();
        assert_eq!(policy.id, "policy-1");
        assert_eq!(policy.device_model_urn, URN);
        assert!(policy.enabled);

        let stages = policy.pipeline("temperature");
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].kind, FunctionKind::EventFilter);
        assert_eq!(stages[1].kind, FunctionKind::ComputedMetric);

        // Attribute without its own pipeline falls back to the wildcard.
        let fallback = policy.pipeline("humidity");
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].kind, FunctionKind::EventFilter);
    }

    #[test]
    fn absent_pipeline_is_empty_not_error() {
        let policy = parse(URN, r#"{"id": "p", "pipelines": []}"#, ParseMode::Strict).unwrap();
        assert!(policy.pipeline("anything").is_empty());
    }

    #[test]
    fn missing_attribute_name_fails() {
        let json = r#"{"id": "p", "pipelines": [{"pipeline": []}]}"#;
        let err = parse(URN, json, ParseMode::Lenient).unwrap_err();
        assert!(matches!(err, PolicyError::MissingAttribute { index: 0 }));
    }

    #[test]
    fn duplicate_attribute_fails() {
        let json = r#"{"id": "p", "pipelines": [
            {"attributeName": "temperature", "pipeline": []},
            {"attributeName": "temperature", "pipeline": []}
        ]}"#;
        let err = parse(URN, json, ParseMode::Lenient).unwrap_err();
        assert!(matches!(err, PolicyError::DuplicateAttribute(_)));
    }

    #[test]
    fn unknown_function_strict_vs_lenient() {
        let json = r#"{"id": "p", "pipelines": [
            {"attributeName": "temperature", "pipeline": [{"id": "futureFn"}]}
        ]}"#;

        let err = parse(URN, json, ParseMode::Strict).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownFunction(_)));

        let policy = parse(URN, json, ParseMode::Lenient).unwrap();
        let stages = policy.pipeline("temperature");
        assert_eq!(stages[0].kind, FunctionKind::Opaque("futureFn".into()));
    }

    #[test]
    fn malformed_json_fails() {
        assert!(matches!(
            parse(URN, "not json", ParseMode::Lenient),
            Err(PolicyError::Malformed(_))
        ));
    }
}
