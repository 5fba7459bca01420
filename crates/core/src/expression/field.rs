// Orchestration field placeholders and their processors

use crate::error::{EngineError, EngineResult};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Marker key identifying an orchestration field placeholder object
pub const ORCHESTRATION_FIELD_TYPE_KEY: &str = "__orchestrationFieldType";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStatus {
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct ProcessorResult {
    pub status: ProcessorStatus,
    pub value: Value,
    pub message: Option<String>,
}

impl ProcessorResult {
    pub fn success(value: Value) -> Self {
        Self {
            status: ProcessorStatus::Success,
            value,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ProcessorStatus::Error,
            value: Value::Null,
            message: Some(message.into()),
        }
    }
}

/// Replaces one kind of placeholder with its final value
pub trait OrchestrationFieldProcessor: Send + Sync {
    fn field_type(&self) -> &str;

    fn process(&self, field: &Map<String, Value>) -> ProcessorResult;
}

/// `parameterField`: `{"value": ..., "inputSetValidator": {...}}`, where the validator
/// type is `allowedValues` or `regex`
pub struct ParameterFieldProcessor;

impl ParameterFieldProcessor {
    fn validate(value: &Value, validator: &Map<String, Value>) -> Result<(), String> {
        let validator_type = validator
            .get("validatorType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let parameters = validator
            .get("parameters")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => return Ok(()),
            other => other.to_string(),
        };

        match validator_type {
            "allowedValues" => {
                let allowed: Vec<&str> = parameters.split(',').map(str::trim).collect();
                if allowed.contains(&text.as_str()) {
                    Ok(())
                } else {
                    Err(format!(
                        "value '{}' is not one of the allowed values [{}]",
                        text, parameters
                    ))
                }
            }
            "regex" => {
                let pattern = Regex::new(parameters)
                    .map_err(|e| format!("invalid validator pattern '{}': {}", parameters, e))?;
                if pattern.is_match(&text) {
                    Ok(())
                } else {
                    Err(format!(
                        "value '{}' does not match pattern '{}'",
                        text, parameters
                    ))
                }
            }
            "" => Ok(()),
            other => Err(format!("unknown input validator '{}'", other)),
        }
    }
}

impl OrchestrationFieldProcessor for ParameterFieldProcessor {
    fn field_type(&self) -> &str {
        "parameterField"
    }

    fn process(&self, field: &Map<String, Value>) -> ProcessorResult {
        let value = field.get("value").cloned().unwrap_or(Value::Null);
        if let Some(validator) = field.get("inputSetValidator").and_then(Value::as_object) {
            if let Err(message) = Self::validate(&value, validator) {
                return ProcessorResult::error(message);
            }
        }
        ProcessorResult::success(value)
    }
}

/// Processors keyed by placeholder type
#[derive(Default)]
pub struct FieldProcessorRegistry {
    processors: HashMap<String, Arc<dyn OrchestrationFieldProcessor>>,
}

impl FieldProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ParameterFieldProcessor));
        registry
    }

    pub fn register(&mut self, processor: Arc<dyn OrchestrationFieldProcessor>) {
        self.processors
            .insert(processor.field_type().to_string(), processor);
    }

    /// Replace every placeholder in `value`, depth first. Fails on the first
    /// error, leaving the input untouched.
    pub fn resolve_fields(&self, value: &Value) -> EngineResult<Value> {
        match value {
            Value::Object(map) => {
                if let Some(field_type) = map.get(ORCHESTRATION_FIELD_TYPE_KEY) {
                    let field_type = field_type.as_str().unwrap_or_default();
                    let processor = self.processors.get(field_type).ok_or_else(|| {
                        EngineError::CriticalExpressionEvaluation(format!(
                            "no processor for orchestration field type '{}'",
                            field_type
                        ))
                    })?;
                    let result = processor.process(map);
                    if result.status == ProcessorStatus::Error {
                        return Err(EngineError::CriticalExpressionEvaluation(
                            result
                                .message
                                .unwrap_or_else(|| format!("{} failed", field_type)),
                        ));
                    }
                    return self.resolve_fields(&result.value);
                }

                let mut resolved = Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(key.clone(), self.resolve_fields(item)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_fields(item))
                    .collect::<EngineResult<Vec<_>>>()?,
            )),
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parameter_field_replaced() {
        let registry = FieldProcessorRegistry::with_defaults();
        let input = json!({
            "timeout": {"__orchestrationFieldType": "parameterField", "value": "10m"},
            "list": [{"__orchestrationFieldType": "parameterField", "value": 3}],
            "plain": "x"
        });
        let resolved = registry.resolve_fields(&input).unwrap();
        assert_eq!(resolved, json!({"timeout": "10m", "list": [3], "plain": "x"}));
    }

    #[test]
    fn test_allowed_values_validator() {
        let registry = FieldProcessorRegistry::with_defaults();
        let field = |value: &str| {
            json!({
                "env": {
                    "__orchestrationFieldType": "parameterField",
                    "value": value,
                    "inputSetValidator": {"validatorType": "allowedValues", "parameters": "dev, qa, prod"}
                }
            })
        };
        assert_eq!(
            registry.resolve_fields(&field("qa")).unwrap(),
            json!({"env": "qa"})
        );
        assert!(matches!(
            registry.resolve_fields(&field("staging")),
            Err(EngineError::CriticalExpressionEvaluation(_))
        ));
    }

    #[test]
    fn test_regex_validator() {
        let registry = FieldProcessorRegistry::with_defaults();
        let field = json!({
            "__orchestrationFieldType": "parameterField",
            "value": "release-7",
            "inputSetValidator": {"validatorType": "regex", "parameters": "^release-\\d+$"}
        });
        assert_eq!(registry.resolve_fields(&field).unwrap(), json!("release-7"));
    }

    #[test]
    fn test_unknown_field_type() {
        let registry = FieldProcessorRegistry::with_defaults();
        let field = json!({"__orchestrationFieldType": "secretRef", "value": "x"});
        assert!(matches!(
            registry.resolve_fields(&field),
            Err(EngineError::CriticalExpressionEvaluation(_))
        ));
    }
}
