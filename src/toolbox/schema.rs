//! Typed argument schema shared by every `ToolDescriptor` (§4.2).
//!
//! The shape mirrors a function-calling JSON Schema closely enough to derive one
//! mechanically, but the descriptor — not the schema — is the authoritative source of
//! truth, per the redesign note in §9: validation lives here, not behind decorators.

use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Number,
    Integer,
    Boolean,
    List,
}

/// One typed, validated, optionally-bounded field of a tool's argument schema.
#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    pub name: String,
    pub arg_type: ArgumentType,
    pub description: String,
    pub required: bool,
    pub default: Option<ArgumentValue>,
    /// Inclusive numeric bounds, only meaningful for `Number`/`Integer`.
    pub bounds: Option<(f64, f64)>,
}

impl ArgumentSpec {
    pub fn new(name: impl Into<String>, arg_type: ArgumentType) -> Self {
        Self {
            name: name.into(),
            arg_type,
            description: String::new(),
            required: false,
            default: None,
            bounds: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: ArgumentValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.bounds = Some((min, max));
        self
    }
}

/// A validated argument value. Type coercion is intentionally bounded: strings stay
/// strings, numbers are parsed from strings, and lists are split from comma-separated
/// strings — never arbitrary structural reinterpretation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    String(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
    List(Vec<String>),
}

impl ArgumentValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgumentValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgumentValue::Number(n) => Some(*n),
            ArgumentValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ArgumentValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// A fully validated argument record, keyed by parameter name.
pub type ValidatedArgs = HashMap<String, ArgumentValue>;

/// Coerce a raw JSON value read from the LLM's function-call arguments into the type the
/// spec declares, bounded as described in §4.2.
pub fn coerce(raw: &serde_json::Value, arg_type: ArgumentType) -> Option<ArgumentValue> {
    match (arg_type, raw) {
        (ArgumentType::String, serde_json::Value::String(s)) => Some(ArgumentValue::String(s.clone())),
        (ArgumentType::Boolean, serde_json::Value::Bool(b)) => Some(ArgumentValue::Boolean(*b)),
        (ArgumentType::Number, serde_json::Value::Number(n)) => n.as_f64().map(ArgumentValue::Number),
        (ArgumentType::Number, serde_json::Value::String(s)) => s.parse::<f64>().ok().map(ArgumentValue::Number),
        (ArgumentType::Integer, serde_json::Value::Number(n)) => n.as_i64().map(ArgumentValue::Integer),
        (ArgumentType::Integer, serde_json::Value::String(s)) => s.parse::<i64>().ok().map(ArgumentValue::Integer),
        (ArgumentType::List, serde_json::Value::Array(items)) => Some(ArgumentValue::List(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )),
        (ArgumentType::List, serde_json::Value::String(s)) => Some(ArgumentValue::List(
            s.split(',').map(|part| part.trim().to_string()).filter(|p| !p.is_empty()).collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_comma_separated_string_into_list() {
        let raw = serde_json::json!("a, b,c");
        let v = coerce(&raw, ArgumentType::List).unwrap();
        assert_eq!(v.as_list().unwrap(), &["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn coerces_numeric_string_into_number() {
        let raw = serde_json::json!("3.14");
        let v = coerce(&raw, ArgumentType::Number).unwrap();
        assert_eq!(v.as_f64(), Some(3.14));
    }

    #[test]
    fn rejects_type_mismatch() {
        let raw = serde_json::json!({"nested": true});
        assert!(coerce(&raw, ArgumentType::String).is_none());
    }

    #[test]
    fn argument_spec_builder_applies_bounds_and_default() {
        let spec = ArgumentSpec::new("port", ArgumentType::Integer)
            .with_description("target port")
            .required()
            .with_bounds(1.0, 65535.0)
            .with_default(ArgumentValue::Integer(443));
        assert!(spec.required);
        assert_eq!(spec.bounds, Some((1.0, 65535.0)));
        assert_eq!(spec.default, Some(ArgumentValue::Integer(443)));
    }
}
