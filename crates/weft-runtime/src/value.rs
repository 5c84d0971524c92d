//! Attribute values.
//!
//! Steps carry two maps of attributes: `params` (inputs, populated by the
//! evaluator before a handler runs) and `returns` (outputs, populated
//! from a reducer step or a handler result). Each attribute is a
//! `(name, value, type_hint)` triple; the runtime treats values
//! structurally and uses the hint only for surface diagnostics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named value with a free-form type label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub name: String,
    pub value: Value,
    pub type_hint: String,
}

impl AttributeValue {
    /// Create an attribute, inferring the type hint from the value.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        let type_hint = infer_type_hint(&value).to_string();
        Self {
            name: name.into(),
            value,
            type_hint,
        }
    }

    /// Create an attribute with an explicit type hint.
    pub fn with_hint(name: impl Into<String>, value: Value, type_hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            type_hint: type_hint.into(),
        }
    }
}

/// Infer a surface type label from a JSON value.
pub fn infer_type_hint(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "Boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Long",
        Value::Number(_) => "Double",
        Value::String(_) => "String",
        Value::Array(_) => "List",
        Value::Object(_) => "Map",
        Value::Null => "Any",
    }
}

/// The two attribute maps of a step.
///
/// Keys are attribute names; ordering is stable (sorted) so persisted
/// step records serialize deterministically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetAttributes {
    pub params: BTreeMap<String, AttributeValue>,
    pub returns: BTreeMap<String, AttributeValue>,
}

impl FacetAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an input attribute.
    pub fn set_param(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.params
            .insert(name.clone(), AttributeValue::new(name, value));
    }

    /// Set an output attribute.
    pub fn set_return(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.returns
            .insert(name.clone(), AttributeValue::new(name, value));
    }

    /// Get an input attribute's value.
    pub fn get_param(&self, name: &str) -> Option<&Value> {
        self.params.get(name).map(|a| &a.value)
    }

    /// Get an output attribute's value.
    pub fn get_return(&self, name: &str) -> Option<&Value> {
        self.returns.get(name).map(|a| &a.value)
    }

    /// Merge another attribute set into this one; the other side wins on
    /// name collisions.
    pub fn merge(&mut self, other: &FacetAttributes) {
        for (name, attr) in &other.params {
            self.params.insert(name.clone(), attr.clone());
        }
        for (name, attr) in &other.returns {
            self.returns.insert(name.clone(), attr.clone());
        }
    }

    /// Project the params to a plain JSON map (handler payload shape).
    pub fn params_json(&self) -> serde_json::Map<String, Value> {
        self.params
            .iter()
            .map(|(k, a)| (k.clone(), a.value.clone()))
            .collect()
    }

    /// Project the returns to a plain JSON map.
    pub fn returns_json(&self) -> serde_json::Map<String, Value> {
        self.returns
            .iter()
            .map(|(k, a)| (k.clone(), a.value.clone()))
            .collect()
    }

    /// Replace the returns from a plain JSON map (handler result shape).
    pub fn set_returns_json(&mut self, returns: &serde_json::Map<String, Value>) {
        for (name, value) in returns {
            self.set_return(name.clone(), value.clone());
        }
    }
}
