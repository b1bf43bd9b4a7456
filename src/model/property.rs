//! Node properties: local configuration values that are not routed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Value;

/// A map of property names to values.
pub type PropertyMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[default]
    Str,
    Int,
    Float,
    Bool,
    Text,
    List,
    Dict,
    Any,
}

impl PropertyType {
    /// Coerce a raw value into this type. Returns `None` when it cannot be represented.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (_, Value::Unresolved) => Some(Value::Unresolved),
            (PropertyType::Any, v) => Some(v.clone()),
            (PropertyType::Str | PropertyType::Text, Value::String(_)) => Some(value.clone()),
            (PropertyType::Str | PropertyType::Text, Value::Null) => Some(value.clone()),
            (PropertyType::Str | PropertyType::Text, v) if v.is_numeric() => Some(Value::String(v.to_string())),
            (PropertyType::Int, Value::Int(_)) => Some(value.clone()),
            (PropertyType::Int, Value::Float(f)) => Some(Value::Int(*f as i64)),
            (PropertyType::Int, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::Int),
            (PropertyType::Float, v) if v.is_numeric() => v.as_float().map(Value::Float),
            (PropertyType::Float, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::Float),
            (PropertyType::Bool, Value::Bool(_)) => Some(value.clone()),
            (PropertyType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "0" | "" => Some(Value::Bool(false)),
                _ => None,
            },
            (PropertyType::Bool, v) => Some(Value::Bool(v.is_truthy())),
            (PropertyType::List, Value::List(_)) => Some(value.clone()),
            (PropertyType::Dict, Value::Map(_)) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Editor-facing metadata for a property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PropertyType,
    pub description: String,
    pub default: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    pub readonly: bool,
    /// Not written to the flat form.
    pub ephemeral: bool,
    #[serde(skip)]
    pub generate_choices: Option<fn() -> Vec<Value>>,
}

impl PropertyField {
    pub fn new(name: impl Into<String>, kind: PropertyType, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            default: default.into(),
            choices: None,
            min: None,
            max: None,
            step: None,
            readonly: false,
            ephemeral: false,
            generate_choices: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn choices(mut self, choices: Vec<Value>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self.step = Some(step);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Static choices, or the generated list when a generator is set.
    pub fn resolved_choices(&self) -> Option<Vec<Value>> {
        match (self.generate_choices, &self.choices) {
            (Some(generate), _) => Some(generate()),
            (None, Some(choices)) => Some(choices.clone()),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce() {
        assert_eq!(PropertyType::Int.coerce(&Value::from("12")), Some(Value::Int(12)));
        assert_eq!(PropertyType::Float.coerce(&Value::Int(2)), Some(Value::Float(2.0)));
        assert_eq!(PropertyType::Bool.coerce(&Value::from("yes")), Some(Value::Bool(true)));
        assert_eq!(PropertyType::Int.coerce(&Value::from("x")), None);
        assert_eq!(PropertyType::Str.coerce(&Value::Unresolved), Some(Value::Unresolved));
    }

    #[test]
    fn test_generated_choices_win() {
        fn generated() -> Vec<Value> { vec![Value::from("a")] }
        let mut field = PropertyField::new("mode", PropertyType::Str, "a").choices(vec![Value::from("b")]);
        assert_eq!(field.resolved_choices(), Some(vec![Value::from("b")]));
        field.generate_choices = Some(generated);
        assert_eq!(field.resolved_choices(), Some(vec![Value::from("a")]));
    }
}
