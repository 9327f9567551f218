//! Attribute and metadata values

use std::collections::BTreeMap;

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// A scene-description value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Token(String),
    TokenArray(Vec<String>),
    Vec3(DVec3),
    Vec3Array(Vec<DVec3>),
    DoubleArray(Vec<f64>),
    Dictionary(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String or token contents
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Token(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<DVec3> {
        match self {
            Value::Vec3(v) => Some(*v),
            Value::Vec3Array(values) if values.len() == 1 => Some(values[0]),
            _ => None,
        }
    }

    pub fn as_vec3_array(&self) -> Option<&[DVec3]> {
        match self {
            Value::Vec3Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<DVec3> for Value {
    fn from(value: DVec3) -> Self {
        Value::Vec3(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Token("render".into()).as_str(), Some("render"));
        assert_eq!(
            Value::Vec3Array(vec![DVec3::ONE]).as_vec3(),
            Some(DVec3::ONE)
        );
        assert_eq!(Value::Bool(true).as_f64(), None);
    }
}
