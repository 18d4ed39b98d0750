//! Attribute access abstraction
//!
//! Samplers never know how a value is exposed. The surrounding system hands
//! them an [`AttributeReader`] and the name of the attribute to poll.

use crate::error::{MetricsError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Source of live attribute values
#[async_trait]
pub trait AttributeReader: Send + Sync {
    /// Current value of `attribute`. A missing or temporarily unreadable
    /// attribute yields [`MetricsError::AttributeUnavailable`].
    async fn read(&self, attribute: &str) -> Result<AttributeValue>;
}

/// Raw value of an attribute as exposed by its owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Bool(bool),
}

impl AttributeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Int(_) => "int",
            AttributeValue::Long(_) => "long",
            AttributeValue::Float(_) => "float",
            AttributeValue::Double(_) => "double",
            AttributeValue::Text(_) => "text",
            AttributeValue::Bool(_) => "bool",
        }
    }

    /// Coerce to a sample value. Only numeric types are accepted.
    pub fn as_f64(&self, attribute: &str) -> Result<f64> {
        match self {
            AttributeValue::Int(v) => Ok(*v as f64),
            AttributeValue::Long(v) => Ok(*v as f64),
            AttributeValue::Float(v) => Ok(*v as f64),
            AttributeValue::Double(v) => Ok(*v),
            other => Err(MetricsError::TypeMismatch {
                attribute: attribute.to_string(),
                found: other.type_name(),
            }),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Long(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Double(v) => write!(f, "{v}"),
            AttributeValue::Text(v) => write!(f, "{v:?}"),
            AttributeValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A named attribute on a particular reader
#[derive(Clone)]
pub struct AttributeRef {
    pub reader: Arc<dyn AttributeReader>,
    pub name: String,
}

impl AttributeRef {
    pub fn new(reader: Arc<dyn AttributeReader>, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
        }
    }

    pub async fn read(&self) -> Result<AttributeValue> {
        self.reader.read(&self.name).await
    }
}

impl fmt::Debug for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeRef")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(AttributeValue::Int(-3).as_f64("a").unwrap(), -3.0);
        assert_eq!(AttributeValue::Long(1 << 40).as_f64("a").unwrap(), (1u64 << 40) as f64);
        assert_eq!(AttributeValue::Float(0.5).as_f64("a").unwrap(), 0.5);
        assert_eq!(AttributeValue::Double(2.25).as_f64("a").unwrap(), 2.25);
    }

    #[test]
    fn test_unsupported_types_mismatch() {
        let err = AttributeValue::Text("12".into()).as_f64("Count").unwrap_err();
        assert!(matches!(
            err,
            MetricsError::TypeMismatch { ref attribute, found: "text" } if attribute == "Count"
        ));
        assert!(err.is_sample_local());
        assert!(AttributeValue::Bool(true).as_f64("Count").is_err());
    }
}
