//! Closed value model for the tree encoding

use std::collections::BTreeMap;

use crate::error::WireError;

/// The only shapes the tree encoding understands
///
/// Booleans have no tree representation of their own and are lowered to
/// `Text("true")` / `Text("false")`. Non-integral numbers are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Number(i64),
    Text(String),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    /// Short name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
        }
    }

    /// Attribute text for scalar values; `None` for everything else
    pub fn as_attribute(&self) -> Option<String> {
        match self {
            Value::Number(n) => Some(n.to_string()),
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Parse an attribute string, recovering canonical integers
    pub fn from_attribute(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) if n.to_string() == raw => Value::Number(n),
            _ => Value::Text(raw.to_string()),
        }
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = WireError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Text(b.to_string()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Number(i),
                None => {
                    return Err(WireError::UnsupportedEncoding(format!(
                        "non-integer number {}",
                        n
                    )));
                }
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => Value::Sequence(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(fields) => Value::Mapping(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((k, Value::try_from(v)?)))
                    .collect::<Result<_, WireError>>()?,
            ),
        })
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Number(n) => serde_json::Value::from(n),
            Value::Text(s) => serde_json::Value::String(s),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Mapping(fields) => serde_json::Value::Object(
                fields.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}
