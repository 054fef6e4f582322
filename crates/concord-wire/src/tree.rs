//! Stanza tree encoding
//!
//! `{"a": 4, "b": {"c": 5}}` becomes
//!
//! ```text
//! <y xmlns="http://y.ninja/connector-stanza" a="4">
//!   <b c="5"/>
//! </y>
//! ```
//!
//! Primitive values are not supported as direct array elements; every
//! array item must itself be an object or an array.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, de::DeserializeOwned};
use tracing::trace;

use crate::error::{WireError, WireResult};
use crate::value::Value;

/// Name of the root element of every stanza
pub const STANZA_ROOT: &str = "y";

/// Namespace attribute placed on the root element
pub const STANZA_NAMESPACE: &str = "http://y.ninja/connector-stanza";

/// Name of each child element of an array node
pub const ARRAY_ELEMENT: &str = "array-element";

/// Marker attribute on array nodes
pub const IS_ARRAY_ATTR: &str = "isArray";

const XMLNS_ATTR: &str = "xmlns";

/// A node of an attribute/element tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// First child with the given name
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn is_array(&self) -> bool {
        self.attr(IS_ARRAY_ATTR) == Some("true")
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (name, value) in &self.attrs {
            write!(f, " {}=\"{}\"", name, escape(value))?;
        }
        if self.children.is_empty() {
            return write!(f, "/>");
        }
        write!(f, ">")?;
        for child in &self.children {
            write!(f, "{}", child)?;
        }
        write!(f, "</{}>", self.name)
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Encode a value as a stanza rooted at `y`
///
/// # Errors
///
/// [`WireError::UnsupportedEncoding`] if the top level is neither a mapping
/// nor a sequence, or if a sequence holds a primitive item.
pub fn encode_tree(value: &Value) -> WireResult<Element> {
    let root = Element::new(STANZA_ROOT).with_attr(XMLNS_ATTR, STANZA_NAMESPACE);
    match value {
        Value::Mapping(fields) => encode_mapping(root, fields),
        Value::Sequence(items) => encode_sequence(root, items),
        other => Err(WireError::UnsupportedEncoding(format!(
            "top-level {} (expected mapping or sequence)",
            other.kind()
        ))),
    }
}

fn encode_mapping(mut node: Element, fields: &BTreeMap<String, Value>) -> WireResult<Element> {
    for (name, value) in fields {
        if let Some(attribute) = value.as_attribute() {
            node.attrs.insert(name.clone(), attribute);
            continue;
        }
        match value {
            Value::Mapping(inner) => {
                let child = encode_mapping(Element::new(name.as_str()), inner)?;
                node.children.push(child);
            }
            Value::Sequence(items) => {
                let child = encode_sequence(Element::new(name.as_str()), items)?;
                node.children.push(child);
            }
            // Null has no tree representation; absent on the wire.
            Value::Null | Value::Number(_) | Value::Text(_) => {}
        }
    }
    Ok(node)
}

fn encode_sequence(node: Element, items: &[Value]) -> WireResult<Element> {
    let mut node = node.with_attr(IS_ARRAY_ATTR, "true");
    for item in items {
        let child = match item {
            Value::Mapping(fields) => encode_mapping(Element::new(ARRAY_ELEMENT), fields)?,
            Value::Sequence(inner) => encode_sequence(Element::new(ARRAY_ELEMENT), inner)?,
            other => {
                return Err(WireError::UnsupportedEncoding(format!(
                    "{} as array element",
                    other.kind()
                )));
            }
        };
        node.children.push(child);
    }
    Ok(node)
}

/// Decode a stanza back into a value
///
/// # Errors
///
/// [`WireError::Malformed`] if the root is not a `y` element or an array
/// node holds something other than `array-element` children.
pub fn decode_tree(root: &Element) -> WireResult<Value> {
    if root.name != STANZA_ROOT {
        return Err(WireError::Malformed(format!(
            "root element <{}>, expected <{}>",
            root.name, STANZA_ROOT
        )));
    }
    decode_node(root, true)
}

fn decode_node(node: &Element, is_root: bool) -> WireResult<Value> {
    if node.is_array() {
        return decode_sequence(node);
    }

    let mut fields = BTreeMap::new();
    for (name, raw) in &node.attrs {
        if is_root && name == XMLNS_ATTR {
            continue;
        }
        fields.insert(name.clone(), Value::from_attribute(raw));
    }
    for child in &node.children {
        if fields.contains_key(&child.name) {
            trace!(field = %child.name, "child element shadows attribute");
        }
        fields.insert(child.name.clone(), decode_node(child, false)?);
    }
    Ok(Value::Mapping(fields))
}

fn decode_sequence(node: &Element) -> WireResult<Value> {
    node.children
        .iter()
        .map(|child| {
            if child.name != ARRAY_ELEMENT {
                return Err(WireError::Malformed(format!(
                    "array <{}> holds <{}>",
                    node.name, child.name
                )));
            }
            decode_node(child, false)
        })
        .collect::<WireResult<Vec<_>>>()
        .map(Value::Sequence)
}

/// Serialize any value straight into a stanza
pub fn to_tree<T: Serialize + ?Sized>(value: &T) -> WireResult<Element> {
    let json = serde_json::to_value(value)?;
    encode_tree(&Value::try_from(json)?)
}

/// Deserialize a stanza into any type
///
/// Integer-looking attributes arrive as numbers, so target types with
/// string fields must accept numbers too.
pub fn from_tree<T: DeserializeOwned>(root: &Element) -> WireResult<T> {
    let json = serde_json::Value::from(decode_tree(root)?);
    Ok(serde_json::from_value(json)?)
}
