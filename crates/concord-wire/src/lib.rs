//! # Concord Wire
//!
//! Tree-structured wire encoding for transports that carry attribute and
//! element trees instead of raw JSON.
//!
//! Messages are first lowered into the closed [`Value`] variant set, then
//! mapped onto an [`Element`] tree rooted at a `y` stanza:
//!
//! - scalar fields of an object become attributes
//! - object and array fields become child elements
//! - arrays carry `isArray="true"` and hold one `array-element` child per item
//!
//! Decoding reverses the mapping. Attribute values that are canonical
//! base-10 integers come back as [`Value::Number`], everything else as
//! [`Value::Text`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use concord_wire::{to_tree, from_tree};
//!
//! let tree = to_tree(&serde_json::json!({"type": "update", "ops": []}))?;
//! let back: serde_json::Value = from_tree(&tree)?;
//! ```

pub mod error;
pub mod tree;
pub mod value;

pub use error::{WireError, WireResult};
pub use tree::{
    ARRAY_ELEMENT, Element, IS_ARRAY_ATTR, STANZA_NAMESPACE, STANZA_ROOT, decode_tree,
    encode_tree, from_tree, to_tree,
};
pub use value::Value;
