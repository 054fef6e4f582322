//! Error types for the tree wire encoding

use thiserror::Error;

/// Errors that can occur while encoding or decoding stanza trees
#[derive(Debug, Error)]
pub enum WireError {
    /// The value has a shape the tree encoding cannot express
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// The tree does not follow the stanza layout
    #[error("Malformed stanza: {0}")]
    Malformed(String),

    #[error("JSON bridge error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WireError::UnsupportedEncoding("top-level text".to_string());
        assert!(format!("{}", err).contains("Unsupported encoding"));
        assert!(format!("{}", err).contains("top-level text"));

        let err = WireError::Malformed("root is <x>".to_string());
        assert!(format!("{}", err).contains("root is <x>"));
    }
}
