//! Error types for the subtree codecs

use odb_core::OdbError;
use thiserror::Error;

/// Errors from saving or loading a subtree.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The database refused an operation
    #[error(transparent)]
    Odb(#[from] OdbError),

    /// Malformed ASCII input
    #[error("Parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Malformed XML input or a writer failure
    #[error("XML error: {0}")]
    Xml(String),

    /// Malformed JSON input
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed JSON that does not describe a subtree
    #[error("Unexpected JSON structure: {0}")]
    JsonShape(String),

    /// A type name or id no key type corresponds to
    #[error("Unknown type \"{0}\"")]
    UnknownType(String),
}

impl From<quick_xml::Error> for CodecError {
    fn from(e: quick_xml::Error) -> Self {
        CodecError::Xml(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for CodecError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        CodecError::Xml(e.to_string())
    }
}

/// Convenience result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
