use quick_xml::events::attributes::AttrError;
use quick_xml::Error as QuickXmlError;
use std::fmt;

/// Result alias for binary XML operations.
pub type AxmlResult<T> = Result<T, AxmlError>;

/// Errors surfaced by the binary XML decoder, auditor and encoder.
///
/// Most damage inside a manifest is tolerated and never reaches this type: only a
/// buffer too short for the outer chunk header aborts a decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxmlError {
    /// Fewer than 8 bytes remain where a chunk header is required.
    TruncatedHeader { offset: usize, available: usize },
    /// A declared read runs past the end of the buffer.
    Truncated { offset: usize, needed: usize },
    /// The document is missing the expected structure.
    MalformedDocument(String),
    /// Text XML parsing failure (encoder side).
    Xml(String),
}

impl fmt::Display for AxmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxmlError::TruncatedHeader { offset, available } => write!(
                f,
                "Truncated chunk header at 0x{offset:x}: {available} of 8 bytes available"
            ),
            AxmlError::Truncated { offset, needed } => {
                write!(f, "Unexpected end of binary XML reading {needed} bytes at 0x{offset:x}")
            }
            AxmlError::MalformedDocument(msg) => write!(f, "Malformed manifest: {msg}"),
            AxmlError::Xml(msg) => write!(f, "XML error: {msg}"),
        }
    }
}

impl std::error::Error for AxmlError {}

impl From<QuickXmlError> for AxmlError {
    fn from(value: QuickXmlError) -> Self {
        AxmlError::Xml(value.to_string())
    }
}

impl From<AttrError> for AxmlError {
    fn from(value: AttrError) -> Self {
        AxmlError::Xml(value.to_string())
    }
}
