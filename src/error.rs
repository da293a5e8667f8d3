//! Custom error types for the Formid library
//!
//! Setup, persistence and matcher errors are all surfaced through
//! [`FormidError`]. Persistence failures additionally live on the cursor as a
//! sticky [`PersistError`] so many reads and writes can be checked once.

use thiserror::Error;

/// Main error type for the Formid library
#[derive(Error, Debug)]
pub enum FormidError {
    /// Errors related to XML signature file deserialization
    #[error("XML deserialization error: {0}")]
    XmlDeserialize(#[from] quick_xml::DeError),

    /// Errors related to regular expression compilation (glob patterns)
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// Errors related to base64 encoded signature values
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Errors related to hex encoded signature values
    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Errors related to file I/O operations
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors related to JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors raised by the persistence cursor
    #[error("Load error: {0}")]
    Load(#[from] PersistError),

    /// An identifier type tag outside the registry table
    #[error("Registry error: tag {tag} is outside the loader table")]
    Registry { tag: u8 },

    /// A signature set handed to a matcher that cannot use its shape
    #[error("Incompatible signature set: {matcher} matcher cannot add {found} signatures")]
    IncompatibleSignatureSet {
        matcher: &'static str,
        found: &'static str,
    },

    /// Unrecoverable matcher setup failure
    #[error("Byte source error: {message}")]
    ByteSource { message: String },

    /// Errors related to invalid signature data
    #[error("Invalid signature data: {message}")]
    SignatureData { message: String },

    /// Errors related to configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Custom errors with context
    #[error("Error: {message}")]
    Custom { message: String },
}

impl FormidError {
    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }

    /// Create an invalid signature data error
    pub fn signature_data<S: Into<String>>(message: S) -> Self {
        Self::SignatureData {
            message: message.into(),
        }
    }

    /// Create a byte source error
    pub fn byte_source<S: Into<String>>(message: S) -> Self {
        Self::ByteSource {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Errors recorded on a [`LoadSaver`](crate::persist::LoadSaver).
///
/// Clonable so the first error can stay on the cursor while also being
/// returned to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    #[error("unexpected end of data at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("bad identifier loader: no loader registered for tag {tag}")]
    BadIdentifierLoader { tag: u8 },

    #[error("bad matcher type tag {tag}")]
    BadMatcherType { tag: u8 },

    #[error("bad signature file: {message}")]
    BadSignatureFile { message: String },
}

/// Result type alias for Formid operations
pub type FormidResult<T> = Result<T, FormidError>;
