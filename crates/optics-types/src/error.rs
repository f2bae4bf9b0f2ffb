/// Errors from parsing or constructing foundation types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypeError {
    /// A hex string could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// A byte sequence had the wrong length for its type.
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// A string is not a well-formed `hash://` URL.
    #[error("invalid hash url: {0}")]
    InvalidHashUrl(String),

    /// A string is not a well-formed dataset path.
    #[error("invalid dataset path: {0}")]
    InvalidPath(String),

    /// Unknown source tag (expected `datasets`, `lenses`, or `meta`).
    #[error("unknown source: {0}")]
    UnknownSource(String),
}
