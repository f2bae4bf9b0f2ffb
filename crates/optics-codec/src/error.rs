/// Errors from encoding or decoding structured values.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A value could not be encoded in the target format.
    #[error("encode error: {0}")]
    Encode(String),

    /// Incoming bytes are not a valid document in the source format.
    #[error("decode error: {0}")]
    Decode(String),
}

impl CodecError {
    pub fn encode(err: impl std::fmt::Display) -> Self {
        Self::Encode(err.to_string())
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
