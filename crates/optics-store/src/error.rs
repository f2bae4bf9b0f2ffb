use optics_types::Hash;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested blob or object was not found.
    #[error("not found: {0}")]
    NotFound(Hash),

    /// Content hash mismatch on read (data corruption).
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: Hash, computed: Hash },

    /// Encode/decode failure in the canonical codec.
    #[error(transparent)]
    Codec(#[from] optics_codec::CodecError),

    /// Metadata (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
