use optics_types::Hash;

/// Errors from attachment operations.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// No attachment metadata exists for the hash.
    #[error("attachment not found: {0}")]
    NotFound(Hash),

    /// Failure in the underlying blob or file store.
    #[error(transparent)]
    Store(#[from] optics_store::StoreError),
}

/// Result alias for attachment operations.
pub type AttachResult<T> = Result<T, AttachError>;
