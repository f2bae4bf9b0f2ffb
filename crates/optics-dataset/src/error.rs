use optics_attach::AttachError;
use optics_store::StoreError;

/// Errors from dataset operations.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// The dataset or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create was called for a dataset that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A record payload references attachments that are not present.
    /// Carries every missing `hash://` URL so clients can resend them.
    #[error("missing attachments: {}", .0.join(", "))]
    MissingAttachments(Vec<String>),

    /// Config or record failed source-specific validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Failure in the attachment store.
    #[error(transparent)]
    Attach(#[from] AttachError),

    /// Failure in the underlying stores.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for dataset operations.
pub type DatasetResult<T> = Result<T, DatasetError>;
