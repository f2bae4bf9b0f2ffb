use optics_dataset::DatasetError;
use optics_resolve::ResolveError;

/// Errors from the lens engine itself. Sandbox faults are not errors at
/// this level — they land in the build log.
#[derive(Debug, thiserror::Error)]
pub enum LensError {
    /// The named dataset exists but carries no lens spec.
    #[error("not a lens: {0}")]
    NotALens(String),

    /// Failure in the dataset layer.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Failure resolving an input or dependency path.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Result alias for engine operations.
pub type LensResult<T> = Result<T, LensError>;
