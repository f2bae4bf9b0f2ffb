//! The versioned dataset model.
//!
//! A dataset is a named, monotonically versioned mapping from record IDs
//! to structured values, owned by a user. Metadata lives in the file
//! store at `<source>/<user>/<name>/meta`; record payloads live in a
//! per-dataset content-addressed object store beside it.
//!
//! [`Collection`] is the entry point — one instance per source family
//! (`datasets` or `lenses`). Its [`Collection::update_meta`] is the
//! pivotal primitive: an exclusive per-dataset critical section that
//! bumps the version, runs the caller's mutation, validates the result,
//! garbage-collects unreferenced objects, commits atomically, and
//! publishes a `path_updated` event. Every higher-level write goes
//! through it.

mod collection;
mod error;
mod meta;

pub use collection::Collection;
pub use error::{DatasetError, DatasetResult};
pub use meta::{BuildLogEntry, DatasetMeta, LensSpec, RecordMeta, SandboxFault};
