//! Storage primitives for Pigeon Optics.
//!
//! Three stores layer on top of each other:
//!
//! - [`BlobStore`] — a filesystem CAS keyed by SHA-256, with atomic
//!   staged writes and [`BlobStore::retain`] garbage collection.
//! - [`ObjectStore`] — structured values over a blob store, encoded with
//!   the canonical codec so the blob key *is* the object hash.
//! - [`FileStore`] — a path-keyed mutable map for metadata, whose
//!   [`FileStore::update`] is the atomic read-modify-write primitive
//!   every higher layer builds on.
//!
//! Two process-wide coordination structures support them:
//!
//! - [`LockManager`] — scoped exclusive locks keyed by string, released
//!   on every exit path (guards).
//! - [`HoldTable`] — soft references that keep blobs alive while an
//!   operation is in flight, independent of persistent references.
//!
//! # Design Rules
//!
//! 1. Blobs are immutable once written; content-addressing guarantees it.
//! 2. Every write stages to a temp file, fsyncs, then renames into place.
//! 3. Deletion happens only through `retain` sweeps or explicit GC.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod blob;
pub mod error;
pub mod file;
pub mod hold;
pub mod lock;
pub mod object;

pub use blob::{BlobStore, StagedBlob};
pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use hold::{Hold, HoldTable};
pub use lock::{LockGuard, LockManager};
pub use object::ObjectStore;
