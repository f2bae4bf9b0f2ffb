use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use optics_store::{BlobStore, FileStore, Hold, HoldTable, LockManager};
use optics_types::{Clock, DatasetPath, Hash, HashUrl, StructuredValue};

use crate::error::{AttachError, AttachResult};
use crate::meta::AttachmentMeta;

/// Resolves a record path to the hash URLs its payload currently
/// references. `None` means the record is gone (or unreadable), so the
/// linker no longer counts.
///
/// Implemented by the read-path resolver; injected after construction
/// because the resolver itself is built on the dataset models that write
/// through this store.
pub trait LinkSource: Send + Sync {
    fn record_links(&self, path: &DatasetPath) -> Option<Vec<HashUrl>>;
}

/// Caller-supplied fields for a new attachment write.
#[derive(Clone, Debug, Default)]
pub struct NewAttachment {
    /// Record paths that will reference this attachment.
    pub linkers: Vec<DatasetPath>,
    /// Arbitrary user metadata merged into the attachment meta.
    pub extra: BTreeMap<String, StructuredValue>,
}

struct Inner {
    blobs: BlobStore,
    meta: FileStore,
    holds: HoldTable,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    link_source: RwLock<Option<Arc<dyn LinkSource>>>,
}

/// The attachment store: blobs plus linker-tracking metadata.
///
/// Every mutation of a given hash runs under an exclusive in-process lock
/// keyed `attachments/<hex>`, covering blob publication, metadata merge,
/// and GC deletion.
#[derive(Clone)]
pub struct AttachmentStore {
    inner: Arc<Inner>,
}

impl AttachmentStore {
    /// Open (creating if needed) the two stores under `root`
    /// (`<root>/blobs`, `<root>/meta`).
    pub fn open(
        root: impl AsRef<Path>,
        holds: HoldTable,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
    ) -> AttachResult<Self> {
        let root = root.as_ref();
        let blobs = BlobStore::open(root.join("blobs"), holds.clone())?;
        let meta = FileStore::open(root.join("meta"), Arc::clone(&locks))?;
        Ok(Self {
            inner: Arc::new(Inner {
                blobs,
                meta,
                holds,
                locks,
                clock,
                link_source: RwLock::new(None),
            }),
        })
    }

    /// Wire in the read-path resolver once it exists. Until then,
    /// `validate` keeps every linker (conservative).
    pub fn set_link_source(&self, source: Arc<dyn LinkSource>) {
        *self.inner.link_source.write() = Some(source);
    }

    fn lock_key(hash: &Hash) -> String {
        format!("attachments/{}", hash.to_hex())
    }

    fn meta_segments(hex: &str) -> [&str; 2] {
        [&hex[..2], &hex[2..]]
    }

    /// Stream an attachment in.
    ///
    /// Bytes are staged to a temp file while hashing; once the hash is
    /// known a hold is taken, and under the attachment lock the blob is
    /// published (idempotently) and the metadata merged. The returned
    /// [`AttachmentHold`] keeps the attachment alive until the caller's
    /// record write commits.
    pub fn write_stream(
        &self,
        reader: &mut dyn Read,
        new: NewAttachment,
    ) -> AttachResult<(Hash, AttachmentHold)> {
        let staged = self.inner.blobs.stage(reader)?;
        let hash = staged.hash();
        let hold = self.inner.holds.hold(hash.to_hex());

        {
            let _guard = self.inner.locks.lock(&Self::lock_key(&hash));
            self.inner.blobs.commit(staged)?;
            let now = self.inner.clock.now_ms();
            let linkers: BTreeSet<String> =
                new.linkers.iter().map(|path| path.to_string()).collect();
            let hex = hash.to_hex();
            self.inner
                .meta
                .update::<AttachmentMeta, _>(&Self::meta_segments(&hex), |current| {
                    Ok(Some(match current {
                        Some(existing) => existing.merge(linkers.clone(), new.extra.clone(), now),
                        None => AttachmentMeta {
                            created: now,
                            updated: now,
                            linkers: linkers.clone(),
                            extra: new.extra.clone(),
                        },
                    }))
                })?;
        }
        debug!(hash = %hash.short_hex(), "attachment written");
        Ok((hash, AttachmentHold::new(self.clone(), hash, hold)))
    }

    /// Buffered convenience over [`Self::write_stream`].
    pub fn write(
        &self,
        bytes: &[u8],
        new: NewAttachment,
    ) -> AttachResult<(Hash, AttachmentHold)> {
        self.write_stream(&mut std::io::Cursor::new(bytes), new)
    }

    /// Open the attachment blob for streaming reads.
    pub fn read_stream(&self, hash: &Hash) -> AttachResult<File> {
        Ok(self.inner.blobs.open_reader(hash)?)
    }

    /// Read the attachment blob fully into memory.
    pub fn read(&self, hash: &Hash) -> AttachResult<Vec<u8>> {
        Ok(self.inner.blobs.read(hash)?)
    }

    /// The attachment's metadata, if present.
    pub fn read_meta(&self, hash: &Hash) -> AttachResult<Option<AttachmentMeta>> {
        let hex = hash.to_hex();
        Ok(self.inner.meta.read(&Self::meta_segments(&hex))?)
    }

    /// `true` iff both blob and metadata exist.
    pub fn has(&self, hash: &Hash) -> bool {
        let hex = hash.to_hex();
        self.inner.blobs.exists(hash) && self.inner.meta.exists(&Self::meta_segments(&hex))
    }

    /// Direct filesystem path of the blob (for sendfile-style serving).
    pub fn blob_path(&self, hash: &Hash) -> PathBuf {
        self.inner.blobs.path_for(hash)
    }

    /// Record additional linker paths on an existing attachment.
    ///
    /// Fails with [`AttachError::NotFound`] if the attachment has no
    /// metadata.
    pub fn link(&self, hash: &Hash, paths: &[DatasetPath]) -> AttachResult<()> {
        let _guard = self.inner.locks.lock(&Self::lock_key(hash));
        let hex = hash.to_hex();
        let now = self.inner.clock.now_ms();
        let linkers: BTreeSet<String> = paths.iter().map(|path| path.to_string()).collect();
        let updated = self
            .inner
            .meta
            .update::<AttachmentMeta, _>(&Self::meta_segments(&hex), |current| {
                Ok(current.map(|meta| meta.merge(linkers.clone(), BTreeMap::new(), now)))
            })?;
        match updated {
            Some(_) => Ok(()),
            None => Err(AttachError::NotFound(*hash)),
        }
    }

    /// Take a hold on an attachment, keeping it alive regardless of
    /// linkers. Releasing the last hold triggers [`Self::validate`].
    pub fn hold(&self, hash: &Hash) -> AttachmentHold {
        let hold = self.inner.holds.hold(hash.to_hex());
        AttachmentHold::new(self.clone(), *hash, hold)
    }

    /// The GC oracle. Re-walks the linker paths through the configured
    /// [`LinkSource`], prunes linkers whose records no longer reference
    /// this hash, and deletes blob + metadata when no linker survives and
    /// no hold exists.
    ///
    /// Returns `true` iff the attachment was retained on disk.
    pub fn validate(&self, hash: &Hash) -> AttachResult<bool> {
        let _guard = self.inner.locks.lock(&Self::lock_key(hash));
        let hex = hash.to_hex();
        let segments = Self::meta_segments(&hex);
        let Some(mut meta) = self.inner.meta.read::<AttachmentMeta>(&segments)? else {
            return Ok(false);
        };

        let source = self.inner.link_source.read().clone();
        if let Some(source) = source {
            let before = meta.linkers.len();
            meta.linkers.retain(|linker| {
                let Ok(path) = linker.parse::<DatasetPath>() else {
                    return false;
                };
                match source.record_links(&path) {
                    Some(links) => links.iter().any(|url| url.hash() == *hash),
                    None => false,
                }
            });
            if meta.linkers.len() != before {
                meta.updated = self.inner.clock.now_ms();
                self.inner.meta.write(&segments, &meta)?;
            }
        }

        if meta.linkers.is_empty() && !self.inner.holds.is_held(&hex) {
            self.inner.blobs.delete(hash)?;
            self.inner.meta.delete(&segments)?;
            debug!(hash = %hash.short_hex(), "attachment collected");
            return Ok(false);
        }
        Ok(true)
    }
}

impl std::fmt::Debug for AttachmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentStore")
            .field("blobs", &self.inner.blobs)
            .finish()
    }
}

/// A live hold on one attachment.
///
/// Releasing (explicitly or on drop) gives the hold back; when the last
/// hold goes and no linker survives validation, the attachment is
/// deleted.
pub struct AttachmentHold {
    store: AttachmentStore,
    hash: Hash,
    hold: Option<Hold>,
}

impl AttachmentHold {
    fn new(store: AttachmentStore, hash: Hash, hold: Hold) -> Self {
        Self {
            store,
            hash,
            hold: Some(hold),
        }
    }

    /// The held attachment hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Release the hold. Returns `true` iff the attachment survived
    /// validation (was retained on disk).
    pub fn release(mut self) -> AttachResult<bool> {
        self.release_inner()
            .unwrap_or(Ok(true))
    }

    fn release_inner(&mut self) -> Option<AttachResult<bool>> {
        let mut hold = self.hold.take()?;
        let remaining = hold.release();
        if remaining == 0 {
            Some(self.store.validate(&self.hash))
        } else {
            None
        }
    }
}

impl Drop for AttachmentHold {
    fn drop(&mut self) {
        if let Some(Err(err)) = self.release_inner() {
            warn!(hash = %self.hash.short_hex(), %err, "validate failed on hold drop");
        }
    }
}
