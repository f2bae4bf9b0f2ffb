use std::collections::HashSet;

use optics_codec::cbor::{canonical_encode, CborCodec};
use optics_codec::Codec;
use optics_types::{Hash, StructuredValue};

use crate::blob::BlobStore;
use crate::error::{StoreError, StoreResult};

/// Structured values over a blob store.
///
/// Values are encoded with the canonical codec before hitting the blob
/// layer, so the blob key equals the value's object hash: reading any
/// representation of a value back always lands on the same blob.
pub struct ObjectStore {
    blobs: BlobStore,
    paranoid: bool,
}

impl ObjectStore {
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            blobs,
            paranoid: false,
        }
    }

    /// Re-verify the content hash on every read. Test hook; off in
    /// production.
    pub fn with_paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    /// Write a value, returning its object hash. Idempotent.
    pub fn write(&self, value: &StructuredValue) -> StoreResult<Hash> {
        let bytes = canonical_encode(value)?;
        self.blobs.write(&bytes)
    }

    /// Read a value by object hash.
    pub fn read(&self, hash: &Hash) -> StoreResult<StructuredValue> {
        let bytes = self.blobs.read(hash)?;
        if self.paranoid {
            let computed = Hash::digest(&bytes);
            if computed != *hash {
                return Err(StoreError::HashMismatch {
                    expected: *hash,
                    computed,
                });
            }
        }
        Ok(CborCodec.decode(&bytes)?)
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.blobs.exists(hash)
    }

    /// GC: delete every object not in `keep` and not held.
    pub fn retain(&self, keep: &HashSet<Hash>) -> StoreResult<usize> {
        self.blobs.retain(keep)
    }

    /// The underlying blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("blobs", &self.blobs)
            .field("paranoid", &self.paranoid)
            .finish()
    }
}
