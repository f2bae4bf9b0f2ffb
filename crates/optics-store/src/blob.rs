use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use optics_types::Hash;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::hold::HoldTable;

/// Filesystem content-addressed store.
///
/// Blobs live at `root/<first-2-hex>/<remaining-62-hex>.<ext>`. Writes
/// stage to a temp file, fsync, then rename into place, so a crash never
/// leaves a partial blob at a final path; stale staging files are swept by
/// the next [`BlobStore::retain`].
///
/// Deletion respects the shared [`HoldTable`]: a held blob survives any
/// retain sweep regardless of the keep set.
pub struct BlobStore {
    root: PathBuf,
    extension: &'static str,
    holds: HoldTable,
}

/// A fully-written blob that has not been published yet.
pub struct StagedBlob {
    hash: Hash,
    temp: NamedTempFile,
}

impl StagedBlob {
    /// The hash the blob will be published under.
    pub fn hash(&self) -> Hash {
        self.hash
    }
}

impl BlobStore {
    /// Open (creating if needed) a store rooted at `root` with the
    /// default `data` extension.
    pub fn open(root: impl Into<PathBuf>, holds: HoldTable) -> StoreResult<Self> {
        Self::open_with_extension(root, holds, "data")
    }

    /// Open with an explicit blob file extension (`cbor` for object
    /// stores, `data` for raw attachments).
    pub fn open_with_extension(
        root: impl Into<PathBuf>,
        holds: HoldTable,
        extension: &'static str,
    ) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            extension,
            holds,
        })
    }

    /// The store root on disk.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The hold table guarding this store's deletions.
    pub fn holds(&self) -> &HoldTable {
        &self.holds
    }

    /// Direct filesystem path for a hash (for sendfile-style reads).
    pub fn path_for(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.root
            .join(&hex[..2])
            .join(format!("{}.{}", &hex[2..], self.extension))
    }

    /// Write a blob, returning its hash. Idempotent: rewriting identical
    /// bytes is a no-op.
    pub fn write(&self, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::digest(bytes);
        let path = self.path_for(&hash);
        if path.exists() {
            return Ok(hash);
        }
        let shard = path.parent().expect("blob path always has a parent");
        fs::create_dir_all(shard)?;
        let mut staged = NamedTempFile::new_in(shard)?;
        staged.write_all(bytes)?;
        staged.as_file().sync_all()?;
        staged
            .persist(&path)
            .map_err(|err| StoreError::Io(err.error))?;
        fsync_dir(shard);
        debug!(hash = %hash.short_hex(), bytes = bytes.len(), "blob written");
        Ok(hash)
    }

    /// Streaming write: hash while copying to a staging file, then move
    /// the staging file into place under the computed hash.
    pub fn write_reader(&self, reader: &mut dyn Read) -> StoreResult<Hash> {
        let staged = self.stage(reader)?;
        self.commit(staged)
    }

    /// Stream bytes to a staging file while hashing, without publishing.
    ///
    /// The returned [`StagedBlob`] knows its final hash; [`Self::commit`]
    /// moves it into place. Dropping it instead discards the staging
    /// file. The split lets callers take holds or locks between hashing
    /// and publication.
    pub fn stage(&self, reader: &mut dyn Read) -> StoreResult<StagedBlob> {
        let mut staged = NamedTempFile::new_in(&self.root)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            staged.write_all(&buf[..n])?;
        }
        staged.as_file().sync_all()?;
        Ok(StagedBlob {
            hash: Hash::from_raw(hasher.finalize().into()),
            temp: staged,
        })
    }

    /// Publish a staged blob under its hash. Idempotent: if the blob
    /// already exists the staging file is simply discarded.
    pub fn commit(&self, staged: StagedBlob) -> StoreResult<Hash> {
        let hash = staged.hash;
        let path = self.path_for(&hash);
        if path.exists() {
            // Drop discards the temp file.
            return Ok(hash);
        }
        let shard = path.parent().expect("blob path always has a parent");
        fs::create_dir_all(shard)?;
        staged
            .temp
            .persist(&path)
            .map_err(|err| StoreError::Io(err.error))?;
        fsync_dir(shard);
        Ok(hash)
    }

    /// Read a blob fully into memory.
    pub fn read(&self, hash: &Hash) -> StoreResult<Vec<u8>> {
        match fs::read(self.path_for(hash)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(*hash))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Open a blob for streaming reads.
    pub fn open_reader(&self, hash: &Hash) -> StoreResult<File> {
        match File::open(self.path_for(hash)) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(*hash))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.path_for(hash).exists()
    }

    /// Best-effort unlink. Returns `true` if the blob existed.
    pub fn delete(&self, hash: &Hash) -> StoreResult<bool> {
        match fs::remove_file(self.path_for(hash)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Every hash currently stored, in unspecified order.
    pub fn list(&self) -> StoreResult<Vec<Hash>> {
        let mut hashes = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name();
            let Some(prefix) = prefix.to_str() else {
                continue;
            };
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if let Some(hash) = self.parse_entry(prefix, &entry.file_name()) {
                    hashes.push(hash);
                }
            }
        }
        Ok(hashes)
    }

    /// Delete every blob whose hash is neither in `keep` nor held, and
    /// sweep stale staging files. Returns the number of blobs removed.
    pub fn retain(&self, keep: &HashSet<Hash>) -> StoreResult<usize> {
        let mut removed = 0;
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                // Staging files live directly under the root; anything
                // still here was left by a crash.
                let _ = fs::remove_file(shard.path());
                continue;
            }
            let prefix = shard.file_name();
            let Some(prefix) = prefix.to_str() else {
                continue;
            };
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let Some(hash) = self.parse_entry(prefix, &entry.file_name()) else {
                    continue;
                };
                if keep.contains(&hash) || self.holds.is_held(&hash.to_hex()) {
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(hash = %hash.short_hex(), %err, "retain sweep failed to unlink");
                    }
                }
            }
        }
        if removed > 0 {
            debug!(removed, "retain sweep complete");
        }
        Ok(removed)
    }

    fn parse_entry(&self, prefix: &str, file_name: &std::ffi::OsStr) -> Option<Hash> {
        let name = file_name.to_str()?;
        let rest = name.strip_suffix(&format!(".{}", self.extension))?;
        Hash::from_hex(&format!("{prefix}{rest}")).ok()
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("root", &self.root)
            .field("extension", &self.extension)
            .finish()
    }
}

fn fsync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
