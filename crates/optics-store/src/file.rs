use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{StoreError, StoreResult};
use crate::lock::{LockGuard, LockManager};

/// Filesystem-hostile characters, escaped in every path segment so
/// arbitrary user-chosen names land safely on disk.
const FS_SEGMENT: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'\\')
    .add(b':')
    .add(b'%')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|')
    .add(b'.')
    .add(b' ');

/// Path-keyed persistent map for metadata.
///
/// Keys are segment tuples (`["datasets", user, name, "meta"]`); values
/// are any serde type, encoded CBOR on disk at
/// `root/<seg>/../<last>.cbor`. [`FileStore::update`] is the atomic
/// read-modify-write primitive: an exclusive per-path lock is held across
/// the full read → closure → rename, and released on every exit path.
pub struct FileStore {
    root: PathBuf,
    locks: Arc<LockManager>,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>, locks: Arc<LockManager>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, locks })
    }

    /// The store root on disk.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The stable lock key for a path tuple.
    pub fn lock_key(path: &[&str]) -> String {
        path.iter()
            .map(|seg| utf8_percent_encode(seg, FS_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Acquire the exclusive lock for a path without touching the file.
    pub fn lock(&self, path: &[&str]) -> LockGuard {
        self.locks.lock(&Self::lock_key(path))
    }

    fn file_path(&self, path: &[&str]) -> PathBuf {
        let mut full = self.root.clone();
        for seg in path {
            full.push(utf8_percent_encode(seg, FS_SEGMENT).to_string());
        }
        full.set_extension("cbor");
        full
    }

    /// The directory a path prefix maps to on disk (segments encoded).
    pub fn dir_path(&self, path: &[&str]) -> PathBuf {
        let mut full = self.root.clone();
        for seg in path {
            full.push(utf8_percent_encode(seg, FS_SEGMENT).to_string());
        }
        full
    }

    /// Read the value at a path, or `None` if absent.
    pub fn read<T: DeserializeOwned>(&self, path: &[&str]) -> StoreResult<Option<T>> {
        let bytes = match fs::read(self.file_path(path)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        ciborium::de::from_reader(bytes.as_slice())
            .map(Some)
            .map_err(|err| StoreError::Serialization(err.to_string()))
    }

    /// Write a value at a path: encode, stage, fsync, atomic rename.
    pub fn write<T: Serialize>(&self, path: &[&str], value: &T) -> StoreResult<()> {
        let file_path = self.file_path(path);
        let parent = file_path.parent().expect("file path always has a parent");
        fs::create_dir_all(parent)?;
        let mut staged = NamedTempFile::new_in(parent)?;
        ciborium::ser::into_writer(value, &mut staged)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        staged.as_file().sync_all()?;
        staged
            .persist(&file_path)
            .map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }

    /// Atomic read-modify-write.
    ///
    /// Acquires the path's exclusive lock, reads the current value (or
    /// `None`), runs `f`, and writes the result back if `f` returned one.
    /// The lock is released on all exit paths including errors.
    pub fn update<T, F>(&self, path: &[&str], f: F) -> StoreResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StoreResult<Option<T>>,
    {
        let _guard = self.lock(path);
        let current = self.read(path)?;
        let next = f(current)?;
        if let Some(ref value) = next {
            self.write(path, value)?;
        }
        Ok(next)
    }

    /// Delete the value at a path. Returns `true` if it existed.
    pub fn delete(&self, path: &[&str]) -> StoreResult<bool> {
        match fs::remove_file(self.file_path(path)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a whole subtree (a path prefix and everything under it).
    pub fn delete_tree(&self, path: &[&str]) -> StoreResult<bool> {
        match fs::remove_dir_all(self.dir_path(path)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn exists(&self, path: &[&str]) -> bool {
        self.file_path(path).exists()
    }

    /// Child folder names under a path prefix, decoded and sorted.
    pub fn iterate_folders(&self, path: &[&str]) -> StoreResult<Vec<String>> {
        let dir = self.dir_path(path);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(encoded) = entry.file_name().to_str() {
                if let Ok(decoded) = percent_decode_str(encoded).decode_utf8() {
                    names.push(decoded.into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").field("root", &self.root).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use optics_types::StructuredValue;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        version: u64,
        memo: String,
    }

    fn temp_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            FileStore::open(dir.path().join("meta"), Arc::new(LockManager::new())).unwrap();
        (dir, store)
    }

    #[test]
    fn read_missing_is_none() {
        let (_dir, store) = temp_store();
        let value: Option<Sample> = store.read(&["datasets", "alice", "songs", "meta"]).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn write_then_read() {
        let (_dir, store) = temp_store();
        let path = ["datasets", "alice", "songs", "meta"];
        let sample = Sample {
            version: 1,
            memo: "x".into(),
        };
        store.write(&path, &sample).unwrap();
        assert_eq!(store.read::<Sample>(&path).unwrap(), Some(sample));
        assert!(store.exists(&path));
    }

    #[test]
    fn structured_values_are_storable() {
        let (_dir, store) = temp_store();
        let mut map = BTreeMap::new();
        map.insert("bytes".into(), StructuredValue::Bytes(vec![1, 2, 3]));
        let value = StructuredValue::Map(map);
        store.write(&["config"], &value).unwrap();
        assert_eq!(store.read(&["config"]).unwrap(), Some(value));
    }

    #[test]
    fn update_creates_and_mutates() {
        let (_dir, store) = temp_store();
        let path = ["counter"];

        let created = store
            .update::<Sample, _>(&path, |current| {
                assert!(current.is_none());
                Ok(Some(Sample {
                    version: 1,
                    memo: "new".into(),
                }))
            })
            .unwrap();
        assert_eq!(created.as_ref().map(|s| s.version), Some(1));

        store
            .update::<Sample, _>(&path, |current| {
                let mut sample = current.expect("written above");
                sample.version += 1;
                Ok(Some(sample))
            })
            .unwrap();
        assert_eq!(store.read::<Sample>(&path).unwrap().unwrap().version, 2);
    }

    #[test]
    fn update_returning_none_writes_nothing() {
        let (_dir, store) = temp_store();
        let path = ["untouched"];
        store
            .update::<Sample, _>(&path, |_| Ok(None))
            .unwrap();
        assert!(!store.exists(&path));
    }

    #[test]
    fn update_error_leaves_file_intact() {
        let (_dir, store) = temp_store();
        let path = ["stable"];
        let sample = Sample {
            version: 7,
            memo: "keep".into(),
        };
        store.write(&path, &sample).unwrap();

        let result = store.update::<Sample, _>(&path, |_| {
            Err(StoreError::Serialization("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.read::<Sample>(&path).unwrap(), Some(sample));
        // Lock must have been released on the error path.
        let _guard = store.lock(&path);
    }

    #[test]
    fn concurrent_updates_serialise() {
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FileStore::open(dir.path().join("meta"), Arc::new(LockManager::new())).unwrap(),
        );
        store
            .write(&["n"], &Sample {
                version: 0,
                memo: String::new(),
            })
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..25 {
                        store
                            .update::<Sample, _>(&["n"], |current| {
                                let mut sample = current.unwrap();
                                sample.version += 1;
                                Ok(Some(sample))
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.read::<Sample>(&["n"]).unwrap().unwrap().version, 100);
    }

    #[test]
    fn hostile_segment_names_are_escaped() {
        let (_dir, store) = temp_store();
        let path = ["datasets", "a/b:c", "..", "meta"];
        store
            .write(&path, &Sample {
                version: 1,
                memo: "escaped".into(),
            })
            .unwrap();
        assert!(store.exists(&path));
        // The hostile segments never become real directory traversal.
        assert!(store.file_path(&path).starts_with(store.root()));
    }

    #[test]
    fn delete_and_delete_tree() {
        let (_dir, store) = temp_store();
        store.write(&["datasets", "u", "n", "meta"], &1u32).unwrap();
        assert!(store.delete(&["datasets", "u", "n", "meta"]).unwrap());
        assert!(!store.delete(&["datasets", "u", "n", "meta"]).unwrap());

        store.write(&["datasets", "u", "n", "meta"], &1u32).unwrap();
        assert!(store.delete_tree(&["datasets", "u", "n"]).unwrap());
        assert!(!store.exists(&["datasets", "u", "n", "meta"]));
    }

    #[test]
    fn iterate_folders_lists_children() {
        let (_dir, store) = temp_store();
        store.write(&["datasets", "alice", "songs", "meta"], &1u32).unwrap();
        store.write(&["datasets", "alice", "films", "meta"], &1u32).unwrap();
        store.write(&["datasets", "bob", "notes", "meta"], &1u32).unwrap();

        assert_eq!(
            store.iterate_folders(&["datasets"]).unwrap(),
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert_eq!(
            store.iterate_folders(&["datasets", "alice"]).unwrap(),
            vec!["films".to_string(), "songs".to_string()]
        );
        assert!(store.iterate_folders(&["lenses"]).unwrap().is_empty());
    }
}
