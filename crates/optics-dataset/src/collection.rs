use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use optics_attach::AttachmentStore;
use optics_bus::{PathEvent, UpdateBus};
use optics_store::{BlobStore, FileStore, HoldTable, ObjectStore};
use optics_types::{Clock, DatasetPath, Hash, Source, StructuredValue};

use crate::error::{DatasetError, DatasetResult};
use crate::meta::{DatasetMeta, LensSpec, RecordMeta};

/// One family of datasets (`datasets` or `lenses`).
///
/// Metadata lives at `<source>/<user>/<name>/meta` in the shared file
/// store; each dataset gets its own object store at
/// `<source>/<user>/<name>/objects/`. All mutations funnel through
/// [`Collection::update_meta`].
#[derive(Clone)]
pub struct Collection {
    source: Source,
    files: Arc<FileStore>,
    attachments: AttachmentStore,
    holds: HoldTable,
    bus: UpdateBus,
    clock: Arc<dyn Clock>,
}

impl Collection {
    pub fn new(
        source: Source,
        files: Arc<FileStore>,
        attachments: AttachmentStore,
        holds: HoldTable,
        bus: UpdateBus,
        clock: Arc<dyn Clock>,
    ) -> DatasetResult<Self> {
        if source == Source::Meta {
            return Err(DatasetError::ValidationFailed(
                "the virtual meta source has no collection".into(),
            ));
        }
        Ok(Self {
            source,
            files,
            attachments,
            holds,
            bus,
            clock,
        })
    }

    /// The source family this collection manages.
    pub fn source(&self) -> Source {
        self.source
    }

    /// The address of a dataset in this collection.
    pub fn path(&self, user: &str, name: &str) -> DatasetPath {
        DatasetPath::dataset(self.source, user, name)
    }

    fn meta_segments<'a>(&self, user: &'a str, name: &'a str) -> [&'a str; 4] {
        [self.source.as_str(), user, name, "meta"]
    }

    /// The per-dataset object store (creating its directory if needed).
    pub fn object_store(&self, user: &str, name: &str) -> DatasetResult<ObjectStore> {
        let dir = self
            .files
            .dir_path(&[self.source.as_str(), user, name, "objects"]);
        let blobs = BlobStore::open_with_extension(dir, self.holds.clone(), "cbor")?;
        Ok(ObjectStore::new(blobs))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a dataset at version zero.
    pub fn create(
        &self,
        user: &str,
        name: &str,
        config: BTreeMap<String, StructuredValue>,
        lens: Option<LensSpec>,
    ) -> DatasetResult<DatasetMeta> {
        let segments = self.meta_segments(user, name);
        let guard = self.files.lock(&segments);
        if self.files.exists(&segments) {
            return Err(DatasetError::AlreadyExists(self.path(user, name).to_string()));
        }
        let mut meta = DatasetMeta::new(self.clock.now_ms(), config);
        meta.lens = lens;
        self.validate_config(&meta)?;
        self.files.write(&segments, &meta)?;
        drop(guard);

        info!(path = %self.path(user, name), "dataset created");
        self.bus.emit_coalesced(vec![
            PathEvent {
                path: DatasetPath::system(self.source.as_str()),
                version: 0,
            },
            PathEvent {
                path: self.path(user, name),
                version: 0,
            },
        ]);
        Ok(meta)
    }

    /// Read a dataset's metadata.
    pub fn read_meta(&self, user: &str, name: &str) -> DatasetResult<DatasetMeta> {
        self.files
            .read(&self.meta_segments(user, name))?
            .ok_or_else(|| DatasetError::NotFound(self.path(user, name).to_string()))
    }

    pub fn exists(&self, user: &str, name: &str) -> bool {
        self.files.exists(&self.meta_segments(user, name))
    }

    /// Delete a whole dataset: its metadata, its objects, and the
    /// attachment linkers its records contributed.
    pub fn delete(&self, user: &str, name: &str) -> DatasetResult<()> {
        let segments = self.meta_segments(user, name);
        let guard = self.files.lock(&segments);
        let meta: DatasetMeta = self
            .files
            .read(&segments)?
            .ok_or_else(|| DatasetError::NotFound(self.path(user, name).to_string()))?;
        self.files
            .delete_tree(&[self.source.as_str(), user, name])?;
        drop(guard);

        for hash in meta.attachment_hashes() {
            if let Err(err) = self.attachments.validate(&hash) {
                warn!(hash = %hash.short_hex(), %err, "attachment validate failed after dataset delete");
            }
        }
        info!(path = %self.path(user, name), "dataset deleted");
        self.bus
            .path_updated(DatasetPath::system(self.source.as_str()), 0);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // The pivotal primitive
    // -----------------------------------------------------------------------

    /// Atomic read-modify-write of a dataset's metadata.
    ///
    /// Under the dataset's exclusive lock: reads the current meta, bumps
    /// the version and `updated` stamp on a draft, runs `block`,
    /// validates the result, garbage-collects objects unreferenced by
    /// either the current or the new version (this runs even when the
    /// block fails, compensating its object-store side effects), writes
    /// the meta atomically, and publishes a `path_updated` event.
    ///
    /// Either the new version commits end-to-end or the dataset is left
    /// byte-identical.
    pub fn update_meta<F>(&self, user: &str, name: &str, block: F) -> DatasetResult<DatasetMeta>
    where
        F: FnOnce(&mut DatasetMeta) -> DatasetResult<()>,
    {
        self.update_meta_inner(user, name, block)
            .map(|(_, draft)| draft)
    }

    fn update_meta_inner<F>(
        &self,
        user: &str,
        name: &str,
        block: F,
    ) -> DatasetResult<(DatasetMeta, DatasetMeta)>
    where
        F: FnOnce(&mut DatasetMeta) -> DatasetResult<()>,
    {
        let segments = self.meta_segments(user, name);
        let guard = self.files.lock(&segments);
        let current: DatasetMeta = self
            .files
            .read(&segments)?
            .ok_or_else(|| DatasetError::NotFound(self.path(user, name).to_string()))?;

        let mut retain: HashSet<Hash> = current.record_hashes();
        let mut draft = current.clone();
        draft.version = current.version + 1;
        draft.updated = self.clock.now_ms();

        let outcome = block(&mut draft).and_then(|()| {
            draft.version = current.version + 1;
            self.validate_draft(&mut draft)?;
            self.validate_config(&draft)
        });

        // GC runs whatever the outcome: objects the block wrote that are
        // referenced by neither version are swept now.
        retain.extend(draft.record_hashes());
        let swept = self.object_store(user, name)?.retain(&retain);

        outcome?;
        swept?;
        self.files.write(&segments, &draft)?;
        drop(guard);

        debug!(path = %self.path(user, name), version = draft.version, "meta updated");
        self.bus.path_updated(self.path(user, name), draft.version);
        Ok((current, draft))
    }

    fn validate_draft(&self, draft: &mut DatasetMeta) -> DatasetResult<()> {
        let version = draft.version;
        for (id, record) in draft.records.iter_mut() {
            if record.version == 0 {
                record.version = version;
            }
            if record.version > version {
                return Err(DatasetError::ValidationFailed(format!(
                    "record {id} is at version {} beyond dataset version {version}",
                    record.version
                )));
            }
        }
        Ok(())
    }

    fn validate_config(&self, meta: &DatasetMeta) -> DatasetResult<()> {
        match (self.source, &meta.lens) {
            (Source::Datasets, Some(_)) => Err(DatasetError::ValidationFailed(
                "plain datasets cannot carry a lens spec".into(),
            )),
            (Source::Lenses, None) => Err(DatasetError::ValidationFailed(
                "lens datasets require a lens spec".into(),
            )),
            (Source::Lenses, Some(lens)) => {
                if lens.map_source.trim().is_empty() {
                    return Err(DatasetError::ValidationFailed(
                        "lens map function is empty".into(),
                    ));
                }
                if lens.inputs.is_empty() {
                    return Err(DatasetError::ValidationFailed(
                        "lens needs at least one input".into(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn validate_record(&self, id: &str, _value: &StructuredValue) -> DatasetResult<()> {
        if id.is_empty() {
            return Err(DatasetError::ValidationFailed(
                "record id must not be empty".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Record writes
    // -----------------------------------------------------------------------

    /// Write a batch of record entries in one new version.
    ///
    /// `None` payloads delete; for each written payload every referenced
    /// attachment must already exist ([`DatasetError::MissingAttachments`]
    /// otherwise) and gets this record registered as a linker before the
    /// meta commits. With `overwrite`, records not named in `entries` are
    /// dropped from the dataset.
    pub fn write_entries(
        &self,
        user: &str,
        name: &str,
        entries: Vec<(String, Option<StructuredValue>)>,
        overwrite: bool,
    ) -> DatasetResult<DatasetMeta> {
        self.write_entries_with(user, name, entries, overwrite, |_| Ok(()))
    }

    /// [`Self::write_entries`] plus an extra mutation folded into the
    /// same version (the lens engine commits outputs and its build
    /// bookkeeping in one transition).
    pub fn write_entries_with<P>(
        &self,
        user: &str,
        name: &str,
        entries: Vec<(String, Option<StructuredValue>)>,
        overwrite: bool,
        post: P,
    ) -> DatasetResult<DatasetMeta>
    where
        P: FnOnce(&mut DatasetMeta) -> DatasetResult<()>,
    {
        let objects = self.object_store(user, name)?;
        let (old, new) = self.update_meta_inner(user, name, |draft| {
            let mut touched: BTreeSet<String> = BTreeSet::new();
            for (id, payload) in &entries {
                match payload {
                    None => {
                        draft.records.remove(id);
                        touched.insert(id.clone());
                    }
                    Some(value) => {
                        self.validate_record(id, value)?;
                        let links = value.hash_urls();
                        let missing: Vec<String> = links
                            .iter()
                            .filter(|url| !self.attachments.has(&url.hash()))
                            .map(|url| url.to_string())
                            .collect();
                        if !missing.is_empty() {
                            return Err(DatasetError::MissingAttachments(missing));
                        }
                        let record_path =
                            DatasetPath::record(self.source, user, name, id.clone());
                        for url in &links {
                            self.attachments
                                .link(&url.hash(), std::slice::from_ref(&record_path))?;
                        }
                        let hash = objects.write(value)?;
                        let changed = draft.records.get(id).map_or(true, |r| r.hash != hash);
                        if changed {
                            draft.records.insert(
                                id.clone(),
                                RecordMeta {
                                    hash,
                                    links: links.iter().map(|url| url.to_string()).collect(),
                                    version: 0,
                                },
                            );
                        }
                        touched.insert(id.clone());
                    }
                }
            }
            if overwrite {
                draft.records.retain(|id, _| touched.contains(id));
            }
            post(draft)
        })?;
        self.validate_departed_attachments(&old, &new);
        Ok(new)
    }

    /// Merge records into the dataset (existing records untouched).
    pub fn merge(
        &self,
        user: &str,
        name: &str,
        records: BTreeMap<String, StructuredValue>,
    ) -> DatasetResult<DatasetMeta> {
        let entries = records.into_iter().map(|(id, v)| (id, Some(v))).collect();
        self.write_entries(user, name, entries, false)
    }

    /// Replace the dataset's records wholesale.
    pub fn overwrite(
        &self,
        user: &str,
        name: &str,
        records: BTreeMap<String, StructuredValue>,
    ) -> DatasetResult<DatasetMeta> {
        let entries = records.into_iter().map(|(id, v)| (id, Some(v))).collect();
        self.write_entries(user, name, entries, true)
    }

    /// Write one record.
    pub fn write(
        &self,
        user: &str,
        name: &str,
        id: &str,
        value: StructuredValue,
    ) -> DatasetResult<DatasetMeta> {
        self.write_entries(user, name, vec![(id.to_string(), Some(value))], false)
    }

    /// Delete one record. Fails with `NotFound` if the record is absent.
    pub fn delete_record(&self, user: &str, name: &str, id: &str) -> DatasetResult<DatasetMeta> {
        let (old, new) = self.update_meta_inner(user, name, |draft| {
            if draft.records.remove(id).is_none() {
                return Err(DatasetError::NotFound(
                    DatasetPath::record(self.source, user, name, id).to_string(),
                ));
            }
            Ok(())
        })?;
        self.validate_departed_attachments(&old, &new);
        Ok(new)
    }

    /// Re-validate attachments whose last reference from this dataset
    /// disappeared in the transition `old` -> `new`.
    fn validate_departed_attachments(&self, old: &DatasetMeta, new: &DatasetMeta) {
        let still_referenced = new.attachment_hashes();
        for hash in old.attachment_hashes() {
            if still_referenced.contains(&hash) {
                continue;
            }
            if let Err(err) = self.attachments.validate(&hash) {
                warn!(hash = %hash.short_hex(), %err, "attachment validate failed after record change");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read one record's payload. `Ok(None)` for a missing record in an
    /// existing dataset.
    pub fn read(
        &self,
        user: &str,
        name: &str,
        id: &str,
    ) -> DatasetResult<Option<StructuredValue>> {
        let meta = self.read_meta(user, name)?;
        let Some(record) = meta.records.get(id) else {
            return Ok(None);
        };
        Ok(Some(self.object_store(user, name)?.read(&record.hash)?))
    }

    /// Read one record's metadata. `Ok(None)` for a missing record.
    pub fn record_meta(
        &self,
        user: &str,
        name: &str,
        id: &str,
    ) -> DatasetResult<Option<RecordMeta>> {
        Ok(self.read_meta(user, name)?.records.get(id).cloned())
    }

    /// Iterate the records of a dataset in id order. The iterator is
    /// detached from storage, so consumers may stop early freely.
    pub fn iterate(
        &self,
        user: &str,
        name: &str,
    ) -> DatasetResult<impl Iterator<Item = (String, RecordMeta)>> {
        Ok(self.read_meta(user, name)?.records.into_iter())
    }

    /// Names of this user's datasets, sorted.
    pub fn list(&self, user: &str) -> DatasetResult<Vec<String>> {
        Ok(self.files.iterate_folders(&[self.source.as_str(), user])?)
    }

    /// Every user owning at least one dataset in this source, sorted.
    pub fn users(&self) -> DatasetResult<Vec<String>> {
        Ok(self.files.iterate_folders(&[self.source.as_str()])?)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use optics_attach::{LinkSource, NewAttachment};
    use optics_codec::object_hash;
    use optics_store::LockManager;
    use optics_types::{HashUrl, SystemClock};

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        datasets: Collection,
        attachments: AttachmentStore,
        bus: UpdateBus,
    }

    /// LinkSource that resolves record links straight through a
    /// collection, standing in for the full read-path resolver.
    struct CollectionLinks(Collection);

    impl LinkSource for CollectionLinks {
        fn record_links(&self, path: &DatasetPath) -> Option<Vec<HashUrl>> {
            let record = path.record.as_deref()?;
            let meta = self
                .0
                .record_meta(&path.user, &path.name, record)
                .ok()
                .flatten()?;
            Some(meta.links.iter().filter_map(|link| link.parse().ok()).collect())
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(LockManager::new());
        let holds = HoldTable::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let files = Arc::new(FileStore::open(dir.path(), Arc::clone(&locks)).unwrap());
        let attachments = AttachmentStore::open(
            dir.path().join("attachments"),
            holds.clone(),
            Arc::clone(&locks),
            Arc::clone(&clock),
        )
        .unwrap();
        let bus = UpdateBus::default();
        let datasets = Collection::new(
            Source::Datasets,
            files,
            attachments.clone(),
            holds,
            bus.clone(),
            clock,
        )
        .unwrap();
        attachments.set_link_source(Arc::new(CollectionLinks(datasets.clone())));
        Fixture {
            _dir: dir,
            datasets,
            attachments,
            bus,
        }
    }

    fn memo_config(text: &str) -> BTreeMap<String, StructuredValue> {
        BTreeMap::from([("memo".to_string(), StructuredValue::Text(text.into()))])
    }

    fn title(text: &str) -> StructuredValue {
        StructuredValue::Map(BTreeMap::from([(
            "title".to_string(),
            StructuredValue::Text(text.into()),
        )]))
    }

    // -----------------------------------------------------------------------
    // Create / read / write (scenario S1)
    // -----------------------------------------------------------------------

    #[test]
    fn create_write_read_back() {
        let fx = fixture();
        let meta = fx
            .datasets
            .create("alice", "songs", memo_config("x"), None)
            .unwrap();
        assert_eq!(meta.version, 0);

        let meta = fx
            .datasets
            .write("alice", "songs", "a", title("A"))
            .unwrap();
        assert_eq!(meta.version, 1);

        let read_back = fx.datasets.read("alice", "songs", "a").unwrap().unwrap();
        assert_eq!(read_back, title("A"));

        let meta = fx.datasets.read_meta("alice", "songs").unwrap();
        let record = &meta.records["a"];
        assert_eq!(record.version, 1);
        assert!(record.links.is_empty());
        assert_eq!(record.hash, object_hash(&title("A")).unwrap());
    }

    #[test]
    fn create_twice_is_already_exists() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        assert!(matches!(
            fx.datasets.create("alice", "songs", BTreeMap::new(), None),
            Err(DatasetError::AlreadyExists(_))
        ));
    }

    #[test]
    fn read_missing_dataset_is_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.datasets.read_meta("nobody", "nothing"),
            Err(DatasetError::NotFound(_))
        ));
    }

    #[test]
    fn read_missing_record_is_none() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        assert!(fx.datasets.read("alice", "songs", "ghost").unwrap().is_none());
    }

    // -----------------------------------------------------------------------
    // Versioning
    // -----------------------------------------------------------------------

    #[test]
    fn versions_strictly_increase() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        let mut last = 0;
        for i in 0..5 {
            let meta = fx
                .datasets
                .write("alice", "songs", "a", StructuredValue::Integer(i))
                .unwrap();
            assert_eq!(meta.version, last + 1);
            last = meta.version;
        }
    }

    #[test]
    fn failed_update_leaves_dataset_unchanged() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        fx.datasets.write("alice", "songs", "a", title("A")).unwrap();
        let before = fx.datasets.read_meta("alice", "songs").unwrap();

        let result = fx.datasets.update_meta("alice", "songs", |_| {
            Err(DatasetError::ValidationFailed("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(fx.datasets.read_meta("alice", "songs").unwrap(), before);
    }

    #[test]
    fn unchanged_payload_keeps_record_version() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        fx.datasets.write("alice", "songs", "a", title("A")).unwrap();
        let meta = fx.datasets.write("alice", "songs", "a", title("A")).unwrap();
        // Dataset version advanced, record version did not.
        assert_eq!(meta.version, 2);
        assert_eq!(meta.records["a"].version, 1);
    }

    // -----------------------------------------------------------------------
    // GC retention (scenario S4, invariant 4)
    // -----------------------------------------------------------------------

    #[test]
    fn record_blobs_exist_for_current_meta() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        fx.datasets.write("alice", "songs", "a", title("A")).unwrap();
        fx.datasets.write("alice", "songs", "b", title("B")).unwrap();

        let meta = fx.datasets.read_meta("alice", "songs").unwrap();
        let objects = fx.datasets.object_store("alice", "songs").unwrap();
        for record in meta.records.values() {
            assert!(objects.exists(&record.hash));
        }
    }

    #[test]
    fn overwrite_drops_other_records_and_collects_objects() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        for id in ["a", "b", "c"] {
            fx.datasets
                .write("alice", "songs", id, title(id))
                .unwrap();
        }
        let old_b = object_hash(&title("b")).unwrap();

        let meta = fx
            .datasets
            .overwrite(
                "alice",
                "songs",
                BTreeMap::from([("a".to_string(), title("fresh"))]),
            )
            .unwrap();
        assert_eq!(meta.records.len(), 1);
        assert!(meta.records.contains_key("a"));

        let objects = fx.datasets.object_store("alice", "songs").unwrap();
        assert!(!objects.exists(&old_b));
        assert!(objects.exists(&meta.records["a"].hash));
    }

    #[test]
    fn rewrite_collects_superseded_object() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        fx.datasets.write("alice", "songs", "a", title("old")).unwrap();
        let old_hash = object_hash(&title("old")).unwrap();
        fx.datasets.write("alice", "songs", "a", title("new")).unwrap();

        let objects = fx.datasets.object_store("alice", "songs").unwrap();
        assert!(!objects.exists(&old_hash));
    }

    // -----------------------------------------------------------------------
    // Attachments (scenarios S2, S3)
    // -----------------------------------------------------------------------

    #[test]
    fn missing_attachment_rejects_write() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        let absent = HashUrl::new(Hash::digest(b"nope"));
        let payload = StructuredValue::Map(BTreeMap::from([(
            "v".to_string(),
            StructuredValue::Url(absent.clone()),
        )]));

        let err = fx
            .datasets
            .write("alice", "songs", "k", payload)
            .unwrap_err();
        match err {
            DatasetError::MissingAttachments(urls) => {
                assert_eq!(urls, vec![absent.to_string()]);
            }
            other => panic!("expected MissingAttachments, got {other}"),
        }
        // Version unchanged.
        assert_eq!(fx.datasets.read_meta("alice", "songs").unwrap().version, 0);
    }

    #[test]
    fn attachment_lifecycle_through_record_versions() {
        let fx = fixture();
        fx.datasets
            .create("u", "n", BTreeMap::new(), None)
            .unwrap();
        let (hash, hold) = fx
            .attachments
            .write(b"hello", NewAttachment::default())
            .unwrap();

        let payload = StructuredValue::Map(BTreeMap::from([(
            "video".to_string(),
            StructuredValue::Url(HashUrl::new(hash)),
        )]));
        fx.datasets.write("u", "n", "k", payload).unwrap();

        // The record write registered a linker.
        let meta = fx.attachments.read_meta(&hash).unwrap().unwrap();
        assert!(meta.linkers.contains("datasets/u/n/k"));

        // Hold released: linker still present, attachment survives.
        assert!(hold.release().unwrap());
        assert!(fx.attachments.has(&hash));

        // Record deleted: validate prunes the linker and collects.
        fx.datasets.delete_record("u", "n", "k").unwrap();
        assert!(!fx.attachments.has(&hash));
    }

    #[test]
    fn dataset_delete_releases_attachments() {
        let fx = fixture();
        fx.datasets
            .create("u", "n", BTreeMap::new(), None)
            .unwrap();
        let (hash, hold) = fx
            .attachments
            .write(b"payload", NewAttachment::default())
            .unwrap();
        let payload = StructuredValue::Map(BTreeMap::from([(
            "v".to_string(),
            StructuredValue::Url(HashUrl::new(hash)),
        )]));
        fx.datasets.write("u", "n", "k", payload).unwrap();
        hold.release().unwrap();

        fx.datasets.delete("u", "n").unwrap();
        assert!(!fx.datasets.exists("u", "n"));
        assert!(!fx.attachments.has(&hash));
    }

    // -----------------------------------------------------------------------
    // Concurrency (scenario S5, invariant 7)
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_merges_serialise_and_all_commit() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let datasets = fx.datasets.clone();
                thread::spawn(move || {
                    for i in 0..5 {
                        datasets
                            .merge(
                                "alice",
                                "songs",
                                BTreeMap::from([(
                                    format!("w{worker}-{i}"),
                                    StructuredValue::Integer(i),
                                )]),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let meta = fx.datasets.read_meta("alice", "songs").unwrap();
        assert_eq!(meta.version, 20);
        assert_eq!(meta.records.len(), 20);
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    #[test]
    fn mutations_publish_path_updated() {
        let fx = fixture();
        let mut stream = fx.bus.subscribe();

        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        let system = stream.try_recv().unwrap();
        assert_eq!(system.path, DatasetPath::system("datasets"));
        let created = stream.try_recv().unwrap();
        assert_eq!(created.path, fx.datasets.path("alice", "songs"));
        assert_eq!(created.version, 0);

        fx.datasets.write("alice", "songs", "a", title("A")).unwrap();
        let written = stream.try_recv().unwrap();
        assert_eq!(written.version, 1);
    }

    #[test]
    fn delete_publishes_system_event() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        let mut stream = fx.bus.subscribe();
        fx.datasets.delete("alice", "songs").unwrap();
        let event = stream.try_recv().unwrap();
        assert_eq!(event.path, DatasetPath::system("datasets"));
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    #[test]
    fn list_and_users() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        fx.datasets
            .create("alice", "films", BTreeMap::new(), None)
            .unwrap();
        fx.datasets
            .create("bob", "notes", BTreeMap::new(), None)
            .unwrap();

        assert_eq!(fx.datasets.users().unwrap(), vec!["alice", "bob"]);
        assert_eq!(fx.datasets.list("alice").unwrap(), vec!["films", "songs"]);
        assert!(fx.datasets.list("carol").unwrap().is_empty());
    }

    #[test]
    fn iterate_stops_early_without_issue() {
        let fx = fixture();
        fx.datasets
            .create("alice", "songs", BTreeMap::new(), None)
            .unwrap();
        for id in ["a", "b", "c"] {
            fx.datasets.write("alice", "songs", id, title(id)).unwrap();
        }
        let first = fx
            .datasets
            .iterate("alice", "songs")
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(first.0, "a");
    }

    // -----------------------------------------------------------------------
    // Config validation
    // -----------------------------------------------------------------------

    #[test]
    fn plain_dataset_rejects_lens_spec() {
        let fx = fixture();
        let lens = LensSpec::new("code", vec![fx.datasets.path("u", "in")]);
        assert!(matches!(
            fx.datasets
                .create("alice", "bad", BTreeMap::new(), Some(lens)),
            Err(DatasetError::ValidationFailed(_))
        ));
    }
}
