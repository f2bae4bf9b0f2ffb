//! Read-path resolution.
//!
//! [`ReadPath`] turns `source/user/name[/record]` addresses into record
//! metadata and payloads, across both dataset families and the read-only
//! virtual `meta` source (`meta/system/system/<kind>` enumerates users,
//! datasets, and lenses).
//!
//! It also implements the attachment store's [`LinkSource`] seam: the GC
//! oracle re-walks attachment linkers through [`ReadPath::record_links`],
//! which never attempts resolution for system paths — their entries
//! deliberately carry no content hash.

use std::collections::BTreeMap;

use optics_attach::LinkSource;
use optics_dataset::{Collection, DatasetError};
use optics_types::{DatasetPath, Hash, HashUrl, Source, StructuredValue};

/// Errors from path resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The path does not resolve to anything.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path is well-formed but not readable this way (e.g. reading a
    /// whole dataset as a value).
    #[error("unsupported path: {0}")]
    Unsupported(String),

    /// Failure in the dataset layer.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Result alias for resolution.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// What a path resolved to.
///
/// System entries carry `hash: None` — their identities are names, not
/// content digests — and never carry links.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordPointer {
    pub path: DatasetPath,
    pub version: u64,
    pub hash: Option<Hash>,
    pub links: Vec<String>,
}

/// Per-path outcome of a bulk [`ReadPath::meta`] resolution. An error on
/// one path never aborts the others.
#[derive(Debug)]
pub struct PathMeta {
    pub path: DatasetPath,
    pub result: ResolveResult<RecordPointer>,
}

/// The resolver over both collections.
#[derive(Clone, Debug)]
pub struct ReadPath {
    datasets: Collection,
    lenses: Collection,
}

impl ReadPath {
    pub fn new(datasets: Collection, lenses: Collection) -> Self {
        Self { datasets, lenses }
    }

    fn collection(&self, source: Source) -> Option<&Collection> {
        match source {
            Source::Datasets => Some(&self.datasets),
            Source::Lenses => Some(&self.lenses),
            Source::Meta => None,
        }
    }

    /// Resolve a batch of paths lazily; consumers may stop early.
    pub fn meta<'a>(
        &'a self,
        paths: &'a [DatasetPath],
    ) -> impl Iterator<Item = PathMeta> + 'a {
        paths.iter().map(|path| PathMeta {
            path: path.clone(),
            result: self.resolve(path),
        })
    }

    /// Resolve one path to a pointer.
    pub fn resolve(&self, path: &DatasetPath) -> ResolveResult<RecordPointer> {
        if path.is_system() {
            return self.resolve_system(path);
        }
        let collection = self
            .collection(path.source)
            .expect("non-system source always has a collection");
        let meta = collection.read_meta(&path.user, &path.name)?;
        match path.record.as_deref() {
            None => Ok(RecordPointer {
                path: path.clone(),
                version: meta.version,
                hash: None,
                links: Vec::new(),
            }),
            Some(record) => {
                let record_meta = meta
                    .records
                    .get(record)
                    .ok_or_else(|| ResolveError::NotFound(path.to_string()))?;
                Ok(RecordPointer {
                    path: path.clone(),
                    version: record_meta.version,
                    hash: Some(record_meta.hash),
                    links: record_meta.links.clone(),
                })
            }
        }
    }

    fn resolve_system(&self, path: &DatasetPath) -> ResolveResult<RecordPointer> {
        let kind = self.system_kind(path)?;
        Ok(RecordPointer {
            path: DatasetPath::system(kind),
            version: 0,
            hash: None,
            links: Vec::new(),
        })
    }

    fn system_kind(&self, path: &DatasetPath) -> ResolveResult<&'static str> {
        if path.user != "system" || path.name != "system" {
            return Err(ResolveError::NotFound(path.to_string()));
        }
        match path.record.as_deref() {
            Some("users") => Ok("users"),
            Some("datasets") => Ok("datasets"),
            Some("lenses") => Ok("lenses"),
            _ => Err(ResolveError::NotFound(path.to_string())),
        }
    }

    /// Read the value a path points at.
    ///
    /// Record paths return the stored payload; system paths return the
    /// enumerated collection; dataset-level paths are not readable as
    /// values.
    pub fn read(&self, path: &DatasetPath) -> ResolveResult<StructuredValue> {
        if path.is_system() {
            return self.read_system(path);
        }
        let Some(record) = path.record.as_deref() else {
            return Err(ResolveError::Unsupported(path.to_string()));
        };
        let collection = self
            .collection(path.source)
            .expect("non-system source always has a collection");
        collection
            .read(&path.user, &path.name, record)?
            .ok_or_else(|| ResolveError::NotFound(path.to_string()))
    }

    fn read_system(&self, path: &DatasetPath) -> ResolveResult<StructuredValue> {
        match self.system_kind(path)? {
            "users" => {
                let mut users = self.datasets.users()?;
                users.extend(self.lenses.users()?);
                users.sort();
                users.dedup();
                Ok(StructuredValue::Sequence(
                    users.into_iter().map(StructuredValue::Text).collect(),
                ))
            }
            kind => {
                let collection = if kind == "datasets" {
                    &self.datasets
                } else {
                    &self.lenses
                };
                let mut listing = BTreeMap::new();
                for user in collection.users()? {
                    let names = collection.list(&user)?;
                    listing.insert(
                        user,
                        StructuredValue::Sequence(
                            names.into_iter().map(StructuredValue::Text).collect(),
                        ),
                    );
                }
                Ok(StructuredValue::Map(listing))
            }
        }
    }

    /// `true` if the path resolves.
    pub fn exists(&self, path: &DatasetPath) -> bool {
        self.resolve(path).is_ok()
    }

    /// Full dataset metadata for a non-system path (record component
    /// ignored).
    pub fn dataset_meta(
        &self,
        path: &DatasetPath,
    ) -> ResolveResult<optics_dataset::DatasetMeta> {
        let collection = self
            .collection(path.source)
            .ok_or_else(|| ResolveError::Unsupported(path.to_string()))?;
        Ok(collection.read_meta(&path.user, &path.name)?)
    }
}

impl LinkSource for ReadPath {
    fn record_links(&self, path: &DatasetPath) -> Option<Vec<HashUrl>> {
        // System entries have name-shaped identities, never attachments.
        if path.is_system() {
            return None;
        }
        let record = path.record.as_deref()?;
        let collection = self.collection(path.source)?;
        let meta = collection
            .record_meta(&path.user, &path.name, record)
            .ok()
            .flatten()?;
        Some(
            meta.links
                .iter()
                .filter_map(|link| link.parse().ok())
                .collect(),
        )
    }
}
