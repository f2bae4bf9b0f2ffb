use std::collections::{BTreeMap, BTreeSet, HashSet};

use optics_types::{DatasetPath, Hash, HashUrl, StructuredValue};
use serde::{Deserialize, Serialize};

/// Metadata for one record within a dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Object hash of the stored payload.
    pub hash: Hash,
    /// Every `hash://` URL referenced anywhere within the payload,
    /// extracted at write time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    /// The dataset version at which this record was last written.
    #[serde(default)]
    pub version: u64,
}

impl RecordMeta {
    /// The attachment hashes referenced by this record.
    pub fn link_hashes(&self) -> impl Iterator<Item = Hash> + '_ {
        self.links
            .iter()
            .filter_map(|link| link.parse::<HashUrl>().ok())
            .map(|url| url.hash())
    }
}

/// A user-code fault captured during a lens build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SandboxFault {
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

/// Outcome of mapping one changed input record during a lens build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildLogEntry {
    /// The input record path (slash form).
    pub input: String,
    /// When the record was mapped, epoch milliseconds.
    pub mapped_at: i64,
    /// Console output captured from the sandbox.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    /// The fault, if the map function threw for this input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxFault>,
}

/// Lens declaration plus build bookkeeping, carried inside the lens
/// dataset's metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LensSpec {
    /// Source code of the user map function.
    pub map_source: String,
    /// Input dataset paths the lens derives from.
    pub inputs: Vec<DatasetPath>,
    /// Extra datasets readable (but not diffed) during mapping.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DatasetPath>,
    /// Highest input version already processed, per input path. Events
    /// at or below these versions are ignored.
    #[serde(default)]
    pub last_processed: BTreeMap<String, u64>,
    /// Record-id -> payload hash per input, as of the last completed
    /// build. The next build diffs against this to find changed records.
    #[serde(default)]
    pub fingerprints: BTreeMap<String, BTreeMap<String, Hash>>,
    /// Output record id -> the input record keys that produced it. Used
    /// to drop outputs whose every producer disappeared.
    #[serde(default)]
    pub reverse_index: BTreeMap<String, BTreeSet<String>>,
    /// Per-input outcomes of the most recent build.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_log: Vec<BuildLogEntry>,
}

impl LensSpec {
    pub fn new(map_source: impl Into<String>, inputs: Vec<DatasetPath>) -> Self {
        Self {
            map_source: map_source.into(),
            inputs,
            dependencies: Vec::new(),
            last_processed: BTreeMap::new(),
            fingerprints: BTreeMap::new(),
            reverse_index: BTreeMap::new(),
            build_log: Vec::new(),
        }
    }
}

/// Metadata for one dataset: version counter, timestamps, config, and the
/// ordered record map. Lens datasets additionally carry a [`LensSpec`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    /// Strictly increases on every mutation.
    pub version: u64,
    /// Creation time, epoch milliseconds.
    pub created: i64,
    /// Last mutation time, epoch milliseconds.
    pub updated: i64,
    /// Arbitrary per-dataset configuration (memo, validators, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, StructuredValue>,
    /// Records, ordered by natural string comparison of their IDs.
    #[serde(default)]
    pub records: BTreeMap<String, RecordMeta>,
    /// Present iff this dataset is a lens output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens: Option<LensSpec>,
}

impl DatasetMeta {
    /// Fresh metadata at version zero.
    pub fn new(now: i64, config: BTreeMap<String, StructuredValue>) -> Self {
        Self {
            version: 0,
            created: now,
            updated: now,
            config,
            records: BTreeMap::new(),
            lens: None,
        }
    }

    /// Every payload object hash referenced by the current records.
    pub fn record_hashes(&self) -> HashSet<Hash> {
        self.records.values().map(|record| record.hash).collect()
    }

    /// Every attachment hash referenced by the current records.
    pub fn attachment_hashes(&self) -> HashSet<Hash> {
        self.records
            .values()
            .flat_map(|record| record.link_hashes())
            .collect()
    }
}
