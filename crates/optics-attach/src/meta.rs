use std::collections::{BTreeMap, BTreeSet};

use optics_types::StructuredValue;
use serde::{Deserialize, Serialize};

/// Per-attachment metadata, stored beside the blob.
///
/// `linkers` is the set of dataset record paths (slash form,
/// `source/user/name/record`) whose payloads currently reference this
/// attachment. User-supplied metadata rides along in `extra`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// Creation time, epoch milliseconds.
    pub created: i64,
    /// Last update time, epoch milliseconds.
    pub updated: i64,
    /// Record paths referencing this attachment.
    pub linkers: BTreeSet<String>,
    /// Arbitrary caller metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, StructuredValue>,
}

impl AttachmentMeta {
    /// Merge a later write into existing metadata: `created` is kept,
    /// `updated` advances, linkers union, and new extra entries win.
    pub fn merge(mut self, linkers: BTreeSet<String>, extra: BTreeMap<String, StructuredValue>, now: i64) -> Self {
        self.updated = now;
        self.linkers.extend(linkers);
        self.extra.extend(extra);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unions_linkers_and_keeps_created() {
        let first = AttachmentMeta {
            created: 100,
            updated: 100,
            linkers: BTreeSet::from(["datasets/a/n/r1".to_string()]),
            extra: BTreeMap::from([("memo".to_string(), StructuredValue::Integer(1))]),
        };
        let merged = first.merge(
            BTreeSet::from(["datasets/a/n/r2".to_string()]),
            BTreeMap::from([("memo".to_string(), StructuredValue::Integer(2))]),
            200,
        );
        assert_eq!(merged.created, 100);
        assert_eq!(merged.updated, 200);
        assert_eq!(merged.linkers.len(), 2);
        // Later extra values win.
        assert_eq!(merged.extra["memo"], StructuredValue::Integer(2));
    }
}
