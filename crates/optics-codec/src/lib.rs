//! Multi-format serialization for Pigeon Optics.
//!
//! Every record payload is a [`StructuredValue`]; this crate normalises it
//! across wire formats so that content hashes are stable no matter which
//! representation a client used.
//!
//! # Codecs
//!
//! - [`CborCodec`] — the **canonical** codec. Deterministic CBOR: map keys
//!   sorted lexicographically, shortest integer forms, definite lengths,
//!   timestamps as tag 0. All object hashing goes through this codec and
//!   no other codec may influence a hash.
//! - [`JsonCodec`] / [`JsonLinesCodec`] — JSON with the Buffer/Date
//!   wrapper conventions for bytes and timestamps.
//! - [`MsgpackCodec`], [`YamlCodec`], [`XmlCodec`] — interchange formats
//!   following their native conventions; never canonical.
//!
//! # Lookup
//!
//! [`CodecRegistry::for_query`] resolves a media type (with or without
//! `;parameters`), a bare file extension, or a full filename to a codec.

pub mod cbor;
pub mod error;
pub mod json;
pub mod lines;
pub mod msgpack;
pub mod registry;
pub mod xml;
pub mod yaml;

pub use cbor::{object_hash, CborCodec};
pub use error::{CodecError, CodecResult};
pub use json::JsonCodec;
pub use lines::JsonLinesCodec;
pub use msgpack::MsgpackCodec;
pub use registry::CodecRegistry;
pub use xml::XmlCodec;
pub use yaml::YamlCodec;

use optics_types::StructuredValue;

/// A serialization format for structured values.
///
/// Implementations must round-trip losslessly: `decode(encode(v))` is
/// structurally equal to `v` for every value the format can express.
pub trait Codec: Send + Sync {
    /// Short format name (`"cbor"`, `"json"`, ...).
    fn name(&self) -> &'static str;

    /// Media types this codec handles, most specific first.
    fn media_types(&self) -> &'static [&'static str];

    /// File extensions this codec handles, without the leading dot.
    fn extensions(&self) -> &'static [&'static str];

    /// Encode one value.
    fn encode(&self, value: &StructuredValue) -> CodecResult<Vec<u8>>;

    /// Decode one value.
    fn decode(&self, bytes: &[u8]) -> CodecResult<StructuredValue>;

    /// Encode a sequence of `(record id, value)` entries for export.
    ///
    /// The default folds the entries into a single mapping document;
    /// line-oriented formats override this with a streaming-friendly
    /// shape.
    fn encode_entries(&self, entries: &[(String, StructuredValue)]) -> CodecResult<Vec<u8>> {
        let map = entries
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();
        self.encode(&StructuredValue::Map(map))
    }
}
