use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cbor::CborCodec;
use crate::json::JsonCodec;
use crate::lines::JsonLinesCodec;
use crate::msgpack::MsgpackCodec;
use crate::xml::XmlCodec;
use crate::yaml::YamlCodec;
use crate::Codec;

/// Lookup table over the installed codecs.
///
/// The canonical codec is always CBOR and always first; the registry is
/// open — additional codecs can be pushed for export formats.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// The standard registry: CBOR (canonical), JSON, JSON-Lines,
    /// MessagePack, YAML, XML.
    pub fn standard() -> Self {
        Self {
            codecs: vec![
                Arc::new(CborCodec),
                Arc::new(JsonCodec),
                Arc::new(JsonLinesCodec),
                Arc::new(MsgpackCodec),
                Arc::new(YamlCodec),
                Arc::new(XmlCodec),
            ],
        }
    }

    /// Register an additional codec.
    pub fn push(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.push(codec);
    }

    /// The canonical codec. Only this codec may influence object hashes.
    pub fn canonical(&self) -> &Arc<dyn Codec> {
        &self.codecs[0]
    }

    /// All installed codecs.
    pub fn all(&self) -> &[Arc<dyn Codec>] {
        &self.codecs
    }

    /// Resolve a query to a codec.
    ///
    /// Accepts a media type (parameters after `;` are ignored), a file
    /// extension (with or without the leading dot), or a full filename
    /// (the part after the last dot is used).
    pub fn for_query(&self, query: &str) -> Option<&Arc<dyn Codec>> {
        let query = query.trim();
        if query.contains('/') {
            let media = query.split(';').next().unwrap_or(query).trim();
            return self.by_media_type(media);
        }
        let ext = match query.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => query,
        };
        self.by_extension(ext)
    }

    fn by_media_type(&self, media: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs
            .iter()
            .find(|codec| codec.media_types().iter().any(|m| m.eq_ignore_ascii_case(media)))
    }

    fn by_extension(&self, ext: &str) -> Option<&Arc<dyn Codec>> {
        self.codecs
            .iter()
            .find(|codec| codec.extensions().iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// Derived table: media type -> codec name.
    pub fn media_type_handlers(&self) -> BTreeMap<&'static str, &'static str> {
        self.codecs
            .iter()
            .flat_map(|codec| {
                codec
                    .media_types()
                    .iter()
                    .map(move |media| (*media, codec.name()))
            })
            .collect()
    }

    /// Derived table: extension -> codec name.
    pub fn extension_handlers(&self) -> BTreeMap<&'static str, &'static str> {
        self.codecs
            .iter()
            .flat_map(|codec| {
                codec
                    .extensions()
                    .iter()
                    .map(move |ext| (*ext, codec.name()))
            })
            .collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.codecs.iter().map(|c| c.name()).collect();
        f.debug_struct("CodecRegistry").field("codecs", &names).finish()
    }
}
