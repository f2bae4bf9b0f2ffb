use std::collections::BTreeMap;
use std::fmt;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::url::HashUrl;

/// The canonical recursive document value.
///
/// Every record payload, config entry, and lens output is a
/// `StructuredValue`. The variants cover the full data model: primitives,
/// byte strings distinct from text, ordered sequences, string-keyed
/// mappings, millisecond timestamps, and [`HashUrl`] attachment references.
///
/// Mappings use `BTreeMap`, so keys are always in natural string order —
/// the ordering the canonical codec requires. Because the tree is owned,
/// cyclic values are unrepresentable.
#[derive(Clone, Debug, PartialEq)]
pub enum StructuredValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Sequence(Vec<StructuredValue>),
    Map(BTreeMap<String, StructuredValue>),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// An attachment reference.
    Url(HashUrl),
}

impl StructuredValue {
    /// Variant name, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Sequence(_) => "sequence",
            Self::Map(_) => "map",
            Self::Timestamp(_) => "timestamp",
            Self::Url(_) => "hash-url",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, StructuredValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[StructuredValue]> {
        match self {
            Self::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// Map lookup; `None` for non-maps or missing keys.
    pub fn get(&self, key: &str) -> Option<&StructuredValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Every [`HashUrl`] referenced anywhere within this value, in
    /// depth-first order, deduplicated.
    ///
    /// Both [`StructuredValue::Url`] variants and text values that parse
    /// as hash URLs count as references.
    pub fn hash_urls(&self) -> Vec<HashUrl> {
        let mut out = Vec::new();
        self.collect_hash_urls(&mut out);
        let mut seen = std::collections::HashSet::new();
        out.retain(|url| seen.insert(url.clone()));
        out
    }

    fn collect_hash_urls(&self, out: &mut Vec<HashUrl>) {
        match self {
            Self::Url(url) => out.push(url.clone()),
            Self::Text(s) if HashUrl::is_hash_url(s) => {
                if let Ok(url) = s.parse() {
                    out.push(url);
                }
            }
            Self::Sequence(items) => {
                for item in items {
                    item.collect_hash_urls(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_hash_urls(out);
                }
            }
            _ => {}
        }
    }
}

/// Render an epoch-ms timestamp as RFC 3339 with millisecond precision.
pub fn format_timestamp(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Parse an RFC 3339 timestamp into epoch milliseconds.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

impl From<bool> for StructuredValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for StructuredValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<f64> for StructuredValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for StructuredValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for StructuredValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<HashUrl> for StructuredValue {
    fn from(url: HashUrl) -> Self {
        Self::Url(url)
    }
}

impl From<Vec<StructuredValue>> for StructuredValue {
    fn from(items: Vec<StructuredValue>) -> Self {
        Self::Sequence(items)
    }
}

impl From<BTreeMap<String, StructuredValue>> for StructuredValue {
    fn from(entries: BTreeMap<String, StructuredValue>) -> Self {
        Self::Map(entries)
    }
}

// ---------------------------------------------------------------------------
// Serde: the "wrapper" conventions
// ---------------------------------------------------------------------------
//
// Byte strings and timestamps have no representation in plain JSON, so the
// serde form uses recognised wrapper objects:
//
//   bytes      {"type": "Buffer", "data": [..]}   (or base64 text data)
//   timestamp  {"type": "Date",   "value": "<rfc3339>"}
//   hash url   plain string "hash://sha256/.."
//
// Every serde-family codec (JSON, YAML, MessagePack) and the on-disk
// metadata encoding share these conventions. The canonical CBOR codec does
// NOT go through serde — it has its own conversion with real byte strings
// and tag-0 timestamps.

impl Serialize for StructuredValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(n) => serializer.serialize_i64(*n),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Url(url) => serializer.serialize_str(&url.to_string()),
            Self::Bytes(bytes) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "Buffer")?;
                map.serialize_entry("data", bytes)?;
                map.end()
            }
            Self::Timestamp(ms) => {
                let rendered = format_timestamp(*ms)
                    .ok_or_else(|| serde::ser::Error::custom("timestamp out of range"))?;
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "Date")?;
                map.serialize_entry("value", &rendered)?;
                map.end()
            }
            Self::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

/// Recognise the wrapper shapes after a map has been collected.
fn from_map(entries: BTreeMap<String, StructuredValue>) -> StructuredValue {
    match entries.get("type").and_then(StructuredValue::as_str) {
        Some("Buffer") => {
            if let Some(bytes) = buffer_data(&entries) {
                return StructuredValue::Bytes(bytes);
            }
        }
        Some("Date") => {
            if let Some(ms) = entries
                .get("value")
                .and_then(StructuredValue::as_str)
                .and_then(parse_timestamp)
            {
                return StructuredValue::Timestamp(ms);
            }
        }
        _ => {}
    }
    StructuredValue::Map(entries)
}

fn buffer_data(entries: &BTreeMap<String, StructuredValue>) -> Option<Vec<u8>> {
    match entries.get("data")? {
        StructuredValue::Sequence(items) => items
            .iter()
            .map(|item| {
                item.as_i64()
                    .and_then(|n| u8::try_from(n).ok())
            })
            .collect(),
        StructuredValue::Text(encoded) => BASE64_STANDARD.decode(encoded).ok(),
        StructuredValue::Bytes(bytes) => Some(bytes.clone()),
        _ => None,
    }
}

impl<'de> Deserialize<'de> for StructuredValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = StructuredValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("any structured value")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(StructuredValue::Null)
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(StructuredValue::Null)
            }

            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
                d.deserialize_any(ValueVisitor)
            }

            fn visit_bool<E>(self, b: bool) -> Result<Self::Value, E> {
                Ok(StructuredValue::Bool(b))
            }

            fn visit_i64<E>(self, n: i64) -> Result<Self::Value, E> {
                Ok(StructuredValue::Integer(n))
            }

            fn visit_u64<E: de::Error>(self, n: u64) -> Result<Self::Value, E> {
                i64::try_from(n)
                    .map(StructuredValue::Integer)
                    .map_err(|_| E::custom("integer out of range"))
            }

            fn visit_f64<E>(self, f: f64) -> Result<Self::Value, E> {
                Ok(StructuredValue::Float(f))
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E> {
                if HashUrl::is_hash_url(s) {
                    if let Ok(url) = s.parse() {
                        return Ok(StructuredValue::Url(url));
                    }
                }
                Ok(StructuredValue::Text(s.to_string()))
            }

            fn visit_string<E>(self, s: String) -> Result<Self::Value, E> {
                if HashUrl::is_hash_url(&s) {
                    if let Ok(url) = s.parse() {
                        return Ok(StructuredValue::Url(url));
                    }
                }
                Ok(StructuredValue::Text(s))
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E> {
                Ok(StructuredValue::Bytes(bytes.to_vec()))
            }

            fn visit_byte_buf<E>(self, bytes: Vec<u8>) -> Result<Self::Value, E> {
                Ok(StructuredValue::Bytes(bytes))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(StructuredValue::Sequence(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, StructuredValue>()? {
                    entries.insert(key, value);
                }
                Ok(from_map(entries))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}
