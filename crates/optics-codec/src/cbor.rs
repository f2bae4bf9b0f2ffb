use ciborium::value::{Integer, Value};
use optics_types::value::{format_timestamp, parse_timestamp};
use optics_types::{Hash, StructuredValue};

use crate::error::{CodecError, CodecResult};
use crate::Codec;

/// The canonical codec: deterministic CBOR.
///
/// Encoding rules: mapping keys emitted in lexicographic order (enforced by
/// `StructuredValue`'s `BTreeMap`), shortest integer forms and
/// definite-length items (ciborium's encoder), byte strings distinct from
/// text, timestamps as tag 0 RFC 3339 text. Hash URLs are plain text; they
/// are recognised by shape on decode.
///
/// All object hashing goes through this codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn media_types(&self) -> &'static [&'static str] {
        &["application/cbor"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["cbor"]
    }

    fn encode(&self, value: &StructuredValue) -> CodecResult<Vec<u8>> {
        canonical_encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<StructuredValue> {
        let raw: Value =
            ciborium::de::from_reader(bytes).map_err(CodecError::decode)?;
        from_cbor_value(raw)
    }
}

/// Canonical CBOR bytes for a value.
pub fn canonical_encode(value: &StructuredValue) -> CodecResult<Vec<u8>> {
    let raw = to_cbor_value(value)?;
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&raw, &mut buf).map_err(CodecError::encode)?;
    Ok(buf)
}

/// The hash of a structured value: SHA-256 over its canonical CBOR
/// encoding. Stable across every input representation.
pub fn object_hash(value: &StructuredValue) -> CodecResult<Hash> {
    Ok(Hash::digest(&canonical_encode(value)?))
}

/// Convert to the CBOR document model.
pub fn to_cbor_value(value: &StructuredValue) -> CodecResult<Value> {
    Ok(match value {
        StructuredValue::Null => Value::Null,
        StructuredValue::Bool(b) => Value::Bool(*b),
        StructuredValue::Integer(n) => Value::Integer(Integer::from(*n)),
        StructuredValue::Float(f) => Value::Float(*f),
        StructuredValue::Text(s) => Value::Text(s.clone()),
        StructuredValue::Url(url) => Value::Text(url.to_string()),
        StructuredValue::Bytes(bytes) => Value::Bytes(bytes.clone()),
        StructuredValue::Timestamp(ms) => {
            let rendered = format_timestamp(*ms)
                .ok_or_else(|| CodecError::Encode(format!("timestamp out of range: {ms}")))?;
            Value::Tag(0, Box::new(Value::Text(rendered)))
        }
        StructuredValue::Sequence(items) => Value::Array(
            items
                .iter()
                .map(to_cbor_value)
                .collect::<CodecResult<Vec<_>>>()?,
        ),
        StructuredValue::Map(entries) => Value::Map(
            // BTreeMap iteration gives the required lexicographic key order.
            entries
                .iter()
                .map(|(key, value)| Ok((Value::Text(key.clone()), to_cbor_value(value)?)))
                .collect::<CodecResult<Vec<_>>>()?,
        ),
    })
}

/// Convert from the CBOR document model.
pub fn from_cbor_value(raw: Value) -> CodecResult<StructuredValue> {
    Ok(match raw {
        Value::Null => StructuredValue::Null,
        Value::Bool(b) => StructuredValue::Bool(b),
        Value::Integer(n) => StructuredValue::Integer(
            i128::from(n)
                .try_into()
                .map_err(|_| CodecError::Decode("integer out of range".into()))?,
        ),
        Value::Float(f) => StructuredValue::Float(f),
        Value::Text(s) => text_value(s),
        Value::Bytes(bytes) => StructuredValue::Bytes(bytes),
        Value::Tag(0, inner) => match *inner {
            Value::Text(s) => StructuredValue::Timestamp(
                parse_timestamp(&s)
                    .ok_or_else(|| CodecError::Decode(format!("bad tag-0 timestamp: {s}")))?,
            ),
            other => {
                return Err(CodecError::Decode(format!(
                    "tag 0 must wrap text, got {other:?}"
                )))
            }
        },
        // Epoch timestamps (tag 1) are accepted on input.
        Value::Tag(1, inner) => match *inner {
            Value::Integer(n) => {
                let secs: i64 = i128::from(n)
                    .try_into()
                    .map_err(|_| CodecError::Decode("tag-1 timestamp out of range".into()))?;
                StructuredValue::Timestamp(secs * 1000)
            }
            Value::Float(f) => StructuredValue::Timestamp((f * 1000.0) as i64),
            other => {
                return Err(CodecError::Decode(format!(
                    "tag 1 must wrap a number, got {other:?}"
                )))
            }
        },
        Value::Tag(tag, _) => {
            return Err(CodecError::Decode(format!("unsupported CBOR tag {tag}")))
        }
        Value::Array(items) => StructuredValue::Sequence(
            items
                .into_iter()
                .map(from_cbor_value)
                .collect::<CodecResult<Vec<_>>>()?,
        ),
        Value::Map(pairs) => {
            let mut entries = std::collections::BTreeMap::new();
            for (key, value) in pairs {
                let Value::Text(key) = key else {
                    return Err(CodecError::Decode(format!(
                        "map keys must be text, got {key:?}"
                    )));
                };
                entries.insert(key, from_cbor_value(value)?);
            }
            StructuredValue::Map(entries)
        }
        other => {
            return Err(CodecError::Decode(format!(
                "unsupported CBOR item: {other:?}"
            )))
        }
    })
}

fn text_value(s: String) -> StructuredValue {
    if optics_types::HashUrl::is_hash_url(&s) {
        if let Ok(url) = s.parse() {
            return StructuredValue::Url(url);
        }
    }
    StructuredValue::Text(s)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use optics_types::HashUrl;

    use super::*;

    fn sample() -> StructuredValue {
        let mut map = BTreeMap::new();
        map.insert("title".into(), StructuredValue::Text("A".into()));
        map.insert("plays".into(), StructuredValue::Integer(42));
        map.insert("rating".into(), StructuredValue::Float(4.5));
        map.insert("raw".into(), StructuredValue::Bytes(vec![0, 1, 2]));
        map.insert("released".into(), StructuredValue::Timestamp(1_600_000_000_000));
        map.insert(
            "video".into(),
            StructuredValue::Url(HashUrl::new(Hash::digest(b"clip"))),
        );
        map.insert(
            "tags".into(),
            StructuredValue::Sequence(vec![
                StructuredValue::Text("x".into()),
                StructuredValue::Null,
                StructuredValue::Bool(true),
            ]),
        );
        StructuredValue::Map(map)
    }

    #[test]
    fn roundtrip_preserves_structure() {
        let value = sample();
        let codec = CborCodec;
        let bytes = codec.encode(&value).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn encoding_is_deterministic() {
        let value = sample();
        assert_eq!(
            canonical_encode(&value).unwrap(),
            canonical_encode(&value).unwrap()
        );
    }

    #[test]
    fn hash_stable_across_reencode() {
        let value = sample();
        let codec = CborCodec;
        let decoded = codec.decode(&codec.encode(&value).unwrap()).unwrap();
        assert_eq!(object_hash(&value).unwrap(), object_hash(&decoded).unwrap());
    }

    #[test]
    fn map_key_order_does_not_depend_on_insertion() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), StructuredValue::Integer(1));
        a.insert("a".to_string(), StructuredValue::Integer(2));
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), StructuredValue::Integer(2));
        b.insert("b".to_string(), StructuredValue::Integer(1));
        assert_eq!(
            canonical_encode(&StructuredValue::Map(a)).unwrap(),
            canonical_encode(&StructuredValue::Map(b)).unwrap()
        );
    }

    #[test]
    fn bytes_and_text_hash_differently() {
        let text = StructuredValue::Text("abc".into());
        let bytes = StructuredValue::Bytes(b"abc".to_vec());
        assert_ne!(
            object_hash(&text).unwrap(),
            object_hash(&bytes).unwrap()
        );
    }

    #[test]
    fn timestamp_encodes_as_tag_0() {
        let bytes = canonical_encode(&StructuredValue::Timestamp(0)).unwrap();
        // Major type 6 (tag), value 0 => 0xc0.
        assert_eq!(bytes[0], 0xc0);
        let back = CborCodec.decode(&bytes).unwrap();
        assert_eq!(back, StructuredValue::Timestamp(0));
    }

    #[test]
    fn tag_1_epoch_accepted_on_decode() {
        let raw = Value::Tag(1, Box::new(Value::Integer(Integer::from(10))));
        assert_eq!(
            from_cbor_value(raw).unwrap(),
            StructuredValue::Timestamp(10_000)
        );
    }

    #[test]
    fn shortest_integer_form() {
        // 23 fits in the initial byte.
        assert_eq!(
            canonical_encode(&StructuredValue::Integer(23)).unwrap(),
            vec![0x17]
        );
        // 500 needs two extra bytes, not eight.
        assert_eq!(
            canonical_encode(&StructuredValue::Integer(500)).unwrap(),
            vec![0x19, 0x01, 0xf4]
        );
    }

    #[test]
    fn hash_url_text_is_recognised_on_decode() {
        let url = HashUrl::new(Hash::digest(b"x"));
        let value = StructuredValue::Url(url.clone());
        let back = CborCodec.decode(&canonical_encode(&value).unwrap()).unwrap();
        assert_eq!(back, StructuredValue::Url(url));
    }

    #[test]
    fn rejects_non_text_map_keys() {
        let raw = Value::Map(vec![(Value::Integer(Integer::from(1)), Value::Null)]);
        assert!(from_cbor_value(raw).is_err());
    }

    #[test]
    fn rejects_unknown_tags() {
        let raw = Value::Tag(42, Box::new(Value::Null));
        assert!(from_cbor_value(raw).is_err());
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        assert!(CborCodec.decode(&[0xff, 0x00, 0x01]).is_err());
    }
}
