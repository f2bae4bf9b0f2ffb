use optics_types::StructuredValue;

use crate::error::{CodecError, CodecResult};
use crate::Codec;

/// JSON-Lines codec: one JSON document per line.
///
/// A top-level sequence becomes one line per element; any other value is a
/// single line. Decoding a multi-line body yields a sequence. Entry export
/// streams `[id, value]` pairs, one per line.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLinesCodec;

impl Codec for JsonLinesCodec {
    fn name(&self) -> &'static str {
        "json-lines"
    }

    fn media_types(&self) -> &'static [&'static str] {
        &["application/jsonl", "application/x-ndjson", "application/json-lines"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["jsonl", "ndjson"]
    }

    fn encode(&self, value: &StructuredValue) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        match value {
            StructuredValue::Sequence(items) => {
                for item in items {
                    serde_json::to_writer(&mut out, item).map_err(CodecError::encode)?;
                    out.push(b'\n');
                }
            }
            other => {
                serde_json::to_writer(&mut out, other).map_err(CodecError::encode)?;
                out.push(b'\n');
            }
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<StructuredValue> {
        let text = std::str::from_utf8(bytes).map_err(CodecError::decode)?;
        let mut values = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            values.push(serde_json::from_str(line).map_err(CodecError::decode)?);
        }
        match values.len() {
            1 => Ok(values.pop().expect("length checked")),
            _ => Ok(StructuredValue::Sequence(values)),
        }
    }

    fn encode_entries(&self, entries: &[(String, StructuredValue)]) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        for (id, value) in entries {
            let pair = StructuredValue::Sequence(vec![
                StructuredValue::Text(id.clone()),
                value.clone(),
            ]);
            serde_json::to_writer(&mut out, &pair).map_err(CodecError::encode)?;
            out.push(b'\n');
        }
        Ok(out)
    }
}
