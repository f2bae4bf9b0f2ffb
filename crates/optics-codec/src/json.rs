use optics_types::StructuredValue;

use crate::error::{CodecError, CodecResult};
use crate::Codec;

/// JSON interchange codec.
///
/// Byte strings are carried as `{"type":"Buffer","data":[..]}` (a base64
/// `data` string is also recognised on decode) and timestamps as
/// `{"type":"Date","value":"<rfc3339>"}`; hash URLs are plain strings.
/// These wrappers live in `StructuredValue`'s serde implementation, so
/// this codec is a direct `serde_json` round-trip. Not canonical.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn media_types(&self) -> &'static [&'static str] {
        &["application/json", "text/json"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn encode(&self, value: &StructuredValue) -> CodecResult<Vec<u8>> {
        serde_json::to_vec_pretty(value).map_err(CodecError::encode)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<StructuredValue> {
        serde_json::from_slice(bytes).map_err(CodecError::decode)
    }
}
