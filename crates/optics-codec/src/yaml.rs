use optics_types::StructuredValue;

use crate::error::{CodecError, CodecResult};
use crate::Codec;

/// YAML interchange codec. Not canonical.
#[derive(Clone, Copy, Debug, Default)]
pub struct YamlCodec;

impl Codec for YamlCodec {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn media_types(&self) -> &'static [&'static str] {
        &["application/yaml", "text/yaml", "application/x-yaml"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["yaml", "yml"]
    }

    fn encode(&self, value: &StructuredValue) -> CodecResult<Vec<u8>> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(CodecError::encode)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<StructuredValue> {
        serde_yaml::from_slice(bytes).map_err(CodecError::decode)
    }
}
