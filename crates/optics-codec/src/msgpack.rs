use optics_types::StructuredValue;

use crate::error::{CodecError, CodecResult};
use crate::Codec;

/// MessagePack interchange codec. Not canonical.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn media_types(&self) -> &'static [&'static str] {
        &["application/msgpack", "application/x-msgpack"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["msgpack", "mpk"]
    }

    fn encode(&self, value: &StructuredValue) -> CodecResult<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(CodecError::encode)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<StructuredValue> {
        rmp_serde::from_slice(bytes).map_err(CodecError::decode)
    }
}
