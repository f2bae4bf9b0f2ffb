use std::collections::BTreeMap;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use optics_types::value::{format_timestamp, parse_timestamp};
use optics_types::{HashUrl, StructuredValue};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{CodecError, CodecResult};
use crate::Codec;

/// Namespace for the arbitrary-object element vocabulary.
const ARBITRARY_NS: &str = "pigeon-optics:arbitrary";

/// XML interchange codec.
///
/// Values are expressed with the arbitrary-object tag set under the
/// `pigeon-optics:arbitrary` namespace: `<object>` (children carry a
/// `name` attribute), `<array>`, `<string>`, `<number>`,
/// `<buffer encoding="base64">`, `<date>`, `<null/>`, `<true/>`,
/// `<false/>`. Any structured value round-trips. Not canonical.
#[derive(Clone, Copy, Debug, Default)]
pub struct XmlCodec;

impl Codec for XmlCodec {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn media_types(&self) -> &'static [&'static str] {
        &["application/xml", "text/xml"]
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["xml"]
    }

    fn encode(&self, value: &StructuredValue) -> CodecResult<Vec<u8>> {
        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(CodecError::encode)?;
        write_value(&mut writer, value, None, true)?;
        Ok(writer.into_inner())
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<StructuredValue> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();
        let mut root: Option<StructuredValue> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(start)) => {
                    stack.push(Frame::open(&start)?);
                }
                Ok(Event::Empty(start)) => {
                    let value = Frame::open(&start)?.finish()?;
                    let name = attribute(&start, "name")?;
                    place(&mut stack, &mut root, name, value)?;
                }
                Ok(Event::Text(text)) => {
                    let text = text.unescape().map_err(CodecError::decode)?;
                    match stack.last_mut() {
                        Some(Frame::Leaf { text: buf, .. }) => buf.push_str(&text),
                        _ if text.trim().is_empty() => {}
                        _ => {
                            return Err(CodecError::Decode(format!(
                                "unexpected text outside a leaf element: {text:?}"
                            )))
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    let frame = stack
                        .pop()
                        .ok_or_else(|| CodecError::Decode("unbalanced end tag".into()))?;
                    let name = frame.name().map(str::to_string);
                    let value = frame.finish()?;
                    place(&mut stack, &mut root, name, value)?;
                }
                Ok(Event::Eof) => break,
                Ok(Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_)) => {}
                Ok(Event::CData(data)) => match stack.last_mut() {
                    Some(Frame::Leaf { text: buf, .. }) => {
                        buf.push_str(
                            std::str::from_utf8(&data).map_err(CodecError::decode)?,
                        );
                    }
                    _ => return Err(CodecError::Decode("unexpected CDATA".into())),
                },
                Err(err) => return Err(CodecError::decode(err)),
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(CodecError::Decode("unclosed element".into()));
        }
        root.ok_or_else(|| CodecError::Decode("empty document".into()))
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn write_value(
    writer: &mut Writer<Vec<u8>>,
    value: &StructuredValue,
    name: Option<&str>,
    root: bool,
) -> CodecResult<()> {
    let start = |tag: &'static str| {
        let mut elem = BytesStart::new(tag);
        if root {
            elem.push_attribute(("xmlns", ARBITRARY_NS));
        }
        if let Some(name) = name {
            elem.push_attribute(("name", name));
        }
        elem
    };
    let write_leaf = |writer: &mut Writer<Vec<u8>>, elem: BytesStart<'_>, text: &str| {
        let tag = String::from_utf8_lossy(elem.name().as_ref()).into_owned();
        writer
            .write_event(Event::Start(elem))
            .and_then(|_| writer.write_event(Event::Text(BytesText::new(text))))
            .and_then(|_| writer.write_event(Event::End(BytesEnd::new(tag))))
            .map_err(CodecError::encode)
    };

    match value {
        StructuredValue::Null => writer
            .write_event(Event::Empty(start("null")))
            .map_err(CodecError::encode),
        StructuredValue::Bool(true) => writer
            .write_event(Event::Empty(start("true")))
            .map_err(CodecError::encode),
        StructuredValue::Bool(false) => writer
            .write_event(Event::Empty(start("false")))
            .map_err(CodecError::encode),
        StructuredValue::Integer(n) => write_leaf(writer, start("number"), &n.to_string()),
        StructuredValue::Float(f) => write_leaf(writer, start("number"), &f.to_string()),
        StructuredValue::Text(s) => write_leaf(writer, start("string"), s),
        StructuredValue::Url(url) => write_leaf(writer, start("string"), &url.to_string()),
        StructuredValue::Bytes(bytes) => {
            let mut elem = start("buffer");
            elem.push_attribute(("encoding", "base64"));
            write_leaf(writer, elem, &BASE64_STANDARD.encode(bytes))
        }
        StructuredValue::Timestamp(ms) => {
            let rendered = format_timestamp(*ms)
                .ok_or_else(|| CodecError::Encode(format!("timestamp out of range: {ms}")))?;
            write_leaf(writer, start("date"), &rendered)
        }
        StructuredValue::Sequence(items) => {
            writer
                .write_event(Event::Start(start("array")))
                .map_err(CodecError::encode)?;
            for item in items {
                write_value(writer, item, None, false)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("array")))
                .map_err(CodecError::encode)
        }
        StructuredValue::Map(entries) => {
            writer
                .write_event(Event::Start(start("object")))
                .map_err(CodecError::encode)?;
            for (key, value) in entries {
                write_value(writer, value, Some(key), false)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("object")))
                .map_err(CodecError::encode)
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

enum Frame {
    Object {
        name: Option<String>,
        entries: BTreeMap<String, StructuredValue>,
    },
    Array {
        name: Option<String>,
        items: Vec<StructuredValue>,
    },
    Leaf {
        name: Option<String>,
        tag: LeafTag,
        text: String,
    },
}

#[derive(Clone, Copy, PartialEq)]
enum LeafTag {
    Str,
    Number,
    Buffer,
    Date,
    Null,
    True,
    False,
}

fn attribute(start: &BytesStart<'_>, key: &str) -> CodecResult<Option<String>> {
    let attr = start
        .try_get_attribute(key)
        .map_err(CodecError::decode)?;
    attr.map(|a| {
        a.unescape_value()
            .map(|v| v.into_owned())
            .map_err(CodecError::decode)
    })
    .transpose()
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> CodecResult<Self> {
        let name = attribute(start, "name")?;
        let tag = start.local_name();
        Ok(match tag.as_ref() {
            b"object" => Frame::Object {
                name,
                entries: BTreeMap::new(),
            },
            b"array" => Frame::Array {
                name,
                items: Vec::new(),
            },
            b"string" => Frame::leaf(name, LeafTag::Str),
            b"number" => Frame::leaf(name, LeafTag::Number),
            b"buffer" => {
                match attribute(start, "encoding")?.as_deref() {
                    None | Some("base64") => {}
                    Some(other) => {
                        return Err(CodecError::Decode(format!(
                            "unsupported buffer encoding: {other}"
                        )))
                    }
                }
                Frame::leaf(name, LeafTag::Buffer)
            }
            b"date" => Frame::leaf(name, LeafTag::Date),
            b"null" => Frame::leaf(name, LeafTag::Null),
            b"true" => Frame::leaf(name, LeafTag::True),
            b"false" => Frame::leaf(name, LeafTag::False),
            other => {
                return Err(CodecError::Decode(format!(
                    "unknown element: {}",
                    String::from_utf8_lossy(other)
                )))
            }
        })
    }

    fn leaf(name: Option<String>, tag: LeafTag) -> Self {
        Frame::Leaf {
            name,
            tag,
            text: String::new(),
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            Frame::Object { name, .. } | Frame::Array { name, .. } | Frame::Leaf { name, .. } => {
                name.as_deref()
            }
        }
    }

    fn finish(self) -> CodecResult<StructuredValue> {
        Ok(match self {
            Frame::Object { entries, .. } => StructuredValue::Map(entries),
            Frame::Array { items, .. } => StructuredValue::Sequence(items),
            Frame::Leaf { tag, text, .. } => match tag {
                LeafTag::Null => StructuredValue::Null,
                LeafTag::True => StructuredValue::Bool(true),
                LeafTag::False => StructuredValue::Bool(false),
                LeafTag::Str => {
                    if HashUrl::is_hash_url(&text) {
                        if let Ok(url) = text.parse() {
                            return Ok(StructuredValue::Url(url));
                        }
                    }
                    StructuredValue::Text(text)
                }
                LeafTag::Number => parse_number(&text)?,
                LeafTag::Buffer => StructuredValue::Bytes(
                    BASE64_STANDARD
                        .decode(text.trim())
                        .map_err(CodecError::decode)?,
                ),
                LeafTag::Date => StructuredValue::Timestamp(
                    parse_timestamp(text.trim())
                        .ok_or_else(|| CodecError::Decode(format!("bad date: {text}")))?,
                ),
            },
        })
    }
}

fn parse_number(text: &str) -> CodecResult<StructuredValue> {
    let text = text.trim();
    if !text.contains(['.', 'e', 'E']) {
        if let Ok(n) = text.parse::<i64>() {
            return Ok(StructuredValue::Integer(n));
        }
    }
    text.parse::<f64>()
        .map(StructuredValue::Float)
        .map_err(|_| CodecError::Decode(format!("bad number: {text}")))
}

fn place(
    stack: &mut Vec<Frame>,
    root: &mut Option<StructuredValue>,
    name: Option<String>,
    value: StructuredValue,
) -> CodecResult<()> {
    match stack.last_mut() {
        Some(Frame::Object { entries, .. }) => {
            let name =
                name.ok_or_else(|| CodecError::Decode("object child missing name".into()))?;
            entries.insert(name, value);
            Ok(())
        }
        Some(Frame::Array { items, .. }) => {
            items.push(value);
            Ok(())
        }
        Some(Frame::Leaf { .. }) => {
            Err(CodecError::Decode("leaf elements cannot nest".into()))
        }
        None => {
            if root.is_some() {
                return Err(CodecError::Decode("multiple root elements".into()));
            }
            *root = Some(value);
            Ok(())
        }
    }
}
