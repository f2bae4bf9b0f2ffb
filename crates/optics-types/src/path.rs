use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Characters escaped inside a path segment. `/` and `:` are structural in
/// both path forms; `%` must round-trip through the escaper itself.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b':')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b' ');

/// The dataset family a path addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// User-written datasets.
    Datasets,
    /// Derived (lens output) datasets.
    Lenses,
    /// Read-only virtual system collections.
    Meta,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datasets => "datasets",
            Self::Lenses => "lenses",
            Self::Meta => "meta",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "datasets" => Ok(Self::Datasets),
            "lenses" => Ok(Self::Lenses),
            "meta" => Ok(Self::Meta),
            other => Err(TypeError::UnknownSource(other.to_string())),
        }
    }
}

/// Address of a dataset, or of one record within it.
///
/// Two textual forms exist:
///
/// - the **slash form** `source/user/name[/record]`, used for linker paths
///   in attachment metadata and by the read-path resolver;
/// - the **URI form** `pigeon-optics:/<source>/<user>:<name>[/<record>]`,
///   used where a scheme-qualified identifier is wanted.
///
/// Reserved characters in segments are percent-encoded in both forms, so
/// arbitrary user/dataset/record names survive round-trips.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetPath {
    pub source: Source,
    pub user: String,
    pub name: String,
    pub record: Option<String>,
}

impl DatasetPath {
    /// Address a whole dataset.
    pub fn dataset(source: Source, user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source,
            user: user.into(),
            name: name.into(),
            record: None,
        }
    }

    /// Address one record within a dataset.
    pub fn record(
        source: Source,
        user: impl Into<String>,
        name: impl Into<String>,
        record: impl Into<String>,
    ) -> Self {
        Self {
            source,
            user: user.into(),
            name: name.into(),
            record: Some(record.into()),
        }
    }

    /// The virtual system collection for a kind (`users`, `datasets`, `lenses`).
    pub fn system(kind: impl Into<String>) -> Self {
        Self::record(Source::Meta, "system", "system", kind)
    }

    /// `true` for paths under the read-only virtual `meta` source.
    pub fn is_system(&self) -> bool {
        self.source == Source::Meta
    }

    /// Drop the record component, addressing the containing dataset.
    pub fn without_record(&self) -> Self {
        Self {
            record: None,
            ..self.clone()
        }
    }

    /// The scheme-qualified URI form.
    pub fn to_uri(&self) -> String {
        let user = utf8_percent_encode(&self.user, SEGMENT);
        let name = utf8_percent_encode(&self.name, SEGMENT);
        let mut uri = format!("pigeon-optics:/{}/{user}:{name}", self.source);
        if let Some(ref record) = self.record {
            uri.push('/');
            uri.push_str(&utf8_percent_encode(record, SEGMENT).to_string());
        }
        uri
    }

    /// Parse the URI form produced by [`Self::to_uri`].
    pub fn parse_uri(s: &str) -> Result<Self, TypeError> {
        let rest = s
            .strip_prefix("pigeon-optics:/")
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?;
        let mut parts = rest.splitn(3, '/');
        let source: Source = parts
            .next()
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?
            .parse()?;
        let user_name = parts
            .next()
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?;
        let (user, name) = user_name
            .split_once(':')
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?;
        let record = parts.next().map(decode_segment).transpose()?;
        Ok(Self {
            source,
            user: decode_segment(user)?,
            name: decode_segment(name)?,
            record,
        })
    }
}

fn decode_segment(s: &str) -> Result<String, TypeError> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| TypeError::InvalidPath(s.to_string()))
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.source,
            utf8_percent_encode(&self.user, SEGMENT),
            utf8_percent_encode(&self.name, SEGMENT),
        )?;
        if let Some(ref record) = self.record {
            write!(f, "/{}", utf8_percent_encode(record, SEGMENT))?;
        }
        Ok(())
    }
}

impl FromStr for DatasetPath {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, '/');
        let source: Source = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?
            .parse()?;
        let user = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?;
        let name = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TypeError::InvalidPath(s.to_string()))?;
        let record = parts
            .next()
            .filter(|p| !p.is_empty())
            .map(decode_segment)
            .transpose()?;
        Ok(Self {
            source,
            user: decode_segment(user)?,
            name: decode_segment(name)?,
            record,
        })
    }
}

impl TryFrom<String> for DatasetPath {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DatasetPath> for String {
    fn from(path: DatasetPath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_form_roundtrip() {
        let path = DatasetPath::record(Source::Datasets, "alice", "songs", "a");
        assert_eq!(path.to_string(), "datasets/alice/songs/a");
        let parsed: DatasetPath = path.to_string().parse().unwrap();
        assert_eq!(path, parsed);
    }

    #[test]
    fn slash_form_without_record() {
        let path = DatasetPath::dataset(Source::Lenses, "bob", "double");
        assert_eq!(path.to_string(), "lenses/bob/double");
        let parsed: DatasetPath = "lenses/bob/double".parse().unwrap();
        assert_eq!(parsed.record, None);
    }

    #[test]
    fn uri_form_roundtrip() {
        let path = DatasetPath::record(Source::Datasets, "alice", "songs", "track 1");
        let uri = path.to_uri();
        assert!(uri.starts_with("pigeon-optics:/datasets/alice:songs/"));
        assert_eq!(DatasetPath::parse_uri(&uri).unwrap(), path);
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let path = DatasetPath::record(Source::Datasets, "a/b", "c:d", "e%f");
        let text = path.to_string();
        let parsed: DatasetPath = text.parse().unwrap();
        assert_eq!(parsed, path);
        assert_eq!(DatasetPath::parse_uri(&path.to_uri()).unwrap(), path);
    }

    #[test]
    fn system_paths() {
        let path = DatasetPath::system("datasets");
        assert_eq!(path.to_string(), "meta/system/system/datasets");
        assert!(path.is_system());
        assert!(!DatasetPath::dataset(Source::Datasets, "u", "n").is_system());
    }

    #[test]
    fn rejects_unknown_source() {
        assert!(matches!(
            "things/u/n".parse::<DatasetPath>(),
            Err(TypeError::UnknownSource(_))
        ));
    }

    #[test]
    fn rejects_missing_components() {
        assert!("datasets/u".parse::<DatasetPath>().is_err());
        assert!("datasets".parse::<DatasetPath>().is_err());
        assert!(DatasetPath::parse_uri("pigeon-optics:/datasets/alice").is_err());
    }

    #[test]
    fn without_record_strips_record() {
        let path = DatasetPath::record(Source::Datasets, "u", "n", "r");
        assert_eq!(
            path.without_record(),
            DatasetPath::dataset(Source::Datasets, "u", "n")
        );
    }
}
