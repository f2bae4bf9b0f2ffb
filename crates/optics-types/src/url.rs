use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::hash::Hash;

const SCHEME_PREFIX: &str = "hash://sha256/";

/// A reference to an attachment by content hash.
///
/// Rendered as `hash://sha256/<64 hex>[?type=<mime>]`. The hex portion is
/// case-insensitive on parse; the canonical form is lowercase. Any string
/// value inside a [`crate::StructuredValue`] matching this shape is treated
/// as an attachment reference.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HashUrl {
    hash: Hash,
    media_type: Option<String>,
}

impl HashUrl {
    /// Build a URL for a hash, with no media type hint.
    pub fn new(hash: Hash) -> Self {
        Self {
            hash,
            media_type: None,
        }
    }

    /// Build a URL carrying a `?type=<mime>` hint.
    pub fn with_type(hash: Hash, media_type: impl Into<String>) -> Self {
        Self {
            hash,
            media_type: Some(media_type.into()),
        }
    }

    /// The referenced content hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The `?type=` media type hint, if present.
    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    /// Quick check whether a string looks like a hash URL.
    pub fn is_hash_url(s: &str) -> bool {
        s.get(..SCHEME_PREFIX.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(SCHEME_PREFIX))
    }
}

impl FromStr for HashUrl {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_hash_url(s) {
            return Err(TypeError::InvalidHashUrl(s.to_string()));
        }
        let rest = &s[SCHEME_PREFIX.len()..];
        let (hex_part, media_type) = match rest.split_once('?') {
            Some((hex, query)) => {
                let media = query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("type="))
                    .map(|m| m.to_string());
                (hex, media)
            }
            None => (rest, None),
        };
        let hash = Hash::from_hex(hex_part)
            .map_err(|_| TypeError::InvalidHashUrl(s.to_string()))?;
        Ok(Self { hash, media_type })
    }
}

impl fmt::Display for HashUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}", self.hash.to_hex())?;
        if let Some(ref media) = self.media_type {
            write!(f, "?type={media}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashUrl({self})")
    }
}

impl TryFrom<String> for HashUrl {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<HashUrl> for String {
    fn from(url: HashUrl) -> Self {
        url.to_string()
    }
}
