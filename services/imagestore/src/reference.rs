//! Syntax of the strings which address registry objects: image names,
//! tags, digests and digest prefixes, and upload session ids.
//!
//! Everything is lowercased before it is checked, so mixed-case input from
//! clients addresses the same objects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{RegistryError, RegistryResult};

/// Optional algorithm prefix accepted on digests.
pub const DIGEST_ALGORITHM_PREFIX: &str = "sha256:";

/// Length of a hex-encoded sha256 digest.
pub const DIGEST_LENGTH: usize = 64;

/// Shortest digest prefix accepted as a manifest reference.
pub const MIN_DIGEST_PREFIX: usize = 2;

const MAX_NAME_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A full sha256 content digest, held as lowercase hex without the
/// algorithm prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse `[sha256:]<64 hex>`, in any case.
    pub fn parse(digest: &str) -> RegistryResult<Self> {
        let lower = digest.trim().to_ascii_lowercase();
        let hex = lower.strip_prefix(DIGEST_ALGORITHM_PREFIX).unwrap_or(&lower);
        if hex.len() == DIGEST_LENGTH && is_hex(hex) {
            Ok(Digest(hex.to_owned()))
        } else {
            Err(RegistryError::InvalidDigest(digest.to_owned()))
        }
    }

    /// Digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Digest of everything fed to `hasher`.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Digest(hex::encode(hasher.finalize()))
    }

    /// The bare hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How a manifest is addressed within an image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A manifest id, or an unambiguous prefix of one, as lowercase hex.
    Digest(String),
    /// A mutable tag.
    Tag(String),
}

impl Reference {
    /// Classify and normalize a reference.
    ///
    /// Hex strings of at least [`MIN_DIGEST_PREFIX`] characters are digest
    /// references; anything else must be a valid tag.
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        let lower = reference.trim().to_ascii_lowercase();

        if let Some(hex) = lower.strip_prefix(DIGEST_ALGORITHM_PREFIX) {
            return Self::digest_prefix(hex)
                .ok_or_else(|| RegistryError::InvalidDigest(reference.to_owned()));
        }

        if let Some(reference) = Self::digest_prefix(&lower) {
            return Ok(reference);
        }

        validate_tag(&lower).map(Reference::Tag)
    }

    /// Classify a reference a manifest is stored under.
    ///
    /// Only a complete id is a digest reference here. Anything else,
    /// including a short hex string such as `cafe`, must be a valid tag.
    pub fn parse_exact(reference: &str) -> RegistryResult<Self> {
        match Digest::parse(reference) {
            Ok(digest) => Ok(Reference::Digest(digest.into())),
            Err(_) => validate_tag(&reference.trim().to_ascii_lowercase()).map(Reference::Tag),
        }
    }

    fn digest_prefix(hex: &str) -> Option<Self> {
        ((MIN_DIGEST_PREFIX..=DIGEST_LENGTH).contains(&hex.len()) && is_hex(hex))
            .then(|| Reference::Digest(hex.to_owned()))
    }

    /// Whether this is a digest (or digest prefix) reference.
    pub fn is_digest(&self) -> bool {
        matches!(self, Reference::Digest(_))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Digest(digest) => f.write_str(digest),
            Reference::Tag(tag) => f.write_str(tag),
        }
    }
}

/// Lowercase and validate an image name.
///
/// Names are `/`-separated components of `[a-z0-9]+([._-][a-z0-9]+)*`.
/// Components can never start with `_`, which keeps them apart from the
/// store's own namespaces.
pub fn normalize_name(name: &str) -> RegistryResult<String> {
    let lower = name.trim().to_ascii_lowercase();
    let invalid = || RegistryError::InvalidRepository(name.to_owned());

    if lower.is_empty() || lower.len() > MAX_NAME_LENGTH {
        return Err(invalid());
    }

    for component in lower.split('/') {
        if !valid_name_component(component) {
            return Err(invalid());
        }
    }

    Ok(lower)
}

fn valid_name_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alphanumeric = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let separator = |b: &u8| matches!(b, b'.' | b'_' | b'-');

    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) if alphanumeric(first) && alphanumeric(last) => bytes
            .windows(2)
            .all(|pair| alphanumeric(&pair[0]) || alphanumeric(&pair[1]))
            && bytes.iter().all(|b| alphanumeric(b) || separator(b)),
        _ => false,
    }
}

/// Validate a lowercased tag: `[a-z0-9_][a-z0-9_.-]{0,127}`.
fn validate_tag(tag: &str) -> RegistryResult<String> {
    let bytes = tag.as_bytes();
    let word = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_';

    let valid = match bytes.split_first() {
        Some((first, rest)) => {
            bytes.len() <= MAX_TAG_LENGTH
                && word(first)
                && rest.iter().all(|b| word(b) || matches!(b, b'.' | b'-'))
        }
        None => false,
    };

    if valid {
        Ok(tag.to_owned())
    } else {
        Err(RegistryError::InvalidTag(tag.to_owned()))
    }
}

/// Normalize an upload session id, which must be a UUID.
pub fn normalize_session(session: &str) -> RegistryResult<String> {
    uuid::Uuid::parse_str(session.trim())
        .map(|id| id.hyphenated().to_string())
        .map_err(|_| RegistryError::InvalidUpload(session.to_owned()))
}

/// A fresh upload session id.
pub fn new_session() -> String {
    uuid::Uuid::new_v4().hyphenated().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn digest_of_bytes() {
        assert_eq!(Digest::of(b"hello").as_str(), HELLO);
    }

    #[test]
    fn digest_accepts_prefix_and_case() {
        let upper = format!("SHA256:{}", HELLO.to_uppercase());
        assert_eq!(Digest::parse(&upper).unwrap().as_str(), HELLO);
        assert!(Digest::parse(&HELLO[..63]).is_err());
        assert!(Digest::parse(&format!("md5:{HELLO}")).is_err());
    }

    #[test]
    fn references() {
        assert_eq!(
            Reference::parse("ABCDEF").unwrap(),
            Reference::Digest("abcdef".into())
        );
        assert_eq!(
            Reference::parse("ab").unwrap(),
            Reference::Digest("ab".into())
        );
        assert_eq!(
            Reference::parse("Latest").unwrap(),
            Reference::Tag("latest".into())
        );
        assert_eq!(Reference::parse("a").unwrap(), Reference::Tag("a".into()));
        assert_eq!(
            Reference::parse("v1.0-rc_1").unwrap(),
            Reference::Tag("v1.0-rc_1".into())
        );

        assert!(matches!(
            Reference::parse("sha256:xyz"),
            Err(RegistryError::InvalidDigest(_))
        ));
        assert!(matches!(
            Reference::parse(".hidden"),
            Err(RegistryError::InvalidTag(_))
        ));
        assert!(matches!(
            Reference::parse(&"t".repeat(129)),
            Err(RegistryError::InvalidTag(_))
        ));
    }

    #[test]
    fn exact_references() {
        assert_eq!(
            Reference::parse_exact(&format!("sha256:{}", HELLO.to_uppercase())).unwrap(),
            Reference::Digest(HELLO.into())
        );
        assert_eq!(
            Reference::parse_exact("cafe").unwrap(),
            Reference::Tag("cafe".into())
        );
        assert_eq!(
            Reference::parse_exact(&HELLO[..63]).unwrap(),
            Reference::Tag(HELLO[..63].into())
        );
        assert!(matches!(
            Reference::parse_exact("sha256:cafe"),
            Err(RegistryError::InvalidTag(_))
        ));
    }

    #[test]
    fn names() {
        assert_eq!(normalize_name("Library/Ubuntu").unwrap(), "library/ubuntu");
        assert_eq!(normalize_name("a.b_c-d/e").unwrap(), "a.b_c-d/e");

        for invalid in ["", "/a", "a/", "a//b", "_uploads", "a/../b", "a--", "a..b"] {
            assert!(
                normalize_name(invalid).is_err(),
                "{invalid:?} should be rejected"
            );
        }
    }

    #[test]
    fn sessions() {
        let session = new_session();
        assert_eq!(normalize_session(&session.to_uppercase()).unwrap(), session);
        assert!(normalize_session("../../etc").is_err());
    }
}
