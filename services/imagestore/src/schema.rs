//! Documents persisted by the image store.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};
use crate::reference::Digest;

/// Media type recorded for blobs uploaded without one.
pub const DEFAULT_BLOB_MEDIA_TYPE: &str = "application/octet-stream";

/// Describes one image: its content blob and the chain of images it was
/// built on.
///
/// The `id` is the digest of the canonical JSON of every other field, so a
/// manifest can't be stored under an id it does not hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Digest of the manifest's own canonical serialization.
    pub id: String,

    /// Human readable image name.
    pub name: String,

    /// Ancestor manifest ids, nearest first.
    #[serde(default)]
    pub parents: Vec<String>,

    /// Digest of the content blob of this image.
    pub blobsum: String,

    /// When the image was committed.
    pub created: DateTime<Utc>,

    /// Who committed the image.
    #[serde(default)]
    pub author: String,

    /// CPU architecture the image targets, e.g. `x86_64`.
    #[serde(default)]
    pub architecture: String,

    /// Free form description.
    #[serde(default)]
    pub desc: String,

    /// Size of the content blob in bytes.
    pub size: u64,

    /// Size of the image once expanded, in bytes.
    #[serde(default)]
    pub virtualsize: u64,
}

/// Every field except the id, in serialization order.
#[derive(Serialize)]
struct ManifestBody<'a> {
    name: &'a str,
    parents: &'a [String],
    blobsum: &'a str,
    created: &'a DateTime<Utc>,
    author: &'a str,
    architecture: &'a str,
    desc: &'a str,
    size: u64,
    virtualsize: u64,
}

impl<'a> From<&'a ImageManifest> for ManifestBody<'a> {
    fn from(manifest: &'a ImageManifest) -> Self {
        ManifestBody {
            name: &manifest.name,
            parents: &manifest.parents,
            blobsum: &manifest.blobsum,
            created: &manifest.created,
            author: &manifest.author,
            architecture: &manifest.architecture,
            desc: &manifest.desc,
            size: manifest.size,
            virtualsize: manifest.virtualsize,
        }
    }
}

/// Lowercase, and drop any algorithm prefix from well-formed digests.
fn normalize_digest(digest: &str) -> String {
    Digest::parse(digest)
        .map(String::from)
        .unwrap_or_else(|_| digest.to_ascii_lowercase())
}

impl ImageManifest {
    /// Parse a manifest from its JSON form.
    pub fn parse(data: &[u8]) -> RegistryResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// The canonical serialization, which is what gets stored.
    pub fn to_json(&self) -> RegistryResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The id this manifest's content hashes to.
    pub fn compute_id(&self) -> RegistryResult<Digest> {
        let body = serde_json::to_vec(&ManifestBody::from(self))?;
        Ok(Digest::of(&body))
    }

    /// Fill in `id` from the content.
    pub fn seal(mut self) -> RegistryResult<Self> {
        self.id = self.compute_id()?.into();
        Ok(self)
    }

    /// Lowercase the id, parents and blobsum.
    pub fn normalized(mut self) -> Self {
        self.id = normalize_digest(&self.id);
        self.blobsum = normalize_digest(&self.blobsum);
        for parent in &mut self.parents {
            *parent = normalize_digest(parent);
        }
        self
    }

    /// Structural validity: well formed id, blobsum and parents, no image
    /// listed as its own parent, and no parent listed twice.
    pub fn validate(&self) -> RegistryResult<()> {
        let invalid = |reason: String| Err(RegistryError::InvalidManifest(reason));

        if Digest::parse(&self.id).is_err() {
            return invalid(format!("malformed id '{}'", self.id));
        }

        if Digest::parse(&self.blobsum).is_err() {
            return invalid(format!("malformed blobsum '{}'", self.blobsum));
        }

        let mut seen = HashSet::with_capacity(self.parents.len());
        for parent in &self.parents {
            if Digest::parse(parent).is_err() {
                return invalid(format!("malformed parent id '{parent}'"));
            }
            if parent == &self.id {
                return invalid(format!("image {} is its own parent", self.id));
            }
            if !seen.insert(parent) {
                return invalid(format!("parent {parent} listed twice"));
            }
        }

        Ok(())
    }

    /// Whether [`ImageManifest::validate`] passes.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl fmt::Display for ImageManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Declared properties of a blob upload, recorded when the session is prepared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Total size the client will upload, in bytes.
    pub size: u64,

    /// Digest the completed blob must have.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Media type to record for the completed blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl UploadInfo {
    /// An upload of `size` bytes.
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Require the completed blob to have `digest`.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Record `media_type` for the completed blob.
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// Stored alongside a blob's content once the blob is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    /// Digest of the blob content.
    pub digest: Digest,
    /// Content size in bytes.
    pub size: u64,
    /// Media type declared when the blob was uploaded.
    pub media_type: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn manifest(desc: &str, blobsum: &Digest, parents: &[&str]) -> ImageManifest {
        ImageManifest {
            id: String::new(),
            name: "test image".into(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            blobsum: blobsum.to_string(),
            created: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            author: "tests".into(),
            architecture: "x86_64".into(),
            desc: desc.into(),
            size: 4,
            virtualsize: 8,
        }
        .seal()
        .unwrap()
    }

    #[test]
    fn id_ignores_id_field() {
        let blob = Digest::of(b"blob");
        let sealed = manifest("a", &blob, &[]);
        assert_eq!(sealed.compute_id().unwrap().as_str(), sealed.id);

        let mut renamed = sealed.clone();
        renamed.id = "0".repeat(64);
        assert_eq!(renamed.compute_id().unwrap().as_str(), sealed.id);

        let other = manifest("b", &blob, &[]);
        assert_ne!(other.id, sealed.id);
    }

    #[test]
    fn canonical_round_trip() {
        let parent = manifest("parent", &Digest::of(b"p"), &[]);
        let child = manifest("child", &Digest::of(b"c"), &[parent.id.as_str()]);

        let json = child.to_json().unwrap();
        assert_eq!(json, child.to_string());
        let parsed = ImageManifest::parse(json.as_bytes()).unwrap();
        assert_eq!(parsed, child);
        assert_eq!(parsed.to_json().unwrap(), json);
    }

    #[test]
    fn normalization() {
        let blob = Digest::of(b"blob");
        let mut upper = manifest("a", &blob, &[]);
        upper.id = upper.id.to_uppercase();
        upper.blobsum = format!("sha256:{}", upper.blobsum.to_uppercase());

        let normalized = upper.normalized();
        assert_eq!(normalized.blobsum, blob.as_str());
        assert!(normalized.is_valid());
        assert_eq!(normalized.compute_id().unwrap().as_str(), normalized.id);
    }

    #[test]
    fn validity() {
        let blob = Digest::of(b"blob");
        let base = manifest("a", &blob, &[]);
        assert!(base.is_valid());

        let mut bad = base.clone();
        bad.blobsum = "nothex".into();
        assert!(matches!(
            bad.validate(),
            Err(RegistryError::InvalidManifest(_))
        ));

        let mut own_parent = base.clone();
        own_parent.parents = vec![base.id.clone()];
        assert!(!own_parent.is_valid());

        let other = Digest::of(b"other").to_string();
        let mut duplicate = base.clone();
        duplicate.parents = vec![other.clone(), other];
        assert!(!duplicate.is_valid());

        let mut short_id = base;
        short_id.id.truncate(10);
        assert!(!short_id.is_valid());
    }

    #[test]
    fn upload_info_json() {
        let info = UploadInfo::new(100);
        assert_eq!(serde_json::to_string(&info).unwrap(), r#"{"size":100}"#);

        let info: UploadInfo =
            serde_json::from_str(r#"{"size":5,"digest":"abc","media_type":"text/plain"}"#)
                .unwrap();
        assert_eq!(
            info,
            UploadInfo::new(5)
                .with_digest("abc")
                .with_media_type("text/plain")
        );
    }
}
