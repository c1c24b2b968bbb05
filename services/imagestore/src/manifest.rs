//! Manifests and the tags which point at them.

use camino::Utf8Path;
use storage::StorageBucket;

use crate::blob::BlobStore;
use crate::error::{RegistryError, RegistryResult, StorageResultExt as _};
use crate::paths::PathSpec;
use crate::reference::{normalize_name, Digest, Reference};
use crate::schema::ImageManifest;

/// Stores manifests by id, and resolves tags and digest prefixes to them.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    storage: StorageBucket,
    blobs: BlobStore,
}

impl ManifestStore {
    pub(crate) fn new(storage: StorageBucket, blobs: BlobStore) -> Self {
        Self { storage, blobs }
    }

    /// Fetch the manifest `reference` points at under `name`.
    ///
    /// A digest reference may be truncated, and must then match exactly one
    /// stored manifest id.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, name: &str, reference: &str) -> RegistryResult<ImageManifest> {
        let name = normalize_name(name)?;
        let id = match Reference::parse(reference)? {
            Reference::Digest(prefix) => self.resolve_prefix(&name, &prefix).await?,
            Reference::Tag(tag) => self.resolve_tag(&name, &tag).await?,
        };
        self.load(&name, &id).await
    }

    async fn resolve_prefix(&self, name: &str, prefix: &str) -> RegistryResult<String> {
        let listed = self
            .storage
            .list(Some(&PathSpec::Manifests { name }.path()))
            .await
            .or_missing(
                || RegistryError::ManifestNotFound(format!("{name}@{prefix}")),
                "listing manifests",
            )?;

        let mut matches = listed
            .iter()
            .filter_map(|key| Utf8Path::new(key).file_name())
            .filter(|id| id.starts_with(prefix));

        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.to_owned()),
            (Some(_), Some(_)) => Err(RegistryError::Ambiguous(prefix.to_owned())),
            (None, _) => Err(RegistryError::Internal(format!(
                "no manifest under {name} matches digest {prefix}"
            ))),
        }
    }

    async fn resolve_tag(&self, name: &str, tag: &str) -> RegistryResult<String> {
        let content = self
            .storage
            .get_content(&PathSpec::Tag { name, tag }.path())
            .await
            .or_missing(
                || RegistryError::TagNotFound {
                    name: name.to_owned(),
                    tag: tag.to_owned(),
                },
                "reading tag",
            )?;

        let id = String::from_utf8_lossy(&content);
        Digest::parse(&id)
            .map(String::from)
            .map_err(|_| RegistryError::TagIntegrity {
                id: id.trim().to_owned(),
                tag: tag.to_owned(),
            })
    }

    async fn load(&self, name: &str, id: &str) -> RegistryResult<ImageManifest> {
        let data = self
            .storage
            .get_content(&PathSpec::Manifest { name, id }.path())
            .await
            .or_missing(
                || RegistryError::ManifestNotFound(format!("{name}@{id}")),
                "reading manifest",
            )?;
        ImageManifest::parse(&data)
    }

    /// Store `manifest` under `name`, and point `reference` at it when it
    /// is a tag.
    ///
    /// A reference is only taken as an id when it is a complete one, which
    /// must then be the manifest's own. Short hex strings are tags.
    ///
    /// Every parent must already be stored under `name`, and the content
    /// blob must be complete. Nothing is written unless all checks pass.
    #[tracing::instrument(skip(self, manifest), fields(id = %manifest.id))]
    pub async fn put(
        &self,
        name: &str,
        reference: &str,
        manifest: &ImageManifest,
    ) -> RegistryResult<()> {
        let name = normalize_name(name)?;
        let reference = Reference::parse_exact(reference)?;
        let manifest = manifest.clone().normalized();

        if let Reference::Digest(digest) = &reference {
            if digest != &manifest.id {
                return Err(RegistryError::DigestMismatch {
                    expected: digest.clone(),
                    actual: manifest.id,
                });
            }
        }

        manifest.validate()?;

        let computed = manifest.compute_id()?;
        if computed.as_str() != manifest.id {
            return Err(RegistryError::DigestMismatch {
                expected: manifest.id,
                actual: computed.into(),
            });
        }

        for parent in &manifest.parents {
            let path = PathSpec::Manifest {
                name: &name,
                id: parent,
            }
            .path();
            if !self.storage.exists(&path).await.context("checking parent")? {
                return Err(RegistryError::ParentNotFound(parent.clone()));
            }
        }

        if !self.blobs.exists(&manifest.blobsum).await? {
            return Err(RegistryError::BlobNotFound(manifest.blobsum));
        }

        self.storage
            .put_content(
                &PathSpec::Manifest {
                    name: &name,
                    id: &manifest.id,
                }
                .path(),
                manifest.to_json()?,
            )
            .await
            .context("writing manifest")?;

        if let Reference::Tag(tag) = &reference {
            self.storage
                .put_content(
                    &PathSpec::Tag { name: &name, tag }.path(),
                    manifest.id.clone(),
                )
                .await
                .context("writing tag")?;
            tracing::debug!(%name, %tag, "tag updated");
        }

        tracing::info!(%name, id = %manifest.id, "manifest stored");
        Ok(())
    }

    /// Every tag under `name`, sorted. An image with no tags lists as empty.
    #[tracing::instrument(skip(self))]
    pub async fn tags(&self, name: &str) -> RegistryResult<Vec<String>> {
        let name = normalize_name(name)?;
        let listed = match self
            .storage
            .list(Some(&PathSpec::Tags { name: &name }.path()))
            .await
        {
            Ok(listed) => listed,
            Err(error) if error.is_not_found() => return Ok(Vec::new()),
            Err(error) => return Err(RegistryError::storage("listing tags")(error)),
        };

        let mut tags: Vec<String> = listed
            .iter()
            .filter_map(|key| Utf8Path::new(key).file_name())
            .map(str::to_owned)
            .collect();
        tags.sort();
        Ok(tags)
    }
}
