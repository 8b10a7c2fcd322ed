//! Content-addressed, tag-symlinked rootfs store (`spec.md` §2 C7, §6).
//!
//! `spec.md` §1 scopes the OCI fetch/convert-to-erofs pipeline itself out
//! of this crate — that work (pulling manifests, converting layers to an
//! `ext4`/erofs rootfs) is an external collaborator. What lives here is
//! the store layout those collaborators write into and that the instance
//! manager reads from: `images/<repository>/<digest-hex>/{rootfs.ext4,
//! metadata.json}` plus `<repository>/<tag> -> <digest-hex>` symlinks.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EntityKind, HypemanError, Result};
use crate::paths::DataRoot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub repository: String,
    pub digest: String,
    pub env: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ImageRef {
    pub repository: String,
    pub digest: String,
}

pub struct ImageManager {
    data_root: DataRoot,
}

impl ImageManager {
    pub fn new(data_root: DataRoot) -> Self {
        Self { data_root }
    }

    /// Registers a digest already present in the store (placed there by the
    /// external pull/convert pipeline) and points `tag` at it, replacing
    /// any existing tag symlink. Returns the resolved [`ImageRef`].
    pub async fn publish(
        &self,
        repository: &str,
        digest: &str,
        tag: Option<&str>,
        env: Vec<String>,
    ) -> Result<ImageRef> {
        let rootfs = self.data_root.image_rootfs_path(repository, digest);
        if !tokio::fs::try_exists(&rootfs).await.unwrap_or(false) {
            return Err(HypemanError::NotFound {
                kind: EntityKind::Image,
                id: format!("{repository}@{digest}: rootfs not present at {}", rootfs.display()),
            });
        }

        let metadata = ImageMetadata {
            repository: repository.to_string(),
            digest: digest.to_string(),
            env,
            created_at: crate::now_rfc3339(),
        };
        crate::paths::write_json(
            &self.data_root.image_metadata_path(repository, digest),
            &metadata,
        )
        .await?;

        if let Some(tag) = tag {
            self.tag(repository, digest, tag).await?;
        }

        Ok(ImageRef {
            repository: repository.to_string(),
            digest: digest.to_string(),
        })
    }

    /// Points `repository:tag` at `digest`, replacing any prior symlink.
    pub async fn tag(&self, repository: &str, digest: &str, tag: &str) -> Result<()> {
        let link = self.data_root.image_tag_link(repository, tag);
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(&link).await;
        tokio::fs::symlink(digest, &link).await?;
        info!(repository, digest, tag, "image tagged");
        Ok(())
    }

    /// Resolves `image_ref` (`repository:tag`, `repository@digest`, or a
    /// bare `repository` implying `:latest`) to a concrete [`ImageRef`]
    /// plus its metadata.
    pub async fn resolve(&self, image_ref: &str) -> Result<(ImageRef, ImageMetadata)> {
        let (repository, digest) = if let Some((repo, digest)) = image_ref.split_once('@') {
            (repo.to_string(), digest.to_string())
        } else {
            let (repo, tag) = image_ref.split_once(':').unwrap_or((image_ref, "latest"));
            let link = self.data_root.image_tag_link(repo, tag);
            let target = tokio::fs::read_link(&link).await.map_err(|_| {
                HypemanError::not_found(EntityKind::Image, image_ref.to_string())
            })?;
            let digest = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| HypemanError::not_found(EntityKind::Image, image_ref.to_string()))?;
            (repo.to_string(), digest)
        };

        let metadata: ImageMetadata = crate::paths::try_read_json(
            &self.data_root.image_metadata_path(&repository, &digest),
        )
        .await?
        .ok_or_else(|| HypemanError::not_found(EntityKind::Image, image_ref.to_string()))?;

        Ok((
            ImageRef {
                repository,
                digest,
            },
            metadata,
        ))
    }

    pub fn rootfs_path(&self, image_ref: &ImageRef) -> std::path::PathBuf {
        self.data_root
            .image_rootfs_path(&image_ref.repository, &image_ref.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_manager() -> (tempfile::TempDir, ImageManager) {
        let dir = tempfile::tempdir().unwrap();
        (dir, ImageManager::new(DataRoot::new(dir.path())))
    }

    async fn seed_rootfs(mgr: &ImageManager, repo: &str, digest: &str) {
        let path = mgr.data_root.image_rootfs_path(repo, digest);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"ext4").await.unwrap();
    }

    #[tokio::test]
    async fn publish_then_resolve_by_tag() {
        let (_dir, mgr) = make_manager().await;
        seed_rootfs(&mgr, "library/alpine", "abc123").await;
        mgr.publish("library/alpine", "abc123", Some("latest"), vec![])
            .await
            .unwrap();

        let (img, _meta) = mgr.resolve("library/alpine:latest").await.unwrap();
        assert_eq!(img.digest, "abc123");

        let (img2, _) = mgr.resolve("library/alpine").await.unwrap();
        assert_eq!(img2.digest, "abc123");
    }

    #[tokio::test]
    async fn resolve_by_digest_skips_tag_lookup() {
        let (_dir, mgr) = make_manager().await;
        seed_rootfs(&mgr, "library/alpine", "abc123").await;
        mgr.publish("library/alpine", "abc123", None, vec![])
            .await
            .unwrap();

        let (img, _) = mgr.resolve("library/alpine@abc123").await.unwrap();
        assert_eq!(img.digest, "abc123");
    }

    #[tokio::test]
    async fn publish_rejects_missing_rootfs() {
        let (_dir, mgr) = make_manager().await;
        let err = mgr
            .publish("library/alpine", "missing", None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, HypemanError::NotFound { .. }));
    }

    #[tokio::test]
    async fn retag_moves_symlink() {
        let (_dir, mgr) = make_manager().await;
        seed_rootfs(&mgr, "library/alpine", "v1").await;
        seed_rootfs(&mgr, "library/alpine", "v2").await;
        mgr.publish("library/alpine", "v1", Some("latest"), vec![])
            .await
            .unwrap();
        mgr.publish("library/alpine", "v2", Some("latest"), vec![])
            .await
            .unwrap();
        let (img, _) = mgr.resolve("library/alpine:latest").await.unwrap();
        assert_eq!(img.digest, "v2");
    }
}
