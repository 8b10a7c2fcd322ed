//! Pure path algebra for the on-disk layout (`spec.md` §6, C1).
//!
//! Nothing in this module touches the filesystem except [`write_atomic`]
//! and [`read_json`]/[`write_json`], which are the shared temp-file+rename
//! primitives every other component persists through.

use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{HypemanError, Result};

/// Root of the on-disk layout, rooted at `DATA_DIR`.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // system/
    pub fn system_dir(&self) -> PathBuf {
        self.root.join("system")
    }

    pub fn kernel_path(&self, version: &str, arch: &str) -> PathBuf {
        self.system_dir()
            .join("kernel")
            .join(version)
            .join(arch)
            .join("vmlinux")
    }

    pub fn initrd_dir(&self, arch: &str) -> PathBuf {
        self.system_dir().join("initrd").join(arch)
    }

    pub fn initrd_latest_link(&self, arch: &str) -> PathBuf {
        self.initrd_dir(arch).join("latest")
    }

    pub fn initrd_timestamped(&self, arch: &str, timestamp: &str) -> PathBuf {
        self.initrd_dir(arch).join(timestamp).join("initrd")
    }

    pub fn vmm_binary_path(&self, version: &str, arch: &str, binary: &str) -> PathBuf {
        self.system_dir()
            .join("binaries")
            .join(version)
            .join(arch)
            .join(binary)
    }

    pub fn oci_cache_dir(&self) -> PathBuf {
        self.system_dir().join("oci-cache")
    }

    // images/
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn image_digest_dir(&self, repository: &str, digest_hex: &str) -> PathBuf {
        self.images_dir().join(repository).join(digest_hex)
    }

    pub fn image_rootfs_path(&self, repository: &str, digest_hex: &str) -> PathBuf {
        self.image_digest_dir(repository, digest_hex)
            .join("rootfs.ext4")
    }

    pub fn image_metadata_path(&self, repository: &str, digest_hex: &str) -> PathBuf {
        self.image_digest_dir(repository, digest_hex)
            .join("metadata.json")
    }

    pub fn image_tag_link(&self, repository: &str, tag: &str) -> PathBuf {
        self.images_dir().join(repository).join(tag)
    }

    // guests/
    pub fn guests_dir(&self) -> PathBuf {
        self.root.join("guests")
    }

    pub fn guest_dir(&self, id: &str) -> PathBuf {
        self.guests_dir().join(id)
    }

    pub fn guest_deleting_dir(&self, id: &str) -> PathBuf {
        self.guests_dir().join(format!(".deleting-{id}"))
    }

    pub fn instance_metadata_path(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join("metadata.json")
    }

    pub fn overlay_path(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join("overlay.raw")
    }

    pub fn config_disk_path(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join("config.ext4")
    }

    pub fn config_stage_dir(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join(".config-stage")
    }

    pub fn ch_socket_path(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join("ch.sock")
    }

    pub fn vsock_socket_path(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join("vsock.sock")
    }

    pub fn console_log_path(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join("logs").join("console.log")
    }

    pub fn snapshots_dir(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join("snapshots")
    }

    pub fn snapshot_latest_link(&self, id: &str) -> PathBuf {
        self.snapshots_dir(id).join("snapshot-latest")
    }

    pub fn snapshot_dir(&self, id: &str, timestamp: &str) -> PathBuf {
        self.snapshots_dir(id).join(timestamp)
    }

    pub fn snapshot_memory_path(&self, id: &str, timestamp: &str) -> PathBuf {
        self.snapshot_dir(id, timestamp).join("state")
    }

    pub fn snapshot_network_path(&self, id: &str, timestamp: &str) -> PathBuf {
        self.snapshot_dir(id, timestamp).join("network.json")
    }

    /// Current network allocation for a Running instance, persisted
    /// alongside its metadata so a daemon restart can recover the live
    /// IP/MAC/TAP without a central allocations ledger (`spec.md` §4.3,
    /// §9).
    pub fn network_state_path(&self, id: &str) -> PathBuf {
        self.guest_dir(id).join("network.json")
    }

    // devices/
    pub fn devices_dir(&self) -> PathBuf {
        self.root.join("devices")
    }

    pub fn device_metadata_path(&self, id: &str) -> PathBuf {
        self.devices_dir().join(id).join("metadata.json")
    }

    // volumes/
    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    pub fn volume_dir(&self, id: &str) -> PathBuf {
        self.volumes_dir().join(id)
    }

    pub fn volume_metadata_path(&self, id: &str) -> PathBuf {
        self.volume_dir(id).join("metadata.json")
    }

    pub fn volume_disk_path(&self, id: &str) -> PathBuf {
        self.volume_dir(id).join("disk.raw")
    }

    // ingresses/
    pub fn ingresses_dir(&self) -> PathBuf {
        self.root.join("ingresses")
    }

    pub fn ingress_path(&self, id: &str) -> PathBuf {
        self.ingresses_dir().join(format!("{id}.json"))
    }

    // caddy/
    pub fn caddy_dir(&self) -> PathBuf {
        self.root.join("caddy")
    }

    pub fn caddy_config_path(&self) -> PathBuf {
        self.caddy_dir().join("config.json")
    }

    pub fn caddy_data_dir(&self) -> PathBuf {
        self.caddy_dir().join("data")
    }

    pub fn caddy_pid_path(&self) -> PathBuf {
        self.caddy_dir().join("pid")
    }

    pub fn caddy_log_path(&self) -> PathBuf {
        self.caddy_dir().join("log")
    }
}

/// Write `bytes` to `path` via a sibling temp file + atomic rename.
///
/// Used by every component that persists JSON or generated config so a
/// crash mid-write never leaves a half-written file behind (`spec.md` §5,
/// "Binaries and config files").
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HypemanError::Internal(format!("missing file: {}", path.display()))
        } else {
            HypemanError::from(e)
        }
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub async fn try_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_spec() {
        let root = DataRoot::new("/data");
        assert_eq!(
            root.kernel_path("6.6.1", "x86_64"),
            PathBuf::from("/data/system/kernel/6.6.1/x86_64/vmlinux")
        );
        assert_eq!(
            root.image_tag_link("library/alpine", "latest"),
            PathBuf::from("/data/images/library/alpine/latest")
        );
        assert_eq!(
            root.guest_dir("abc123"),
            PathBuf::from("/data/guests/abc123")
        );
        assert_eq!(
            root.snapshot_latest_link("abc123"),
            PathBuf::from("/data/guests/abc123/snapshots/snapshot-latest")
        );
    }

    #[tokio::test]
    async fn write_atomic_then_read_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("thing.json");
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Thing {
            a: u32,
        }
        write_json(&path, &Thing { a: 7 }).await.unwrap();
        let back: Thing = read_json(&path).await.unwrap();
        assert_eq!(back, Thing { a: 7 });
        // no leftover .tmp file
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn try_read_json_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let v: Option<serde_json::Value> = try_read_json(&path).await.unwrap();
        assert!(v.is_none());
    }
}
