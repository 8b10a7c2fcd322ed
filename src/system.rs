//! System manager (C6): ensures the kernel, initrd, and VMM binary that
//! every instance boots from are present on disk (`spec.md` §2, §6).
//!
//! Building the initrd (which embeds the guest agent) and fetching the
//! Cloud Hypervisor binary are external build/ops concerns; this module
//! only verifies presence and resolves paths, the way the teacher's
//! `ImageStoreManager` resolves cache paths without itself compiling
//! anything.

use tracing::debug;

use crate::error::{HypemanError, Result};
use crate::paths::DataRoot;

pub struct SystemManager {
    data_root: DataRoot,
    kernel_version: String,
    arch: String,
}

impl SystemManager {
    pub fn new(data_root: DataRoot, kernel_version: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            data_root,
            kernel_version: kernel_version.into(),
            arch: arch.into(),
        }
    }

    /// Verifies the kernel and the `latest` initrd symlink resolve to real
    /// files. Called once at daemon start, before any instance can boot.
    pub async fn ensure_present(&self) -> Result<()> {
        let kernel = self.kernel_path();
        if !tokio::fs::try_exists(&kernel).await.unwrap_or(false) {
            return Err(HypemanError::PreconditionFailed(format!(
                "kernel missing at {}",
                kernel.display()
            )));
        }

        let initrd = self.initrd_path().await?;
        if !tokio::fs::try_exists(&initrd).await.unwrap_or(false) {
            return Err(HypemanError::PreconditionFailed(format!(
                "initrd missing at {}",
                initrd.display()
            )));
        }

        debug!(kernel = %kernel.display(), initrd = %initrd.display(), "system images present");
        Ok(())
    }

    pub fn kernel_path(&self) -> std::path::PathBuf {
        self.data_root.kernel_path(&self.kernel_version, &self.arch)
    }

    /// Resolves `system/initrd/<arch>/latest` to its timestamped target and
    /// returns the concrete `initrd` file path underneath it.
    pub async fn initrd_path(&self) -> Result<std::path::PathBuf> {
        let link = self.data_root.initrd_latest_link(&self.arch);
        let target = tokio::fs::read_link(&link).await.map_err(|_| {
            HypemanError::PreconditionFailed(format!(
                "no initrd published at {}",
                link.display()
            ))
        })?;
        let dir = if target.is_absolute() {
            target
        } else {
            self.data_root.initrd_dir(&self.arch).join(target)
        };
        Ok(dir.join("initrd"))
    }

    pub fn vmm_binary_path(&self, binary: &str) -> std::path::PathBuf {
        self.data_root
            .vmm_binary_path(&self.kernel_version, &self.arch, binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn seed(root: &std::path::Path, version: &str, arch: &str) {
        let data_root = DataRoot::new(root);
        std::fs::create_dir_all(data_root.kernel_path(version, arch).parent().unwrap()).unwrap();
        std::fs::write(data_root.kernel_path(version, arch), b"vmlinux").unwrap();

        let ts_dir = data_root.initrd_dir(arch).join("20260101T000000");
        std::fs::create_dir_all(&ts_dir).unwrap();
        std::fs::write(ts_dir.join("initrd"), b"initrd").unwrap();
        symlink("20260101T000000", data_root.initrd_latest_link(arch)).unwrap();
    }

    #[tokio::test]
    async fn ensure_present_resolves_latest_symlink() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "6.6.1", "x86_64");
        let mgr = SystemManager::new(DataRoot::new(dir.path()), "6.6.1", "x86_64");
        mgr.ensure_present().await.unwrap();
        let initrd = mgr.initrd_path().await.unwrap();
        assert!(initrd.ends_with("20260101T000000/initrd"));
    }

    #[tokio::test]
    async fn ensure_present_fails_when_kernel_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SystemManager::new(DataRoot::new(dir.path()), "6.6.1", "x86_64");
        let err = mgr.ensure_present().await.unwrap_err();
        assert!(matches!(err, HypemanError::PreconditionFailed(_)));
    }
}
