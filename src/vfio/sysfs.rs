//! Sysfs path/IO primitives, factored out so the bind/unbind protocol in
//! [`super`] can be driven against a `tempfile` tree in tests instead of
//! the real `/sys`.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::VfioError;

/// Base of a sysfs tree. In production this is `/sys`; tests point it at
/// a synthetic temp directory with the same relative layout.
#[derive(Debug, Clone)]
pub struct SysfsRoot {
    base: PathBuf,
}

impl SysfsRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn default_root() -> Self {
        Self::new("/sys")
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.base.join("bus/pci/devices")
    }

    fn device_dir(&self, pci_address: &str) -> PathBuf {
        self.base.join("bus/pci/devices").join(pci_address)
    }

    pub fn driver_dir(&self, driver: &str) -> PathBuf {
        self.base.join("bus/pci/drivers").join(driver)
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), VfioError> {
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|source| VfioError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        f.write_all(contents.as_bytes())
            .await
            .map_err(|source| VfioError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(())
    }

    pub async fn write_device_file(
        &self,
        pci_address: &str,
        file: &str,
        contents: &str,
    ) -> Result<(), VfioError> {
        let path = self.device_dir(pci_address).join(file);
        self.write_file(&path, contents).await
    }

    pub async fn write_driver_file(
        &self,
        driver: &str,
        file: &str,
        contents: &str,
    ) -> Result<(), VfioError> {
        let path = self.driver_dir(driver).join(file);
        self.write_file(&path, contents).await
    }

    pub async fn write_pci_bus_file(&self, file: &str, contents: &str) -> Result<(), VfioError> {
        let path = self.base.join("bus/pci").join(file);
        self.write_file(&path, contents).await
    }

    pub async fn read_vendor_id(&self, pci_address: &str) -> Result<String, VfioError> {
        let path = self.device_dir(pci_address).join("vendor");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| VfioError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(raw.trim().trim_start_matches("0x").to_string())
    }

    pub async fn read_device_id(&self, pci_address: &str) -> Result<String, VfioError> {
        let path = self.device_dir(pci_address).join("device");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| VfioError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(raw.trim().trim_start_matches("0x").to_string())
    }

    pub async fn read_class(&self, pci_address: &str) -> Result<String, VfioError> {
        let path = self.device_dir(pci_address).join("class");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| VfioError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(raw.trim().trim_start_matches("0x").to_string())
    }

    pub async fn is_pci_bridge(&self, pci_address: &str) -> Result<bool, VfioError> {
        let class = self.read_class(pci_address).await?;
        Ok(class.starts_with("06"))
    }

    /// The device's current driver, read from the `driver` symlink's
    /// target basename. `None` if unbound.
    pub async fn current_driver(&self, pci_address: &str) -> Result<Option<String>, VfioError> {
        let link = self.device_dir(pci_address).join("driver");
        match tokio::fs::read_link(&link).await {
            Ok(target) => Ok(target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(VfioError::Io { path: link, source }),
        }
    }

    pub async fn is_bound_to(&self, pci_address: &str, driver: &str) -> bool {
        matches!(self.current_driver(pci_address).await, Ok(Some(d)) if d == driver)
    }

    /// The numeric IOMMU group id for `pci_address`, parsed from the
    /// `iommu_group` symlink's target basename.
    pub async fn iommu_group(&self, pci_address: &str) -> Result<u32, VfioError> {
        let link = self.device_dir(pci_address).join("iommu_group");
        let target = tokio::fs::read_link(&link)
            .await
            .map_err(|source| VfioError::Io {
                path: link.clone(),
                source,
            })?;
        target
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| VfioError::Io {
                path: link,
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad iommu_group"),
            })
    }

    /// Every PCI address that is a member of IOMMU `group`, by scanning
    /// `/sys/kernel/iommu_groups/<group>/devices/`.
    pub async fn iommu_group_members(&self, group: u32) -> Result<Vec<String>, VfioError> {
        let dir = self
            .base
            .join("kernel/iommu_groups")
            .join(group.to_string())
            .join("devices");
        let mut members = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|source| VfioError::Io {
                path: dir.clone(),
                source,
            })?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| VfioError::Io {
            path: dir.clone(),
            source,
        })? {
            members.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn make_device(base: &Path, addr: &str, vendor: &str, class: &str, group: u32) {
        let dev = base.join("bus/pci/devices").join(addr);
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("vendor"), format!("0x{vendor}\n")).unwrap();
        std::fs::write(dev.join("device"), "0x27b8\n").unwrap();
        std::fs::write(dev.join("class"), format!("0x{class}\n")).unwrap();

        let group_dir = base
            .join("kernel/iommu_groups")
            .join(group.to_string())
            .join("devices");
        std::fs::create_dir_all(&group_dir).unwrap();
        let _ = std::fs::remove_file(group_dir.join(addr));
        symlink(&dev, group_dir.join(addr)).unwrap();

        let iommu_link = dev.join("iommu_group");
        let _ = std::fs::remove_file(&iommu_link);
        symlink(
            base.join("kernel/iommu_groups").join(group.to_string()),
            iommu_link,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn reads_vendor_and_class() {
        let dir = tempfile::tempdir().unwrap();
        make_device(dir.path(), "0000:01:00.0", "10de", "030000", 5);
        let root = SysfsRoot::new(dir.path());
        assert_eq!(root.read_vendor_id("0000:01:00.0").await.unwrap(), "10de");
        assert!(!root.is_pci_bridge("0000:01:00.0").await.unwrap());
    }

    #[tokio::test]
    async fn iommu_group_members_lists_siblings() {
        let dir = tempfile::tempdir().unwrap();
        make_device(dir.path(), "0000:01:00.0", "10de", "030000", 5);
        make_device(dir.path(), "0000:01:00.1", "10de", "048000", 5);
        let root = SysfsRoot::new(dir.path());
        let group = root.iommu_group("0000:01:00.0").await.unwrap();
        assert_eq!(group, 5);
        let mut members = root.iommu_group_members(group).await.unwrap();
        members.sort();
        assert_eq!(members, vec!["0000:01:00.0", "0000:01:00.1"]);
    }

    #[tokio::test]
    async fn current_driver_none_when_unbound() {
        let dir = tempfile::tempdir().unwrap();
        make_device(dir.path(), "0000:01:00.0", "10de", "030000", 5);
        let root = SysfsRoot::new(dir.path());
        assert_eq!(root.current_driver("0000:01:00.0").await.unwrap(), None);
    }
}
