//! Registry of registered passthrough devices, VFIO lifecycle, orphan
//! reconciliation, and mdev lifecycle on VFs (`spec.md` §4.2, C3).

pub mod mdev;
pub mod model;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{EntityKind, HypemanError, Result};
use crate::paths::DataRoot;
use crate::vfio::{self, sysfs::SysfsRoot};

pub use model::Device;

/// Narrow capability the instance manager implements and hands to the
/// device manager after construction, resolving the circular dependency
/// noted in `spec.md` §9.
#[async_trait::async_trait]
pub trait InstanceView: Send + Sync {
    /// True if `instance_id` exists and is currently Running.
    async fn is_running(&self, instance_id: &str) -> bool;

    /// Device ids attached to `instance_id` per its own metadata.
    async fn devices_of(&self, instance_id: &str) -> Vec<String>;

    /// Map of instance id -> device ids, for every known instance.
    async fn all_devices_by_instance(&self) -> HashMap<String, Vec<String>>;

    /// PCI addresses (via `--api-socket` argument) of running hypervisor
    /// processes that do not correspond to a known Running instance.
    async fn detect_stray_vmms(&self) -> Vec<String>;
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub cleared: u32,
    pub warnings: Vec<String>,
    pub suspicious_vmms: Vec<String>,
}

pub struct DeviceManager {
    data_root: DataRoot,
    sysfs: SysfsRoot,
    devices: RwLock<HashMap<String, Device>>,
    instances: RwLock<Option<Arc<dyn InstanceView>>>,
}

impl DeviceManager {
    pub fn new(data_root: DataRoot, sysfs: SysfsRoot) -> Self {
        Self {
            data_root,
            sysfs,
            devices: RwLock::new(HashMap::new()),
            instances: RwLock::new(None),
        }
    }

    /// Late-bind the instance-manager predicate interface (`spec.md` §9).
    pub async fn set_instance_view(&self, view: Arc<dyn InstanceView>) {
        *self.instances.write().await = Some(view);
    }

    async fn instance_view(&self) -> Option<Arc<dyn InstanceView>> {
        self.instances.read().await.clone()
    }

    /// Load every persisted device registry entry from disk.
    pub async fn load_all(&self) -> Result<()> {
        let dir = self.data_root.devices_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        let mut devices = self.devices.write().await;
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let path = self.data_root.device_metadata_path(&id);
            if let Some(device) = crate::paths::try_read_json::<Device>(&path).await? {
                devices.insert(id, device);
            }
        }
        Ok(())
    }

    pub async fn register(&self, device: Device) -> Result<Device> {
        let mut devices = self.devices.write().await;
        if devices.values().any(|d| d.name == device.name) {
            return Err(HypemanError::already_exists(
                EntityKind::Device,
                device.name.clone(),
            ));
        }
        crate::paths::write_json(
            &self.data_root.device_metadata_path(&device.id),
            &device,
        )
        .await?;
        devices.insert(device.id.clone(), device.clone());
        Ok(device)
    }

    pub async fn get(&self, id: &str) -> Result<Device> {
        self.devices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HypemanError::not_found(EntityKind::Device, id))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Device> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| HypemanError::not_found(EntityKind::Device, name))
    }

    pub async fn list(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get(id)
            .ok_or_else(|| HypemanError::not_found(EntityKind::Device, id))?;
        if device.attached_to.is_some() {
            return Err(HypemanError::in_use(
                EntityKind::Device,
                id,
                "device is attached to an instance",
            ));
        }
        devices.remove(id);
        let dir = self.data_root.devices_dir().join(id);
        tokio::fs::remove_dir_all(&dir).await.ok();
        Ok(())
    }

    /// Bind a device and mark it attached to `instance_id`. Undone by
    /// [`Self::detach`] on rollback (`spec.md` §9 "Graph of side effects").
    pub async fn attach(&self, id: &str, instance_id: &str) -> Result<()> {
        {
            let devices = self.devices.read().await;
            let device = devices
                .get(id)
                .ok_or_else(|| HypemanError::not_found(EntityKind::Device, id))?;
            if device.attached_to.is_some() {
                return Err(HypemanError::in_use(
                    EntityKind::Device,
                    id,
                    "already attached",
                ));
            }
        }

        vfio::check_iommu_group_safety(&self.sysfs, &self.device_pci_address(id).await?, &[])
            .await
            .map_err(VfioError::classify_static)?;
        vfio::bind(&self.sysfs, &self.device_pci_address(id).await?)
            .await
            .map_err(VfioError::classify_static)?;

        let mut devices = self.devices.write().await;
        let device = devices.get_mut(id).expect("checked above");
        device.attached_to = Some(instance_id.to_string());
        device.bound_to_vfio = true;
        let snapshot = device.clone();
        drop(devices);
        crate::paths::write_json(&self.data_root.device_metadata_path(id), &snapshot).await?;
        info!(device = id, instance = instance_id, "device attached");
        Ok(())
    }

    async fn device_pci_address(&self, id: &str) -> Result<String> {
        Ok(self.get(id).await?.pci_address)
    }

    /// Unbind a device and clear its attachment, best-effort.
    pub async fn detach(&self, id: &str) -> Result<()> {
        let pci = self.device_pci_address(id).await?;
        if let Err(e) = vfio::unbind(&self.sysfs, &pci).await {
            warn!(device = id, error = %e, "unbind failed during detach");
        }
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(id) {
            device.attached_to = None;
            device.bound_to_vfio = self.sysfs.is_bound_to(&pci, "vfio-pci").await;
            let snapshot = device.clone();
            drop(devices);
            crate::paths::write_json(&self.data_root.device_metadata_path(id), &snapshot).await?;
        }
        Ok(())
    }

    /// Device reconciliation, `spec.md` §4.2: refresh `bound_to_vfio`,
    /// clear orphaned attachments (phase A), log-only cross-check against
    /// instance-reported ownership (phase B), and flag suspicious VMMs
    /// (phase C). Never fails the whole process — accumulates into the
    /// report, per `spec.md` §7.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let Some(view) = self.instance_view().await else {
            report
                .warnings
                .push("no instance view registered, skipping reconcile".into());
            return report;
        };

        // Refresh bound_to_vfio for everything up front.
        let ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        for id in &ids {
            let pci = match self.device_pci_address(id).await {
                Ok(p) => p,
                Err(_) => continue,
            };
            let bound = self.sysfs.is_bound_to(&pci, "vfio-pci").await;
            let mut devices = self.devices.write().await;
            if let Some(d) = devices.get_mut(id) {
                d.bound_to_vfio = bound;
            }
        }

        // Phase A: orphan clear.
        for id in &ids {
            let attached_to = self.devices.read().await.get(id).and_then(|d| d.attached_to.clone());
            let Some(owner) = attached_to else { continue };
            if view.is_running(&owner).await {
                continue;
            }
            let pci = match self.device_pci_address(id).await {
                Ok(p) => p,
                Err(_) => continue,
            };
            {
                let _guard = vfio::VFIO_MUTEX.lock().await;
                if let Err(e) = vfio::reset_lite(&self.sysfs, &pci).await {
                    report.warnings.push(format!(
                        "device {id} reset-lite during orphan clear failed: {e}"
                    ));
                }
            }
            let mut devices = self.devices.write().await;
            if let Some(d) = devices.get_mut(id) {
                d.attached_to = None;
                d.bound_to_vfio = self.sysfs.is_bound_to(&pci, "vfio-pci").await;
                let snapshot = d.clone();
                drop(devices);
                if let Err(e) =
                    crate::paths::write_json(&self.data_root.device_metadata_path(id), &snapshot)
                        .await
                {
                    report
                        .warnings
                        .push(format!("failed to persist device {id} after clear: {e}"));
                }
            }
            report.cleared += 1;
        }

        // Phase B: log-only cross-check.
        let by_instance = view.all_devices_by_instance().await;
        for (instance_id, device_ids) in by_instance {
            let running = view.is_running(&instance_id).await;
            for device_id in device_ids {
                let devices = self.devices.read().await;
                match devices.get(&device_id) {
                    None => report.warnings.push(format!(
                        "instance {instance_id} references unknown device {device_id}"
                    )),
                    Some(d) if d.attached_to.is_none() => report.warnings.push(format!(
                        "instance {instance_id} references device {device_id} with no attached_to"
                    )),
                    Some(d) if d.attached_to.as_deref() != Some(instance_id.as_str()) => {
                        report.warnings.push(format!(
                            "instance {instance_id} references device {device_id} attached to {:?}",
                            d.attached_to
                        ))
                    }
                    Some(d) if running && !d.bound_to_vfio => report.warnings.push(format!(
                        "device {device_id} owned by running instance {instance_id} but not vfio-bound"
                    )),
                    _ => {}
                }
            }
        }

        // Phase C: suspicious VMMs, log-only.
        for stray in view.detect_stray_vmms().await {
            report.warnings.push(format!(
                "hypervisor process for {stray} does not map to a known Running instance"
            ));
            report.suspicious_vmms.push(stray);
        }

        for w in &report.warnings {
            warn!("{w}");
        }
        info!(cleared = report.cleared, warnings = report.warnings.len(), "device reconcile complete");
        report
    }
}

// Thin shim so `.map_err(VfioError::classify_static)` reads naturally above
// without importing the method name ambiguously.
trait VfioErrExt {
    fn classify_static(self) -> HypemanError;
}
impl VfioErrExt for crate::vfio::VfioError {
    fn classify_static(self) -> HypemanError {
        self.classify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeView {
        running: Vec<String>,
    }

    #[async_trait::async_trait]
    impl InstanceView for FakeView {
        async fn is_running(&self, id: &str) -> bool {
            self.running.iter().any(|r| r == id)
        }
        async fn devices_of(&self, _id: &str) -> Vec<String> {
            vec![]
        }
        async fn all_devices_by_instance(&self) -> HashMap<String, Vec<String>> {
            HashMap::new()
        }
        async fn detect_stray_vmms(&self) -> Vec<String> {
            vec![]
        }
    }

    async fn make_manager() -> (tempfile::TempDir, DeviceManager) {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path().join("data"));
        let sysfs = SysfsRoot::new(dir.path().join("sys"));
        std::fs::create_dir_all(sysfs.devices_dir().join("0000:99:00.0")).unwrap();
        std::fs::write(
            sysfs.devices_dir().join("0000:99:00.0").join("vendor"),
            "0x10de\n",
        )
        .unwrap();
        (dir, DeviceManager::new(data_root, sysfs))
    }

    #[tokio::test]
    async fn orphan_clear_drops_attachment_to_missing_instance() {
        let (_dir, mgr) = make_manager().await;
        let device = Device {
            id: "d1".into(),
            name: "gpu0".into(),
            device_type: model::DeviceType::Gpu,
            pci_address: "0000:99:00.0".into(),
            vendor_id: "10de".into(),
            device_id: "27b8".into(),
            iommu_group: 1,
            bound_to_vfio: false,
            attached_to: Some("i-missing".into()),
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        mgr.register(device).await.unwrap();
        mgr.set_instance_view(Arc::new(FakeView { running: vec![] }))
            .await;

        let report = mgr.reconcile().await;
        assert_eq!(report.cleared, 1);

        let d = mgr.get("d1").await.unwrap();
        assert!(d.attached_to.is_none());
    }

    #[tokio::test]
    async fn register_rejects_duplicate_name() {
        let (_dir, mgr) = make_manager().await;
        let device = Device {
            id: "d1".into(),
            name: "gpu0".into(),
            device_type: model::DeviceType::Gpu,
            pci_address: "0000:99:00.0".into(),
            vendor_id: "10de".into(),
            device_id: "27b8".into(),
            iommu_group: 1,
            bound_to_vfio: false,
            attached_to: None,
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        mgr.register(device.clone()).await.unwrap();
        let mut dup = device;
        dup.id = "d2".into();
        let err = mgr.register(dup).await.unwrap_err();
        assert!(matches!(err, HypemanError::AlreadyExists { .. }));
    }
}
