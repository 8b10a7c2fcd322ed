//! Low-level sysfs operations for VFIO bind/unbind, `driver_override`,
//! probe, and IOMMU-group inspection (`spec.md` §4.2, C2).
//!
//! Every write goes through [`write_sysfs`], which is short and direct
//! (`spec.md` §9: "Always use short, direct writes... never try to
//! read/write the same file concurrently from multiple tasks"). Callers
//! serialize on [`VFIO_MUTEX`] even though sysfs itself is process-wide,
//! per the same note.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::{debug, info, warn};

pub mod sysfs;

use sysfs::SysfsRoot;

/// Process-wide lock serializing every VFIO-binder sysfs mutation.
pub static VFIO_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

#[derive(Debug, thiserror::Error)]
pub enum VfioError {
    #[error("device {0} not found in sysfs")]
    DeviceNotFound(String),

    #[error("sysfs io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "IOMMU group {group} conflict: device {other} is neither allowed, vfio-bound, nor a bridge"
    )]
    IommuGroupConflict { group: u32, other: String },

    #[error("vfio-pci driver not loaded (missing /sys/bus/pci/drivers/vfio-pci)")]
    DriverNotLoaded,
}

impl VfioError {
    pub fn classify(self) -> crate::error::HypemanError {
        use crate::error::HypemanError;
        match self {
            VfioError::DeviceNotFound(id) => {
                HypemanError::not_found(crate::error::EntityKind::Device, id)
            }
            VfioError::IommuGroupConflict { .. } => {
                HypemanError::PreconditionFailed(self.to_string())
            }
            VfioError::DriverNotLoaded => HypemanError::PreconditionFailed(self.to_string()),
            VfioError::Io { .. } => HypemanError::Internal(self.to_string()),
        }
    }
}

const NVIDIA_VENDOR_ID: &str = "10de";

/// Binds a PCI device at `pci_address` to the `vfio-pci` driver.
///
/// Implements the four-step protocol from `spec.md` §4.2:
/// 1. stop `nvidia-persistenced` first if the device is NVIDIA
/// 2. unbind from the current driver, if any
/// 3. set `driver_override` to `vfio-pci`
/// 4. write the address to `vfio-pci`'s `bind` file
pub async fn bind(root: &SysfsRoot, pci_address: &str) -> Result<(), VfioError> {
    let _guard = VFIO_MUTEX.lock().await;
    info!(pci_address, "binding device to vfio-pci");

    let vendor = root.read_vendor_id(pci_address).await?;
    let is_nvidia = vendor.eq_ignore_ascii_case(NVIDIA_VENDOR_ID);

    if is_nvidia {
        stop_nvidia_persistenced().await;
    }

    if let Some(driver) = root.current_driver(pci_address).await? {
        debug!(pci_address, driver, "unbinding from current driver");
        root.write_driver_file(&driver, "unbind", pci_address)
            .await?;
    }

    root.write_device_file(pci_address, "driver_override", "vfio-pci")
        .await?;
    root.write_driver_file("vfio-pci", "bind", pci_address)
        .await?;

    info!(pci_address, "device bound to vfio-pci");
    Ok(())
}

/// Reverses [`bind`]: clear override, unbind from vfio-pci, trigger probe,
/// and restart nvidia-persistenced for NVIDIA devices.
pub async fn unbind(root: &SysfsRoot, pci_address: &str) -> Result<(), VfioError> {
    let _guard = VFIO_MUTEX.lock().await;
    info!(pci_address, "unbinding device from vfio-pci");
    reset_lite(root, pci_address).await
}

/// The bounded per-device reset from `spec.md` §9 ("Reconcile-lite"):
/// clear `driver_override`, unbind from `vfio-pci`, trigger probe, restart
/// NVIDIA persistence. Used both by [`unbind`] and by device
/// reconciliation's orphan-clear phase. Caller must hold [`VFIO_MUTEX`].
pub async fn reset_lite(root: &SysfsRoot, pci_address: &str) -> Result<(), VfioError> {
    let vendor = root.read_vendor_id(pci_address).await.unwrap_or_default();
    let is_nvidia = vendor.eq_ignore_ascii_case(NVIDIA_VENDOR_ID);

    root.write_device_file(pci_address, "driver_override", "\n")
        .await
        .ok();

    if root.is_bound_to(pci_address, "vfio-pci").await {
        root.write_driver_file("vfio-pci", "unbind", pci_address)
            .await?;
    }

    root.write_pci_bus_file("drivers_probe", pci_address)
        .await?;

    if is_nvidia {
        start_nvidia_persistenced().await;
    }

    Ok(())
}

/// Enumerate every device sharing `pci_address`'s IOMMU group and confirm
/// each is either explicitly `allowed`, already vfio-bound, or a PCI
/// bridge (class `06xxxx`). `spec.md` §4.2.
pub async fn check_iommu_group_safety(
    root: &SysfsRoot,
    pci_address: &str,
    allowed: &[String],
) -> Result<(), VfioError> {
    let group = root.iommu_group(pci_address).await?;
    let members = root.iommu_group_members(group).await?;

    for member in members {
        if member == pci_address {
            continue;
        }
        if allowed.iter().any(|a| a == &member) {
            continue;
        }
        if root.is_bound_to(&member, "vfio-pci").await {
            continue;
        }
        if root.is_pci_bridge(&member).await.unwrap_or(false) {
            continue;
        }
        return Err(VfioError::IommuGroupConflict {
            group,
            other: member,
        });
    }
    Ok(())
}

async fn stop_nvidia_persistenced() {
    info!("stopping nvidia-persistenced (required for unbind)");
    let status = Command::new("systemctl")
        .args(["stop", "nvidia-persistenced"])
        .status()
        .await;
    match status {
        Ok(s) if s.success() => return,
        _ => {}
    }
    warn!("systemctl stop failed, signaling nvidia-persistenced directly");
    let _ = Command::new("pkill")
        .args(["-TERM", "nvidia-persistenced"])
        .status()
        .await;
}

async fn start_nvidia_persistenced() {
    let status = Command::new("systemctl")
        .args(["start", "nvidia-persistenced"])
        .status()
        .await;
    if !matches!(status, Ok(s) if s.success()) {
        warn!("failed to restart nvidia-persistenced after reset");
    }
}

/// True if `/sys/bus/pci/drivers/vfio-pci` exists, i.e. the kernel module
/// is loaded. Checked once at device-manager start.
pub fn vfio_pci_driver_loaded(root: &SysfsRoot) -> bool {
    root.driver_dir("vfio-pci").exists()
}

pub fn pci_devices_root(root: &SysfsRoot) -> PathBuf {
    root.devices_dir()
}
