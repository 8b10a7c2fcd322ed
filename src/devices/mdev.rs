//! mdev (vGPU) lifecycle on SR-IOV virtual functions (`spec.md` §4.2).
//!
//! VFs and mdevs are derived, never persisted: VFs come from scanning the
//! mdev bus, mdevs from sysfs. The only thing hypeman writes down is which
//! instance owns a given mdev UUID, recorded on the instance's own metadata.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{HypemanError, Result};
use crate::vfio::sysfs::SysfsRoot;

/// Process-wide lock serializing mdev create/destroy sysfs writes.
pub static MDEV_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFunction {
    pub vf_address: String,
    pub physfn_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdevDevice {
    pub uuid: String,
    pub vf_address: String,
    pub profile_type: String,
    pub instance_id: Option<String>,
}

/// Static per-PF profile list, cached after the first VF sampled for each
/// physical function (`spec.md` §4.2: "since all VFs on the same PF expose
/// identical profiles, sample only one VF per PF").
#[derive(Debug, Default, Clone)]
pub struct ProfileCache {
    by_physfn: HashMap<String, Vec<String>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn profiles_for(&self, physfn: &str) -> Option<&[String]> {
        self.by_physfn.get(physfn).map(|v| v.as_slice())
    }

    fn insert(&mut self, physfn: String, profiles: Vec<String>) {
        self.by_physfn.insert(physfn, profiles);
    }
}

fn mdev_bus_dir(sysfs: &SysfsRoot) -> PathBuf {
    sysfs.devices_dir().parent().unwrap().join("mdev_bus")
}

/// Scan `/sys/bus/mdev/devices` for virtual functions, reading each one's
/// `physfn` symlink back to its parent PF.
pub async fn discover_vfs(sysfs_root: &std::path::Path) -> Result<Vec<VirtualFunction>> {
    let dir = sysfs_root.join("bus/mdev/devices");
    let mut vfs = Vec::new();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vfs),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let vf_address = entry.file_name().to_string_lossy().into_owned();
        let physfn_link = entry.path().join("physfn");
        let target = match tokio::fs::read_link(&physfn_link).await {
            Ok(t) => t,
            Err(_) => continue,
        };
        let Some(physfn_address) = target.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            continue;
        };
        vfs.push(VirtualFunction {
            vf_address,
            physfn_address,
        });
    }
    Ok(vfs)
}

/// Reads `mdev_supported_types/*/name` under a VF's sysfs directory,
/// caching the result per physical function.
pub async fn supported_profiles(
    sysfs_root: &std::path::Path,
    cache: &mut ProfileCache,
    vf: &VirtualFunction,
) -> Result<Vec<String>> {
    if let Some(cached) = cache.profiles_for(&vf.physfn_address) {
        return Ok(cached.to_vec());
    }
    let dir = sysfs_root
        .join("bus/pci/devices")
        .join(&vf.vf_address)
        .join("mdev_supported_types");
    let mut profiles = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        profiles.push(entry.file_name().to_string_lossy().into_owned());
    }
    profiles.sort();
    cache.insert(vf.physfn_address.clone(), profiles.clone());
    Ok(profiles)
}

async fn available_instances(
    sysfs_root: &std::path::Path,
    vf_address: &str,
    profile: &str,
) -> Result<u32> {
    let path = sysfs_root
        .join("bus/pci/devices")
        .join(vf_address)
        .join("mdev_supported_types")
        .join(profile)
        .join("available_instances");
    let raw = tokio::fs::read_to_string(&path).await?;
    raw.trim()
        .parse()
        .map_err(|_| HypemanError::Internal(format!("unreadable available_instances at {}", path.display())))
}

/// Create an mdev of `profile` on the first VF with capacity, recording
/// `instance_id` as the owner. Serializes on [`MDEV_MUTEX`] per `spec.md`
/// §4.2: "under a single process-wide mdev mutex, pick the first VF whose
/// `available_instances >= 1`... write the UUID into the profile's `create`
/// file."
pub async fn create(
    sysfs_root: &std::path::Path,
    cache: &mut ProfileCache,
    vfs: &[VirtualFunction],
    profile: &str,
    instance_id: &str,
) -> Result<MdevDevice> {
    let _guard = MDEV_MUTEX.lock().await;

    for vf in vfs {
        let profiles = supported_profiles(sysfs_root, cache, vf).await?;
        if !profiles.iter().any(|p| p == profile) {
            continue;
        }
        let available = available_instances(sysfs_root, &vf.vf_address, profile).await?;
        if available < 1 {
            continue;
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        let create_path = sysfs_root
            .join("bus/pci/devices")
            .join(&vf.vf_address)
            .join("mdev_supported_types")
            .join(profile)
            .join("create");
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&create_path)
            .await?;
        f.write_all(uuid.as_bytes()).await?;

        info!(vf = %vf.vf_address, profile, uuid, instance = instance_id, "mdev created");
        return Ok(MdevDevice {
            uuid,
            vf_address: vf.vf_address.clone(),
            profile_type: profile.to_string(),
            instance_id: Some(instance_id.to_string()),
        });
    }

    Err(HypemanError::ResourceExhausted(format!(
        "no virtual function has capacity for profile {profile}"
    )))
}

/// Destroy an mdev: best-effort `mdevctl undefine`, then write `1` to its
/// sysfs `remove` file.
pub async fn destroy(sysfs_root: &std::path::Path, uuid: &str) -> Result<()> {
    let _guard = MDEV_MUTEX.lock().await;

    let status = tokio::process::Command::new("mdevctl")
        .args(["undefine", "--uuid", uuid])
        .status()
        .await;
    if !matches!(status, Ok(s) if s.success()) {
        warn!(uuid, "mdevctl undefine failed or unavailable, continuing with sysfs removal");
    }

    let remove_path = sysfs_root.join("bus/mdev/devices").join(uuid).join("remove");
    match tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&remove_path)
        .await
    {
        Ok(mut f) => {
            f.write_all(b"1").await?;
            info!(uuid, "mdev removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(uuid, "mdev already absent from sysfs");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// True if the mdev at `uuid` is currently bound to any driver, i.e. its
/// `driver` symlink resolves. Used by reconciliation's destroy precondition
/// (c): "the mdev is not bound to a driver".
pub async fn is_bound(sysfs_root: &std::path::Path, uuid: &str) -> bool {
    let link = sysfs_root.join("bus/mdev/devices").join(uuid).join("driver");
    tokio::fs::read_link(&link).await.is_ok()
}

/// Destroy an mdev if its owning instance is known, not Running, and not
/// Unknown, and the mdev is unbound (`spec.md` §4.2 reconciliation rule).
/// Anything else is left alone and returns `Ok(false)`.
pub async fn reconcile_one(
    sysfs_root: &std::path::Path,
    uuid: &str,
    owner_running_or_unknown: bool,
) -> Result<bool> {
    if owner_running_or_unknown {
        return Ok(false);
    }
    if is_bound(sysfs_root, uuid).await {
        warn!(uuid, "mdev eligible for reconcile but still bound to a driver, leaving alone");
        return Ok(false);
    }
    destroy(sysfs_root, uuid).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn make_vf(root: &std::path::Path, vf: &str, physfn: &str, profiles: &[(&str, u32)]) {
        let vf_dir = root.join("bus/pci/devices").join(vf);
        std::fs::create_dir_all(&vf_dir).unwrap();
        for (name, avail) in profiles {
            let p = vf_dir.join("mdev_supported_types").join(name);
            std::fs::create_dir_all(&p).unwrap();
            std::fs::write(p.join("available_instances"), avail.to_string()).unwrap();
            std::fs::write(p.join("create"), "").unwrap();
        }
        let physfn_dir = root.join("bus/pci/devices").join(physfn);
        std::fs::create_dir_all(&physfn_dir).unwrap();
        let _ = std::fs::remove_file(vf_dir.join("physfn"));
        symlink(&physfn_dir, vf_dir.join("physfn")).unwrap();

        let mdev_bus_dir = root.join("bus/mdev/devices");
        std::fs::create_dir_all(&mdev_bus_dir).unwrap();
        let _ = std::fs::remove_file(mdev_bus_dir.join(vf));
        symlink(&vf_dir, mdev_bus_dir.join(vf)).unwrap();
    }

    #[tokio::test]
    async fn discover_vfs_reads_physfn_links() {
        let dir = tempfile::tempdir().unwrap();
        make_vf(dir.path(), "0000:01:00.4", "0000:01:00.0", &[("nvidia-35", 1)]);
        let vfs = discover_vfs(dir.path()).await.unwrap();
        assert_eq!(vfs.len(), 1);
        assert_eq!(vfs[0].physfn_address, "0000:01:00.0");
    }

    #[tokio::test]
    async fn create_picks_vf_with_capacity_and_writes_uuid() {
        let dir = tempfile::tempdir().unwrap();
        make_vf(dir.path(), "0000:01:00.4", "0000:01:00.0", &[("nvidia-35", 0)]);
        make_vf(dir.path(), "0000:01:00.5", "0000:01:00.0", &[("nvidia-35", 2)]);
        let vfs = discover_vfs(dir.path()).await.unwrap();
        let mut cache = ProfileCache::new();
        let mdev = create(dir.path(), &mut cache, &vfs, "nvidia-35", "inst-1")
            .await
            .unwrap();
        assert_eq!(mdev.vf_address, "0000:01:00.5");
        assert_eq!(mdev.instance_id.as_deref(), Some("inst-1"));
    }

    #[tokio::test]
    async fn create_fails_when_no_capacity() {
        let dir = tempfile::tempdir().unwrap();
        make_vf(dir.path(), "0000:01:00.4", "0000:01:00.0", &[("nvidia-35", 0)]);
        let vfs = discover_vfs(dir.path()).await.unwrap();
        let mut cache = ProfileCache::new();
        let err = create(dir.path(), &mut cache, &vfs, "nvidia-35", "inst-1")
            .await
            .unwrap_err();
        assert!(matches!(err, HypemanError::ResourceExhausted(_)));
    }
}
