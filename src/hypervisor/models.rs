//! JSON request/response bodies for the Cloud Hypervisor control API
//! (`spec.md` §4.5, §6). Field names follow Cloud Hypervisor's own
//! `vmm/src/api/openapi/cloud-hypervisor.yaml` wire format.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct PayloadConfig {
    pub kernel: PathBuf,
    pub initramfs: PathBuf,
    pub cmdline: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpusConfig {
    pub boot_vcpus: u32,
    pub max_vcpus: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryConfig {
    pub size: u64,
    pub hotplug_size: Option<u64>,
    pub hotplug_method: Option<String>,
    pub shared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetConfig {
    pub tap: String,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VsockConfig {
    pub cid: u64,
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct VmConfig {
    pub payload: PayloadConfig,
    pub cpus: CpusConfig,
    pub memory: MemoryConfig,
    pub disks: Vec<DiskConfig>,
    pub net: Vec<NetConfig>,
    pub vsock: Option<VsockConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_devices: Vec<DeviceConfig>,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            kernel: PathBuf::new(),
            initramfs: PathBuf::new(),
            cmdline: String::new(),
        }
    }
}

impl Default for CpusConfig {
    fn default() -> Self {
        Self {
            boot_vcpus: 1,
            max_vcpus: 1,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            size: 0,
            hotplug_size: None,
            hotplug_method: None,
            shared: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotConfig {
    pub destination_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreConfig {
    pub source_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Created,
    Running,
    Paused,
    Shutdown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmInfo {
    pub state: VmState,
    pub config: VmInfoConfig,
}

/// The subset of `vm.info`'s echoed `config` this driver reads back,
/// notably the net device's resolved MAC/tap (used by network-allocation
/// derivation, `spec.md` §4.3). [`VmConfig`] above is request-only and
/// does not implement `Deserialize`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct VmInfoConfig {
    #[serde(default)]
    pub net: Vec<NetInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetInfo {
    pub tap: Option<String>,
    pub mac: Option<String>,
}
