//! Instance entity persisted under `guests/<id>/metadata.json` (`spec.md`
//! §3, §4.1).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Creating,
    Running,
    Standby,
    Stopped,
    Deleting,
    /// Last-known state could not be reconciled against a live VMM or a
    /// snapshot on disk (`spec.md` §9's Unknown-state asymmetry).
    Unknown,
}

impl InstanceState {
    /// Non-terminal states count against name uniqueness and resource caps;
    /// `Deleting` does not (`spec.md` §4.1).
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Deleting)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdevAttachment {
    pub uuid: String,
    pub vf_address: String,
    pub profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub state: InstanceState,
    pub vcpus: u32,
    pub mem_size: u64,
    pub hotplug_size: u64,
    pub overlay_size: u64,
    pub network_enabled: bool,
    pub device_ids: Vec<String>,
    pub volume_attachments: Vec<VolumeAttachment>,
    pub env: HashMap<String, String>,
    pub gpu_mdev: Option<MdevAttachment>,
    /// Guaranteed shaping rate (bytes/sec) applied to this instance's TAP,
    /// whether from an explicit `CreateRequest::rate_bps` override or the
    /// `spec.md` §4.3 default formula computed at allocation time. `None`
    /// when `network_enabled` is false. Reapplied verbatim by `start`/
    /// `restore` so a resumed VM gets the same shaping it had before
    /// ("Reapply shaping from instance metadata", `spec.md` §4.3).
    pub network_rate_bps: Option<u64>,
    pub created_at: String,
}

/// Request body for [`super::InstanceManager::create`].
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub image_ref: String,
    pub vcpus: u32,
    pub mem_size: u64,
    pub hotplug_size: u64,
    pub overlay_size: u64,
    pub network_enabled: bool,
    pub env: HashMap<String, String>,
    pub device_names: Vec<String>,
    pub volume_attachments: Vec<VolumeAttachment>,
    pub gpu_profile: Option<String>,
    /// Explicit guaranteed shaping rate override (bytes/sec). `None` uses
    /// the `spec.md` §4.3 default formula.
    pub rate_bps: Option<u64>,
}

/// Network allocation recorded alongside a snapshot, the only place a
/// Standby instance's IP/MAC/TAP name survives (`spec.md` §4.3: "no central
/// allocations file").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshottedNetwork {
    pub tap_name: String,
    pub ip: std::net::Ipv4Addr,
    pub mac: String,
}
