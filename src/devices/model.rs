//! Device registry entities persisted under `devices/<id>/metadata.json`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Gpu,
    Nic,
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub pci_address: String,
    pub vendor_id: String,
    pub device_id: String,
    pub iommu_group: u32,
    pub bound_to_vfio: bool,
    pub attached_to: Option<String>,
    pub created_at: String,
}
