//! hypeman: a host-resident control plane turning OCI container images
//! into Cloud-Hypervisor-based microVMs.
//!
//! This crate is the core engine — instance lifecycle, device
//! passthrough, network fabric, guest-agent transport, and the ingress
//! supervisor. The HTTP façade, auth, and image conversion pipeline are
//! external collaborators and live outside this crate.

pub mod config;
pub mod devices;
pub mod error;
pub mod guest_rpc;
pub mod hypervisor;
pub mod images;
pub mod ingress;
pub mod instance;
pub mod network;
pub mod paths;
pub mod system;
pub mod vfio;
pub mod volumes;

/// Current time as an RFC 3339 string, used for every `created_at` and
/// snapshot timestamp written to disk.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A collision-resistant 24-hex-char identifier (`spec.md` §3).
pub fn new_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    let hex = uuid.simple().to_string();
    hex[..24].to_string()
}
