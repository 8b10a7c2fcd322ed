//! Environment/CLI configuration surface (`spec.md` §6).
//!
//! Mirrors the teacher's `qarax-node` `Args` struct: a single `clap::
//! Parser` with `env` attributes, `rename_all_env = "screaming-snake"`, so
//! every flag doubles as the documented environment variable.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "hypeman",
    about = "hypeman — OCI-to-microVM control plane",
    rename_all = "kebab-case",
    rename_all_env = "screaming-snake"
)]
pub struct HypemanConfig {
    /// Root of the on-disk layout.
    #[clap(long, default_value = "/var/lib/hypeman")]
    pub data_dir: PathBuf,

    /// Path to the Cloud Hypervisor binary.
    #[clap(long, default_value = "/usr/local/bin/cloud-hypervisor")]
    pub cloud_hypervisor_binary: PathBuf,

    /// Name of the Linux bridge all networked VMs are enslaved to.
    #[clap(long, default_value = "vmbr0")]
    pub bridge_name: String,

    /// IPv4 CIDR the bridge and all VM addresses are drawn from.
    #[clap(long, default_value = "192.168.127.0/24")]
    pub subnet_cidr: String,

    /// Host interface VM traffic is NAT-masqueraded out of.
    #[clap(long, default_value = "eth0")]
    pub uplink_interface: String,

    /// Host vCPU capacity the default per-VM shaping rate is scaled
    /// against (`spec.md` §4.3: `(vcpus / cpu_capacity) * network_capacity`).
    #[clap(long, default_value_t = num_cpus::get() as u32)]
    pub cpu_capacity: u32,

    /// Host network capacity, bytes/sec, for the same default-rate formula.
    #[clap(long, default_value_t = 1_250_000_000)]
    pub network_capacity_bps: u64,

    /// DNS server handed to guests via the config disk.
    #[clap(long, default_value = "1.1.1.1")]
    pub dns_server: String,

    /// Maximum overlay size (bytes) permitted for a single instance.
    #[clap(long, default_value_t = 64 * 1024 * 1024 * 1024)]
    pub max_overlay_size: u64,

    /// Maximum number of concurrent image builds/pulls.
    #[clap(long, default_value_t = 4)]
    pub max_concurrent_builds: usize,

    /// Address Caddy listens on for proxied traffic.
    #[clap(long, default_value = "0.0.0.0:443")]
    pub caddy_listen_address: String,

    /// Address of Caddy's admin API.
    #[clap(long, default_value = "127.0.0.1")]
    pub caddy_admin_address: String,

    /// Port of Caddy's admin API.
    #[clap(long, default_value_t = 2019)]
    pub caddy_admin_port: u16,

    /// Whether to send Caddy a shutdown request when hypeman exits.
    #[clap(long, default_value_t = true)]
    pub caddy_stop_on_shutdown: bool,

    /// Comma-separated list of allowed ingress hostname patterns.
    #[clap(long, default_value = "*")]
    pub tls_allowed_domains: String,

    /// Contact email handed to Caddy's ACME automation policy. Unset
    /// disables `tls: true` ingress rules entirely.
    #[clap(long)]
    pub acme_email: Option<String>,

    /// Suffix resolved by the embedded DNS server (`<instance>.<suffix>`).
    #[clap(long, default_value = "vm.internal")]
    pub dns_suffix: String,

    /// Address the embedded DNS resolver listens on.
    #[clap(long, default_value = "127.0.0.1:5353")]
    pub dns_listen_address: String,

    /// Path to the Caddy binary.
    #[clap(long, default_value = "/usr/local/bin/caddy")]
    pub caddy_binary: PathBuf,

    /// Bounded wait for the hypervisor control socket to become ready.
    #[clap(long, default_value_t = 10_000)]
    pub spawn_timeout_ms: u64,

    /// Bounded wait for the guest agent to answer after boot.
    #[clap(long, default_value_t = 30_000)]
    pub boot_timeout_ms: u64,

    /// Bounded wait for a VMM to exit after SIGTERM, before SIGKILL.
    #[clap(long, default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    /// Kernel version directory under `system/kernel/<ver>` and
    /// `system/binaries/<ver>`. Defaults to the running kernel's `uname -r`.
    #[clap(long)]
    pub kernel_version: Option<String>,

    /// Architecture directory under `system/kernel/<ver>/<arch>` and
    /// `system/initrd/<arch>`. Defaults to the host's own architecture.
    #[clap(long)]
    pub arch: Option<String>,
}

/// Resource caps enforced by the instance manager (`spec.md` §4.1).
///
/// Not itself part of the externally-documented environment-variable
/// surface in `spec.md` §6 — constructed from sane internal defaults, but
/// exposed as a constructor parameter so callers embedding this crate can
/// override it.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_vcpus_per_instance: u32,
    pub max_mem_per_instance: u64,
    pub max_overlay_per_instance: u64,
    pub max_total_vcpus: u32,
    pub max_total_mem: u64,
    pub max_volumes_per_instance: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_vcpus_per_instance: 16,
            max_mem_per_instance: 32 * 1024 * 1024 * 1024,
            max_overlay_per_instance: 64 * 1024 * 1024 * 1024,
            max_total_vcpus: num_cpus::get() as u32 * 4,
            max_total_mem: 256 * 1024 * 1024 * 1024,
            max_volumes_per_instance: 8,
        }
    }
}
