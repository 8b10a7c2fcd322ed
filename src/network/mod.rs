//! Bridge/TAP/iptables network fabric, IP/MAC/TAP allocation derived from
//! live VM info and snapshots, and traffic shaping (`spec.md` §4.3, C4).
//!
//! There is no allocations ledger: "current allocations" are whatever the
//! [`AllocationView`] the instance manager hands us reports right now.

pub mod shaping;

use std::collections::HashSet;
use std::net::Ipv4Addr;

use rand::Rng;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::HypemanError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no free IP address in {0}")]
    AddressSpaceExhausted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("command `{cmd}` failed: {stderr}")]
    CommandFailed { cmd: String, stderr: String },

    #[error("/proc/sys/net/ipv4/ip_forward is 0; enable IPv4 forwarding before starting hypeman")]
    ForwardingDisabled,

    #[error("invalid CIDR {0}")]
    InvalidCidr(String),
}

impl NetworkError {
    pub fn classify(self) -> HypemanError {
        match self {
            NetworkError::AddressSpaceExhausted(_) => HypemanError::ResourceExhausted(self.to_string()),
            NetworkError::ForwardingDisabled | NetworkError::InvalidCidr(_) => {
                HypemanError::PreconditionFailed(self.to_string())
            }
            other => HypemanError::Internal(other.to_string()),
        }
    }
}

/// A parsed IPv4 CIDR block. Hand-rolled rather than pulled from a crate:
/// the only operations needed are "nth usable address" and "contains",
/// both a few lines of integer math.
#[derive(Debug, Clone, Copy)]
pub struct Cidr {
    network: u32,
    prefix_len: u32,
}

impl Cidr {
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| NetworkError::InvalidCidr(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| NetworkError::InvalidCidr(s.to_string()))?;
        let len: u32 = len
            .parse()
            .map_err(|_| NetworkError::InvalidCidr(s.to_string()))?;
        if len > 32 {
            return Err(NetworkError::InvalidCidr(s.to_string()));
        }
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix_len: len,
        })
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network + 1)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network | !self.mask())
    }

    pub fn prefix_len(&self) -> u32 {
        self.prefix_len
    }

    /// The usable range is `.2` to `broadcast - 1`, per `spec.md` §4.3
    /// ("skipping the gateway at `.1`").
    pub fn usable_range(&self) -> (u32, u32) {
        let low = self.network + 2;
        let high = u32::from(self.broadcast()) - 1;
        (low, high)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == self.network
    }
}

#[async_trait::async_trait]
pub trait AllocationView: Send + Sync {
    /// IPs currently in use by any Running or Standby instance.
    async fn allocated_ips(&self) -> HashSet<Ipv4Addr>;

    /// True if `name` is already taken by a non-terminal instance.
    async fn name_in_use(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NetworkAllocation {
    pub tap_name: String,
    pub ip: Ipv4Addr,
    pub mac: String,
}

pub struct NetworkFabric {
    bridge_name: String,
    cidr: Cidr,
    uplink_interface: String,
    alloc_mutex: tokio::sync::Mutex<()>,
    /// Host vCPU capacity the default per-VM shaping rate is scaled against
    /// (`spec.md` §4.3: `(vcpus / cpu_capacity) * network_capacity`).
    cpu_capacity: u32,
    /// Host network capacity (bytes/sec) for the same formula.
    network_capacity_bps: u64,
}

impl NetworkFabric {
    pub fn new(
        bridge_name: String,
        cidr: Cidr,
        uplink_interface: String,
        cpu_capacity: u32,
        network_capacity_bps: u64,
    ) -> Self {
        Self {
            bridge_name,
            cidr,
            uplink_interface,
            alloc_mutex: tokio::sync::Mutex::new(()),
            cpu_capacity,
            network_capacity_bps,
        }
    }

    pub fn tap_name(instance_id: &str) -> String {
        format!("tap-{}", &instance_id[..8.min(instance_id.len())])
    }

    /// Idempotent one-time setup: forwarding precondition, bridge, and
    /// iptables rules (`spec.md` §4.3).
    pub async fn init(&self) -> Result<(), NetworkError> {
        check_ip_forward().await?;
        self.ensure_bridge().await?;
        self.ensure_iptables_rules().await?;
        Ok(())
    }

    async fn ensure_bridge(&self) -> Result<(), NetworkError> {
        if link_exists(&self.bridge_name).await {
            debug!(bridge = %self.bridge_name, "bridge already present");
            return Ok(());
        }
        info!(bridge = %self.bridge_name, "creating bridge");
        run("ip", &["link", "add", &self.bridge_name, "type", "bridge"]).await?;
        run(
            "ip",
            &[
                "addr",
                "add",
                &format!("{}/{}", self.cidr.gateway(), self.cidr.prefix_len()),
                "dev",
                &self.bridge_name,
            ],
        )
        .await?;
        run("ip", &["link", "set", &self.bridge_name, "up"]).await?;
        Ok(())
    }

    async fn ensure_iptables_rules(&self) -> Result<(), NetworkError> {
        let cidr_str = format!(
            "{}/{}",
            Ipv4Addr::from(u32::from(self.cidr.gateway()) - 1),
            self.cidr.prefix_len()
        );

        ensure_rule(
            "iptables",
            &["-t", "nat", "-A", "POSTROUTING", "-s", &cidr_str, "-o", &self.uplink_interface, "-j", "MASQUERADE"],
        )
        .await?;
        ensure_rule("iptables", &["-P", "FORWARD", "DROP"]).await?;
        ensure_rule(
            "iptables",
            &["-A", "FORWARD", "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
        )
        .await?;
        ensure_rule(
            "iptables",
            &["-A", "FORWARD", "-i", &self.bridge_name, "-o", &self.uplink_interface, "-j", "ACCEPT"],
        )
        .await?;
        Ok(())
    }

    /// Steps 1-4 of `spec.md` §4.3's Create allocation sequence: pick an
    /// IP, generate a MAC, and wire up the TAP. Serialized on
    /// `alloc_mutex` so two concurrent creates can't double-assign. Step 5
    /// (shaping) is the caller's job via [`Self::apply_shaping`], since it
    /// needs the instance's vCPU count and any explicit rate override.
    pub async fn allocate(
        &self,
        instance_id: &str,
        view: &dyn AllocationView,
    ) -> Result<NetworkAllocation, NetworkError> {
        let _guard = self.alloc_mutex.lock().await;

        let in_use = view.allocated_ips().await;
        let ip = self.pick_ip(&in_use)?;
        let mac = random_mac();
        let tap_name = Self::tap_name(instance_id);

        self.create_tap(&tap_name).await?;
        self.enslave(&tap_name).await?;

        Ok(NetworkAllocation { tap_name, ip, mac })
    }

    /// Default symmetric per-VM rate absent an explicit override
    /// (`spec.md` §4.3: `(vcpus / cpu_capacity) * network_capacity`).
    pub fn default_rate_bps(&self, vcpus: u32) -> u64 {
        shaping::default_rate_bps(vcpus, self.cpu_capacity, self.network_capacity_bps)
    }

    /// Install bidirectional shaping for a TAP: HTB-on-bridge for upload,
    /// TBF-on-TAP for download, both at the same guaranteed `rate_bps`
    /// (`spec.md` §4.3 step 5).
    pub async fn apply_shaping(&self, tap_name: &str, rate_bps: u64) -> Result<(), NetworkError> {
        let rates = shaping::ShapingRates::new(rate_bps);
        shaping::apply_upload_shaping(&self.bridge_name, tap_name, rates).await?;
        shaping::apply_download_shaping(tap_name, rates).await?;
        Ok(())
    }

    fn pick_ip(&self, in_use: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, NetworkError> {
        let (low, high) = self.cidr.usable_range();
        if low > high {
            return Err(NetworkError::AddressSpaceExhausted(format!(
                "{}/{}",
                self.cidr.gateway(),
                self.cidr.prefix_len()
            )));
        }

        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            let candidate = Ipv4Addr::from(rng.gen_range(low..=high));
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }

        (low..=high)
            .map(Ipv4Addr::from)
            .find(|ip| !in_use.contains(ip))
            .ok_or_else(|| {
                NetworkError::AddressSpaceExhausted(format!(
                    "{}/{}",
                    self.cidr.gateway(),
                    self.cidr.prefix_len()
                ))
            })
    }

    /// Create a TAP device and set it isolated-enslaved to the bridge,
    /// matching an existing allocation exactly (used by Restore).
    pub async fn recreate(&self, tap_name: &str) -> Result<(), NetworkError> {
        self.create_tap(tap_name).await?;
        self.enslave(tap_name).await?;
        Ok(())
    }

    async fn create_tap(&self, tap_name: &str) -> Result<(), NetworkError> {
        if link_exists(tap_name).await {
            run("ip", &["link", "delete", tap_name]).await.ok();
        }
        run("ip", &["tuntap", "add", tap_name, "mode", "tap"]).await?;
        run("ip", &["link", "set", tap_name, "up"]).await?;
        Ok(())
    }

    /// Enslave `tap_name` to the bridge in isolated bridge-slave mode.
    /// Netlink has no attribute for the isolated flag, so this goes
    /// through `ip link` directly (`spec.md` §4.3).
    async fn enslave(&self, tap_name: &str) -> Result<(), NetworkError> {
        run("ip", &["link", "set", tap_name, "master", &self.bridge_name]).await?;
        run("ip", &["link", "set", tap_name, "type", "bridge_slave", "isolated", "on"]).await?;
        Ok(())
    }

    /// Remove shaping (if present) and destroy the TAP.
    pub async fn release(&self, tap_name: &str) -> Result<(), NetworkError> {
        shaping::remove_class(&self.bridge_name, tap_name).await.ok();
        if link_exists(tap_name).await {
            run("ip", &["link", "delete", tap_name]).await?;
        }
        Ok(())
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge_name
    }
}

fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 3] = rng.gen();
    format!("02:00:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

async fn check_ip_forward() -> Result<(), NetworkError> {
    let value = tokio::fs::read_to_string("/proc/sys/net/ipv4/ip_forward")
        .await
        .unwrap_or_default();
    if value.trim() == "1" {
        Ok(())
    } else {
        Err(NetworkError::ForwardingDisabled)
    }
}

async fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn run(cmd: &str, args: &[&str]) -> Result<(), NetworkError> {
    let output = Command::new(cmd).args(args).output().await?;
    if !output.status.success() {
        return Err(NetworkError::CommandFailed {
            cmd: format!("{cmd} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Runs an iptables `-A` rule only if an equivalent `-C` check fails,
/// making bridge/NAT/forward setup idempotent across restarts.
async fn ensure_rule(cmd: &str, append_args: &[&str]) -> Result<(), NetworkError> {
    if append_args.first() == Some(&"-P") {
        return run(cmd, append_args).await;
    }
    let mut check_args = append_args.to_vec();
    check_args[0] = "-C";
    let exists = Command::new(cmd)
        .args(&check_args)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    if exists {
        return Ok(());
    }
    run(cmd, append_args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_gateway_and_broadcast() {
        let cidr = Cidr::parse("192.168.127.0/24").unwrap();
        assert_eq!(cidr.gateway(), Ipv4Addr::new(192, 168, 127, 1));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(192, 168, 127, 255));
        let (low, high) = cidr.usable_range();
        assert_eq!(Ipv4Addr::from(low), Ipv4Addr::new(192, 168, 127, 2));
        assert_eq!(Ipv4Addr::from(high), Ipv4Addr::new(192, 168, 127, 254));
    }

    #[test]
    fn cidr_contains() {
        let cidr = Cidr::parse("10.0.0.0/24").unwrap();
        assert!(cidr.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 0, 1, 1)));
    }

    #[test]
    fn tap_name_truncates_to_eight_chars() {
        assert_eq!(NetworkFabric::tap_name("abcdefgh12345"), "tap-abcdefgh");
        assert_eq!(NetworkFabric::tap_name("ab"), "tap-ab");
    }

    #[test]
    fn random_mac_has_locally_administered_prefix() {
        let mac = random_mac();
        assert!(mac.starts_with("02:00:00:"));
    }

    #[test]
    fn pick_ip_exhausted_reports_error() {
        let cidr = Cidr::parse("192.168.127.0/30").unwrap();
        let fabric = NetworkFabric::new("vmbr0".into(), cidr, "eth0".into(), 16, 1_000_000_000);
        let (low, high) = cidr.usable_range();
        let mut in_use = HashSet::new();
        for ip in low..=high {
            in_use.insert(Ipv4Addr::from(ip));
        }
        let err = fabric.pick_ip(&in_use).unwrap_err();
        assert!(matches!(err, NetworkError::AddressSpaceExhausted(_)));
    }
}
