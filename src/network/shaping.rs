//! Bidirectional traffic shaping via `tc` (`spec.md` §4.3).
//!
//! Download (external → VM) gets a TBF qdisc on the TAP's own egress.
//! Upload (VM → external) gets an HTB class per VM on the bridge's egress,
//! with a leaf `fq_codel` so TCP backs off on queueing delay instead of
//! hard drops. Classless policing is rejected by construction: there is no
//! code path here that installs a policer.

use tokio::process::Command;

use super::NetworkError;

#[derive(Debug, Clone, Copy)]
pub struct ShapingRates {
    /// Guaranteed rate, bytes/sec.
    pub rate_bps: u64,
    /// Burst ceiling, bytes/sec. Defaults to `4 * rate_bps` per `spec.md` §4.3.
    pub ceil_bps: u64,
}

impl ShapingRates {
    pub fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps,
            ceil_bps: rate_bps.saturating_mul(4),
        }
    }
}

/// Default symmetric per-VM rate absent an explicit override: `(vcpus /
/// cpu_capacity) * network_capacity`, per `spec.md` §4.3.
pub fn default_rate_bps(vcpus: u32, cpu_capacity: u32, network_capacity_bps: u64) -> u64 {
    if cpu_capacity == 0 {
        return network_capacity_bps;
    }
    (network_capacity_bps * vcpus as u64) / cpu_capacity as u64
}

/// Ensure the bridge has a root HTB qdisc, then install/replace a per-VM
/// class keyed by a stable minor number derived from the TAP's own kernel
/// ifindex, with an `fq_codel` leaf.
pub async fn apply_upload_shaping(bridge: &str, tap: &str, rates: ShapingRates) -> Result<(), NetworkError> {
    let class_id = class_id_for_tap(tap).await?;
    ensure_root_htb(bridge).await?;

    run(
        "tc",
        &[
            "class",
            "replace",
            "dev",
            bridge,
            "parent",
            "1:",
            "classid",
            &format!("1:{class_id:x}"),
            "htb",
            "rate",
            &format!("{}bps", rates.rate_bps),
            "ceil",
            &format!("{}bps", rates.ceil_bps),
        ],
    )
    .await?;

    run(
        "tc",
        &[
            "qdisc",
            "replace",
            "dev",
            bridge,
            "parent",
            &format!("1:{class_id:x}"),
            "fq_codel",
        ],
    )
    .await?;

    run(
        "tc",
        &[
            "filter",
            "replace",
            "dev",
            bridge,
            "parent",
            "1:",
            "protocol",
            "ip",
            "prio",
            "1",
            "u32",
            "match",
            "u32",
            "0",
            "0",
            "flowid",
            &format!("1:{class_id:x}"),
        ],
    )
    .await?;

    Ok(())
}

/// Install a TBF qdisc on the TAP's own egress, queueing and smoothing
/// download traffic rather than policing it.
pub async fn apply_download_shaping(tap: &str, rates: ShapingRates) -> Result<(), NetworkError> {
    run(
        "tc",
        &[
            "qdisc",
            "replace",
            "dev",
            tap,
            "root",
            "tbf",
            "rate",
            &format!("{}bps", rates.rate_bps),
            "burst",
            "32kb",
            "latency",
            "50ms",
        ],
    )
    .await?;
    Ok(())
}

/// A TAP's kernel ifindex, used as a stable HTB minor class number — unique
/// system-wide for as long as the TAP exists, so two VMs never collide.
async fn class_id_for_tap(tap: &str) -> Result<u32, NetworkError> {
    let content = tokio::fs::read_to_string(format!("/sys/class/net/{tap}/ifindex"))
        .await
        .map_err(|e| NetworkError::CommandFailed {
            cmd: format!("read ifindex of {tap}"),
            stderr: e.to_string(),
        })?;
    content.trim().parse::<u32>().map_err(|e| NetworkError::CommandFailed {
        cmd: format!("parse ifindex of {tap}"),
        stderr: e.to_string(),
    })
}

async fn ensure_root_htb(bridge: &str) -> Result<(), NetworkError> {
    let exists = Command::new("tc")
        .args(["qdisc", "show", "dev", bridge])
        .output()
        .await
        .map(|o| {
            String::from_utf8_lossy(&o.stdout).contains("htb")
        })
        .unwrap_or(false);
    if exists {
        return Ok(());
    }
    run("tc", &["qdisc", "add", "dev", bridge, "root", "handle", "1:", "htb"]).await
}

/// Tear down shaping state for a TAP: its HTB class on the bridge (if
/// present) and its own TBF qdisc. Called while the TAP still exists (so
/// its ifindex, and hence its class id, is still resolvable) but before it
/// is destroyed (`spec.md` §4.3 Release).
pub async fn remove_class(bridge: &str, tap: &str) -> Result<(), NetworkError> {
    if let Ok(class_id) = class_id_for_tap(tap).await {
        run("tc", &["class", "del", "dev", bridge, "classid", &format!("1:{class_id:x}")])
            .await
            .ok();
    }
    run("tc", &["qdisc", "del", "dev", tap, "root"]).await.ok();
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rate_scales_with_vcpus() {
        assert_eq!(default_rate_bps(4, 16, 1_000_000_000), 250_000_000);
        assert_eq!(default_rate_bps(16, 16, 1_000_000_000), 1_000_000_000);
    }

    #[test]
    fn shaping_rates_default_ceil_is_4x() {
        let r = ShapingRates::new(1000);
        assert_eq!(r.ceil_bps, 4000);
    }

    #[test]
    fn default_rate_falls_back_to_network_capacity_with_no_cpu_capacity() {
        assert_eq!(default_rate_bps(4, 0, 1_000_000_000), 1_000_000_000);
    }
}
