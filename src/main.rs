//! hypeman daemon entry point: parses configuration, constructs every
//! manager, reconciles on-disk state against whatever Cloud Hypervisor and
//! Caddy are already doing, and serves until asked to stop.
//!
//! This binary is intentionally thin — all behavior lives in the library
//! crate. `main` only wires dependencies together the way the teacher's
//! `qarax-node` binary wires a `VmManager` and an `ImageStoreManager`
//! together before starting its gRPC server.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use hypeman::config::{HypemanConfig, ResourceLimits};
use hypeman::devices::DeviceManager;
use hypeman::guest_rpc::Pool;
use hypeman::hypervisor::HypervisorDriver;
use hypeman::images::ImageManager;
use hypeman::ingress::caddy::CaddySupervisor;
use hypeman::ingress::{self, IngressManager};
use hypeman::instance::InstanceManager;
use hypeman::network::{Cidr, NetworkFabric};
use hypeman::paths::DataRoot;
use hypeman::system::SystemManager;
use hypeman::vfio::sysfs::SysfsRoot;
use hypeman::volumes::VolumeManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = HypemanConfig::parse();
    info!(data_dir = %config.data_dir.display(), "hypeman starting");

    let kernel_version = match &config.kernel_version {
        Some(v) => v.clone(),
        None => detect_kernel_version().await.unwrap_or_else(|| {
            warn!("could not determine running kernel version, defaulting to \"unknown\"");
            "unknown".to_string()
        }),
    };
    let arch = config.arch.clone().unwrap_or_else(|| std::env::consts::ARCH.to_string());
    info!(kernel_version, arch, "resolved system image layout");

    let data_root = DataRoot::new(&config.data_dir);
    tokio::fs::create_dir_all(data_root.root()).await?;

    let system = Arc::new(SystemManager::new(data_root.clone(), kernel_version, arch));
    system.ensure_present().await?;

    let cidr = Cidr::parse(&config.subnet_cidr).map_err(|e| e.classify())?;
    let network = Arc::new(NetworkFabric::new(
        config.bridge_name.clone(),
        cidr,
        config.uplink_interface.clone(),
        config.cpu_capacity,
        config.network_capacity_bps,
    ));
    network.init().await.map_err(|e| e.classify())?;

    let images = Arc::new(ImageManager::new(data_root.clone()));

    let devices = Arc::new(DeviceManager::new(data_root.clone(), SysfsRoot::default_root()));
    devices.load_all().await?;

    let volumes = Arc::new(VolumeManager::new(data_root.clone(), config.max_overlay_size));
    volumes.load_all().await?;

    let hypervisor = Arc::new(HypervisorDriver::new(
        config.cloud_hypervisor_binary.clone(),
        Duration::from_millis(config.spawn_timeout_ms),
    ));
    let guest_pool = Arc::new(Pool::new());

    let limits = ResourceLimits {
        max_overlay_per_instance: config.max_overlay_size,
        ..ResourceLimits::default()
    };
    let instances = Arc::new(InstanceManager::new(
        data_root.clone(),
        limits,
        images,
        system,
        network,
        devices.clone(),
        volumes,
        hypervisor,
        guest_pool,
        std::path::PathBuf::from("/sys"),
        config.dns_server.clone(),
        Duration::from_millis(config.boot_timeout_ms),
        Duration::from_millis(config.shutdown_grace_ms),
    ));

    devices.set_instance_view(instances.clone()).await;

    info!("reconciling on-disk state against live hypervisor/device state");
    instances.reconcile_on_start().await?;

    let mut caddy = CaddySupervisor::new(
        config.caddy_binary.clone(),
        &config.caddy_admin_address,
        config.caddy_admin_port,
        data_root.caddy_config_path(),
        data_root.caddy_log_path(),
        config.caddy_stop_on_shutdown,
    );
    caddy
        .spawn(Duration::from_millis(config.spawn_timeout_ms))
        .await
        .map_err(|e| e.classify())?;

    let ingresses = Arc::new(IngressManager::new(
        data_root.clone(),
        config.tls_allowed_domains.clone(),
        config.dns_suffix.clone(),
        config.dns_listen_address.clone(),
        config.acme_email.clone(),
    ));
    ingresses.load_all().await?;
    ingresses.reload_all(&caddy).await?;

    let dns_listen_address: std::net::SocketAddr = config
        .dns_listen_address
        .parse()
        .map_err(|e| format!("invalid DNS_LISTEN_ADDRESS {:?}: {e}", config.dns_listen_address))?;
    let dns_task = ingress::spawn_dns_resolver(instances.clone(), dns_listen_address, config.dns_suffix.clone());

    info!("hypeman ready");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, tearing down");

    dns_task.abort();
    caddy.shutdown(Duration::from_millis(config.shutdown_grace_ms)).await;

    Ok(())
}

/// Runs the host's `uname -r` synchronously at startup, before any
/// instance-related work begins.
async fn detect_kernel_version() -> Option<String> {
    let output = tokio::process::Command::new("uname")
        .arg("-r")
        .stdout(Stdio::piped())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8(output.stdout).ok()?;
    let version = version.trim();
    if version.is_empty() { None } else { Some(version.to_string()) }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
