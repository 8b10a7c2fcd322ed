//! Instance lifecycle manager (`spec.md` §4.1, C10): the orchestrator that
//! owns every other component and drives an instance through
//! Creating -> Running -> Standby/Stopped -> Deleting.
//!
//! Plain async Rust API, not a network service — `main.rs` constructs one
//! `InstanceManager` and calls its methods directly. It implements
//! [`crate::devices::InstanceView`] and [`crate::network::AllocationView`]
//! so the device and network modules can query instance state without a
//! compile-time dependency back on this module (`spec.md` §9).

pub mod model;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub use model::{CreateRequest, Instance, InstanceState, MdevAttachment, SnapshottedNetwork, VolumeAttachment};

use crate::config::ResourceLimits;
use crate::devices::DeviceManager;
use crate::devices::mdev::{self, ProfileCache};
use crate::error::{EntityKind, HypemanError, Result};
use crate::guest_rpc::Pool;
use crate::guest_rpc::copy::CopiedEntry;
use crate::guest_rpc::exec::{ExecOutcome, ExecRequest};
use crate::hypervisor::{
    CpusConfig, DeviceConfig, DiskConfig, HypervisorDriver, MemoryConfig, NetConfig, PayloadConfig,
    VmConfig, VmState, VsockConfig,
};
use crate::images::ImageManager;
use crate::network::{NetworkAllocation, NetworkFabric};
use crate::paths::DataRoot;
use crate::system::SystemManager;
use crate::volumes::VolumeManager;

/// vsock port the guest agent listens on inside every instance.
const AGENT_VSOCK_PORT: u32 = 1024;
/// Cloud Hypervisor's vsock context id for the host side of the connection.
const VSOCK_CID: u64 = 3;
const CONFIG_DISK_SIZE: &str = "16M";

/// One effect of [`InstanceManager::create`] that must be undone, in
/// reverse order, if a later step fails (`spec.md` §9, "graph of side
/// effects").
#[derive(Debug)]
enum UndoStep {
    RemoveInstanceDir(String),
    ReleaseNetwork(String),
    DetachDevice(String),
    DestroyMdev(String),
    DetachVolume(String),
}

pub struct InstanceManager {
    data_root: DataRoot,
    instances: RwLock<HashMap<String, Instance>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    limits: ResourceLimits,
    images: Arc<ImageManager>,
    system: Arc<SystemManager>,
    network: Arc<NetworkFabric>,
    devices: Arc<DeviceManager>,
    volumes: Arc<VolumeManager>,
    hypervisor: Arc<HypervisorDriver>,
    guest_pool: Arc<Pool>,
    sysfs_root: PathBuf,
    mdev_cache: Mutex<ProfileCache>,
    /// In-memory view of who currently holds which IP/MAC/TAP. Rebuilt by
    /// [`Self::reconcile_on_start`] on every boot — never the source of
    /// truth, per `spec.md` §4.3's "no central allocations file".
    allocations: RwLock<HashMap<String, NetworkAllocation>>,
    /// Live VMM child handles, keyed by instance id. Runtime-only; never
    /// persisted.
    processes: Mutex<HashMap<String, tokio::process::Child>>,
    dns_server: String,
    boot_timeout: Duration,
    shutdown_grace: Duration,
}

impl InstanceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_root: DataRoot,
        limits: ResourceLimits,
        images: Arc<ImageManager>,
        system: Arc<SystemManager>,
        network: Arc<NetworkFabric>,
        devices: Arc<DeviceManager>,
        volumes: Arc<VolumeManager>,
        hypervisor: Arc<HypervisorDriver>,
        guest_pool: Arc<Pool>,
        sysfs_root: PathBuf,
        dns_server: String,
        boot_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            data_root,
            instances: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            limits,
            images,
            system,
            network,
            devices,
            volumes,
            hypervisor,
            guest_pool,
            sysfs_root,
            mdev_cache: Mutex::new(ProfileCache::new()),
            allocations: RwLock::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            dns_server,
            boot_timeout,
            shutdown_grace,
        }
    }

    /// Resolves an exact id, then an exact name, then an unambiguous id
    /// prefix, per `spec.md` §4.1.
    pub async fn resolve(&self, id_or_name: &str) -> Result<String> {
        let instances = self.instances.read().await;
        if instances.contains_key(id_or_name) {
            return Ok(id_or_name.to_string());
        }
        if let Some(found) = instances.values().find(|i| i.name == id_or_name) {
            return Ok(found.id.clone());
        }
        let matches: Vec<String> = instances
            .keys()
            .filter(|id| id.starts_with(id_or_name))
            .cloned()
            .collect();
        match matches.len() {
            0 => Err(HypemanError::not_found(EntityKind::Instance, id_or_name)),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(HypemanError::Ambiguous {
                prefix: id_or_name.to_string(),
                candidates: matches,
            }),
        }
    }

    pub async fn get(&self, id_or_name: &str) -> Result<Instance> {
        let id = self.resolve(id_or_name).await?;
        self.get_by_id(&id).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Instance> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HypemanError::not_found(EntityKind::Instance, id))
    }

    pub async fn list(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    async fn instance_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn persist_and_insert(&self, instance: &Instance) -> Result<()> {
        crate::paths::write_json(&self.data_root.instance_metadata_path(&instance.id), instance).await?;
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    fn validate_caps(&self, instances: &HashMap<String, Instance>, req: &CreateRequest) -> Result<()> {
        if req.vcpus > self.limits.max_vcpus_per_instance {
            return Err(HypemanError::ResourceExhausted(format!(
                "requested {} vcpus exceeds per-instance cap of {}",
                req.vcpus, self.limits.max_vcpus_per_instance
            )));
        }
        if req.mem_size + req.hotplug_size > self.limits.max_mem_per_instance {
            return Err(HypemanError::ResourceExhausted(format!(
                "requested size ({}) plus hotplug_size ({}) exceeds per-instance memory cap of {}",
                req.mem_size, req.hotplug_size, self.limits.max_mem_per_instance
            )));
        }
        if req.overlay_size > self.limits.max_overlay_per_instance {
            return Err(HypemanError::ResourceExhausted(format!(
                "requested overlay size {} exceeds cap of {}",
                req.overlay_size, self.limits.max_overlay_per_instance
            )));
        }
        if req.volume_attachments.len() > self.limits.max_volumes_per_instance {
            return Err(HypemanError::ResourceExhausted(format!(
                "requested {} volume attachments exceeds per-instance cap of {}",
                req.volume_attachments.len(),
                self.limits.max_volumes_per_instance
            )));
        }

        let (total_vcpus, total_mem) = instances
            .values()
            .filter(|i| !i.state.is_terminal())
            .fold((0u32, 0u64), |(v, m), i| (v + i.vcpus, m + i.mem_size + i.hotplug_size));

        if total_vcpus + req.vcpus > self.limits.max_total_vcpus {
            return Err(HypemanError::ResourceExhausted(format!(
                "creating this instance would bring total vcpus to {}, exceeding the cap of {}",
                total_vcpus + req.vcpus,
                self.limits.max_total_vcpus
            )));
        }
        if total_mem + req.mem_size + req.hotplug_size > self.limits.max_total_mem {
            return Err(HypemanError::ResourceExhausted(format!(
                "creating this instance would bring total memory to {}, exceeding the cap of {}",
                total_mem + req.mem_size + req.hotplug_size,
                self.limits.max_total_mem
            )));
        }
        Ok(())
    }

    /// Creates and boots a new instance, per the effect sequence in
    /// `spec.md` §4.1. Any failure after the instance directory is created
    /// unwinds every completed effect in reverse order.
    pub async fn create(&self, req: CreateRequest) -> Result<Instance> {
        {
            let instances = self.instances.read().await;
            if instances
                .values()
                .any(|i| i.name == req.name && !i.state.is_terminal())
            {
                return Err(HypemanError::already_exists(EntityKind::Instance, req.name.clone()));
            }
            self.validate_caps(&instances, &req)?;
        }

        let mut device_ids = Vec::new();
        for name in &req.device_names {
            let device = self.devices.get_by_name(name).await?;
            if device.attached_to.is_some() {
                return Err(HypemanError::in_use(
                    EntityKind::Device,
                    device.id,
                    "already attached to another instance",
                ));
            }
            device_ids.push(device.id);
        }

        let (image, _meta) = self.images.resolve(&req.image_ref).await?;
        let rootfs_path = self.images.rootfs_path(&image);

        let id = crate::new_id();
        let mut undo: Vec<UndoStep> = Vec::new();

        tokio::fs::create_dir_all(self.data_root.guest_dir(&id)).await?;
        undo.push(UndoStep::RemoveInstanceDir(id.clone()));

        let mut instance = Instance {
            id: id.clone(),
            name: req.name.clone(),
            image_ref: req.image_ref.clone(),
            state: InstanceState::Creating,
            vcpus: req.vcpus,
            mem_size: req.mem_size,
            hotplug_size: req.hotplug_size,
            overlay_size: req.overlay_size,
            network_enabled: req.network_enabled,
            device_ids,
            volume_attachments: Vec::new(),
            env: req.env.clone(),
            gpu_mdev: None,
            network_rate_bps: None,
            created_at: crate::now_rfc3339(),
        };
        self.persist_and_insert(&instance).await?;

        if let Err(e) = self.create_inner(&mut instance, &req, &rootfs_path, &mut undo).await {
            self.unwind(undo).await;
            self.instances.write().await.remove(&id);
            return Err(e);
        }

        instance.state = InstanceState::Running;
        self.persist_and_insert(&instance).await?;
        info!(instance = %id, name = %req.name, "instance created");
        Ok(instance)
    }

    async fn create_inner(
        &self,
        instance: &mut Instance,
        req: &CreateRequest,
        rootfs_path: &Path,
        undo: &mut Vec<UndoStep>,
    ) -> Result<()> {
        let id = instance.id.clone();

        create_overlay(&self.data_root.overlay_path(&id), req.overlay_size).await?;

        for device_id in instance.device_ids.clone() {
            self.devices.attach(&device_id, &id).await?;
            undo.push(UndoStep::DetachDevice(device_id));
        }

        for attachment in &req.volume_attachments {
            self.volumes.attach(&attachment.volume_id, &id).await?;
            undo.push(UndoStep::DetachVolume(attachment.volume_id.clone()));
            instance.volume_attachments.push(attachment.clone());
        }

        if let Some(profile) = &req.gpu_profile {
            let vfs = mdev::discover_vfs(&self.sysfs_root).await?;
            let mdev_device = {
                let mut cache = self.mdev_cache.lock().await;
                mdev::create(&self.sysfs_root, &mut cache, &vfs, profile, &id).await?
            };
            undo.push(UndoStep::DestroyMdev(mdev_device.uuid.clone()));
            instance.gpu_mdev = Some(MdevAttachment {
                uuid: mdev_device.uuid,
                vf_address: mdev_device.vf_address,
                profile: profile.clone(),
            });
        }

        let allocation = if req.network_enabled {
            let alloc = self
                .network
                .allocate(&id, self)
                .await
                .map_err(|e| e.classify())?;
            undo.push(UndoStep::ReleaseNetwork(alloc.tap_name.clone()));

            let rate = req.rate_bps.unwrap_or_else(|| self.network.default_rate_bps(req.vcpus));
            self.network
                .apply_shaping(&alloc.tap_name, rate)
                .await
                .map_err(|e| e.classify())?;
            instance.network_rate_bps = Some(rate);

            self.persist_network_state(&id, &alloc).await?;
            self.allocations.write().await.insert(id.clone(), alloc.clone());
            Some(alloc)
        } else {
            None
        };

        self.render_config_disk(&id, req).await?;

        let vm_config = self.build_vm_config(instance, rootfs_path, allocation.as_ref()).await?;
        self.spawn_and_boot(&id, &vm_config).await?;

        Ok(())
    }

    async fn unwind(&self, steps: Vec<UndoStep>) {
        for step in steps.into_iter().rev() {
            match step {
                UndoStep::DetachVolume(volume_id) => {
                    if let Err(e) = self.volumes.detach(&volume_id).await {
                        warn!(volume = volume_id, error = %e, "undo: volume detach failed");
                    }
                }
                UndoStep::DestroyMdev(uuid) => {
                    if let Err(e) = mdev::destroy(&self.sysfs_root, &uuid).await {
                        warn!(uuid, error = %e, "undo: mdev destroy failed");
                    }
                }
                UndoStep::DetachDevice(device_id) => {
                    if let Err(e) = self.devices.detach(&device_id).await {
                        warn!(device = device_id, error = %e, "undo: device detach failed");
                    }
                }
                UndoStep::ReleaseNetwork(tap_name) => {
                    if let Err(e) = self.network.release(&tap_name).await {
                        warn!(tap = tap_name, error = %e, "undo: network release failed");
                    }
                }
                UndoStep::RemoveInstanceDir(id) => {
                    self.allocations.write().await.remove(&id);
                    let dir = self.data_root.guest_dir(&id);
                    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                        warn!(instance = id, error = %e, "undo: failed to remove instance dir");
                    }
                }
            }
        }
    }

    /// Renders environment, DNS server, volume mount map, and device hints
    /// onto a small ext4 config disk the guest mounts read-only at boot
    /// (`spec.md` §4.1).
    async fn render_config_disk(&self, id: &str, req: &CreateRequest) -> Result<()> {
        let stage = self.data_root.config_stage_dir(id);
        tokio::fs::create_dir_all(&stage).await?;

        let mut env_content = String::new();
        for (k, v) in &req.env {
            env_content.push_str(&format!("{k}={v}\n"));
        }
        tokio::fs::write(stage.join("env"), env_content).await?;
        tokio::fs::write(stage.join("dns"), format!("{}\n", self.dns_server)).await?;
        tokio::fs::write(
            stage.join("volumes.json"),
            serde_json::to_vec_pretty(&req.volume_attachments)?,
        )
        .await?;
        tokio::fs::write(
            stage.join("devices.json"),
            serde_json::to_vec_pretty(&req.device_names)?,
        )
        .await?;

        let disk_path = self.data_root.config_disk_path(id);
        let stage_str = stage
            .to_str()
            .ok_or_else(|| HypemanError::Internal("non-utf8 config stage path".into()))?;
        let disk_str = disk_path
            .to_str()
            .ok_or_else(|| HypemanError::Internal("non-utf8 config disk path".into()))?;
        let status = tokio::process::Command::new("mkfs.ext4")
            .args(["-q", "-F", "-L", "cidata", "-d", stage_str, disk_str, CONFIG_DISK_SIZE])
            .status()
            .await?;
        if !status.success() {
            return Err(HypemanError::Internal(format!(
                "mkfs.ext4 failed building config disk for instance {id}"
            )));
        }
        tokio::fs::remove_dir_all(&stage).await.ok();
        Ok(())
    }

    async fn build_vm_config(
        &self,
        instance: &Instance,
        rootfs_path: &Path,
        allocation: Option<&NetworkAllocation>,
    ) -> Result<VmConfig> {
        let mut disks = vec![
            DiskConfig {
                path: rootfs_path.to_path_buf(),
                readonly: true,
            },
            DiskConfig {
                path: self.data_root.overlay_path(&instance.id),
                readonly: false,
            },
            DiskConfig {
                path: self.data_root.config_disk_path(&instance.id),
                readonly: true,
            },
        ];
        for attachment in &instance.volume_attachments {
            disks.push(DiskConfig {
                path: self.data_root.volume_disk_path(&attachment.volume_id),
                readonly: false,
            });
        }

        let net = allocation
            .map(|a| {
                vec![NetConfig {
                    tap: a.tap_name.clone(),
                    mac: a.mac.clone(),
                }]
            })
            .unwrap_or_default();

        let mut devices = Vec::new();
        for device_id in &instance.device_ids {
            let device = self.devices.get(device_id).await?;
            devices.push(DeviceConfig {
                path: PathBuf::from(format!("/sys/bus/pci/devices/{}", device.pci_address)),
            });
        }
        let mut user_devices = Vec::new();
        if let Some(mdev) = &instance.gpu_mdev {
            user_devices.push(DeviceConfig {
                path: PathBuf::from(format!("/sys/bus/mdev/devices/{}", mdev.uuid)),
            });
        }

        Ok(VmConfig {
            payload: PayloadConfig {
                kernel: self.system.kernel_path(),
                initramfs: self.system.initrd_path().await?,
                cmdline: "console=hvc0 root=/dev/vda rw".to_string(),
            },
            cpus: CpusConfig {
                boot_vcpus: instance.vcpus,
                max_vcpus: instance.vcpus,
            },
            memory: MemoryConfig {
                size: instance.mem_size,
                hotplug_size: (instance.hotplug_size > 0).then_some(instance.hotplug_size),
                hotplug_method: (instance.hotplug_size > 0).then(|| "virtio-mem".to_string()),
                shared: false,
            },
            disks,
            net,
            vsock: Some(VsockConfig {
                cid: VSOCK_CID,
                socket: self.data_root.vsock_socket_path(&instance.id),
            }),
            devices,
            user_devices,
        })
    }

    async fn spawn_and_boot(&self, id: &str, config: &VmConfig) -> Result<()> {
        let socket_path = self.data_root.ch_socket_path(id);
        let log_path = self.data_root.console_log_path(id);
        let process = self
            .hypervisor
            .spawn(&socket_path, &log_path)
            .await
            .map_err(|e| e.classify())?;
        self.processes.lock().await.insert(id.to_string(), process.child);

        if let Err(e) = self.hypervisor.create(&socket_path, config).await {
            self.kill_process(id, self.shutdown_grace).await;
            return Err(e.classify());
        }
        if let Err(e) = self.hypervisor.boot(&socket_path).await {
            self.kill_process(id, self.shutdown_grace).await;
            return Err(e.classify());
        }

        let vsock_path = self.data_root.vsock_socket_path(id);
        let wait = tokio::time::timeout(self.boot_timeout, async {
            loop {
                if self.guest_pool.get_or_connect(&vsock_path, AGENT_VSOCK_PORT).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await;

        if wait.is_err() {
            self.kill_process(id, self.shutdown_grace).await;
            return Err(HypemanError::Transient(format!(
                "guest agent on instance {id} did not become reachable within the boot timeout"
            )));
        }
        Ok(())
    }

    async fn kill_process(&self, id: &str, grace: Duration) {
        let mut child = match self.processes.lock().await.remove(id) {
            Some(c) => c,
            None => return,
        };
        let socket_path = self.data_root.ch_socket_path(id);
        self.hypervisor.shutdown(&mut child, &socket_path, grace).await;
    }

    /// Running -> Stopped: tear down the VMM and release the network,
    /// keeping devices and volumes attached (`spec.md` §4.1).
    pub async fn stop(&self, id_or_name: &str) -> Result<Instance> {
        let id = self.resolve(id_or_name).await?;
        let lock = self.instance_lock(&id).await;
        let _guard = lock.lock().await;
        let mut instance = self.get_by_id(&id).await?;
        if instance.state != InstanceState::Running {
            return Err(HypemanError::PreconditionFailed(format!(
                "instance {id} is not Running"
            )));
        }

        self.kill_process(&id, self.shutdown_grace).await;
        self.guest_pool.evict(&self.data_root.vsock_socket_path(&id)).await;
        if instance.network_enabled {
            if let Some(alloc) = self.allocations.write().await.remove(&id) {
                self.network.release(&alloc.tap_name).await.map_err(|e| e.classify())?;
                self.clear_network_state(&id).await;
            }
        }

        instance.state = InstanceState::Stopped;
        self.persist_and_insert(&instance).await?;
        info!(instance = %id, "instance stopped");
        Ok(instance)
    }

    /// Stopped -> Running: fresh network allocation, VMM spawn, create,
    /// boot. Overlay and config disk from the original Create are reused.
    pub async fn start(&self, id_or_name: &str) -> Result<Instance> {
        let id = self.resolve(id_or_name).await?;
        let lock = self.instance_lock(&id).await;
        let _guard = lock.lock().await;
        let mut instance = self.get_by_id(&id).await?;
        if instance.state != InstanceState::Stopped {
            return Err(HypemanError::PreconditionFailed(format!(
                "instance {id} is not Stopped"
            )));
        }

        let (image, _meta) = self.images.resolve(&instance.image_ref).await?;
        let rootfs_path = self.images.rootfs_path(&image);

        let allocation = if instance.network_enabled {
            let alloc = self
                .network
                .allocate(&id, self)
                .await
                .map_err(|e| e.classify())?;

            let rate = instance
                .network_rate_bps
                .unwrap_or_else(|| self.network.default_rate_bps(instance.vcpus));
            if let Err(e) = self.network.apply_shaping(&alloc.tap_name, rate).await {
                self.network.release(&alloc.tap_name).await.ok();
                return Err(e.classify());
            }
            instance.network_rate_bps = Some(rate);

            self.persist_network_state(&id, &alloc).await?;
            self.allocations.write().await.insert(id.clone(), alloc.clone());
            Some(alloc)
        } else {
            None
        };

        let vm_config = self.build_vm_config(&instance, &rootfs_path, allocation.as_ref()).await?;
        if let Err(e) = self.spawn_and_boot(&id, &vm_config).await {
            if let Some(alloc) = self.allocations.write().await.remove(&id) {
                self.network.release(&alloc.tap_name).await.ok();
                self.clear_network_state(&id).await;
            }
            return Err(e);
        }

        instance.state = InstanceState::Running;
        self.persist_and_insert(&instance).await?;
        info!(instance = %id, "instance started");
        Ok(instance)
    }

    /// Running -> Standby: pause, snapshot memory to disk, record the
    /// network allocation alongside the snapshot, then tear down the VMM
    /// and TAP (`spec.md` §4.1, §4.5).
    pub async fn standby(&self, id_or_name: &str) -> Result<Instance> {
        let id = self.resolve(id_or_name).await?;
        let lock = self.instance_lock(&id).await;
        let _guard = lock.lock().await;
        let mut instance = self.get_by_id(&id).await?;
        if instance.state != InstanceState::Running {
            return Err(HypemanError::PreconditionFailed(format!(
                "instance {id} is not Running"
            )));
        }

        let socket_path = self.data_root.ch_socket_path(&id);
        self.hypervisor.pause(&socket_path).await.map_err(|e| e.classify())?;

        let timestamp = crate::now_rfc3339().replace([':', '.'], "-");
        let snapshot_dir = self.data_root.snapshot_dir(&id, &timestamp);
        tokio::fs::create_dir_all(&snapshot_dir).await?;
        self.hypervisor
            .snapshot(&socket_path, &snapshot_dir)
            .await
            .map_err(|e| e.classify())?;

        if instance.network_enabled {
            if let Some(alloc) = self.allocations.read().await.get(&id).cloned() {
                let record = SnapshottedNetwork {
                    tap_name: alloc.tap_name,
                    ip: alloc.ip,
                    mac: alloc.mac,
                };
                crate::paths::write_json(
                    &self.data_root.snapshot_network_path(&id, &timestamp),
                    &record,
                )
                .await?;
            }
        }

        let latest_link = self.data_root.snapshot_latest_link(&id);
        let _ = tokio::fs::remove_file(&latest_link).await;
        tokio::fs::symlink(&timestamp, &latest_link).await?;

        self.kill_process(&id, self.shutdown_grace).await;
        self.guest_pool.evict(&self.data_root.vsock_socket_path(&id)).await;
        if instance.network_enabled {
            if let Some(alloc) = self.allocations.write().await.remove(&id) {
                self.network.release(&alloc.tap_name).await.map_err(|e| e.classify())?;
                self.clear_network_state(&id).await;
            }
        }

        instance.state = InstanceState::Standby;
        self.persist_and_insert(&instance).await?;
        info!(instance = %id, "instance moved to standby");
        Ok(instance)
    }

    /// Standby -> Running: recreate the TAP exactly as recorded, restore
    /// the VMM from its latest snapshot, and resume (`spec.md` §4.1, §4.5).
    pub async fn restore(&self, id_or_name: &str) -> Result<Instance> {
        let id = self.resolve(id_or_name).await?;
        let lock = self.instance_lock(&id).await;
        let _guard = lock.lock().await;
        let mut instance = self.get_by_id(&id).await?;
        if instance.state != InstanceState::Standby {
            return Err(HypemanError::PreconditionFailed(format!(
                "instance {id} is not in Standby"
            )));
        }

        let latest_link = self.data_root.snapshot_latest_link(&id);
        let target = tokio::fs::read_link(&latest_link).await.map_err(|_| {
            HypemanError::PreconditionFailed(format!("instance {id} has no snapshot to restore from"))
        })?;
        let timestamp = target.to_string_lossy().into_owned();
        let snapshot_dir = self.data_root.snapshot_dir(&id, &timestamp);

        if instance.network_enabled {
            let record: SnapshottedNetwork =
                crate::paths::read_json(&self.data_root.snapshot_network_path(&id, &timestamp)).await?;
            self.network
                .recreate(&record.tap_name)
                .await
                .map_err(|e| e.classify())?;
            let alloc = NetworkAllocation {
                tap_name: record.tap_name,
                ip: record.ip,
                mac: record.mac,
            };

            let rate = instance
                .network_rate_bps
                .unwrap_or_else(|| self.network.default_rate_bps(instance.vcpus));
            if let Err(e) = self.network.apply_shaping(&alloc.tap_name, rate).await {
                self.network.release(&alloc.tap_name).await.ok();
                return Err(e.classify());
            }
            instance.network_rate_bps = Some(rate);

            self.persist_network_state(&id, &alloc).await?;
            self.allocations.write().await.insert(id.clone(), alloc);
        }

        let socket_path = self.data_root.ch_socket_path(&id);
        let log_path = self.data_root.console_log_path(&id);
        let restore_result = async {
            let process = self
                .hypervisor
                .spawn(&socket_path, &log_path)
                .await
                .map_err(|e| e.classify())?;
            self.processes.lock().await.insert(id.clone(), process.child);
            self.hypervisor
                .restore(&socket_path, &snapshot_dir)
                .await
                .map_err(|e| e.classify())?;
            self.hypervisor.resume(&socket_path).await.map_err(|e| e.classify())
        }
        .await;

        if let Err(e) = restore_result {
            self.kill_process(&id, self.shutdown_grace).await;
            if instance.network_enabled {
                if let Some(alloc) = self.allocations.write().await.remove(&id) {
                    self.network.release(&alloc.tap_name).await.ok();
                    self.clear_network_state(&id).await;
                }
            }
            return Err(e);
        }

        instance.state = InstanceState::Running;
        self.persist_and_insert(&instance).await?;
        info!(instance = %id, "instance restored from standby");
        Ok(instance)
    }

    /// Tears an instance down from any state: best-effort VMM shutdown,
    /// detach devices/volumes, destroy any mdev, release the network, then
    /// atomically rename the directory aside before removing it
    /// (`spec.md` §3's `.deleting-<id>` convention).
    pub async fn delete(&self, id_or_name: &str) -> Result<()> {
        let id = self.resolve(id_or_name).await?;
        let lock = self.instance_lock(&id).await;
        let _guard = lock.lock().await;

        let mut instance = self.get_by_id(&id).await?;
        instance.state = InstanceState::Deleting;
        self.persist_and_insert(&instance).await?;

        self.teardown_live_state(&id, &instance).await;

        let final_dir = self.data_root.guest_dir(&id);
        let deleting_dir = self.data_root.guest_deleting_dir(&id);
        if tokio::fs::rename(&final_dir, &deleting_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&deleting_dir).await.ok();
        } else {
            tokio::fs::remove_dir_all(&final_dir).await.ok();
        }

        self.instances.write().await.remove(&id);
        self.locks.lock().await.remove(&id);
        info!(instance = %id, "instance deleted");
        Ok(())
    }

    async fn teardown_live_state(&self, id: &str, instance: &Instance) {
        self.kill_process(id, self.shutdown_grace).await;
        self.guest_pool.evict(&self.data_root.vsock_socket_path(id)).await;

        for device_id in &instance.device_ids {
            if let Err(e) = self.devices.detach(device_id).await {
                warn!(device = device_id, error = %e, "detach during teardown failed");
            }
        }
        if let Some(mdev) = &instance.gpu_mdev {
            if let Err(e) = mdev::destroy(&self.sysfs_root, &mdev.uuid).await {
                warn!(uuid = mdev.uuid, error = %e, "mdev destroy during teardown failed");
            }
        }
        for attachment in &instance.volume_attachments {
            if let Err(e) = self.volumes.detach(&attachment.volume_id).await {
                warn!(volume = attachment.volume_id, error = %e, "volume detach during teardown failed");
            }
        }
        if instance.network_enabled {
            if let Some(alloc) = self.allocations.write().await.remove(id) {
                if let Err(e) = self.network.release(&alloc.tap_name).await {
                    warn!(tap = alloc.tap_name, error = %e, "network release during teardown failed");
                }
            }
        }
    }

    pub async fn exec(&self, id_or_name: &str, request: ExecRequest, deadline: Duration) -> Result<ExecOutcome> {
        let id = self.resolve(id_or_name).await?;
        let instance = self.get_by_id(&id).await?;
        if instance.state != InstanceState::Running {
            return Err(HypemanError::PreconditionFailed(format!(
                "instance {id} is not Running"
            )));
        }
        let conn = self
            .guest_pool
            .get_or_connect(&self.data_root.vsock_socket_path(&id), AGENT_VSOCK_PORT)
            .await
            .map_err(|e| e.classify())?;
        crate::guest_rpc::exec::run_to_completion(&conn, request, deadline)
            .await
            .map_err(|e| e.classify())
    }

    pub async fn copy_to_guest(&self, id_or_name: &str, local_path: &Path, remote_path: &str) -> Result<u64> {
        let id = self.resolve(id_or_name).await?;
        let conn = self
            .guest_pool
            .get_or_connect(&self.data_root.vsock_socket_path(&id), AGENT_VSOCK_PORT)
            .await
            .map_err(|e| e.classify())?;
        crate::guest_rpc::copy::copy_to_guest(&conn, local_path, remote_path)
            .await
            .map_err(|e| e.classify())
    }

    pub async fn copy_from_guest(
        &self,
        id_or_name: &str,
        remote_path: &str,
        local_root: &Path,
        follow_links: bool,
    ) -> Result<Vec<CopiedEntry>> {
        let id = self.resolve(id_or_name).await?;
        let conn = self
            .guest_pool
            .get_or_connect(&self.data_root.vsock_socket_path(&id), AGENT_VSOCK_PORT)
            .await
            .map_err(|e| e.classify())?;
        crate::guest_rpc::copy::copy_from_guest(&conn, remote_path, local_root, follow_links)
            .await
            .map_err(|e| e.classify())
    }

    /// Loads every persisted instance, corroborates `Running` and
    /// `Standby`/`Stopped` claims against the live hypervisor, tears down
    /// anything left mid-`Creating`/`Deleting`, and asks the device manager
    /// to reconcile (`spec.md` §4.1, §7: "never fails the whole process").
    pub async fn reconcile_on_start(&self) -> Result<()> {
        let dir = self.data_root.guests_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        let mut loaded = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            match crate::paths::try_read_json::<Instance>(&self.data_root.instance_metadata_path(&name)).await {
                Ok(Some(instance)) => loaded.push(instance),
                Ok(None) => warn!(instance = name, "guest directory has no metadata, skipping"),
                Err(e) => warn!(instance = name, error = %e, "failed to read instance metadata"),
            }
        }

        for mut instance in loaded {
            let id = instance.id.clone();
            let socket_path = self.data_root.ch_socket_path(&id);
            let live_running = match self.hypervisor.info(&socket_path).await {
                Ok(info) => Some(info.state == VmState::Running),
                Err(_) => None,
            };

            match classify_reconcile(instance.state, live_running) {
                ReconcileOutcome::TearDown => {
                    warn!(instance = %id, state = ?instance.state, "instance left mid-transition, tearing down");
                    self.teardown_live_state(&id, &instance).await;
                    tokio::fs::remove_dir_all(self.data_root.guest_dir(&id)).await.ok();
                }
                ReconcileOutcome::MarkUnknown => {
                    instance.state = InstanceState::Unknown;
                    if let Err(e) = self.persist_and_insert(&instance).await {
                        warn!(instance = %id, error = %e, "failed to persist Unknown state during reconcile");
                    }
                }
                ReconcileOutcome::Keep => {
                    if instance.state == InstanceState::Running && instance.network_enabled {
                        match crate::paths::try_read_json::<NetworkAllocation>(
                            &self.data_root.network_state_path(&id),
                        )
                        .await
                        {
                            Ok(Some(alloc)) => {
                                self.allocations.write().await.insert(id.clone(), alloc);
                            }
                            Ok(None) => warn!(
                                instance = %id,
                                "running instance has no recorded network state, ingress/dns will not resolve it until restart"
                            ),
                            Err(e) => warn!(instance = %id, error = %e, "failed to read network state"),
                        }
                    }
                    self.instances.write().await.insert(id.clone(), instance.clone());
                }
            }
        }

        let report = self.devices.reconcile().await;
        if !report.warnings.is_empty() {
            warn!(warnings = report.warnings.len(), "device reconcile reported warnings");
        }

        self.reconcile_mdevs().await;
        Ok(())
    }

    /// Persists the live network allocation alongside the instance's own
    /// directory (not the snapshots tree) so a daemon restart can recover
    /// a Running instance's IP/MAC/TAP without a central ledger.
    async fn persist_network_state(&self, id: &str, alloc: &NetworkAllocation) -> Result<()> {
        crate::paths::write_json(&self.data_root.network_state_path(id), alloc).await
    }

    async fn clear_network_state(&self, id: &str) {
        tokio::fs::remove_file(self.data_root.network_state_path(id)).await.ok();
    }

    /// mdev reconciliation, `spec.md` §4.2: destroy an mdev only if its
    /// owning instance is known, not Running, and not Unknown (the same
    /// Unknown-state asymmetry `classify_reconcile` preserves for devices),
    /// and the mdev is unbound. Anything else is left alone. Never fails
    /// the whole process — per-mdev errors are logged (`spec.md` §7).
    async fn reconcile_mdevs(&self) {
        let snapshot: Vec<(String, MdevAttachment, InstanceState)> = self
            .instances
            .read()
            .await
            .values()
            .filter_map(|i| i.gpu_mdev.clone().map(|m| (i.id.clone(), m, i.state)))
            .collect();

        for (instance_id, mdev, state) in snapshot {
            let owner_running_or_unknown =
                matches!(state, InstanceState::Running | InstanceState::Unknown);
            match mdev::reconcile_one(&self.sysfs_root, &mdev.uuid, owner_running_or_unknown).await {
                Ok(true) => info!(instance = %instance_id, uuid = %mdev.uuid, "mdev reconciled away"),
                Ok(false) => {}
                Err(e) => warn!(instance = %instance_id, uuid = %mdev.uuid, error = %e, "mdev reconcile failed"),
            }
        }
    }
}

async fn create_overlay(path: &Path, size: u64) -> Result<()> {
    let file = tokio::fs::File::create(path).await?;
    file.set_len(size).await?;
    drop(file);
    let path_str = path
        .to_str()
        .ok_or_else(|| HypemanError::Internal("non-utf8 overlay path".into()))?;
    let status = tokio::process::Command::new("mkfs.ext4")
        .args(["-q", "-F", path_str])
        .status()
        .await?;
    if !status.success() {
        return Err(HypemanError::Internal(format!(
            "mkfs.ext4 failed formatting overlay at {}",
            path.display()
        )));
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ReconcileOutcome {
    Keep,
    MarkUnknown,
    TearDown,
}

/// Pure reconcile-on-start decision table (`spec.md` §9's Unknown-state
/// asymmetry): a claimed `Running` instance with no corroborating live VMM
/// becomes `Unknown`, never silently `Stopped`. `Standby`/`Stopped` need no
/// live VMM to be believed. `live_running` is `None` when the hypervisor's
/// control socket could not be reached at all.
fn classify_reconcile(state: InstanceState, live_running: Option<bool>) -> ReconcileOutcome {
    match state {
        InstanceState::Creating | InstanceState::Deleting => ReconcileOutcome::TearDown,
        InstanceState::Running if live_running == Some(true) => ReconcileOutcome::Keep,
        InstanceState::Running | InstanceState::Unknown => ReconcileOutcome::MarkUnknown,
        InstanceState::Standby | InstanceState::Stopped => ReconcileOutcome::Keep,
    }
}

#[async_trait::async_trait]
impl crate::devices::InstanceView for InstanceManager {
    async fn is_running(&self, instance_id: &str) -> bool {
        matches!(
            self.instances.read().await.get(instance_id),
            Some(i) if i.state == InstanceState::Running
        )
    }

    async fn devices_of(&self, instance_id: &str) -> Vec<String> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .map(|i| i.device_ids.clone())
            .unwrap_or_default()
    }

    async fn all_devices_by_instance(&self) -> HashMap<String, Vec<String>> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(id, i)| (id.clone(), i.device_ids.clone()))
            .collect()
    }

    async fn detect_stray_vmms(&self) -> Vec<String> {
        let running: HashSet<String> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.state == InstanceState::Running)
            .map(|i| i.id.clone())
            .collect();

        let dir = self.data_root.guests_dir();
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return Vec::new();
        };
        let mut strays = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let id = entry.file_name().to_string_lossy().into_owned();
            if running.contains(&id) {
                continue;
            }
            let socket = self.data_root.ch_socket_path(&id);
            if tokio::net::UnixStream::connect(&socket).await.is_ok() {
                strays.push(id);
            }
        }
        strays
    }
}

#[async_trait::async_trait]
impl crate::network::AllocationView for InstanceManager {
    async fn allocated_ips(&self) -> HashSet<Ipv4Addr> {
        self.allocations.read().await.values().map(|a| a.ip).collect()
    }

    async fn name_in_use(&self, name: &str) -> bool {
        self.instances
            .read()
            .await
            .values()
            .any(|i| i.name == name && !i.state.is_terminal())
    }
}

#[async_trait::async_trait]
impl crate::ingress::IngressView for InstanceManager {
    /// Current IP of a Running instance, by id or name. `spec.md` §4.6: the
    /// proxy dials live — a Standby or Stopped instance has no address to
    /// hand back, not even its last-known one.
    async fn resolve_ip(&self, instance_name_or_id: &str) -> Option<Ipv4Addr> {
        let id = self.resolve(instance_name_or_id).await.ok()?;
        self.allocations.read().await.get(&id).map(|a| a.ip)
    }

    async fn instance_exists(&self, instance_name_or_id: &str) -> bool {
        self.resolve(instance_name_or_id).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Cidr;
    use crate::vfio::sysfs::SysfsRoot;
    use std::collections::HashMap as StdHashMap;

    async fn make_manager() -> (tempfile::TempDir, InstanceManager) {
        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path().join("data"));
        let images = Arc::new(ImageManager::new(data_root.clone()));
        let system = Arc::new(SystemManager::new(data_root.clone(), "6.6.1", "x86_64"));
        let network = Arc::new(NetworkFabric::new(
            "vmbr0".into(),
            Cidr::parse("192.168.127.0/24").unwrap(),
            "eth0".into(),
            16,
            1_000_000_000,
        ));
        let devices = Arc::new(DeviceManager::new(
            data_root.clone(),
            SysfsRoot::new(dir.path().join("sys")),
        ));
        let volumes = Arc::new(VolumeManager::new(data_root.clone(), 10 * 1024 * 1024 * 1024));
        let hypervisor = Arc::new(HypervisorDriver::new(
            PathBuf::from("/usr/local/bin/cloud-hypervisor"),
            Duration::from_secs(5),
        ));
        let pool = Arc::new(Pool::new());

        let mgr = InstanceManager::new(
            data_root,
            ResourceLimits::default(),
            images,
            system,
            network,
            devices,
            volumes,
            hypervisor,
            pool,
            dir.path().join("sys"),
            "1.1.1.1".into(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        (dir, mgr)
    }

    fn sample_instance(id: &str, name: &str, state: InstanceState, vcpus: u32, mem: u64) -> Instance {
        Instance {
            id: id.into(),
            name: name.into(),
            image_ref: "library/alpine:latest".into(),
            state,
            vcpus,
            mem_size: mem,
            hotplug_size: 0,
            overlay_size: 1024,
            network_enabled: false,
            device_ids: vec![],
            volume_attachments: vec![],
            env: StdHashMap::new(),
            gpu_mdev: None,
            network_rate_bps: None,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn resolve_exact_id_name_and_unambiguous_prefix() {
        let (_dir, mgr) = make_manager().await;
        let instance = sample_instance("abcdef0123456789", "web-1", InstanceState::Running, 1, 1024);
        mgr.persist_and_insert(&instance).await.unwrap();

        assert_eq!(mgr.resolve("abcdef0123456789").await.unwrap(), "abcdef0123456789");
        assert_eq!(mgr.resolve("web-1").await.unwrap(), "abcdef0123456789");
        assert_eq!(mgr.resolve("abcdef").await.unwrap(), "abcdef0123456789");
        assert!(mgr.resolve("nope").await.is_err());
    }

    #[tokio::test]
    async fn resolve_ambiguous_prefix_reports_all_candidates() {
        let (_dir, mgr) = make_manager().await;
        mgr.persist_and_insert(&sample_instance("ab0001", "a", InstanceState::Running, 1, 1024))
            .await
            .unwrap();
        mgr.persist_and_insert(&sample_instance("ab0002", "b", InstanceState::Running, 1, 1024))
            .await
            .unwrap();

        let err = mgr.resolve("ab").await.unwrap_err();
        match err {
            HypemanError::Ambiguous { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected Ambiguous, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name_against_non_terminal_instance() {
        let (_dir, mgr) = make_manager().await;
        mgr.persist_and_insert(&sample_instance("id1", "dup", InstanceState::Stopped, 1, 1024))
            .await
            .unwrap();

        let instances = mgr.instances.read().await;
        let taken = instances.values().any(|i| i.name == "dup" && !i.state.is_terminal());
        assert!(taken);
    }

    #[tokio::test]
    async fn validate_caps_rejects_over_per_instance_vcpu_cap() {
        let (_dir, mgr) = make_manager().await;
        let req = CreateRequest {
            name: "big".into(),
            image_ref: "library/alpine:latest".into(),
            vcpus: mgr.limits.max_vcpus_per_instance + 1,
            mem_size: 1024,
            hotplug_size: 0,
            overlay_size: 1024,
            network_enabled: false,
            env: StdHashMap::new(),
            device_names: vec![],
            volume_attachments: vec![],
            gpu_profile: None,
            rate_bps: None,
        };
        let instances = mgr.instances.read().await;
        let err = mgr.validate_caps(&instances, &req).unwrap_err();
        assert!(matches!(err, HypemanError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn validate_caps_rejects_when_total_would_exceed_cap() {
        let (_dir, mgr) = make_manager().await;
        mgr.persist_and_insert(&sample_instance(
            "id1",
            "existing",
            InstanceState::Running,
            mgr.limits.max_total_vcpus,
            1024,
        ))
        .await
        .unwrap();

        let req = CreateRequest {
            name: "another".into(),
            image_ref: "library/alpine:latest".into(),
            vcpus: 1,
            mem_size: 1024,
            hotplug_size: 0,
            overlay_size: 1024,
            network_enabled: false,
            env: StdHashMap::new(),
            device_names: vec![],
            volume_attachments: vec![],
            gpu_profile: None,
            rate_bps: None,
        };
        let instances = mgr.instances.read().await;
        let err = mgr.validate_caps(&instances, &req).unwrap_err();
        assert!(matches!(err, HypemanError::ResourceExhausted(_)));
    }

    #[test]
    fn unknown_state_asymmetry_running_without_live_vmm_becomes_unknown() {
        assert_eq!(
            classify_reconcile(InstanceState::Running, None),
            ReconcileOutcome::MarkUnknown
        );
        assert_eq!(
            classify_reconcile(InstanceState::Running, Some(false)),
            ReconcileOutcome::MarkUnknown
        );
        assert_eq!(
            classify_reconcile(InstanceState::Running, Some(true)),
            ReconcileOutcome::Keep
        );
    }

    #[test]
    fn standby_and_stopped_survive_reconcile_without_a_live_vmm() {
        assert_eq!(classify_reconcile(InstanceState::Standby, None), ReconcileOutcome::Keep);
        assert_eq!(classify_reconcile(InstanceState::Stopped, None), ReconcileOutcome::Keep);
    }

    #[test]
    fn mid_transition_states_are_torn_down_on_reconcile() {
        assert_eq!(
            classify_reconcile(InstanceState::Creating, None),
            ReconcileOutcome::TearDown
        );
        assert_eq!(
            classify_reconcile(InstanceState::Deleting, Some(true)),
            ReconcileOutcome::TearDown
        );
    }

    #[tokio::test]
    async fn unwind_processes_every_step_without_panicking() {
        let (_dir, mgr) = make_manager().await;
        tokio::fs::create_dir_all(mgr.data_root.guest_dir("orphan")).await.unwrap();
        let steps = vec![
            UndoStep::DetachVolume("missing-volume".into()),
            UndoStep::DetachDevice("missing-device".into()),
            UndoStep::RemoveInstanceDir("orphan".into()),
        ];
        mgr.unwind(steps).await;
        assert!(!mgr.data_root.guest_dir("orphan").exists());
    }
}
