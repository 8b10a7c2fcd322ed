//! Typed client for the Cloud Hypervisor Unix-socket control API, process
//! spawn, and vsock dialer (`spec.md` §4.5, C8).

pub mod client;
pub mod models;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use hyper::StatusCode;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};

pub use models::{
    CpusConfig, DeviceConfig, DiskConfig, MemoryConfig, NetConfig, PayloadConfig, VmConfig,
    VmInfo, VmState, VsockConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("failed to spawn VMM: {0}")]
    Spawn(std::io::Error),

    #[error("VMM API socket at {path} never became ready: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("VMM did not become ready within the boot timeout")]
    SpawnTimeout,

    #[error("protocol error talking to VMM: {0}")]
    Protocol(String),

    #[error("VMM API returned {status}: {body}")]
    ApiError { status: StatusCode, body: String },
}

impl HypervisorError {
    pub fn classify(self) -> crate::error::HypemanError {
        use crate::error::HypemanError;
        match self {
            HypervisorError::SpawnTimeout | HypervisorError::Connect { .. } => {
                HypemanError::Transient(self.to_string())
            }
            other => HypemanError::Internal(other.to_string()),
        }
    }
}

/// A spawned, not-yet-necessarily-booted Cloud Hypervisor process plus the
/// handle the caller needs to tear it down.
pub struct HypervisorProcess {
    pub child: Child,
    pub socket_path: PathBuf,
}

pub struct HypervisorDriver {
    binary: PathBuf,
    spawn_timeout: Duration,
}

impl HypervisorDriver {
    pub fn new(binary: PathBuf, spawn_timeout: Duration) -> Self {
        Self {
            binary,
            spawn_timeout,
        }
    }

    /// Spawns the VMM binary with `--api-socket <socket>`, redirecting
    /// stdout/stderr to `log_path`, and waits for the control API to
    /// become readable (`spec.md` §4.5: "any successful request" as the
    /// readiness probe — here, a successful `vm.ping`/404-tolerant GET on
    /// `/api/v1/vmm.ping`. The process is not session-detached: the caller
    /// owns its lifetime and must reap it on teardown.
    pub async fn spawn(
        &self,
        socket_path: &Path,
        log_path: &Path,
    ) -> Result<HypervisorProcess, HypervisorError> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(HypervisorError::Spawn)?;
        }
        let _ = tokio::fs::remove_file(socket_path).await;

        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(HypervisorError::Spawn)?;
        }
        let log_file = std::fs::File::create(log_path).map_err(HypervisorError::Spawn)?;
        let log_file_err = log_file.try_clone().map_err(HypervisorError::Spawn)?;

        let child = Command::new(&self.binary)
            .arg("--api-socket")
            .arg(socket_path)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(HypervisorError::Spawn)?;

        info!(pid = ?child.id(), socket = %socket_path.display(), "spawned cloud-hypervisor");

        self.wait_ready(socket_path).await?;

        Ok(HypervisorProcess {
            child,
            socket_path: socket_path.to_path_buf(),
        })
    }

    async fn wait_ready(&self, socket_path: &Path) -> Result<(), HypervisorError> {
        let deadline = Instant::now() + self.spawn_timeout;
        loop {
            if UnixStream::connect(socket_path).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HypervisorError::SpawnTimeout);
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    async fn put(
        &self,
        socket_path: &Path,
        uri_path: &str,
        body: Option<&VmConfig>,
    ) -> Result<String, HypervisorError> {
        let payload = body
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| HypervisorError::Protocol(e.to_string()))?;
        let (status, body) = client::request(socket_path, "PUT", uri_path, payload).await?;
        if !status.is_success() {
            return Err(HypervisorError::ApiError { status, body });
        }
        Ok(body)
    }

    pub async fn create(&self, socket_path: &Path, config: &VmConfig) -> Result<(), HypervisorError> {
        self.put(socket_path, "/api/v1/vm.create", Some(config)).await?;
        Ok(())
    }

    pub async fn boot(&self, socket_path: &Path) -> Result<(), HypervisorError> {
        self.put(socket_path, "/api/v1/vm.boot", None).await?;
        Ok(())
    }

    pub async fn pause(&self, socket_path: &Path) -> Result<(), HypervisorError> {
        self.put(socket_path, "/api/v1/vm.pause", None).await?;
        Ok(())
    }

    pub async fn resume(&self, socket_path: &Path) -> Result<(), HypervisorError> {
        self.put(socket_path, "/api/v1/vm.resume", None).await?;
        Ok(())
    }

    /// Snapshots the running VM to `file://<dest>`, per `spec.md` §4.5.
    pub async fn snapshot(&self, socket_path: &Path, dest: &Path) -> Result<(), HypervisorError> {
        let body = serde_json::json!({ "destination_url": format!("file://{}", dest.display()) });
        let payload = serde_json::to_string(&body).map_err(|e| HypervisorError::Protocol(e.to_string()))?;
        let (status, resp) = client::request(socket_path, "PUT", "/api/v1/vm.snapshot", Some(payload)).await?;
        if !status.is_success() {
            return Err(HypervisorError::ApiError { status, body: resp });
        }
        Ok(())
    }

    /// Restores a VM from `file://<source>` on a freshly-spawned, not-yet-
    /// created VMM, per `spec.md` §4.5.
    pub async fn restore(&self, socket_path: &Path, source: &Path) -> Result<(), HypervisorError> {
        let body = serde_json::json!({ "source_url": format!("file://{}", source.display()) });
        let payload = serde_json::to_string(&body).map_err(|e| HypervisorError::Protocol(e.to_string()))?;
        let (status, resp) = client::request(socket_path, "PUT", "/api/v1/vm.restore", Some(payload)).await?;
        if !status.is_success() {
            return Err(HypervisorError::ApiError { status, body: resp });
        }
        Ok(())
    }

    pub async fn info(&self, socket_path: &Path) -> Result<VmInfo, HypervisorError> {
        let (status, body) = client::request(socket_path, "GET", "/api/v1/vm.info", None).await?;
        if !status.is_success() {
            return Err(HypervisorError::ApiError { status, body });
        }
        serde_json::from_str(&body).map_err(|e| HypervisorError::Protocol(e.to_string()))
    }

    /// `spec.md` §4.5 shutdown sequence: `vm.shutdown` via the API with a
    /// bounded wait, then SIGTERM with a bounded wait, then SIGKILL.
    /// Always best-effort; errors are logged, never propagated, so the
    /// caller's own teardown (socket cleanup, resource release) proceeds
    /// regardless (`spec.md` §7: "superseded by the SIGTERM/SIGKILL
    /// fallback").
    pub async fn shutdown(&self, process: &mut Child, socket_path: &Path, grace: Duration) {
        let pid = process.id();

        if let Err(e) = self.put(socket_path, "/api/v1/vm.shutdown", None).await {
            warn!(error = %e, "vm.shutdown API call failed, falling back to signals");
        }
        if Self::wait_exit(process, grace).await {
            let _ = tokio::fs::remove_file(socket_path).await;
            return;
        }

        if let Some(pid) = pid {
            info!(pid, "sending SIGTERM to vmm");
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        if Self::wait_exit(process, grace).await {
            let _ = tokio::fs::remove_file(socket_path).await;
            return;
        }

        warn!(?pid, "vmm did not exit after SIGTERM, sending SIGKILL");
        let _ = process.kill().await;
        let _ = process.wait().await;
        let _ = tokio::fs::remove_file(socket_path).await;
    }

    async fn wait_exit(process: &mut Child, grace: Duration) -> bool {
        matches!(timeout(grace, process.wait()).await, Ok(Ok(_)))
    }
}
