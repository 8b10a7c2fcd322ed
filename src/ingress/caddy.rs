//! Caddy process supervisor and admin-API client (`spec.md` §4.6).
//!
//! Spawned and reaped the same way [`crate::hypervisor::HypervisorDriver`]
//! manages Cloud Hypervisor: a logged child process, a readiness probe
//! against its control API, config pushed after the fact rather than baked
//! into the command line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use super::IngressError;

pub struct CaddySupervisor {
    binary: PathBuf,
    admin_base: String,
    config_path: PathBuf,
    log_path: PathBuf,
    stop_on_shutdown: bool,
    client: reqwest::Client,
    child: Option<Child>,
}

impl CaddySupervisor {
    pub fn new(
        binary: PathBuf,
        admin_address: &str,
        admin_port: u16,
        config_path: PathBuf,
        log_path: PathBuf,
        stop_on_shutdown: bool,
    ) -> Self {
        Self {
            binary,
            admin_base: format!("http://{admin_address}:{admin_port}"),
            config_path,
            log_path,
            stop_on_shutdown,
            client: reqwest::Client::new(),
            child: None,
        }
    }

    /// Spawns `caddy run` with an empty starting config at `config_path`
    /// (created if missing) and waits for the admin API to answer.
    pub async fn spawn(&mut self, spawn_timeout: Duration) -> Result<(), IngressError> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(IngressError::Io)?;
        }
        if tokio::fs::metadata(&self.config_path).await.is_err() {
            tokio::fs::write(&self.config_path, b"{}").await.map_err(IngressError::Io)?;
        }
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(IngressError::Io)?;
        }
        let log_file = std::fs::File::create(&self.log_path).map_err(IngressError::Io)?;
        let log_file_err = log_file.try_clone().map_err(IngressError::Io)?;

        let child = Command::new(&self.binary)
            .arg("run")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--adapter")
            .arg("json")
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .kill_on_drop(self.stop_on_shutdown)
            .spawn()
            .map_err(IngressError::Io)?;

        info!(pid = ?child.id(), admin = %self.admin_base, "spawned caddy");
        self.child = Some(child);
        self.wait_ready(spawn_timeout).await
    }

    async fn wait_ready(&self, spawn_timeout: Duration) -> Result<(), IngressError> {
        let deadline = Instant::now() + spawn_timeout;
        loop {
            if self
                .client
                .get(format!("{}/config/", self.admin_base))
                .send()
                .await
                .is_ok()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(IngressError::ProxyUnreachable);
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Atomically writes `config` to disk then POSTs it to the admin API's
    /// `load` endpoint (`spec.md` §4.6 "Reload"). Parse errors are
    /// `ConfigValidationFailed`; a message containing "address already in
    /// use" is additionally flagged `port_in_use`.
    pub async fn load(&self, config: &serde_json::Value) -> Result<(), IngressError> {
        let bytes = serde_json::to_vec_pretty(config).map_err(|e| IngressError::Serialize(e.to_string()))?;
        crate::paths::write_atomic(&self.config_path, &bytes)
            .await
            .map_err(|_| IngressError::Io(std::io::Error::other("write_atomic failed")))?;

        let resp = self
            .client
            .post(format!("{}/load", self.admin_base))
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(|e| IngressError::ProxyRejected {
                message: e.to_string(),
                port_in_use: false,
            })?;

        if resp.status().is_success() {
            return Ok(());
        }
        let message = resp.text().await.unwrap_or_default();
        let port_in_use = message.to_lowercase().contains("address already in use");
        Err(IngressError::ProxyRejected { message, port_in_use })
    }

    /// Best-effort shutdown, never propagating a failure: `CADDY_STOP_ON_
    /// SHUTDOWN=false` skips the admin `/stop` call and leaves the process
    /// running independently of this one (`spec.md` §6).
    pub async fn shutdown(&mut self, grace: Duration) {
        if !self.stop_on_shutdown {
            return;
        }
        if let Err(e) = self.client.post(format!("{}/stop", self.admin_base)).send().await {
            warn!(error = %e, "caddy /stop request failed, falling back to signal");
        }
        let Some(mut child) = self.child.take() else { return };
        if matches!(tokio::time::timeout(grace, child.wait()).await, Ok(Ok(_))) {
            return;
        }
        warn!("caddy did not exit after /stop, killing");
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
