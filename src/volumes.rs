//! Per-volume raw disks: attach/detach, capacity cap, single-writer
//! enforcement (`spec.md` §3, §4, C5).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{EntityKind, HypemanError, Result};
use crate::paths::DataRoot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub attached_to: Option<String>,
    pub created_at: String,
}

pub struct VolumeManager {
    data_root: DataRoot,
    max_volume_size: u64,
    volumes: RwLock<HashMap<String, Volume>>,
}

impl VolumeManager {
    pub fn new(data_root: DataRoot, max_volume_size: u64) -> Self {
        Self {
            data_root,
            max_volume_size,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load_all(&self) -> Result<()> {
        let dir = self.data_root.volumes_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        let mut volumes = self.volumes.write().await;
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if let Some(v) =
                crate::paths::try_read_json::<Volume>(&self.data_root.volume_metadata_path(&id)).await?
            {
                volumes.insert(id, v);
            }
        }
        Ok(())
    }

    pub async fn create(&self, id: String, name: String, size_bytes: u64) -> Result<Volume> {
        if size_bytes > self.max_volume_size {
            return Err(HypemanError::ResourceExhausted(format!(
                "requested volume size {size_bytes} exceeds cap {}",
                self.max_volume_size
            )));
        }

        let mut volumes = self.volumes.write().await;
        if volumes.values().any(|v| v.name == name) {
            return Err(HypemanError::already_exists(EntityKind::Volume, name));
        }

        let disk_path = self.data_root.volume_disk_path(&id);
        tokio::fs::create_dir_all(disk_path.parent().unwrap()).await?;
        let file = tokio::fs::File::create(&disk_path).await?;
        file.set_len(size_bytes).await?;

        let volume = Volume {
            id: id.clone(),
            name,
            size_bytes,
            attached_to: None,
            created_at: crate::now_rfc3339(),
        };
        crate::paths::write_json(&self.data_root.volume_metadata_path(&id), &volume).await?;
        volumes.insert(id, volume.clone());
        Ok(volume)
    }

    pub async fn get(&self, id: &str) -> Result<Volume> {
        self.volumes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HypemanError::not_found(EntityKind::Volume, id))
    }

    pub async fn list(&self) -> Vec<Volume> {
        self.volumes.read().await.values().cloned().collect()
    }

    /// Exclusive attach: fails `InUse` if already attached to anyone.
    pub async fn attach(&self, id: &str, instance_id: &str) -> Result<Volume> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get_mut(id)
            .ok_or_else(|| HypemanError::not_found(EntityKind::Volume, id))?;
        if let Some(owner) = &volume.attached_to {
            if owner != instance_id {
                return Err(HypemanError::in_use(
                    EntityKind::Volume,
                    id,
                    format!("already attached to {owner}"),
                ));
            }
            return Ok(volume.clone());
        }
        volume.attached_to = Some(instance_id.to_string());
        let snapshot = volume.clone();
        drop(volumes);
        crate::paths::write_json(&self.data_root.volume_metadata_path(id), &snapshot).await?;
        info!(volume = id, instance = instance_id, "volume attached");
        Ok(snapshot)
    }

    pub async fn detach(&self, id: &str) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        if let Some(volume) = volumes.get_mut(id) {
            volume.attached_to = None;
            let snapshot = volume.clone();
            drop(volumes);
            crate::paths::write_json(&self.data_root.volume_metadata_path(id), &snapshot).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .get(id)
            .ok_or_else(|| HypemanError::not_found(EntityKind::Volume, id))?;
        if volume.attached_to.is_some() {
            return Err(HypemanError::in_use(EntityKind::Volume, id, "volume is attached"));
        }
        volumes.remove(id);
        let dir = self.data_root.volume_dir(id);
        tokio::fs::remove_dir_all(&dir).await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_manager() -> (tempfile::TempDir, VolumeManager) {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::new(dir.path());
        (dir, VolumeManager::new(root, 10 * 1024 * 1024))
    }

    #[tokio::test]
    async fn create_rejects_over_cap() {
        let (_dir, mgr) = make_manager().await;
        let err = mgr
            .create("v1".into(), "data".into(), 100 * 1024 * 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, HypemanError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn attach_is_exclusive() {
        let (_dir, mgr) = make_manager().await;
        mgr.create("v1".into(), "data".into(), 1024).await.unwrap();
        mgr.attach("v1", "inst-a").await.unwrap();
        let err = mgr.attach("v1", "inst-b").await.unwrap_err();
        assert!(matches!(err, HypemanError::InUse { .. }));
    }

    #[tokio::test]
    async fn delete_fails_while_attached() {
        let (_dir, mgr) = make_manager().await;
        mgr.create("v1".into(), "data".into(), 1024).await.unwrap();
        mgr.attach("v1", "inst-a").await.unwrap();
        let err = mgr.delete("v1").await.unwrap_err();
        assert!(matches!(err, HypemanError::InUse { .. }));
        mgr.detach("v1").await.unwrap();
        mgr.delete("v1").await.unwrap();
    }
}
