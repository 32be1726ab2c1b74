//! Catalog persistence.
//!
//! The device and room registries snapshot to `data/devices.json` and
//! `data/rooms.json` after any mutation. All writes funnel through one
//! writer task fed by a coalescing dirty channel, so concurrent mutations
//! never race on the files. Writes are temp-file + rename; transient
//! failures retry with bounded backoff; a corrupt file on load is
//! truncated to an empty catalog rather than halting startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{Device, DeviceRegistry};
use crate::rooms::{Room, RoomRegistry};

const DEVICES_FILE: &str = "devices.json";
const ROOMS_FILE: &str = "rooms.json";
const WRITE_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 100;
/// Mutations arriving within this window share one snapshot write.
const COALESCE_MS: u64 = 200;

/// Handle held by the rest of the server; dropping it stops the writer.
#[derive(Clone)]
pub struct Store {
    dirty_tx: mpsc::UnboundedSender<()>,
}

impl Store {
    /// Note that a registry mutated. Cheap and infallible; the writer task
    /// picks it up.
    pub fn mark_dirty(&self) {
        let _ = self.dirty_tx.send(());
    }
}

/// Load both catalogs. Devices come back offline and unbound.
pub async fn load(data_dir: &Path) -> (Vec<Device>, Vec<Room>) {
    fs::create_dir_all(data_dir).await.ok();
    let devices: Vec<Device> = load_catalog(&data_dir.join(DEVICES_FILE)).await;
    let rooms: Vec<Room> = load_catalog(&data_dir.join(ROOMS_FILE)).await;
    (devices, rooms)
}

async fn load_catalog<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&content) {
        Ok(items) => items,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt catalog, truncating to empty");
            let _ = fs::write(path, "[]").await;
            Vec::new()
        }
    }
}

/// Spawn the single-writer task and return its handle.
pub fn spawn_writer(
    data_dir: PathBuf,
    devices: Arc<DeviceRegistry>,
    rooms: Arc<RoomRegistry>,
) -> Store {
    let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        while dirty_rx.recv().await.is_some() {
            // Coalesce a burst of mutations into one write.
            tokio::time::sleep(std::time::Duration::from_millis(COALESCE_MS)).await;
            while dirty_rx.try_recv().is_ok() {}
            if let Err(e) = write_snapshot(&data_dir, &devices, &rooms).await {
                warn!(error = %e, "catalog snapshot failed");
            }
        }
        debug!("catalog writer stopped");
    });
    Store { dirty_tx }
}

/// Serialize both registries to disk. Used by the writer task and by the
/// shutdown path for the final flush.
pub async fn write_snapshot(
    data_dir: &Path,
    devices: &DeviceRegistry,
    rooms: &RoomRegistry,
) -> Result<()> {
    let device_json =
        serde_json::to_string_pretty(&devices.snapshot()).context("serialize devices")?;
    let room_json = serde_json::to_string_pretty(&rooms.snapshot()).context("serialize rooms")?;
    write_with_retry(&data_dir.join(DEVICES_FILE), &device_json).await?;
    write_with_retry(&data_dir.join(ROOMS_FILE), &room_json).await?;
    Ok(())
}

async fn write_with_retry(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut last_err = None;
    for attempt in 1..=WRITE_RETRIES {
        let result = async {
            fs::write(&tmp, content).await?;
            fs::rename(&tmp, path).await
        }
        .await;
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "catalog write retry");
                last_err = Some(e);
                tokio::time::sleep(std::time::Duration::from_millis(
                    RETRY_BACKOFF_MS * u64::from(attempt),
                ))
                .await;
            }
        }
    }
    Err(last_err.expect("retries exhausted"))
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamdrop_shared::{ConnectionStrength, DeviceKind};
    use tempfile::TempDir;

    fn sample_device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            name: "Chrome on Linux".to_string(),
            custom_name: Some("desk".to_string()),
            kind: DeviceKind::Desktop,
            platform: "Linux".to_string(),
            browser: "Chrome".to_string(),
            user_agent: "ua".to_string(),
            pinned: true,
            online: true,
            last_seen: 42,
            room_id: Some("room-1".to_string()),
            connection_strength: ConnectionStrength::Fair,
            conn_epoch: 7,
        }
    }

    #[tokio::test]
    async fn snapshot_roundtrip_drops_transient_fields() {
        let dir = TempDir::new().unwrap();
        let devices = DeviceRegistry::new(vec![sample_device("device-1")]);
        let rooms = RoomRegistry::default();
        rooms.create("Foo", "device-1").unwrap();

        write_snapshot(dir.path(), &devices, &rooms).await.unwrap();
        let (loaded_devices, loaded_rooms) = load(dir.path()).await;

        assert_eq!(loaded_devices.len(), 1);
        let d = &loaded_devices[0];
        assert_eq!(d.id, "device-1");
        assert_eq!(d.custom_name.as_deref(), Some("desk"));
        assert!(d.pinned);
        // Transient state never persists.
        assert!(!d.online);
        assert_eq!(d.conn_epoch, 0);

        assert_eq!(loaded_rooms.len(), 1);
        assert_eq!(loaded_rooms[0].name, "Foo");
        assert_eq!(loaded_rooms[0].members, vec!["device-1"]);
    }

    #[tokio::test]
    async fn corrupt_catalog_truncates_to_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(DEVICES_FILE), "{ not json")
            .await
            .unwrap();
        let (devices, rooms) = load(dir.path()).await;
        assert!(devices.is_empty());
        assert!(rooms.is_empty());
        // The bad file was rewritten as an empty catalog.
        let content = fs::read_to_string(dir.path().join(DEVICES_FILE))
            .await
            .unwrap();
        assert_eq!(content, "[]");
    }

    #[tokio::test]
    async fn writer_task_coalesces_dirty_marks() {
        let dir = TempDir::new().unwrap();
        let devices = Arc::new(DeviceRegistry::new(vec![sample_device("device-1")]));
        let rooms = Arc::new(RoomRegistry::default());
        let store = spawn_writer(dir.path().to_path_buf(), devices.clone(), rooms.clone());

        for _ in 0..10 {
            store.mark_dirty();
        }
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;

        let (loaded, _) = load(dir.path()).await;
        assert_eq!(loaded.len(), 1);
    }
}
