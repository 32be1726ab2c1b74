//! Periodic sweeper for stale state.
//!
//! One pass every minute: idle channels, expired devices (with their room
//! memberships), expired transfers, and old scratch uploads. Registry
//! snapshots are flushed whenever a sweep mutated anything.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use beamdrop_shared::RelayError;

use crate::registry::now_millis;
use crate::websocket::ServerState;

const JANITOR_PERIOD_SECS: u64 = 60;
/// Channels quiet this long are closed with a normal-closure "Inactivity".
const CHANNEL_IDLE_LIMIT_SECS: u64 = 5 * 60;
/// Scratch uploads older than this are removed.
const UPLOAD_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub fn spawn(state: Arc<ServerState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(JANITOR_PERIOD_SECS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            run_once(&state).await;
        }
    })
}

/// One janitor pass. Public for the shutdown path and tests.
pub async fn run_once(state: &Arc<ServerState>) {
    let mut dirty = false;

    let closed = state
        .close_idle_channels(CHANNEL_IDLE_LIMIT_SECS, RelayError::Inactivity)
        .await;
    if closed > 0 {
        info!(closed, "janitor: closed inactive channels");
    }

    let expired = state.devices.expire(now_millis());
    for device in &expired {
        dirty = true;
        let Some(room_id) = &device.room_id else {
            continue;
        };
        let Some(out) = state.rooms.leave(room_id, &device.id) else {
            continue;
        };
        if out.deleted {
            continue;
        }
        let payload = json!({
            "type": "deviceLeft",
            "roomId": out.room_id,
            "deviceId": device.id,
            "deviceCount": out.remaining.len(),
        });
        for member in &out.remaining {
            state.send_to(member, &payload).await;
        }
        state.broadcast_device_list(&out.room_id).await;
    }
    if !expired.is_empty() {
        info!(expired = expired.len(), "janitor: expired stale devices");
    }

    let swept = state.transfers.sweep_expired(now_millis());
    if swept > 0 {
        info!(swept, "janitor: expired transfers");
        dirty = true;
    }

    match sweep_uploads(Path::new(&state.config.upload_dir)).await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "janitor: pruned scratch uploads"),
        Err(e) => warn!(error = %e, "janitor: upload sweep failed"),
    }

    if dirty {
        state.store.mark_dirty();
    }
}

/// Remove scratch files whose mtime is past the age limit.
async fn sweep_uploads(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age > UPLOAD_MAX_AGE && fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
