//! Process-wide device registry.
//!
//! Devices survive reconnects and restarts; the live channel binding does
//! not. Everything transient (`online`, the owning connection epoch) is
//! `#[serde(skip)]` so the persisted projection stays clean.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use beamdrop_shared::{ConnectionStrength, DeviceKind};

use crate::identity::ClientIdentity;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub const DEVICE_EXPIRY_MS: u64 = 30 * 60 * 1000;
pub const PINNED_DEVICE_EXPIRY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: DeviceKind,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub browser: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub pinned: bool,
    /// True only while a live channel is bound; never persisted.
    #[serde(skip)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub connection_strength: ConnectionStrength,
    /// Serial of the connection currently bound to this device. Guards the
    /// duplicate-connection race: a superseded channel's teardown must not
    /// mark the rebound device offline.
    #[serde(skip)]
    pub conn_epoch: u64,
}

impl Device {
    /// Display name: custom name wins over the platform-derived default.
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }
}

/// Shared map of device id → device record.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new(initial: Vec<Device>) -> Self {
        let devices = initial.into_iter().map(|d| (d.id.clone(), d)).collect();
        DeviceRegistry {
            devices: RwLock::new(devices),
        }
    }

    /// Bind a fresh channel. A known device keeps its custom name, pin and
    /// room; an unknown one is created with the platform-derived defaults.
    pub fn upsert_on_connect(&self, identity: &ClientIdentity, ua: &str, epoch: u64) -> Device {
        let mut devices = self.devices.write();
        let device = devices
            .entry(identity.device_id.clone())
            .and_modify(|d| {
                d.online = true;
                d.last_seen = now_millis();
                d.conn_epoch = epoch;
                d.user_agent = ua.to_string();
                d.platform = identity.platform.clone();
                d.browser = identity.browser.clone();
            })
            .or_insert_with(|| Device {
                id: identity.device_id.clone(),
                name: identity.default_name.clone(),
                custom_name: None,
                kind: identity.kind,
                platform: identity.platform.clone(),
                browser: identity.browser.clone(),
                user_agent: ua.to_string(),
                pinned: false,
                online: true,
                last_seen: now_millis(),
                room_id: None,
                connection_strength: ConnectionStrength::default(),
                conn_epoch: epoch,
            });
        device.clone()
    }

    /// Clear the channel binding. With `epoch` set, the mark is skipped
    /// unless that connection still owns the device.
    pub fn mark_offline(&self, id: &str, epoch: Option<u64>) -> bool {
        let mut devices = self.devices.write();
        match devices.get_mut(id) {
            Some(d) if epoch.is_none() || epoch == Some(d.conn_epoch) => {
                d.online = false;
                d.last_seen = now_millis();
                true
            }
            _ => false,
        }
    }

    pub fn rename(&self, id: &str, name: &str) -> Option<Device> {
        let mut devices = self.devices.write();
        let d = devices.get_mut(id)?;
        d.custom_name = Some(name.to_string());
        d.name = name.to_string();
        Some(d.clone())
    }

    /// Apply a `deviceInfo` update; only supplied fields change.
    pub fn apply_info(
        &self,
        id: &str,
        name: Option<&str>,
        custom_name: Option<&str>,
        kind: Option<DeviceKind>,
        strength: Option<ConnectionStrength>,
    ) -> Option<Device> {
        let mut devices = self.devices.write();
        let d = devices.get_mut(id)?;
        if let Some(name) = name {
            d.name = name.to_string();
        }
        if let Some(custom) = custom_name {
            d.custom_name = Some(custom.to_string());
        }
        if let Some(kind) = kind {
            d.kind = kind;
        }
        if let Some(strength) = strength {
            d.connection_strength = strength;
        }
        Some(d.clone())
    }

    /// Re-derive platform facts from a fresh UA (`client_identify`).
    pub fn correct_client_facts(&self, id: &str, identity: &ClientIdentity, ua: &str) {
        let mut devices = self.devices.write();
        if let Some(d) = devices.get_mut(id) {
            d.platform = identity.platform.clone();
            d.browser = identity.browser.clone();
            d.kind = identity.kind;
            d.user_agent = ua.to_string();
        }
    }

    /// Toggle `pinned` on `target_id`, permitted only when both devices
    /// share a room. Returns the new flag, or `None` for the silent no-op.
    pub fn toggle_pin(&self, target_id: &str, by_id: &str) -> Option<bool> {
        let mut devices = self.devices.write();
        let by_room = devices.get(by_id)?.room_id.clone()?;
        let target = devices.get_mut(target_id)?;
        if target.room_id.as_deref() != Some(by_room.as_str()) {
            return None;
        }
        target.pinned = !target.pinned;
        Some(target.pinned)
    }

    pub fn set_room(&self, id: &str, room_id: Option<String>) {
        let mut devices = self.devices.write();
        if let Some(d) = devices.get_mut(id) {
            d.room_id = room_id;
        }
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.devices.read().values().filter(|d| d.online).count()
    }

    /// Persistable projection, ordered by id so snapshots diff cleanly.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut all: Vec<Device> = self.devices.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Remove expired devices and return them. Offline non-pinned devices
    /// expire after 30 minutes, pinned ones after 24 hours.
    pub fn expire(&self, now: u64) -> Vec<Device> {
        let mut devices = self.devices.write();
        let expired: Vec<String> = devices
            .values()
            .filter(|d| {
                if d.online {
                    return false;
                }
                let window = if d.pinned {
                    PINNED_DEVICE_EXPIRY_MS
                } else {
                    DEVICE_EXPIRY_MS
                };
                now.saturating_sub(d.last_seen) > window
            })
            .map(|d| d.id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| devices.remove(&id))
            .collect()
    }
}
