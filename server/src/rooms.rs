//! Room registry and presence projection.
//!
//! Rooms are open-by-name multicast scopes. Display names keep their case;
//! uniqueness and lookup are case-insensitive and whitespace-trimmed. A
//! room is deleted in the same critical section that removes its last
//! member, so an empty room is never observable.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use beamdrop_shared::RelayError;

use crate::registry::{now_millis, DeviceRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    pub created: u64,
    pub created_by: String,
    pub members: Vec<String>,
}

/// What `leave` did, gathered under the lock for fan-out afterwards.
#[derive(Debug)]
pub struct LeaveOutcome {
    pub room_id: String,
    pub remaining: Vec<String>,
    pub deleted: bool,
}

fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new(initial: Vec<Room>) -> Self {
        let rooms = initial.into_iter().map(|r| (r.id.clone(), r)).collect();
        RoomRegistry {
            rooms: RwLock::new(rooms),
        }
    }

    /// Create a room and make the creator its first member.
    pub fn create(&self, name: &str, by_id: &str) -> Result<Room, RelayError> {
        let display = name.trim();
        if display.is_empty() {
            return Err(RelayError::RoomNameEmpty);
        }
        let folded = fold(display);
        let mut rooms = self.rooms.write();
        if rooms.values().any(|r| fold(&r.name) == folded) {
            return Err(RelayError::RoomAlreadyExists);
        }
        let room = Room {
            id: format!("room-{}", Uuid::new_v4()),
            name: display.to_string(),
            created: now_millis(),
            created_by: by_id.to_string(),
            members: vec![by_id.to_string()],
        };
        rooms.insert(room.id.clone(), room.clone());
        Ok(room)
    }

    /// Join by server-minted id or by display name. Re-joining the same
    /// room is idempotent.
    pub fn join(
        &self,
        room_id: Option<&str>,
        name: Option<&str>,
        by_id: &str,
    ) -> Result<Room, RelayError> {
        if room_id.is_none() && name.map(|n| n.trim().is_empty()).unwrap_or(true) {
            return Err(RelayError::RoomNameEmpty);
        }
        let mut rooms = self.rooms.write();
        let id = room_id
            .filter(|id| rooms.contains_key(*id))
            .map(str::to_string)
            .or_else(|| {
                let folded = fold(name?);
                rooms
                    .values()
                    .find(|r| fold(&r.name) == folded)
                    .map(|r| r.id.clone())
            })
            .ok_or(RelayError::RoomNotFound)?;
        let room = rooms.get_mut(&id).ok_or(RelayError::RoomNotFound)?;
        if !room.members.iter().any(|m| m == by_id) {
            room.members.push(by_id.to_string());
        }
        Ok(room.clone())
    }

    /// Remove a member; the room disappears with its last member.
    pub fn leave(&self, room_id: &str, by_id: &str) -> Option<LeaveOutcome> {
        let mut rooms = self.rooms.write();
        let room = rooms.get_mut(room_id)?;
        let before = room.members.len();
        room.members.retain(|m| m != by_id);
        if room.members.len() == before {
            return None;
        }
        let deleted = room.members.is_empty();
        let remaining = room.members.clone();
        if deleted {
            rooms.remove(room_id);
        }
        Some(LeaveOutcome {
            room_id: room_id.to_string(),
            remaining,
            deleted,
        })
    }

    pub fn get(&self, id: &str) -> Option<Room> {
        self.rooms.read().get(id).cloned()
    }

    pub fn member_ids(&self, id: &str) -> Vec<String> {
        self.rooms
            .read()
            .get(id)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    pub fn member_count(&self, id: &str) -> usize {
        self.rooms.read().get(id).map(|r| r.members.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Room> {
        let mut all: Vec<Room> = self.rooms.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Catalog projection for `GET /api/rooms`.
    pub fn catalog(&self) -> Vec<Value> {
        self.snapshot()
            .iter()
            .map(|r| {
                json!({
                    "id": r.id,
                    "name": r.name,
                    "created": r.created,
                    "createdBy": r.created_by,
                    "deviceCount": r.members.len(),
                })
            })
            .collect()
    }
}

/// Ordered presence projection for one room, plus the member ids to send
/// it to. Gathered under short-lived read locks; the caller fans out after
/// both locks are released.
pub fn device_list_payload(
    rooms: &RoomRegistry,
    devices: &DeviceRegistry,
    room_id: &str,
) -> Option<(Vec<String>, Value)> {
    let members = {
        let guard = rooms.rooms.read();
        guard.get(room_id)?.members.clone()
    };
    let list: Vec<Value> = members
        .iter()
        .filter_map(|id| devices.get(id))
        .map(|d| {
            json!({
                "id": d.id,
                "name": d.display_name(),
                "originalName": d.name,
                "type": d.kind.as_str(),
                "platform": d.platform,
                "browser": d.browser,
                "pinned": d.pinned,
                "online": d.online,
                "lastSeen": d.last_seen,
                "connectionStrength": d.connection_strength.as_str(),
                "hasCustomName": d.custom_name.is_some(),
            })
        })
        .collect();
    let payload = json!({
        "type": "deviceList",
        "roomId": room_id,
        "devices": list,
        "deviceCount": list.len(),
    });
    Some((members, payload))
}
