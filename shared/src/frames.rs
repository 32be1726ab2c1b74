//! Inbound control frames.
//!
//! All frames are JSON objects with a `type` discriminator. The server
//! answers unknown types and malformed JSON differently (`UnknownMessageType`
//! vs `MalformedFrame`), so parsing happens in two steps: pull the `type`
//! out of the raw value, then deserialize into the tagged enum.

use serde::Deserialize;
use serde_json::Value;

use crate::device::{ConnectionStrength, DeviceKind};

/// Metadata for one offered file. `files[0].size` is the authoritative
/// total size of the chunked payload.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct FileMeta {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime: Option<String>,
}

/// Every frame a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Stronger identity material after connect; may carry a fresh UA the
    /// server uses to correct platform/browser before resending `welcome`.
    #[serde(rename = "client_identify", rename_all = "camelCase")]
    ClientIdentify {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        previous_session_id: Option<String>,
        #[serde(default)]
        user_agent: Option<String>,
    },

    #[serde(rename = "deviceInfo", rename_all = "camelCase")]
    DeviceInfo {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        custom_name: Option<String>,
        #[serde(default)]
        device_type: Option<DeviceKind>,
        #[serde(default)]
        connection_strength: Option<ConnectionStrength>,
    },

    #[serde(rename = "updateDeviceName")]
    UpdateDeviceName { name: String },

    #[serde(rename = "createRoom")]
    CreateRoom {
        #[serde(default)]
        name: String,
    },

    /// Joining accepts either the server-minted id or the display name.
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },

    #[serde(rename = "leaveRoom")]
    LeaveRoom {},

    #[serde(rename = "fileTransfer", rename_all = "camelCase")]
    FileTransfer {
        #[serde(default)]
        transfer_id: Option<String>,
        target_device_id: String,
        files: Vec<FileMeta>,
    },

    #[serde(rename = "transferAccepted", rename_all = "camelCase")]
    TransferAccepted { transfer_id: String },

    #[serde(rename = "transferRejected", rename_all = "camelCase")]
    TransferRejected {
        transfer_id: String,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "fileChunk", rename_all = "camelCase")]
    FileChunk {
        transfer_id: String,
        chunk_index: u32,
        total_chunks: u32,
        /// Base64 payload, possibly with a `data:...;base64,` prefix.
        chunk_data: String,
        #[serde(default)]
        file_size: Option<u64>,
    },

    #[serde(rename = "fileComplete", rename_all = "camelCase")]
    FileComplete { transfer_id: String },

    /// Receiver-reported reassembly progress, relayed to the sender.
    #[serde(rename = "fileProgress", rename_all = "camelCase")]
    FileProgress {
        transfer_id: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        received_chunks: Option<u32>,
        #[serde(default)]
        total_chunks: Option<u32>,
    },

    #[serde(rename = "requestMissingChunks", rename_all = "camelCase")]
    RequestMissingChunks {
        transfer_id: String,
        missing_chunks: Vec<u32>,
        #[serde(default)]
        total_chunks: Option<u32>,
    },

    #[serde(rename = "requestFileDownload", rename_all = "camelCase")]
    RequestFileDownload { transfer_id: String },

    #[serde(rename = "togglePinDevice", rename_all = "camelCase")]
    TogglePinDevice { target_device_id: String },

    #[serde(rename = "fileCancel", rename_all = "camelCase")]
    FileCancel {
        transfer_id: String,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },

    /// Reply to a server-initiated heartbeat ping; carries no action beyond
    /// refreshing channel activity.
    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

/// Frame types the router recognizes, used to tell an unknown `type` apart
/// from a recognized frame with bad fields.
const KNOWN_TYPES: &[&str] = &[
    "client_identify",
    "deviceInfo",
    "updateDeviceName",
    "createRoom",
    "joinRoom",
    "leaveRoom",
    "fileTransfer",
    "transferAccepted",
    "transferRejected",
    "fileChunk",
    "fileComplete",
    "fileProgress",
    "requestMissingChunks",
    "requestFileDownload",
    "togglePinDevice",
    "fileCancel",
    "ping",
    "pong",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not JSON, not an object, missing `type`, or bad fields for a
    /// recognized type.
    Malformed(String),
    /// Valid JSON with a `type` the router does not handle.
    UnknownType(String),
}

impl ClientFrame {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
        let ty = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FrameError::Malformed("missing type discriminator".into()))?
            .to_string();
        if !KNOWN_TYPES.contains(&ty.as_str()) {
            return Err(FrameError::UnknownType(ty));
        }
        serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
    }
}
