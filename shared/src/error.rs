//! Relay error taxonomy.
//!
//! Display output is the exact token carried in the `message` field of the
//! outbound error frame, so variants render with no extra prose.

use thiserror::Error;

/// Errors surfaced to clients over the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// Frame had a `type` the router does not recognize.
    #[error("UnknownMessageType")]
    UnknownMessageType,

    /// Frame was not valid JSON or was missing required fields.
    #[error("MalformedFrame")]
    MalformedFrame,

    /// Room create/join with an empty (or all-whitespace) name.
    #[error("RoomNameEmpty")]
    RoomNameEmpty,

    /// Join target does not resolve to a room by id or name.
    #[error("RoomNotFound")]
    RoomNotFound,

    /// Create collides with an existing name under case-folded comparison.
    #[error("RoomAlreadyExists")]
    RoomAlreadyExists,

    /// Transfer target device id is not registered.
    #[error("TargetNotFound")]
    TargetNotFound,

    /// Sender and target are not members of the same room.
    #[error("CrossRoomTransfer")]
    CrossRoomTransfer,

    /// Target exists but has no open channel.
    #[error("TargetOffline")]
    TargetOffline,

    /// Governor refused the transfer (memory or concurrency cap).
    #[error("MemoryExhausted")]
    MemoryExhausted,

    /// Sender channel vanished mid-transfer.
    #[error("SenderUnavailable")]
    SenderUnavailable,

    /// Chunk payload could not be decoded or chunk bookkeeping diverged.
    #[error("AssemblyFailed")]
    AssemblyFailed,

    /// Informational: a newer channel took over this device id.
    #[error("DuplicateConnection")]
    DuplicateConnection,

    /// Channel closed by the janitor for inactivity.
    #[error("Inactivity")]
    Inactivity,
}

impl RelayError {
    /// The outbound frame type that carries this error.
    pub fn frame_type(self) -> &'static str {
        use RelayError::*;
        match self {
            RoomNameEmpty | RoomNotFound | RoomAlreadyExists => "roomError",
            TargetNotFound | CrossRoomTransfer | TargetOffline | MemoryExhausted
            | SenderUnavailable | AssemblyFailed => "transferError",
            UnknownMessageType | MalformedFrame | DuplicateConnection | Inactivity => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_wire_token() {
        assert_eq!(RelayError::RoomNotFound.to_string(), "RoomNotFound");
        assert_eq!(RelayError::MemoryExhausted.to_string(), "MemoryExhausted");
    }

    #[test]
    fn carrier_frame_mapping() {
        assert_eq!(RelayError::RoomNameEmpty.frame_type(), "roomError");
        assert_eq!(RelayError::TargetOffline.frame_type(), "transferError");
        assert_eq!(RelayError::MalformedFrame.frame_type(), "error");
    }
}
