//! Shared protocol definitions for the beamdrop relay.
//!
//! Everything that crosses the wire lives here: the inbound frame enum,
//! the device descriptor types embedded in presence lists, and the error
//! taxonomy whose tokens appear in `error` / `roomError` / `transferError`
//! frames. No I/O — the server crate owns all runtime behavior.

pub mod device;
pub mod error;
pub mod frames;

pub use device::{ConnectionStrength, DeviceKind};
pub use error::RelayError;
pub use frames::{ClientFrame, FileMeta, FrameError};
