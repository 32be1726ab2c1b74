//! Device descriptor types used in presence lists and snapshots.

use serde::{Deserialize, Serialize};

/// Coarse device class, derived from the user agent at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Mobile,
    Tablet,
    Desktop,
    #[default]
    Unknown,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Mobile => "mobile",
            DeviceKind::Tablet => "tablet",
            DeviceKind::Desktop => "desktop",
            DeviceKind::Unknown => "unknown",
        }
    }
}

/// Client-reported link quality, echoed back in presence lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStrength {
    #[default]
    Good,
    Fair,
    Poor,
}

impl ConnectionStrength {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStrength::Good => "good",
            ConnectionStrength::Fair => "fair",
            ConnectionStrength::Poor => "poor",
        }
    }
}
