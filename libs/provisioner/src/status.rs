//! Status values reported for applications and units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusValue {
    Active,
    Waiting,
    Error,
    Unknown,
}

/// A status observation with its operator-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub status: StatusValue,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl StatusInfo {
    pub fn new(status: StatusValue, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
            since: None,
        }
    }

    /// The value reported when a unit's status has not changed since the
    /// last report; the control plane ignores it rather than overwriting
    /// authoritative state.
    pub fn unknown() -> Self {
        Self::new(StatusValue::Unknown, "")
    }
}
