//! The record tracked for the local identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload tracked in transport presence for the local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub online_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn now(identity: &str) -> Self {
        Self {
            user_id: identity.to_string(),
            online_at: Utc::now(),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
