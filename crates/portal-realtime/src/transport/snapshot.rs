//! Presence entries and snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

/// One presence record as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub identity: String,
    pub metadata: BTreeMap<String, String>,
    pub joined_at: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn new(identity: impl Into<String>, joined_at: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            metadata: BTreeMap::new(),
            joined_at,
        }
    }

    /// Parse a raw presence meta object.
    ///
    /// The identity comes from `user_id` (or `identity`), falling back to the
    /// presence key. `online_at` accepts RFC 3339 or epoch milliseconds;
    /// without it `received_at` is used. Remaining scalar fields become
    /// metadata.
    pub fn from_meta(key: &str, meta: &serde_json::Value, received_at: DateTime<Utc>) -> Self {
        let identity = meta
            .get("user_id")
            .or_else(|| meta.get("identity"))
            .and_then(|v| v.as_str())
            .unwrap_or(key)
            .to_string();

        let joined_at = meta
            .get("online_at")
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        let mut metadata = BTreeMap::new();
        if let Some(obj) = meta.as_object() {
            for (field, value) in obj {
                if matches!(field.as_str(), "user_id" | "identity" | "online_at") {
                    continue;
                }
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                metadata.insert(field.clone(), text);
            }
        }

        Self {
            identity,
            metadata,
            joined_at,
        }
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Full presence state of a topic: presence key to its ordered entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    entries: HashMap<String, Vec<PresenceEntry>>,
}

impl PresenceSnapshot {
    pub fn new(entries: HashMap<String, Vec<PresenceEntry>>) -> Self {
        Self { entries }
    }

    /// Every identity with at least one entry.
    pub fn identities(&self) -> HashSet<String> {
        self.entries
            .values()
            .flatten()
            .map(|entry| entry.identity.clone())
            .collect()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries
            .values()
            .flatten()
            .any(|entry| entry.identity == identity)
    }

    /// True when nobody is present.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|entries| entries.is_empty())
    }

    pub fn get(&self, key: &str) -> Option<&[PresenceEntry]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
