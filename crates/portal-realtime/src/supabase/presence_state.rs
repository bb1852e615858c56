//! Per-topic presence map maintained from `presence_state` and
//! `presence_diff` messages.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::transport::{PresenceEntry, PresenceSnapshot};

/// Parse a Phoenix presence map into `HashMap<key, Vec<meta>>`.
///
/// Supabase sends presence as `{ "key": { "metas": [{ ... }] } }`.
pub(crate) fn parse_presence_map(
    value: &serde_json::Value,
) -> HashMap<String, Vec<serde_json::Value>> {
    let mut result = HashMap::new();
    if let Some(obj) = value.as_object() {
        for (key, val) in obj {
            if let Some(metas) = val.get("metas").and_then(|m| m.as_array()) {
                result.insert(key.clone(), metas.clone());
            }
        }
    }
    result
}

fn phx_ref(meta: &serde_json::Value) -> Option<&str> {
    meta.get("phx_ref").and_then(|r| r.as_str())
}

/// Raw metas per presence key for one topic.
#[derive(Debug, Default)]
pub(crate) struct PresenceState {
    metas: HashMap<String, Vec<serde_json::Value>>,
}

impl PresenceState {
    /// Replace everything with a full state message.
    pub(crate) fn replace(&mut self, state: HashMap<String, Vec<serde_json::Value>>) {
        self.metas = state;
        self.metas.retain(|_, metas| !metas.is_empty());
    }

    /// Apply joins, then leaves. Metas are matched by `phx_ref`; a join
    /// whose ref is already present is not duplicated.
    pub(crate) fn apply_diff(
        &mut self,
        joins: &HashMap<String, Vec<serde_json::Value>>,
        leaves: &HashMap<String, Vec<serde_json::Value>>,
    ) {
        for (key, joined) in joins {
            let current = self.metas.entry(key.clone()).or_default();
            for meta in joined {
                let duplicate = phx_ref(meta)
                    .is_some_and(|r| current.iter().any(|m| phx_ref(m) == Some(r)));
                if !duplicate {
                    current.push(meta.clone());
                }
            }
        }
        for (key, left) in leaves {
            let Some(current) = self.metas.get_mut(key) else {
                continue;
            };
            let refs: Vec<&str> = left.iter().filter_map(phx_ref).collect();
            if refs.is_empty() {
                current.clear();
            } else {
                current.retain(|m| !phx_ref(m).is_some_and(|r| refs.contains(&r)));
            }
            if current.is_empty() {
                self.metas.remove(key);
            }
        }
    }

    pub(crate) fn snapshot(&self, received_at: DateTime<Utc>) -> PresenceSnapshot {
        PresenceSnapshot::new(
            self.metas
                .iter()
                .map(|(key, metas)| (key.clone(), entries(key, metas, received_at)))
                .collect(),
        )
    }
}

pub(crate) fn entries(
    key: &str,
    metas: &[serde_json::Value],
    received_at: DateTime<Utc>,
) -> Vec<PresenceEntry> {
    metas
        .iter()
        .map(|meta| PresenceEntry::from_meta(key, meta, received_at))
        .collect()
}
