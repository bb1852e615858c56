//! Tests for the full validation pipeline.

use super::*;
use crate::schema::PortalConfig;

#[test]
fn default_config_validates() {
    let config = PortalConfig::default();
    assert!(validate(&config).is_ok());
}

#[test]
fn catches_heartbeat_too_small() {
    let mut config = PortalConfig::default();
    config.realtime.heartbeat_interval = 1;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("realtime.heartbeat_interval"));
}

#[test]
fn catches_inverted_reconnect_bounds() {
    let mut config = PortalConfig::default();
    config.realtime.reconnect_delay = 20;
    config.realtime.max_reconnect_delay = 5;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("is below realtime.reconnect_delay"));
}

#[test]
fn catches_bad_project_ref() {
    let mut config = PortalConfig::default();
    config.realtime.project_ref = "https://x.supabase.co".into();
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("realtime.project_ref"));
}

#[test]
fn accepts_plain_project_ref() {
    let mut config = PortalConfig::default();
    config.realtime.project_ref = "ojmqzagktzkualzgpcbq".into();
    assert!(validate(&config).is_ok());
}

#[test]
fn catches_empty_global_topic() {
    let mut config = PortalConfig::default();
    config.presence.global_topic = "   ".into();
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("presence.global_topic"));
}

#[test]
fn catches_zero_history_limit() {
    let mut config = PortalConfig::default();
    config.conversations.history_limit = 0;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("conversations.history_limit"));
}

#[test]
fn collects_multiple_errors() {
    let mut config = PortalConfig::default();
    config.realtime.join_timeout = 0;
    config.presence.query_timeout = 1000;
    let err = validate(&config).unwrap_err().to_string();
    assert!(err.contains("realtime.join_timeout"));
    assert!(err.contains("presence.query_timeout"));
    assert!(err.contains("; "));
}
