//! Student portal realtime configuration.
//!
//! TOML-based configuration for the realtime transport, presence and
//! conversation streams. All sections use serde defaults so partial
//! configs work out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use portal_config::{load_config, config_to_json};
//!
//! let config = load_config().expect("failed to load config");
//! let json = config_to_json(&config);
//! println!("{json}");
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{PortalConfig, CONFIG_SCHEMA_VERSION};

use portal_common::ConfigError;

/// Load config from the platform default path and validate it.
///
/// Creates a commented default `config.toml` if none exists yet.
pub fn load_config() -> Result<PortalConfig, ConfigError> {
    let config = toml_loader::load_default()?;
    validation::validate(&config)?;
    Ok(config)
}

/// Serialize a config to a pretty-printed JSON string with secrets masked.
pub fn config_to_json(config: &PortalConfig) -> String {
    let mut redacted = config.clone();
    if !redacted.realtime.api_key.is_empty() {
        redacted.realtime.api_key = "[REDACTED]".into();
    }
    if redacted.realtime.access_token.is_some() {
        redacted.realtime.access_token = Some("[REDACTED]".into());
    }
    serde_json::to_string_pretty(&redacted)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}
