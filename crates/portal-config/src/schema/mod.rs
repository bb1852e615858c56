//! Configuration schema types.
//!
//! All structs use `serde(default)` so partial configs work correctly.

mod presence;
mod realtime;
mod system;

pub use presence::*;
pub use realtime::*;
pub use system::*;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub realtime: RealtimeSettings,
    pub presence: PresenceSettings,
    pub conversations: ConversationSettings,
    pub logging: LoggingConfig,
}
