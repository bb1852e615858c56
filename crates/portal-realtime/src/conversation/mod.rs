//! Direct-message streams multiplexed over the channel registry.

mod log;
mod stream;
mod types;

pub use log::{MessageLog, MessageLogConfig};
pub use stream::ConversationStream;
pub use types::{DirectMessage, MESSAGE_EVENT};
