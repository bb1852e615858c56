//! Validation for the `[presence]` and `[conversations]` sections.

use crate::schema::PortalConfig;

use super::helpers::validate_range;

pub(crate) fn validate_presence(errors: &mut Vec<String>, config: &PortalConfig) {
    let topic = config.presence.global_topic.trim();
    if topic.is_empty() {
        errors.push("presence.global_topic must not be empty".into());
    } else if topic.contains(char::is_whitespace) {
        errors.push(format!(
            "presence.global_topic = {topic:?} must not contain whitespace"
        ));
    }

    validate_range(errors, "presence.query_timeout", config.presence.query_timeout, 0, 300);
}

pub(crate) fn validate_conversations(errors: &mut Vec<String>, config: &PortalConfig) {
    validate_range(
        errors,
        "conversations.history_limit",
        config.conversations.history_limit,
        1,
        10_000,
    );
}
