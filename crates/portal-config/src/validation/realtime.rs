//! Validation for the `[realtime]` section.

use crate::schema::PortalConfig;

use super::helpers::validate_range;

pub(crate) fn validate_realtime(errors: &mut Vec<String>, config: &PortalConfig) {
    let rt = &config.realtime;

    // Empty is allowed (unconfigured); anything else must be a bare subdomain.
    if !rt.project_ref.is_empty()
        && !rt
            .project_ref
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        errors.push(format!(
            "realtime.project_ref = {:?} must be lowercase alphanumeric",
            rt.project_ref
        ));
    }

    validate_range(errors, "realtime.heartbeat_interval", rt.heartbeat_interval, 5, 120);
    validate_range(errors, "realtime.reconnect_delay", rt.reconnect_delay, 1, 60);
    validate_range(errors, "realtime.max_reconnect_delay", rt.max_reconnect_delay, 1, 600);
    validate_range(errors, "realtime.join_timeout", rt.join_timeout, 1, 120);
    validate_range(errors, "realtime.push_timeout", rt.push_timeout, 1, 120);

    if rt.max_reconnect_delay < rt.reconnect_delay {
        errors.push(format!(
            "realtime.max_reconnect_delay = {} is below realtime.reconnect_delay = {}",
            rt.max_reconnect_delay, rt.reconnect_delay
        ));
    }
}
