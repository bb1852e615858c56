//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# Student Portal realtime configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[realtime]
# project_ref = ""          # <ref> in https://<ref>.supabase.co
# api_key = ""              # anon (publishable) key
# heartbeat_interval = 25   # 5-120 seconds
# reconnect_delay = 1       # 1-60 seconds
# max_reconnect_delay = 30  # 1-600 seconds
# join_timeout = 10         # 1-120 seconds
# push_timeout = 10         # 1-120 seconds

[presence]
# enabled = true
# global_topic = "global-presence"
# query_timeout = 15        # 0-300 seconds, 0 waits forever

[conversations]
# history_limit = 500       # 1-10000 messages per conversation

[logging]
# level = "INFO"            # TRACE, DEBUG, INFO, WARNING, ERROR
"##
    .to_string()
}
