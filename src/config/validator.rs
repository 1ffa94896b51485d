use crate::config::{Config, LaunchConfig};
use crate::error::{Error, Result};

/// Validates the launch section
pub fn validate_launch_config(config: &LaunchConfig) -> Result<()> {
    if config.command.trim().is_empty() {
        return Err(Error::ConfigInvalid("Launch command is empty".to_string()));
    }

    if config.stop_command.contains('\n') {
        return Err(Error::ConfigInvalid(
            "Stop command must be a single console line".to_string(),
        ));
    }

    if let Some(pattern) = &config.ready_pattern {
        if pattern.is_empty() {
            return Err(Error::ConfigInvalid("Ready pattern is empty".to_string()));
        }
    }

    Ok(())
}

/// Validates the session prefix.
///
/// tmux treats `.` and `:` as target separators, so neither may appear in a
/// session name.
pub fn validate_session_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(Error::ConfigInvalid("Session prefix is empty".to_string()));
    }
    if prefix
        .chars()
        .any(|c| c == '.' || c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err(Error::ConfigInvalid(format!(
            "Session prefix '{}' contains '.', ':' or whitespace",
            prefix
        )));
    }
    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    validate_launch_config(&config.launch)?;
    validate_session_prefix(&config.session.prefix)?;

    if config.timeouts.graceful_stop_secs == 0 {
        return Err(Error::ConfigInvalid(
            "Graceful stop timeout must be at least one second".to_string(),
        ));
    }
    if config.timeouts.spawn_secs == 0 {
        return Err(Error::ConfigInvalid(
            "Spawn timeout must be at least one second".to_string(),
        ));
    }
    if config.monitor.interval_secs == 0 {
        return Err(Error::ConfigInvalid(
            "Monitor interval must be at least one second".to_string(),
        ));
    }
    if config.monitor.reconcile_interval_secs == Some(0) {
        return Err(Error::ConfigInvalid(
            "Reconcile interval must be at least one second".to_string(),
        ));
    }

    Ok(())
}
