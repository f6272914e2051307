use crate::config::{Config, ServerConfig};
use crate::error::{Error, Result};

/// Whether `id` can be used as a single URL path segment
pub fn is_url_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validates a server configuration
pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if !is_url_safe_id(&config.id) {
        return Err(Error::ConfigInvalid(format!(
            "Server id '{}' must be non-empty and contain only letters, digits, '-' or '_'",
            config.id
        )));
    }

    if config.command.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has empty command",
            config.id
        )));
    }

    let policy = &config.restart_policy;
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has backoff_multiplier {} (must be >= 1)",
            config.id, policy.backoff_multiplier
        )));
    }

    if policy.initial_delay > policy.max_delay {
        return Err(Error::ConfigInvalid(format!(
            "Server '{}' has initial_delay greater than max_delay",
            config.id
        )));
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    for (key, server) in &config.mcp_servers {
        if &server.id != key {
            return Err(Error::ConfigInvalid(format!(
                "Server entry '{}' carries mismatched id '{}'",
                key, server.id
            )));
        }
        validate_server_config(server)?;
    }

    if config.gateway.workers == 0 {
        return Err(Error::ConfigInvalid(
            "Gateway needs at least one worker".to_string(),
        ));
    }

    Ok(())
}
