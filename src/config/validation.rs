use super::{AppConfig, ConfigError};

const VALID_LOG_LEVELS: &[&str] = &[
    "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL", "TRACE", "DISABLED",
];
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_provider(config)?;
    validate_chat(config)?;
    validate_log_level(config)?;
    validate_log_format(config)?;
    Ok(())
}

const MAX_PROVIDER_RETRIES: u32 = 5;

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_provider(config: &AppConfig) -> Result<(), ConfigError> {
    let provider = &config.provider;
    let parsed = url::Url::parse(&provider.host).map_err(|err| {
        validation_err(format!(
            "Provider '{}': invalid host '{}': {err}",
            provider.name, provider.host
        ))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "Provider '{}': host must start with http:// or https://",
            provider.name
        )));
    }
    if provider.api_key.trim().is_empty() {
        return Err(validation_err(format!(
            "Provider '{}': api_key cannot be empty",
            provider.name
        )));
    }
    if provider.model.trim().is_empty() {
        return Err(validation_err(format!(
            "Provider '{}': model cannot be empty",
            provider.name
        )));
    }
    if !(0.0..=2.0).contains(&provider.temperature) {
        return Err(validation_err(format!(
            "Provider '{}': temperature must be within [0, 2]",
            provider.name
        )));
    }
    if provider.idle_timeout_secs == 0 {
        return Err(validation_err(
            "provider.idle_timeout_secs must be greater than 0",
        ));
    }
    if provider.connect_timeout_secs == 0 {
        return Err(validation_err(
            "provider.connect_timeout_secs must be greater than 0",
        ));
    }
    if provider.max_retries > MAX_PROVIDER_RETRIES {
        return Err(validation_err(format!(
            "provider.max_retries must be at most {MAX_PROVIDER_RETRIES}"
        )));
    }
    Ok(())
}

fn validate_chat(config: &AppConfig) -> Result<(), ConfigError> {
    if config.chat.stream_channel_capacity == 0 {
        return Err(validation_err(
            "chat.stream_channel_capacity must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "Unknown log_level '{}'. Must be one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}

fn validate_log_format(config: &AppConfig) -> Result<(), ConfigError> {
    let format = config.features.log_format.to_ascii_lowercase();
    if !VALID_LOG_FORMATS.contains(&format.as_str()) {
        return Err(validation_err(format!(
            "Unknown log_format '{}'. Must be one of: {}",
            config.features.log_format,
            VALID_LOG_FORMATS.join(", ")
        )));
    }
    Ok(())
}
