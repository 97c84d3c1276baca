use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::accounting::UsageRecord;
use crate::config::FeaturesConfig;
use crate::error::ChatError;

/// Map a configured log level onto an `EnvFilter` directive.
///
/// - "DISABLED" -> `None`, no subscriber is installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (TRACE, DEBUG, INFO, WARN, ERROR)
#[must_use]
pub fn filter_directive(log_level: &str) -> Option<String> {
    let level = log_level.to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Initialize the tracing subscriber from the feature settings.
///
/// Does nothing when logging is disabled or a global subscriber is already
/// installed.
pub fn init_tracing(features: &FeaturesConfig) {
    let Some(directive) = filter_directive(&features.log_level) else {
        return;
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = if features.log_format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed; keeping it");
    }
}

/// Log token usage for a committed assistant message at INFO level.
pub fn log_completion(model: &str, usage: &UsageRecord, elapsed: Duration) {
    info!(
        model = model,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.total_tokens(),
        finish_reason = ?usage.finish_reason,
        usage_reliable = usage.is_usage_reliable,
        first_response_ms = usage.first_response_duration_ms,
        duration_seconds = elapsed.as_secs_f64(),
        "response completed"
    );
}

/// Log a stream that ended without reaching its terminator.
pub fn log_stream_failure(model: &str, err: &ChatError, committed_chars: usize) {
    warn!(
        model = model,
        error = %err,
        status = err.http_status().as_u16(),
        committed_chars,
        "response stream failed"
    );
}
