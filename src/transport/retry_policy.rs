use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};

use crate::config::ProviderConfig;

/// How a completion request is retried while the stream is not yet open.
///
/// Once the first stream byte has been read nothing is retried, so a retry
/// can never duplicate text the caller already saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    budget: u32,
    first_backoff: Duration,
    max_backoff: Duration,
    max_retry_after: Duration,
}

impl RetryPolicy {
    pub(crate) fn for_provider(config: &ProviderConfig) -> Self {
        Self {
            budget: config.max_retries,
            first_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(30),
        }
    }

    /// Whether retry number `retries_done + 1` is still within budget.
    pub(crate) fn has_budget(&self, retries_done: u32) -> bool {
        retries_done < self.budget
    }

    /// Rate limiting (429) and overload (503, 529). Everything else is
    /// reported to the caller as-is.
    pub(crate) fn is_retriable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 429 | 503 | 529)
    }

    /// Connection failures that happened before the request reached the
    /// provider.
    pub(crate) fn is_retriable_send_error(err: &reqwest::Error) -> bool {
        err.is_connect() || (err.is_request() && !err.is_body() && !err.is_decode())
    }

    /// Doubling backoff starting at `first_backoff`, capped at `max_backoff`.
    pub(crate) fn backoff(&self, retries_done: u32) -> Duration {
        let factor = 1_u32 << retries_done.min(10);
        self.first_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Wait before retrying a retriable status: the provider's `Retry-After`
    /// when it sent a usable one, the backoff otherwise.
    pub(crate) fn delay_after_status(&self, headers: &HeaderMap, retries_done: u32) -> Duration {
        self.retry_after(headers)
            .unwrap_or_else(|| self.backoff(retries_done))
    }

    /// `Retry-After` as delta-seconds or an HTTP date, capped.
    pub(crate) fn retry_after(&self, headers: &HeaderMap) -> Option<Duration> {
        let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
        let requested = match value.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) if value.is_empty() => return None,
            Err(_) => httpdate::parse_http_date(value)
                .ok()?
                .duration_since(SystemTime::now())
                .unwrap_or_default(),
        };
        Some(requested.min(self.max_retry_after))
    }
}
