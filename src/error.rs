/// Error type shared by the streaming pipeline and the message tree.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Upstream error: status={status}, body={body}")]
    Upstream { status: u16, body: String },
    #[error("Upstream timeout: no data within {idle_secs}s")]
    UpstreamTimeout { idle_secs: u64 },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden")]
    Forbidden,
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Stream ended without a usage trailer")]
    IncompleteUsage,
    #[error("Stream cancelled")]
    Cancelled,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Permission,
    NotFound,
    Upstream,
    Timeout,
    Cancelled,
    ServerError,
}

impl ChatError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChatError::BadRequest(_) => ErrorCategory::InvalidRequest,
            ChatError::Forbidden => ErrorCategory::Permission,
            ChatError::NotFound(_) => ErrorCategory::NotFound,
            ChatError::Protocol(_) | ChatError::Upstream { .. } | ChatError::IncompleteUsage => {
                ErrorCategory::Upstream
            }
            ChatError::UpstreamTimeout { .. } => ErrorCategory::Timeout,
            ChatError::Cancelled => ErrorCategory::Cancelled,
            ChatError::Transport(_) | ChatError::Config(_) | ChatError::Storage(_) => {
                ErrorCategory::ServerError
            }
        }
    }

    /// HTTP-equivalent status for surfacing the error to a client.
    ///
    /// Upstream errors pass the provider's status through when it is itself an
    /// error status.
    #[must_use]
    pub fn http_status(&self) -> http::StatusCode {
        if let ChatError::Upstream { status, .. } = self {
            if let Ok(code) = http::StatusCode::from_u16(*status) {
                if code.is_client_error() || code.is_server_error() {
                    return code;
                }
            }
        }
        http_status_for_category(self.category())
    }

    /// Whether the error ends a stream after deltas may already have been applied.
    #[must_use]
    pub fn is_stream_failure(&self) -> bool {
        matches!(
            self,
            ChatError::Protocol(_)
                | ChatError::Upstream { .. }
                | ChatError::UpstreamTimeout { .. }
                | ChatError::Cancelled
                | ChatError::Transport(_)
        )
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::NotFound => http::StatusCode::NOT_FOUND,
        ErrorCategory::Upstream => http::StatusCode::BAD_GATEWAY,
        ErrorCategory::Timeout => http::StatusCode::GATEWAY_TIMEOUT,
        ErrorCategory::Cancelled => http::StatusCode::REQUEST_TIMEOUT,
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}
