use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::retry_policy::RetryPolicy;
use super::wire::{CompletionRequest, WireMessage};
use crate::config::ProviderConfig;
use crate::error::ChatError;
use crate::stream::{frame_stream, normalized_stream, Frame, NormalizedDelta};

/// Normalized deltas of one streamed completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<NormalizedDelta, ChatError>> + Send>>;

const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

fn build_reqwest_client(config: &ProviderConfig) -> Result<reqwest::Client, ChatError> {
    // No total request timeout: a healthy stream may run for minutes. The
    // idle window is enforced per frame instead.
    reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
        .tcp_nodelay(true)
        .connect_timeout(config.connect_timeout())
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|err| ChatError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Streaming chat-completions client for one provider.
pub struct CompletionClient {
    client: reqwest::Client,
    url: url::Url,
    api_key: String,
    model: String,
    temperature: f64,
    idle_timeout: Duration,
    retry: RetryPolicy,
}

impl CompletionClient {
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] for an unusable host and
    /// [`ChatError::Transport`] when the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, ChatError> {
        let url = url::Url::parse(&config.completions_url())
            .map_err(|err| ChatError::Config(format!("Invalid provider host: {err}")))?;
        Ok(Self {
            client: build_reqwest_client(config)?,
            url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            idle_timeout: config.idle_timeout(),
            retry: RetryPolicy::for_provider(config),
        })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Start a streamed completion over `messages`.
    ///
    /// A non-success status is read in full and reported as
    /// [`ChatError::Upstream`] before any stream parsing happens. Dropping the
    /// returned stream closes the connection.
    ///
    /// # Errors
    ///
    /// [`ChatError::Upstream`], [`ChatError::Transport`],
    /// [`ChatError::UpstreamTimeout`] or [`ChatError::Cancelled`].
    pub async fn open_stream(
        &self,
        messages: &[WireMessage],
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ChatError> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            stream: true,
            temperature: self.temperature,
        };
        let response = self.send_with_retry(&body, &cancel).await?;

        let status = response.status();
        if !status.is_success() {
            let text = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ChatError::Cancelled),
                read = tokio::time::timeout(self.idle_timeout, response.text()) => match read {
                    Ok(Ok(text)) => text,
                    Ok(Err(err)) => format!("<unreadable body: {err}>"),
                    Err(_) => String::new(),
                },
            };
            warn!(
                status = status.as_u16(),
                model = %self.model,
                "upstream rejected completion request"
            );
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(status = status.as_u16(), model = %self.model, "completion stream opened");
        let bytes = cancellable_bytes(response.bytes_stream(), cancel.clone());
        let frames = idle_guarded(frame_stream(bytes, cancel), self.idle_timeout);
        Ok(Box::pin(normalized_stream(frames)))
    }

    async fn send_with_retry(
        &self,
        body: &CompletionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ChatError> {
        let mut retries = 0;
        loop {
            let request = self
                .client
                .post(self.url.clone())
                .bearer_auth(&self.api_key)
                .json(body);
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ChatError::Cancelled),
                sent = request.send() => sent,
            };

            let delay = match sent {
                Ok(response) => {
                    if !self.retry.has_budget(retries)
                        || !RetryPolicy::is_retriable_status(response.status())
                    {
                        return Ok(response);
                    }
                    let delay = self.retry.delay_after_status(response.headers(), retries);
                    debug!(
                        status = response.status().as_u16(),
                        retry_attempt = retries + 1,
                        delay_ms = delay.as_millis(),
                        "retrying completion request after retriable status"
                    );
                    delay
                }
                Err(err) => {
                    if !self.retry.has_budget(retries) || !RetryPolicy::is_retriable_send_error(&err)
                    {
                        return Err(ChatError::Transport(err.to_string()));
                    }
                    let delay = self.retry.backoff(retries);
                    debug!(
                        retry_attempt = retries + 1,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "retrying completion request after transport error"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ChatError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            retries += 1;
        }
    }
}

/// Response body chunks, each read raced against cancellation. The first
/// failure is yielded once, then the body is dropped.
fn cancellable_bytes<S>(
    body: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, ChatError>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    futures_util::stream::unfold(Some(Box::pin(body)), move |state| {
        let cancel = cancel.clone();
        async move {
            let mut body = state?;
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Some((Err(ChatError::Cancelled), None)),
                next = body.next() => next,
            };
            match next? {
                Ok(chunk) => Some((Ok(chunk), Some(body))),
                Err(err) => Some((Err(ChatError::Transport(err.to_string())), None)),
            }
        }
    })
}

/// Applies the provider idle window to an event stream.
///
/// The window restarts only when a frame comes out, so comments, empty
/// blocks and other bytes that never complete a frame do not keep a silent
/// provider alive.
fn idle_guarded<S>(frames: S, idle: Duration) -> impl Stream<Item = Result<Frame, ChatError>> + Send
where
    S: Stream<Item = Result<Frame, ChatError>> + Send + 'static,
{
    let idle_secs = idle.as_secs();
    futures_util::stream::unfold(Some(Box::pin(frames)), move |state| async move {
        let mut frames = state?;
        match tokio::time::timeout(idle, frames.next()).await {
            Ok(Some(Ok(frame))) => Some((Ok(frame), Some(frames))),
            Ok(Some(Err(err))) => Some((Err(err), None)),
            Ok(None) => None,
            Err(_) => {
                warn!(idle_secs, "no event from upstream within the idle window");
                Some((Err(ChatError::UpstreamTimeout { idle_secs }), None))
            }
        }
    })
}
