use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Frame, NormalizedDelta, UsageSnapshot};
use crate::error::ChatError;

/// Result of normalizing a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Delta(NormalizedDelta),
    /// The `[DONE]` sentinel: end of stream, not an error.
    Done,
    /// Nothing to forward (retry hints, empty keep-alive events).
    Skip,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl WireUsage {
    fn into_snapshot(self) -> UsageSnapshot {
        let computed = self.prompt_tokens.saturating_add(self.completion_tokens);
        let total_tokens = match self.total_tokens {
            Some(reported) => {
                if reported != computed {
                    warn!(
                        input_tokens = self.prompt_tokens,
                        output_tokens = self.completion_tokens,
                        reported_total = reported,
                        computed_total = computed,
                        "provider total_tokens disagrees with prompt + completion; keeping provider value"
                    );
                }
                reported
            }
            None => computed,
        };
        UsageSnapshot {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            total_tokens,
        }
    }
}

/// Normalize one frame into a delta.
///
/// Takes `choices[0].delta.content` (empty when absent) and the usage object
/// from `choices[0].usage`, falling back to the top-level `usage`.
///
/// # Errors
///
/// Returns [`ChatError::Protocol`] when the frame payload is not a valid
/// completion chunk, and [`ChatError::Upstream`] when the provider sends an
/// error document in the middle of the stream.
pub fn normalize_frame(frame: &Frame) -> Result<FrameOutcome, ChatError> {
    let data = match frame {
        Frame::RetryInterval(ms) => {
            debug!(retry_ms = ms, "ignoring retry hint from upstream");
            return Ok(FrameOutcome::Skip);
        }
        Frame::Event { data, .. } => data,
    };
    if frame.is_done() {
        return Ok(FrameOutcome::Done);
    }
    if data.trim().is_empty() {
        return Ok(FrameOutcome::Skip);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|err| ChatError::Protocol(format!("malformed completion chunk: {err}")))?;

    if chunk.error.is_some() {
        return Err(ChatError::Upstream {
            status: 200,
            body: data.clone(),
        });
    }

    let mut choices = chunk.choices.into_iter();
    let first = choices.next();
    let (text, choice_usage, finish_reason) = match first {
        Some(choice) => (
            choice
                .delta
                .and_then(|delta| delta.content)
                .unwrap_or_default(),
            choice.usage,
            choice.finish_reason,
        ),
        None => (String::new(), None, None),
    };
    let usage = choice_usage.or(chunk.usage).map(WireUsage::into_snapshot);

    Ok(FrameOutcome::Delta(NormalizedDelta {
        text,
        usage,
        finish_reason,
    }))
}

/// Turn a frame sequence into the normalized delta sequence.
///
/// Stops at `[DONE]` without polling the frame source again. The first error
/// (from the frames or from normalization) is yielded once and ends the
/// sequence.
pub fn normalized_stream<S>(frames: S) -> impl Stream<Item = Result<NormalizedDelta, ChatError>> + Send
where
    S: Stream<Item = Result<Frame, ChatError>> + Send + 'static,
{
    futures_util::stream::unfold(Some(Box::pin(frames)), |state| async move {
        let mut frames = state?;
        loop {
            let frame = match frames.next().await? {
                Ok(frame) => frame,
                Err(err) => return Some((Err(err), None)),
            };
            match normalize_frame(&frame) {
                Ok(FrameOutcome::Delta(delta)) => return Some((Ok(delta), Some(frames))),
                Ok(FrameOutcome::Skip) => {}
                Ok(FrameOutcome::Done) => return None,
                Err(err) => return Some((Err(err), None)),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_of(data: &str) -> NormalizedDelta {
        match normalize_frame(&Frame::data(data)).expect("normalize") {
            FrameOutcome::Delta(delta) => delta,
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn test_text_delta() {
        let delta = delta_of(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#);
        assert_eq!(delta, NormalizedDelta::text("Hi"));
    }

    #[test]
    fn test_missing_content_defaults_to_empty() {
        let delta = delta_of(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#);
        assert_eq!(delta.text, "");
        assert!(delta.usage.is_none());

        let delta = delta_of(r#"{"choices":[]}"#);
        assert_eq!(delta.text, "");
    }

    #[test]
    fn test_choice_usage_trailer() {
        let delta = delta_of(
            r#"{"choices":[{"delta":{},"finish_reason":"stop","usage":{"prompt_tokens":12,"completion_tokens":30,"total_tokens":42}}]}"#,
        );
        assert_eq!(
            delta.usage,
            Some(UsageSnapshot {
                input_tokens: 12,
                output_tokens: 30,
                total_tokens: 42,
            })
        );
        assert_eq!(delta.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_top_level_usage_trailer() {
        let delta = delta_of(
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#,
        );
        let usage = delta.usage.expect("usage");
        assert_eq!(usage.total_tokens, usage.input_tokens + usage.output_tokens);
    }

    #[test]
    fn test_missing_total_is_computed() {
        let delta = delta_of(
            r#"{"choices":[{"delta":{},"usage":{"prompt_tokens":3,"completion_tokens":4}}]}"#,
        );
        assert_eq!(delta.usage.expect("usage").total_tokens, 7);
    }

    #[test]
    fn test_disagreeing_total_keeps_provider_value() {
        let delta = delta_of(
            r#"{"choices":[{"delta":{},"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":9}}]}"#,
        );
        assert_eq!(delta.usage.expect("usage").total_tokens, 9);
    }

    #[test]
    fn test_done_and_skip() {
        assert_eq!(
            normalize_frame(&Frame::data("[DONE]")).unwrap(),
            FrameOutcome::Done
        );
        assert_eq!(
            normalize_frame(&Frame::data(" [DONE] ")).unwrap(),
            FrameOutcome::Done
        );
        assert_eq!(normalize_frame(&Frame::data("")).unwrap(), FrameOutcome::Skip);
        assert_eq!(
            normalize_frame(&Frame::RetryInterval(500)).unwrap(),
            FrameOutcome::Skip
        );
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let err = normalize_frame(&Frame::data("{\"choices\":[")).unwrap_err();
        assert!(matches!(err, ChatError::Protocol(_)));
    }

    #[test]
    fn test_mid_stream_error_document() {
        let err = normalize_frame(&Frame::data(r#"{"error":{"message":"overloaded"}}"#))
            .unwrap_err();
        match err {
            ChatError::Upstream { status, body } => {
                assert_eq!(status, 200);
                assert!(body.contains("overloaded"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_stops_at_done_without_polling_further() {
        let frames = futures_util::stream::iter(vec![
            Ok::<Frame, ChatError>(Frame::data(r#"{"choices":[{"delta":{"content":"a"}}]}"#)),
            Ok(Frame::data("[DONE]")),
            Ok(Frame::data("not json at all")),
        ]);
        let deltas: Vec<Result<NormalizedDelta, ChatError>> =
            normalized_stream(frames).collect().await;
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].as_ref().unwrap().text, "a");
    }

    #[tokio::test]
    async fn test_stream_aborts_on_malformed_frame() {
        let frames = futures_util::stream::iter(vec![
            Ok::<Frame, ChatError>(Frame::data(r#"{"choices":[{"delta":{"content":"a"}}]}"#)),
            Ok(Frame::data("{oops")),
            Ok(Frame::data(r#"{"choices":[{"delta":{"content":"b"}}]}"#)),
        ]);
        let deltas: Vec<Result<NormalizedDelta, ChatError>> =
            normalized_stream(frames).collect().await;
        assert_eq!(deltas.len(), 2);
        assert!(deltas[0].is_ok());
        assert!(matches!(deltas[1], Err(ChatError::Protocol(_))));
    }
}
