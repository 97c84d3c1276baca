pub mod token_counter;

pub use token_counter::{estimate_tokens, HeuristicTokenCounter, TokenCounter};

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::stream::{NormalizedDelta, UsageSnapshot};
use crate::tree::types::{content_text, MessageNode};

/// Why a response stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Success,
    Length,
    ContentFilter,
    ToolCalls,
    Cancelled,
    UpstreamTimeout,
    UpstreamError,
    Unknown,
}

impl FinishReason {
    /// Map a provider `finish_reason` string. A stream that ends cleanly
    /// without one counts as a success.
    #[must_use]
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop" | "end_turn") => FinishReason::Success,
            Some("length" | "max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("tool_calls" | "function_call") => FinishReason::ToolCalls,
            Some(_) => FinishReason::Unknown,
        }
    }

    /// Finish reason recorded on a partial node when its stream failed.
    #[must_use]
    pub fn for_stream_error(err: &ChatError) -> Self {
        match err {
            ChatError::Cancelled => FinishReason::Cancelled,
            ChatError::UpstreamTimeout { .. } => FinishReason::UpstreamTimeout,
            _ => FinishReason::UpstreamError,
        }
    }
}

/// Usage attached to a single message.
///
/// Created once per message and replaced wholesale; never patched field by
/// field after it has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub segment_count: u32,
    pub preprocess_duration_ms: u64,
    pub first_response_duration_ms: u64,
    pub postprocess_duration_ms: u64,
    pub total_duration_ms: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub finish_reason: FinishReason,
    /// `false` when the counts are local estimates rather than provider-reported.
    pub is_usage_reliable: bool,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    fn from_snapshot(snapshot: UsageSnapshot, finish_reason: FinishReason) -> Self {
        Self {
            input_tokens: snapshot.input_tokens,
            output_tokens: snapshot.output_tokens,
            reasoning_tokens: 0,
            segment_count: 1,
            preprocess_duration_ms: 0,
            first_response_duration_ms: 0,
            postprocess_duration_ms: 0,
            total_duration_ms: 0,
            input_cost: 0.0,
            output_cost: 0.0,
            finish_reason,
            is_usage_reliable: true,
            created_at: Utc::now(),
        }
    }

    /// All-zero estimate for callers that treat a missing trailer as non-fatal.
    #[must_use]
    pub fn zero_fallback(finish_reason: FinishReason) -> Self {
        Self {
            is_usage_reliable: false,
            ..Self::from_snapshot(UsageSnapshot::default(), finish_reason)
        }
    }

    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Usage for content edited without calling the provider again.
///
/// The prompt did not change, so input tokens carry over; output tokens are
/// recounted from the new text. Timings, costs and reasoning tokens are zero
/// and the record is flagged as an estimate.
#[must_use]
pub fn derive_for_edit(
    base: &UsageRecord,
    new_text: &str,
    counter: &dyn TokenCounter,
) -> UsageRecord {
    UsageRecord {
        input_tokens: base.input_tokens,
        output_tokens: counter.count(new_text),
        is_usage_reliable: false,
        ..UsageRecord::from_snapshot(UsageSnapshot::default(), FinishReason::Success)
    }
}

/// Local estimate of the prompt size for a root-to-leaf path.
#[must_use]
pub fn estimate_prompt_tokens(path: &[MessageNode], counter: &dyn TokenCounter) -> u64 {
    path.iter()
        .map(|node| counter.count(&content_text(&node.content)))
        .sum()
}

/// Fold a finished stream's deltas into a usage record.
///
/// The last delta carrying usage is authoritative.
///
/// # Errors
///
/// Returns [`ChatError::IncompleteUsage`] when no delta carried usage.
pub fn finalize(deltas: &[NormalizedDelta]) -> Result<UsageRecord, ChatError> {
    let usage = deltas.iter().rev().find_map(|delta| delta.usage);
    let finish_reason = deltas
        .iter()
        .rev()
        .find_map(|delta| delta.finish_reason.as_deref());
    let snapshot = usage.ok_or(ChatError::IncompleteUsage)?;
    Ok(UsageRecord::from_snapshot(
        snapshot,
        FinishReason::from_provider(finish_reason),
    ))
}

/// Incremental fold over a live stream.
///
/// Collects the applied text, the latest usage snapshot and finish reason,
/// and the response timings.
#[derive(Debug)]
pub struct StreamAccumulator {
    started: Instant,
    preprocess: Duration,
    first_response: Option<Duration>,
    text: String,
    usage: Option<UsageSnapshot>,
    finish_reason: Option<String>,
    delta_count: usize,
}

impl StreamAccumulator {
    /// Start timing at `started`; `stream_opened` marks when the upstream
    /// accepted the request.
    #[must_use]
    pub fn new(started: Instant, stream_opened: Instant) -> Self {
        Self {
            started,
            preprocess: stream_opened.saturating_duration_since(started),
            first_response: None,
            text: String::new(),
            usage: None,
            finish_reason: None,
            delta_count: 0,
        }
    }

    pub fn push(&mut self, delta: &NormalizedDelta) {
        if self.first_response.is_none() && !delta.text.is_empty() {
            self.first_response = Some(self.started.elapsed());
        }
        self.text.push_str(&delta.text);
        if delta.usage.is_some() {
            self.usage = delta.usage;
        }
        if delta.finish_reason.is_some() {
            self.finish_reason.clone_from(&delta.finish_reason);
        }
        self.delta_count += 1;
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn delta_count(&self) -> usize {
        self.delta_count
    }

    /// Finish reason reported so far; success when the provider sent none.
    #[must_use]
    pub fn finish_reason(&self) -> FinishReason {
        FinishReason::from_provider(self.finish_reason.as_deref())
    }

    fn stamp_timings(&self, record: &mut UsageRecord) {
        record.preprocess_duration_ms = duration_ms(self.preprocess);
        record.first_response_duration_ms = self.first_response.map_or(0, duration_ms);
        record.total_duration_ms = duration_ms(self.started.elapsed());
    }

    /// Usage for a stream that reached its terminator.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::IncompleteUsage`] when the provider never sent usage.
    pub fn finish(&self) -> Result<UsageRecord, ChatError> {
        let snapshot = self.usage.ok_or(ChatError::IncompleteUsage)?;
        let mut record = UsageRecord::from_snapshot(
            snapshot,
            FinishReason::from_provider(self.finish_reason.as_deref()),
        );
        self.stamp_timings(&mut record);
        Ok(record)
    }

    /// Estimated usage for text committed without a reliable trailer
    /// (timeout, cancellation, upstream failure, or a missing usage frame).
    #[must_use]
    pub fn finish_incomplete(
        &self,
        finish_reason: FinishReason,
        counter: &dyn TokenCounter,
        input_estimate: u64,
    ) -> UsageRecord {
        let mut record = UsageRecord::from_snapshot(
            UsageSnapshot {
                input_tokens: input_estimate,
                output_tokens: counter.count(&self.text),
                total_tokens: 0,
            },
            finish_reason,
        );
        record.is_usage_reliable = false;
        self.stamp_timings(&mut record);
        record
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
