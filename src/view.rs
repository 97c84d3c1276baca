//! Client-facing projections of a chat's message forest.
//!
//! Every id leaving this module is encrypted; nothing here mutates the tree.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::accounting::{FinishReason, UsageRecord};
use crate::error::ChatError;
use crate::ids::IdCipher;
use crate::transport::FileUrls;
use crate::tree::types::{content_text, ContentPart, MessageId, MessageNode, Role};
use crate::tree::ChatForest;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub id: String,
    pub parent_id: Option<String>,
    pub role: Role,
    pub content: Vec<ContentView>,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    pub reaction: Option<bool>,
    pub usage: Option<UsageView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentView {
    Text { text: String },
    File { id: String, url: String },
}

/// Usage summary shown next to a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageView {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    /// Generation time, excluding request preparation.
    pub duration_ms: u64,
    pub first_token_latency_ms: u64,
    pub finish_reason: FinishReason,
    pub is_usage_reliable: bool,
}

impl From<&UsageRecord> for UsageView {
    fn from(usage: &UsageRecord) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            reasoning_tokens: usage.reasoning_tokens,
            input_cost: usage.input_cost,
            output_cost: usage.output_cost,
            duration_ms: usage
                .total_duration_ms
                .saturating_sub(usage.preprocess_duration_ms),
            first_token_latency_ms: usage.first_response_duration_ms,
            finish_reason: usage.finish_reason,
            is_usage_reliable: usage.is_usage_reliable,
        }
    }
}

fn message_view(
    node: &MessageNode,
    cipher: &dyn IdCipher,
    files: &dyn FileUrls,
) -> Result<MessageView, ChatError> {
    let mut content = Vec::with_capacity(node.content.len());
    for part in &node.content {
        content.push(match part {
            ContentPart::Text { text } => ContentView::Text { text: text.clone() },
            ContentPart::File { file } => ContentView::File {
                id: cipher.encrypt_file_id(file.id),
                url: files.download_url(file)?,
            },
        });
    }
    Ok(MessageView {
        id: cipher.encrypt_message_id(node.id),
        parent_id: node.parent_id.map(|id| cipher.encrypt_message_id(id)),
        role: node.role,
        content,
        created_at: node.created_at,
        edited: node.edited,
        reaction: node.reaction,
        usage: node.usage.as_ref().map(UsageView::from),
    })
}

/// Every non-system message in creation order, across all branches.
///
/// # Errors
///
/// Propagates [`FileUrls::download_url`] failures.
pub fn list_messages(
    forest: &ChatForest,
    cipher: &dyn IdCipher,
    files: &dyn FileUrls,
) -> Result<Vec<MessageView>, ChatError> {
    forest
        .nodes_by_created()
        .into_iter()
        .filter(|node| node.role != Role::System)
        .map(|node| message_view(node, cipher, files))
        .collect()
}

/// Text of the chat's first system message, if any.
#[must_use]
pub fn system_prompt(forest: &ChatForest) -> Option<String> {
    forest
        .nodes_by_created()
        .into_iter()
        .find(|node| node.role == Role::System)
        .map(|node| content_text(&node.content))
}

/// Encrypted form of deleted ids, in the order given.
#[must_use]
pub fn encrypt_ids(ids: &[MessageId], cipher: &dyn IdCipher) -> Vec<String> {
    ids.iter().map(|id| cipher.encrypt_message_id(*id)).collect()
}
