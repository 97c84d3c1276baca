use serde::Serialize;

use crate::error::ChatError;
use crate::tree::types::{ContentPart, FileRef, MessageNode, Role};

/// Blob-storage collaborator: resolves a stored file to a URL the provider
/// can fetch.
pub trait FileUrls: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the file cannot be resolved.
    fn download_url(&self, file: &FileRef) -> Result<String, ChatError>;
}

/// Chat-completions request body.
#[derive(Debug, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [WireMessage],
    pub stream: bool,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: WireContent,
}

/// Plain string for text-only messages, a part list otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl WireMessage {
    #[must_use]
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: WireContent::Text(text.into()),
        }
    }

    /// Convert a stored node; file parts are sent as image parts by URL.
    ///
    /// # Errors
    ///
    /// Propagates [`FileUrls::download_url`] failures.
    pub fn from_node(node: &MessageNode, files: &dyn FileUrls) -> Result<Self, ChatError> {
        let has_files = node
            .content
            .iter()
            .any(|part| matches!(part, ContentPart::File { .. }));
        if !has_files {
            return Ok(Self::text(node.role, node.text()));
        }

        let mut parts = Vec::with_capacity(node.content.len());
        for part in &node.content {
            parts.push(match part {
                ContentPart::Text { text } => WirePart::Text { text: text.clone() },
                ContentPart::File { file } => WirePart::ImageUrl {
                    image_url: ImageUrl {
                        url: files.download_url(file)?,
                    },
                },
            });
        }
        Ok(Self {
            role: node.role,
            content: WireContent::Parts(parts),
        })
    }
}

/// Convert a root-to-leaf path into request messages.
///
/// # Errors
///
/// Propagates [`FileUrls::download_url`] failures.
pub fn wire_messages(
    path: &[MessageNode],
    files: &dyn FileUrls,
) -> Result<Vec<WireMessage>, ChatError> {
    path.iter()
        .map(|node| WireMessage::from_node(node, files))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::types::{ChatId, FileId, MessageId};
    use chrono::Utc;

    struct StaticUrls;

    impl FileUrls for StaticUrls {
        fn download_url(&self, file: &FileRef) -> Result<String, ChatError> {
            Ok(format!("https://files.test/{}", file.id))
        }
    }

    fn node(role: Role, content: Vec<ContentPart>) -> MessageNode {
        MessageNode {
            id: MessageId(1),
            parent_id: None,
            chat_id: ChatId(1),
            role,
            content,
            created_at: Utc::now(),
            edited: false,
            usage: None,
            reaction: None,
        }
    }

    #[test]
    fn test_text_only_serializes_as_string() {
        let msg = WireMessage::from_node(
            &node(Role::User, vec![ContentPart::text("hi")]),
            &StaticUrls,
        )
        .unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_file_parts_become_image_urls() {
        let msg = WireMessage::from_node(
            &node(
                Role::User,
                vec![
                    ContentPart::text("what is this?"),
                    ContentPart::File {
                        file: FileRef {
                            id: FileId(9),
                            content_type: "image/png".into(),
                        },
                    },
                ],
            ),
            &StaticUrls,
        )
        .unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image_url", "image_url": {"url": "https://files.test/9"}}
                ]
            })
        );
    }
}
