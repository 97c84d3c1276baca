mod memory;

pub use memory::MemoryStore;

use crate::error::ChatError;
use crate::tree::types::{Chat, ChatId, MessageId, MessageNode};

/// A chat row together with every message row that belongs to it.
#[derive(Debug, Clone)]
pub struct LoadedChat {
    pub chat: Chat,
    pub messages: Vec<MessageNode>,
}

/// Writes produced by one tree mutation.
///
/// A store applies a change set as a unit: deletions, then message saves,
/// then the chat row.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub chat_id: Option<ChatId>,
    pub delete_messages: Vec<MessageId>,
    pub save_messages: Vec<MessageNode>,
    pub save_chat: Option<Chat>,
}

impl ChangeSet {
    #[must_use]
    pub fn for_chat(chat_id: ChatId) -> Self {
        Self {
            chat_id: Some(chat_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delete_messages.is_empty() && self.save_messages.is_empty() && self.save_chat.is_none()
    }
}

/// Persistence collaborator for chats and their message forests.
pub trait ChatStore: Send + Sync {
    fn allocate_chat_id(&self) -> ChatId;

    fn allocate_message_id(&self) -> MessageId;

    /// Which chat a message belongs to, if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] when the backend fails.
    fn locate_message(&self, message_id: MessageId) -> Result<Option<ChatId>, ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] when the backend fails.
    fn load_chat_with_messages(&self, chat_id: ChatId) -> Result<Option<LoadedChat>, ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] when the backend fails or the chat is unknown.
    fn save_message(&self, node: &MessageNode) -> Result<(), ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] when the backend fails.
    fn save_chat(&self, chat: &Chat) -> Result<(), ChatError>;

    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] when the backend fails.
    fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> Result<(), ChatError>;

    /// Apply a change set.
    ///
    /// The default runs the primitives in order; backends with transactions
    /// should override it so a failure part-way leaves nothing applied.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] when any write fails.
    fn commit(&self, changes: ChangeSet) -> Result<(), ChatError> {
        if !changes.delete_messages.is_empty() {
            let chat_id = changes
                .chat_id
                .or_else(|| changes.save_chat.as_ref().map(|chat| chat.id))
                .ok_or_else(|| ChatError::Storage("change set deletes without a chat".into()))?;
            self.delete_messages(chat_id, &changes.delete_messages)?;
        }
        for node in &changes.save_messages {
            self.save_message(node)?;
        }
        if let Some(chat) = &changes.save_chat {
            self.save_chat(chat)?;
        }
        Ok(())
    }
}
