use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{ChangeSet, ChatStore, LoadedChat};
use crate::error::ChatError;
use crate::tree::types::{Chat, ChatId, MessageId, MessageNode};

struct ChatRow {
    chat: Chat,
    messages: FxHashMap<MessageId, MessageNode>,
}

#[derive(Default)]
struct Tables {
    chats: FxHashMap<ChatId, ChatRow>,
    message_chat: FxHashMap<MessageId, ChatId>,
}

impl Tables {
    fn row_mut(&mut self, chat_id: ChatId) -> Result<&mut ChatRow, ChatError> {
        self.chats
            .get_mut(&chat_id)
            .ok_or_else(|| ChatError::Storage(format!("unknown chat {chat_id}")))
    }

    fn delete(&mut self, chat_id: ChatId, ids: &[MessageId]) -> Result<(), ChatError> {
        let row = self.row_mut(chat_id)?;
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if row.messages.remove(id).is_some() {
                removed.push(*id);
            }
        }
        for id in removed {
            self.message_chat.remove(&id);
        }
        Ok(())
    }

    fn save_message(&mut self, node: &MessageNode) -> Result<(), ChatError> {
        let row = self.row_mut(node.chat_id)?;
        row.messages.insert(node.id, node.clone());
        self.message_chat.insert(node.id, node.chat_id);
        Ok(())
    }

    fn save_chat(&mut self, chat: &Chat) {
        match self.chats.get_mut(&chat.id) {
            Some(row) => row.chat = chat.clone(),
            None => {
                self.chats.insert(
                    chat.id,
                    ChatRow {
                        chat: chat.clone(),
                        messages: FxHashMap::default(),
                    },
                );
            }
        }
    }
}

/// In-process [`ChatStore`] backed by hash maps behind one lock.
///
/// `commit` validates a change set and applies it under a single write
/// guard, so readers never observe half of a mutation.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    next_chat_id: AtomicU64,
    next_message_id: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_chat_id: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.tables.read().message_chat.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore for MemoryStore {
    fn allocate_chat_id(&self) -> ChatId {
        ChatId(self.next_chat_id.fetch_add(1, Ordering::Relaxed))
    }

    fn allocate_message_id(&self) -> MessageId {
        MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    fn locate_message(&self, message_id: MessageId) -> Result<Option<ChatId>, ChatError> {
        Ok(self.tables.read().message_chat.get(&message_id).copied())
    }

    fn load_chat_with_messages(&self, chat_id: ChatId) -> Result<Option<LoadedChat>, ChatError> {
        let tables = self.tables.read();
        Ok(tables.chats.get(&chat_id).map(|row| LoadedChat {
            chat: row.chat.clone(),
            messages: row.messages.values().cloned().collect(),
        }))
    }

    fn save_message(&self, node: &MessageNode) -> Result<(), ChatError> {
        self.tables.write().save_message(node)
    }

    fn save_chat(&self, chat: &Chat) -> Result<(), ChatError> {
        self.tables.write().save_chat(chat);
        Ok(())
    }

    fn delete_messages(&self, chat_id: ChatId, ids: &[MessageId]) -> Result<(), ChatError> {
        self.tables.write().delete(chat_id, ids)
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), ChatError> {
        let mut tables = self.tables.write();

        // validate before touching anything
        let chat_id = changes
            .chat_id
            .or_else(|| changes.save_chat.as_ref().map(|chat| chat.id));
        if let Some(chat_id) = chat_id {
            let known = tables.chats.contains_key(&chat_id);
            let creates = changes.save_chat.as_ref().is_some_and(|chat| chat.id == chat_id);
            if !known && !creates {
                return Err(ChatError::Storage(format!("unknown chat {chat_id}")));
            }
        } else if !changes.delete_messages.is_empty() {
            return Err(ChatError::Storage("change set deletes without a chat".into()));
        }
        for node in &changes.save_messages {
            if Some(node.chat_id) != chat_id && !tables.chats.contains_key(&node.chat_id) {
                return Err(ChatError::Storage(format!("unknown chat {}", node.chat_id)));
            }
        }

        if let Some(chat) = &changes.save_chat {
            tables.save_chat(chat);
        }
        if let Some(chat_id) = chat_id {
            tables.delete(chat_id, &changes.delete_messages)?;
        }
        for node in &changes.save_messages {
            tables.save_message(node)?;
        }
        Ok(())
    }
}
