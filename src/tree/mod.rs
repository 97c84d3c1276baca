pub mod forest;
pub mod types;

pub use forest::ChatForest;
pub use types::{
    content_text, Chat, ChatId, ContentPart, FileId, FileRef, MessageId, MessageNode, Role,
    UserId,
};

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::accounting::{derive_for_edit, TokenCounter, UsageRecord};
use crate::error::ChatError;
use crate::store::{ChangeSet, ChatStore};

/// Chat transcript as a branchable message forest.
///
/// Mutations on one chat are serialized by a per-chat lock; each validates
/// the whole request first and then commits a single [`ChangeSet`], so a
/// failed call changes nothing. Operations on different chats never share a
/// lock.
pub struct MessageTree {
    store: Arc<dyn ChatStore>,
    token_counter: Arc<dyn TokenCounter>,
    chat_locks: Mutex<FxHashMap<ChatId, Arc<Mutex<()>>>>,
}

impl MessageTree {
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, token_counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            store,
            token_counter,
            chat_locks: Mutex::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn token_counter(&self) -> &dyn TokenCounter {
        self.token_counter.as_ref()
    }

    fn chat_lock(&self, chat_id: ChatId) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock();
        Arc::clone(locks.entry(chat_id).or_default())
    }

    fn load(&self, caller: UserId, chat_id: ChatId) -> Result<(Chat, ChatForest), ChatError> {
        let loaded = self
            .store
            .load_chat_with_messages(chat_id)?
            .ok_or_else(|| ChatError::NotFound(format!("chat {chat_id}")))?;
        if loaded.chat.user_id != caller {
            return Err(ChatError::Forbidden);
        }
        let forest = ChatForest::from_nodes(chat_id, loaded.messages)?;
        Ok((loaded.chat, forest))
    }

    fn locate(&self, message_id: MessageId) -> Result<ChatId, ChatError> {
        self.store
            .locate_message(message_id)?
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
    }

    /// Resolve a message-addressed call to its chat, then run `op` under that
    /// chat's lock with a fresh snapshot.
    fn with_message_chat<T>(
        &self,
        caller: UserId,
        message_id: MessageId,
        op: impl FnOnce(Chat, ChatForest) -> Result<T, ChatError>,
    ) -> Result<T, ChatError> {
        let chat_id = self.locate(message_id)?;
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock();
        let (chat, forest) = self.load(caller, chat_id)?;
        // deleted between locate and lock
        if !forest.contains(message_id) {
            return Err(ChatError::NotFound(format!("message {message_id}")));
        }
        op(chat, forest)
    }

    /// Create an empty chat owned by `user_id`, optionally seeded with a
    /// system prompt as its first node.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] when the store rejects the write.
    pub fn create_chat(
        &self,
        user_id: UserId,
        system_prompt: Option<&str>,
    ) -> Result<Chat, ChatError> {
        let now = Utc::now();
        let mut chat = Chat {
            id: self.store.allocate_chat_id(),
            user_id,
            leaf_message_id: None,
            updated_at: now,
        };
        let mut changes = ChangeSet::for_chat(chat.id);
        if let Some(prompt) = system_prompt {
            let node = MessageNode {
                id: self.store.allocate_message_id(),
                parent_id: None,
                chat_id: chat.id,
                role: Role::System,
                content: vec![ContentPart::text(prompt)],
                created_at: now,
                edited: false,
                usage: None,
                reaction: None,
            };
            chat.leaf_message_id = Some(node.id);
            changes.save_messages.push(node);
        }
        changes.save_chat = Some(chat.clone());
        self.store.commit(changes)?;
        debug!(chat_id = %chat.id, user_id = %user_id, "chat created");
        Ok(chat)
    }

    /// Append a new leaf under `parent_id` and make it the active leaf.
    ///
    /// `parent_id` may only be `None` while the chat is empty.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] for an unknown chat or parent,
    /// [`ChatError::Forbidden`] when `caller` does not own the chat,
    /// [`ChatError::BadRequest`] for a parent from another chat or a missing
    /// parent on a non-empty chat.
    pub fn append(
        &self,
        caller: UserId,
        chat_id: ChatId,
        parent_id: Option<MessageId>,
        role: Role,
        content: Vec<ContentPart>,
    ) -> Result<MessageNode, ChatError> {
        self.insert_leaf(caller, chat_id, parent_id, role, content, None)
    }

    /// [`MessageTree::append`] for a completed response carrying its usage.
    ///
    /// # Errors
    ///
    /// Same as [`MessageTree::append`].
    pub fn append_response(
        &self,
        caller: UserId,
        chat_id: ChatId,
        parent_id: Option<MessageId>,
        content: Vec<ContentPart>,
        usage: UsageRecord,
    ) -> Result<MessageNode, ChatError> {
        self.insert_leaf(
            caller,
            chat_id,
            parent_id,
            Role::Assistant,
            content,
            Some(usage),
        )
    }

    fn insert_leaf(
        &self,
        caller: UserId,
        chat_id: ChatId,
        parent_id: Option<MessageId>,
        role: Role,
        content: Vec<ContentPart>,
        usage: Option<UsageRecord>,
    ) -> Result<MessageNode, ChatError> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock();
        let (mut chat, forest) = self.load(caller, chat_id)?;

        match parent_id {
            Some(parent_id) if !forest.contains(parent_id) => {
                return Err(match self.store.locate_message(parent_id)? {
                    Some(other) => ChatError::BadRequest(format!(
                        "parent message {parent_id} belongs to chat {other}, not {chat_id}"
                    )),
                    None => ChatError::NotFound(format!("message {parent_id}")),
                });
            }
            None if !forest.is_empty() => {
                return Err(ChatError::BadRequest(format!(
                    "chat {chat_id} is not empty; a parent message is required"
                )));
            }
            _ => {}
        }

        let now = Utc::now();
        let node = MessageNode {
            id: self.store.allocate_message_id(),
            parent_id,
            chat_id,
            role,
            content,
            created_at: now,
            edited: false,
            usage,
            reaction: None,
        };
        chat.leaf_message_id = Some(node.id);
        chat.updated_at = now;

        let mut changes = ChangeSet::for_chat(chat_id);
        changes.save_messages.push(node.clone());
        changes.save_chat = Some(chat);
        self.store.commit(changes)?;
        debug!(chat_id = %chat_id, message_id = %node.id, role = role.as_str(), "message appended");
        Ok(node)
    }

    /// Replace a message's content wholesale and flag it as edited.
    ///
    /// Leaves the forest shape and the active leaf alone.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] or [`ChatError::Forbidden`].
    pub fn edit_in_place(
        &self,
        caller: UserId,
        message_id: MessageId,
        content: Vec<ContentPart>,
    ) -> Result<(), ChatError> {
        self.with_message_chat(caller, message_id, |mut chat, forest| {
            let Some(source) = forest.get(message_id) else {
                return Err(ChatError::NotFound(format!("message {message_id}")));
            };
            let mut node = source.clone();
            node.content = content;
            node.edited = true;
            chat.updated_at = Utc::now();

            let mut changes = ChangeSet::for_chat(chat.id);
            changes.save_messages.push(node);
            changes.save_chat = Some(chat);
            self.store.commit(changes)?;
            debug!(message_id = %message_id, "message edited in place");
            Ok(())
        })
    }

    /// Create an edited sibling of `message_id` under the same parent.
    ///
    /// The source node and its descendants are untouched. When the source has
    /// usage, the copy gets a usage record re-derived for the new text. The
    /// active leaf is not moved; callers switch to the fork with
    /// [`MessageTree::set_leaf`].
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] or [`ChatError::Forbidden`].
    pub fn edit_and_fork(
        &self,
        caller: UserId,
        message_id: MessageId,
        content: Vec<ContentPart>,
    ) -> Result<MessageNode, ChatError> {
        self.with_message_chat(caller, message_id, |mut chat, forest| {
            let Some(source) = forest.get(message_id) else {
                return Err(ChatError::NotFound(format!("message {message_id}")));
            };
            let usage = source.usage.as_ref().map(|base| {
                derive_for_edit(base, &content_text(&content), self.token_counter.as_ref())
            });
            let now = Utc::now();
            let node = MessageNode {
                id: self.store.allocate_message_id(),
                parent_id: source.parent_id,
                chat_id: source.chat_id,
                role: source.role,
                content,
                created_at: now,
                edited: true,
                usage,
                reaction: None,
            };
            chat.updated_at = now;

            let mut changes = ChangeSet::for_chat(chat.id);
            changes.save_messages.push(node.clone());
            changes.save_chat = Some(chat);
            self.store.commit(changes)?;
            debug!(source_id = %message_id, fork_id = %node.id, "message forked");
            Ok(node)
        })
    }

    /// Delete `message_id` and its whole descendant closure.
    ///
    /// The active leaf becomes `new_leaf_id` when given. Without one, the
    /// current leaf is kept if it survives the deletion and cleared
    /// otherwise. Returns the deleted ids in breadth-first order.
    ///
    /// Note that a missing `new_leaf_id` does not by itself clear the leaf:
    /// deleting a side branch leaves the active conversation selected.
    /// Callers that want no active leaf call [`MessageTree::set_leaf`] with
    /// `None` afterwards.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`], [`ChatError::Forbidden`], or
    /// [`ChatError::BadRequest`] when `new_leaf_id` is not in the chat or is
    /// itself being deleted.
    pub fn delete_subtree(
        &self,
        caller: UserId,
        message_id: MessageId,
        new_leaf_id: Option<MessageId>,
    ) -> Result<Vec<MessageId>, ChatError> {
        self.with_message_chat(caller, message_id, |mut chat, forest| {
            if let Some(leaf_id) = new_leaf_id {
                if !forest.contains(leaf_id) {
                    return Err(ChatError::BadRequest(
                        match self.store.locate_message(leaf_id)? {
                            Some(_) => "Leaf message does not belong to the same chat".to_string(),
                            None => "Leaf message not found".to_string(),
                        },
                    ));
                }
            }

            let closure = forest.descendant_closure(message_id);
            let leaf = match new_leaf_id {
                Some(leaf_id) if closure.contains(&leaf_id) => {
                    return Err(ChatError::BadRequest(
                        "Leaf message is inside the deleted subtree".to_string(),
                    ));
                }
                Some(leaf_id) => Some(leaf_id),
                None => chat.leaf_message_id.filter(|leaf| !closure.contains(leaf)),
            };
            chat.leaf_message_id = leaf;
            chat.updated_at = Utc::now();

            let mut changes = ChangeSet::for_chat(chat.id);
            changes.delete_messages.clone_from(&closure);
            changes.save_chat = Some(chat);
            self.store.commit(changes)?;
            debug!(
                message_id = %message_id,
                deleted = closure.len(),
                "message subtree deleted"
            );
            Ok(closure)
        })
    }

    /// Point the chat's active leaf at `leaf_id` (or clear it).
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`], [`ChatError::Forbidden`], or
    /// [`ChatError::BadRequest`] when `leaf_id` is not in the chat.
    pub fn set_leaf(
        &self,
        caller: UserId,
        chat_id: ChatId,
        leaf_id: Option<MessageId>,
    ) -> Result<(), ChatError> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock();
        let (mut chat, forest) = self.load(caller, chat_id)?;
        if let Some(leaf_id) = leaf_id {
            if !forest.contains(leaf_id) {
                return Err(ChatError::BadRequest(format!(
                    "message {leaf_id} is not part of chat {chat_id}"
                )));
            }
        }
        chat.leaf_message_id = leaf_id;
        chat.updated_at = Utc::now();
        let mut changes = ChangeSet::for_chat(chat_id);
        changes.save_chat = Some(chat);
        self.store.commit(changes)
    }

    /// Set, flip or clear the reaction on a message.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] or [`ChatError::Forbidden`].
    pub fn set_reaction(
        &self,
        caller: UserId,
        message_id: MessageId,
        reaction: Option<bool>,
    ) -> Result<(), ChatError> {
        self.with_message_chat(caller, message_id, |mut chat, forest| {
            let Some(source) = forest.get(message_id) else {
                return Err(ChatError::NotFound(format!("message {message_id}")));
            };
            let mut node = source.clone();
            node.reaction = reaction;
            chat.updated_at = Utc::now();

            let mut changes = ChangeSet::for_chat(chat.id);
            changes.save_messages.push(node);
            changes.save_chat = Some(chat);
            self.store.commit(changes)
        })
    }

    /// Current chat row and message forest.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] or [`ChatError::Forbidden`].
    pub fn snapshot(&self, caller: UserId, chat_id: ChatId) -> Result<(Chat, ChatForest), ChatError> {
        self.load(caller, chat_id)
    }

    /// Messages from the root down to the active leaf.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] or [`ChatError::Forbidden`].
    pub fn active_path(&self, caller: UserId, chat_id: ChatId) -> Result<Vec<MessageNode>, ChatError> {
        let (chat, forest) = self.load(caller, chat_id)?;
        Ok(match chat.leaf_message_id {
            Some(leaf) => forest.path_nodes(leaf).into_iter().cloned().collect(),
            None => Vec::new(),
        })
    }
}
