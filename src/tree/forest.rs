use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::types::{ChatId, MessageId, MessageNode};
use crate::error::ChatError;

/// Arena of one chat's messages keyed by id, with a parent -> children index.
///
/// Links are plain ids, so removing a node can never leave a dangling
/// reference behind; lookups of removed ids simply miss.
#[derive(Debug, Clone)]
pub struct ChatForest {
    chat_id: ChatId,
    nodes: FxHashMap<MessageId, MessageNode>,
    children: FxHashMap<MessageId, SmallVec<[MessageId; 2]>>,
    roots: SmallVec<[MessageId; 2]>,
}

impl ChatForest {
    #[must_use]
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            nodes: FxHashMap::default(),
            children: FxHashMap::default(),
            roots: SmallVec::new(),
        }
    }

    /// Build the arena from loaded rows, checking the forest invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Storage`] when a node belongs to another chat, has
    /// a duplicate id, points at a missing parent, or sits on a parent cycle.
    pub fn from_nodes(chat_id: ChatId, nodes: Vec<MessageNode>) -> Result<Self, ChatError> {
        let mut forest = Self::new(chat_id);
        for node in nodes {
            if node.chat_id != chat_id {
                return Err(ChatError::Storage(format!(
                    "message {} belongs to chat {}, not {chat_id}",
                    node.id, node.chat_id
                )));
            }
            let id = node.id;
            if forest.nodes.insert(id, node).is_some() {
                return Err(ChatError::Storage(format!("duplicate message id {id}")));
            }
        }

        let mut links: Vec<(MessageId, Option<MessageId>)> = forest
            .nodes
            .values()
            .map(|node| (node.id, node.parent_id))
            .collect();
        links.sort_unstable_by_key(|(id, _)| *id);
        for (id, parent_id) in links {
            match parent_id {
                Some(parent_id) if !forest.nodes.contains_key(&parent_id) => {
                    return Err(ChatError::Storage(format!(
                        "message {id} references missing parent {parent_id}"
                    )));
                }
                Some(parent_id) => forest.children.entry(parent_id).or_default().push(id),
                None => forest.roots.push(id),
            }
        }

        // every node must reach a root; anything else sits on a cycle
        let reachable = forest.reachable_from_roots();
        if reachable != forest.nodes.len() {
            return Err(ChatError::Storage(format!(
                "chat {chat_id} contains a parent cycle"
            )));
        }

        forest.sort_links();
        Ok(forest)
    }

    fn reachable_from_roots(&self) -> usize {
        let mut seen = 0usize;
        let mut queue: VecDeque<MessageId> = self.roots.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            seen += 1;
            if let Some(children) = self.children.get(&id) {
                queue.extend(children.iter().copied());
            }
        }
        seen
    }

    fn sort_links(&mut self) {
        let nodes = &self.nodes;
        let key = |id: &MessageId| nodes.get(id).map(|node| (node.created_at, node.id));
        self.roots.sort_by_key(key);
        for children in self.children.values_mut() {
            children.sort_by_key(key);
        }
    }

    #[must_use]
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&MessageNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.nodes.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes ordered by creation time (ties broken by id).
    #[must_use]
    pub fn nodes_by_created(&self) -> Vec<&MessageNode> {
        let mut nodes: Vec<&MessageNode> = self.nodes.values().collect();
        nodes.sort_by_key(|node| (node.created_at, node.id));
        nodes
    }

    /// Nodes without a parent, in display order.
    #[must_use]
    pub fn roots(&self) -> &[MessageId] {
        self.roots.as_slice()
    }

    /// Direct children of `id`, in display order.
    #[must_use]
    pub fn children(&self, id: MessageId) -> &[MessageId] {
        match self.children.get(&id) {
            Some(children) => children.as_slice(),
            None => &[],
        }
    }

    /// `id` and every node sharing its parent, in display order.
    #[must_use]
    pub fn siblings(&self, id: MessageId) -> &[MessageId] {
        match self.nodes.get(&id) {
            Some(node) => match node.parent_id {
                Some(parent_id) => self.children(parent_id),
                None => self.roots.as_slice(),
            },
            None => &[],
        }
    }

    /// Transitive descendant closure of `id`, including `id` itself.
    ///
    /// Breadth-first: `id`, then each generation of children in display
    /// order. Uses an explicit queue, so depth is not bounded by the stack.
    #[must_use]
    pub fn descendant_closure(&self, id: MessageId) -> Vec<MessageId> {
        if !self.nodes.contains_key(&id) {
            return Vec::new();
        }
        let mut visited: FxHashSet<MessageId> = FxHashSet::default();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            order.push(current);
            queue.extend(
                self.children(current)
                    .iter()
                    .copied()
                    .filter(|child| !visited.contains(child)),
            );
        }
        order
    }

    /// Ids from the root down to `id`, inclusive. Empty if `id` is unknown.
    #[must_use]
    pub fn path_to(&self, id: MessageId) -> Vec<MessageId> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            if path.len() > self.nodes.len() {
                break;
            }
            path.push(current);
            cursor = node.parent_id;
        }
        path.reverse();
        path
    }

    /// Nodes from the root down to `id`, inclusive.
    #[must_use]
    pub fn path_nodes(&self, id: MessageId) -> Vec<&MessageNode> {
        self.path_to(id)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::types::{ContentPart, Role};
    use chrono::{TimeZone, Utc};

    fn node(id: u64, parent: Option<u64>, at: i64) -> MessageNode {
        MessageNode {
            id: MessageId(id),
            parent_id: parent.map(MessageId),
            chat_id: ChatId(1),
            role: Role::User,
            content: vec![ContentPart::text(format!("m{id}"))],
            created_at: Utc.timestamp_opt(at, 0).unwrap(),
            edited: false,
            usage: None,
            reaction: None,
        }
    }

    fn ids(raw: &[u64]) -> Vec<MessageId> {
        raw.iter().copied().map(MessageId).collect()
    }

    // A(1) -> B(2) -> C(3), A -> D(4)
    fn sample() -> ChatForest {
        ChatForest::from_nodes(
            ChatId(1),
            vec![
                node(1, None, 10),
                node(2, Some(1), 20),
                node(3, Some(2), 30),
                node(4, Some(1), 40),
            ],
        )
        .expect("forest")
    }

    #[test]
    fn test_descendant_closure() {
        let forest = sample();
        assert_eq!(forest.descendant_closure(MessageId(1)), ids(&[1, 2, 4, 3]));
        assert_eq!(forest.descendant_closure(MessageId(2)), ids(&[2, 3]));
        assert_eq!(forest.descendant_closure(MessageId(3)), ids(&[3]));
        assert!(forest.descendant_closure(MessageId(99)).is_empty());
    }

    #[test]
    fn test_children_sorted_by_created_at() {
        let forest = ChatForest::from_nodes(
            ChatId(1),
            vec![node(1, None, 10), node(5, Some(1), 50), node(3, Some(1), 30)],
        )
        .unwrap();
        assert_eq!(forest.children(MessageId(1)), ids(&[3, 5]).as_slice());
        assert_eq!(forest.siblings(MessageId(5)), ids(&[3, 5]).as_slice());
        assert_eq!(forest.siblings(MessageId(1)), ids(&[1]).as_slice());
    }

    #[test]
    fn test_path_to() {
        let forest = sample();
        assert_eq!(forest.path_to(MessageId(3)), ids(&[1, 2, 3]));
        assert_eq!(forest.path_to(MessageId(4)), ids(&[1, 4]));
        assert!(forest.path_to(MessageId(42)).is_empty());
    }

    #[test]
    fn test_rejects_missing_parent() {
        let err = ChatForest::from_nodes(ChatId(1), vec![node(2, Some(1), 0)]).unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));
    }

    #[test]
    fn test_rejects_cycle() {
        let err = ChatForest::from_nodes(
            ChatId(1),
            vec![node(1, None, 0), node(2, Some(3), 0), node(3, Some(2), 0)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_foreign_chat_node() {
        let mut foreign = node(2, None, 0);
        foreign.chat_id = ChatId(7);
        assert!(ChatForest::from_nodes(ChatId(1), vec![node(1, None, 0), foreign]).is_err());
    }

    #[test]
    fn test_deep_chain_closure_does_not_recurse() {
        let nodes: Vec<MessageNode> = (1..=50_000u64)
            .map(|id| node(id, (id > 1).then(|| id - 1), id as i64))
            .collect();
        let forest = ChatForest::from_nodes(ChatId(1), nodes).unwrap();
        assert_eq!(forest.descendant_closure(MessageId(1)).len(), 50_000);
        assert_eq!(forest.path_to(MessageId(50_000)).len(), 50_000);
    }
}
