use std::collections::HashSet;

use crate::protocol::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    Duplicate,
    Tombstoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyDeleted,
    NotAuthor,
    /// No such message yet; the id is tombstoned so it can never be added later.
    Unknown,
}

/// In-memory transcript for one session, kept in `createdAt` order.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    seen: HashSet<String>,
    tombstones: HashSet<String>,
    awaiting_ack: HashSet<String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.message_id == message_id)
    }

    pub fn insert(&mut self, message: Message) -> InsertOutcome {
        if self.tombstones.contains(&message.message_id) {
            return InsertOutcome::Tombstoned;
        }
        if !self.seen.insert(message.message_id.clone()) {
            return InsertOutcome::Duplicate;
        }
        let index = self.messages.partition_point(|existing| {
            (existing.created_at, existing.message_id.as_str())
                <= (message.created_at, message.message_id.as_str())
        });
        self.messages.insert(index, message);
        InsertOutcome::Added
    }

    /// Tombstones `message_id` on behalf of `requester`; only the author may delete.
    pub fn delete(&mut self, message_id: &str, requester: &str) -> DeleteOutcome {
        if let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| message.message_id == message_id)
        {
            if message.participant_id != requester {
                return DeleteOutcome::NotAuthor;
            }
            if message.deleted {
                return DeleteOutcome::AlreadyDeleted;
            }
            message.deleted = true;
            message.content.clear();
            self.tombstones.insert(message_id.to_string());
            self.awaiting_ack.remove(message_id);
            return DeleteOutcome::Deleted;
        }
        if self.tombstones.insert(message_id.to_string()) {
            DeleteOutcome::Unknown
        } else {
            DeleteOutcome::AlreadyDeleted
        }
    }

    pub fn expect_ack(&mut self, message_id: &str) {
        self.awaiting_ack.insert(message_id.to_string());
    }

    /// Returns true the first time an outstanding message is acknowledged.
    pub fn acknowledge(&mut self, message_id: &str) -> bool {
        self.awaiting_ack.remove(message_id)
    }

    pub fn awaiting_ack(&self) -> usize {
        self.awaiting_ack.len()
    }

    /// The visible transcript. Tombstoned entries are kept for author checks but hidden.
    pub fn ordered(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|message| !message.deleted)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ParticipantRole, parse_timestamp};

    fn message(id: &str, author: &str, at: &str) -> Message {
        Message {
            message_id: id.into(),
            participant_id: author.into(),
            role: ParticipantRole::Host,
            content: format!("body of {id}"),
            created_at: parse_timestamp(at).unwrap(),
            deleted: false,
        }
    }

    #[test]
    fn keeps_created_at_order_regardless_of_arrival() {
        let mut store = MessageStore::new();
        store.insert(message("c", "a", "2026-01-01T00:00:03Z"));
        store.insert(message("a", "a", "2026-01-01T00:00:01Z"));
        store.insert(message("b", "a", "2026-01-01T00:00:02Z"));
        let ids: Vec<_> = store.ordered().into_iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicates_are_reported_not_stored() {
        let mut store = MessageStore::new();
        assert_eq!(
            store.insert(message("m", "a", "2026-01-01T00:00:01Z")),
            InsertOutcome::Added
        );
        assert_eq!(
            store.insert(message("m", "a", "2026-01-01T00:00:01Z")),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn only_authors_delete_and_tombstones_stick() {
        let mut store = MessageStore::new();
        store.insert(message("m", "alice", "2026-01-01T00:00:01Z"));
        assert_eq!(store.delete("m", "bob"), DeleteOutcome::NotAuthor);
        assert_eq!(store.delete("m", "alice"), DeleteOutcome::Deleted);
        assert_eq!(store.delete("m", "alice"), DeleteOutcome::AlreadyDeleted);
        let deleted = store.get("m").unwrap();
        assert!(deleted.deleted);
        assert!(deleted.content.is_empty());
        assert!(store.ordered().is_empty());

        assert_eq!(store.delete("future", "bob"), DeleteOutcome::Unknown);
        assert_eq!(
            store.insert(message("future", "bob", "2026-01-01T00:00:02Z")),
            InsertOutcome::Tombstoned
        );
    }

    #[test]
    fn deleted_messages_leave_the_visible_transcript() {
        let mut store = MessageStore::new();
        store.insert(message("kept", "alice", "2026-01-01T00:00:01Z"));
        store.insert(message("gone", "alice", "2026-01-01T00:00:02Z"));
        assert_eq!(store.delete("gone", "alice"), DeleteOutcome::Deleted);

        let ids: Vec<_> = store.ordered().into_iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec!["kept"]);
        assert!(store.contains("gone"));
        assert_eq!(
            store.insert(message("gone", "alice", "2026-01-01T00:00:02Z")),
            InsertOutcome::Tombstoned
        );
    }

    #[test]
    fn acks_are_counted_once() {
        let mut store = MessageStore::new();
        store.expect_ack("m");
        assert_eq!(store.awaiting_ack(), 1);
        assert!(store.acknowledge("m"));
        assert!(!store.acknowledge("m"));
    }
}
