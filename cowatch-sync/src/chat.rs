//! Append-only chat log.
//!
//! Entries are kept in arrival order at this client. Locally authored
//! messages are appended before they are sent, so the author sees them
//! immediately; the copy echoed back by the relay carries the same id and
//! is recognized as a duplicate.

use std::collections::HashSet;

use crate::channel::EventSink;
use crate::error::SyncError;
use crate::protocol::{ChatEvent, Event, UserId};

/// One accepted chat message. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLogEntry {
    pub id: Option<String>,
    pub author_id: UserId,
    pub author_name: String,
    pub message: String,
    pub timestamp: Option<String>,
}

impl ChatLogEntry {
    /// Whether `user` wrote this entry.
    pub fn is_own(&self, user: &UserId) -> bool {
        &self.author_id == user
    }

    /// First letter of each word of the author name, e.g. "Ann Lee" → "AL".
    ///
    /// Falls back to the first letter of the author id when no name is known.
    pub fn author_initials(&self) -> String {
        let initials: String = self
            .author_name
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .collect();
        if initials.is_empty() {
            self.author_id.as_str().chars().take(1).collect()
        } else {
            initials
        }
    }
}

impl From<ChatEvent> for ChatLogEntry {
    fn from(event: ChatEvent) -> Self {
        Self {
            id: event.id,
            author_id: event.author_id,
            author_name: event.author.name,
            message: event.message,
            timestamp: event.timestamp,
        }
    }
}

/// Ordered chat history for the lifetime of a session membership.
#[derive(Debug)]
pub struct ChatLog {
    local_user: UserId,
    local_name: String,
    entries: Vec<ChatLogEntry>,
    ids: HashSet<String>,
}

impl ChatLog {
    pub fn new(local_user: UserId, local_name: impl Into<String>) -> Self {
        Self {
            local_user,
            local_name: local_name.into(),
            entries: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Append to the end of the log.
    ///
    /// Returns `false` without appending when an entry with the same id is
    /// already present.
    pub fn append(&mut self, entry: ChatLogEntry) -> bool {
        if let Some(id) = &entry.id {
            if !self.ids.insert(id.clone()) {
                log::trace!("Chat message {id} already in log");
                return false;
            }
        }
        self.entries.push(entry);
        true
    }

    /// Write a message as the local user: append it locally, then send it.
    ///
    /// The local entry stays in the log even if the send fails.
    pub fn author_and_send<S: EventSink + ?Sized>(
        &mut self,
        text: impl Into<String>,
        sink: &S,
    ) -> Result<ChatLogEntry, SyncError> {
        let event = ChatEvent::authored(self.local_user.clone(), self.local_name.clone(), text);
        let entry = ChatLogEntry::from(event.clone());
        self.append(entry.clone());
        sink.send(&Event::Chat(event))?;
        Ok(entry)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Entries in display order.
    pub fn entries(&self) -> &[ChatLogEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatLogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&ChatLogEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
