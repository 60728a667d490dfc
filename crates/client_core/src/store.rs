use std::collections::HashMap;

use shared::domain::MessageId;

use crate::types::Message;

/// Canonical in-memory messages of the open conversation, keyed by id.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: HashMap<MessageId, Message>,
    dirty: bool,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces by id. Returns the replaced entry, if any.
    pub fn upsert(&mut self, message: Message) -> Option<Message> {
        self.dirty = true;
        self.messages.insert(message.id.clone(), message)
    }

    /// Removing an absent id is a no-op; deletes may race history reloads.
    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let removed = self.messages.remove(id);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Swaps a placeholder for its confirmed record in one step so no reader
    /// observes the message missing between the two mutations.
    pub fn replace(&mut self, placeholder: &MessageId, confirmed: Message) -> Option<Message> {
        let removed = self.messages.remove(placeholder);
        self.upsert(confirmed);
        removed
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Mutates an entry in place. `apply` reports whether it changed anything.
    /// Returns `None` when the id is absent.
    pub fn update(
        &mut self,
        id: &MessageId,
        apply: impl FnOnce(&mut Message) -> bool,
    ) -> Option<bool> {
        let message = self.messages.get_mut(id)?;
        let changed = apply(message);
        self.dirty |= changed;
        Some(changed)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    pub fn find_pending_by_client_ref(&self, client_ref: &str) -> Option<&Message> {
        self.messages.values().find(|message| {
            message.is_pending() && message.client_ref.as_deref() == Some(client_ref)
        })
    }

    /// Messages ordered by creation time, ties broken by id.
    pub fn snapshot(&self) -> Vec<Message> {
        let mut ordered: Vec<Message> = self.messages.values().cloned().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        ordered
    }

    /// Reports whether anything changed since the last call, and resets the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
