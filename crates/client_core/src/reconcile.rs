use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::domain::{ConversationKey, MessageId, UserId};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::{
    error::CommandError,
    store::MessageStore,
    types::{LiveEvent, Message, MessageDeletion, MessageEdit, ReadReceipt, TypingSignal},
    typing::TypingTracker,
};

/// What applying an input did to the conversation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Applied {
    /// The input belongs to another conversation and was ignored.
    pub discarded: bool,
    pub store_changed: bool,
    pub typing_changed: Option<(UserId, bool)>,
}

impl Applied {
    fn discarded() -> Self {
        Self {
            discarded: true,
            ..Self::default()
        }
    }

    fn stored(changed: bool) -> Self {
        Self {
            store_changed: changed,
            ..Self::default()
        }
    }

    fn typing(user_id: UserId, typing: bool) -> Self {
        Self {
            typing_changed: Some((user_id, typing)),
            ..Self::default()
        }
    }
}

/// Sole writer to the message store of one conversation. Every handler is
/// idempotent, so redelivered or reordered inputs converge on the same state.
#[derive(Debug)]
pub struct ReconciliationEngine {
    conversation: ConversationKey,
    self_id: UserId,
    store: MessageStore,
    tombstones: HashSet<MessageId>,
    /// Peer-authored messages not yet marked read.
    unseen: HashSet<MessageId>,
    typing: TypingTracker,
}

impl ReconciliationEngine {
    pub fn new(conversation: ConversationKey, self_id: UserId, typing_guard: Duration) -> Self {
        Self {
            conversation,
            self_id,
            store: MessageStore::new(),
            tombstones: HashSet::new(),
            unseen: HashSet::new(),
            typing: TypingTracker::new(typing_guard),
        }
    }

    pub fn conversation(&self) -> ConversationKey {
        self.conversation
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn peer_id(&self) -> UserId {
        self.conversation
            .peer_of(self.self_id)
            .unwrap_or(self.self_id)
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.store.snapshot()
    }

    pub fn take_dirty(&mut self) -> bool {
        self.store.take_dirty()
    }

    pub fn apply(&mut self, event: LiveEvent, now: Instant) -> Applied {
        match event {
            LiveEvent::Created(message) => self.apply_created(message, now),
            LiveEvent::Edited(edit) => self.apply_edit(edit),
            LiveEvent::Deleted(deletion) => self.apply_deleted(deletion),
            LiveEvent::TypingStarted(signal) => self.typing_started(signal, now),
            LiveEvent::TypingStopped(signal) => self.typing_stopped(signal, now),
            LiveEvent::Seen(receipt) => self.apply_seen(receipt),
        }
    }

    /// Live `message-created`: ingest, and clear the sender's typing flag.
    pub fn apply_created(&mut self, message: Message, now: Instant) -> Applied {
        let sender_id = message.sender_id;
        let Some(changed) = self.ingest(message) else {
            return Applied::discarded();
        };
        let mut applied = Applied::stored(changed);
        if self.typing.stop(sender_id, now) {
            applied.typing_changed = Some((sender_id, false));
        }
        applied
    }

    /// Merges a history page. Never removes anything, so messages created
    /// locally while the request was in flight survive.
    pub fn apply_history(&mut self, messages: Vec<Message>) -> Applied {
        let mut applied = Applied::default();
        for message in messages {
            if let Some(changed) = self.ingest(message) {
                applied.store_changed |= changed;
            }
        }
        applied
    }

    pub fn apply_edit(&mut self, edit: MessageEdit) -> Applied {
        if let Some((sender, receiver)) = edit.participants {
            if !self.conversation.admits(sender, receiver, edit.project_id) {
                return Applied::discarded();
            }
        }
        let MessageEdit {
            message_id,
            body,
            updated_at,
            ..
        } = edit;
        let outcome = self.store.update(&message_id, |message| {
            if updated_at < message.updated_at
                || (message.body == body && message.updated_at == updated_at)
            {
                return false;
            }
            message.body = body;
            message.updated_at = updated_at;
            true
        });
        match outcome {
            Some(changed) => Applied::stored(changed),
            None => {
                debug!(message_id = %message_id, "sync: dropping edit for unknown message");
                Applied::default()
            }
        }
    }

    pub fn apply_deleted(&mut self, deletion: MessageDeletion) -> Applied {
        if let Some((sender, receiver)) = deletion.participants {
            if !self.conversation.admits(sender, receiver, deletion.project_id) {
                return Applied::discarded();
            }
        }
        self.unseen.remove(&deletion.message_id);
        let removed = self.store.remove(&deletion.message_id).is_some();
        self.tombstones.insert(deletion.message_id);
        Applied::stored(removed)
    }

    pub fn apply_seen(&mut self, receipt: ReadReceipt) -> Applied {
        if !self.conversation.includes(receipt.performer_id) {
            return Applied::discarded();
        }
        let mut changed = false;
        for id in &receipt.message_ids {
            if let Some(marked) = self
                .store
                .update(id, |message| message.mark_read(receipt.seen_at))
            {
                changed |= marked;
                self.track_unseen(id);
            }
        }
        Applied::stored(changed)
    }

    pub fn typing_started(&mut self, signal: TypingSignal, now: Instant) -> Applied {
        if !self.admits_typing(&signal) {
            return Applied::discarded();
        }
        if self.typing.start(signal.sender_id, now) {
            Applied::typing(signal.sender_id, true)
        } else {
            Applied::default()
        }
    }

    pub fn typing_stopped(&mut self, signal: TypingSignal, now: Instant) -> Applied {
        if !self.admits_typing(&signal) {
            return Applied::discarded();
        }
        if self.typing.stop(signal.sender_id, now) {
            Applied::typing(signal.sender_id, false)
        } else {
            Applied::default()
        }
    }

    pub fn is_typing(&self, user_id: UserId, now: Instant) -> bool {
        self.typing.is_typing(user_id, now)
    }

    pub fn typing_guard(&self) -> Duration {
        self.typing.guard()
    }

    pub fn expire_typing(&mut self, now: Instant) -> Vec<UserId> {
        self.typing.expire(now)
    }

    pub fn unread_count(&self) -> usize {
        self.unseen.len()
    }

    /// Drains the unseen set, marking each message read locally at `now`.
    /// Returns the ids to report to the server, oldest first.
    pub fn take_unseen(&mut self, now: DateTime<Utc>) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.unseen.drain().collect();
        for id in &ids {
            self.store.update(id, |message| message.mark_read(now));
        }
        ids.sort_by(|a, b| {
            let created = |id: &MessageId| self.store.get(id).map(|message| message.created_at);
            created(a).cmp(&created(b)).then_with(|| a.cmp(b))
        });
        ids
    }

    pub fn insert_pending(&mut self, message: Message) {
        self.store.upsert(message);
    }

    /// Swaps the placeholder for the server's record in a single step.
    pub fn confirm_send(&mut self, placeholder: &MessageId, confirmed: Message) -> bool {
        let id = confirmed.id.clone();
        let changed = if self.tombstones.contains(&id) {
            debug!(message_id = %id, "sync: confirmed send was already deleted");
            return self.store.remove(placeholder).is_some();
        } else if self.store.contains(&id) {
            let removed = self.store.remove(placeholder).is_some();
            self.ingest(confirmed).unwrap_or(false) || removed
        } else {
            self.store.replace(placeholder, confirmed);
            true
        };
        self.track_unseen(&id);
        changed
    }

    pub fn rollback_send(&mut self, placeholder: &MessageId) -> bool {
        self.store.remove(placeholder).is_some()
    }

    /// Applies an optimistic edit and returns the pre-edit copy for rollback.
    pub fn begin_edit(
        &mut self,
        id: &MessageId,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Message, CommandError> {
        let previous = self.authored(id)?.clone();
        self.store.update(id, |message| {
            message.body = body.to_string();
            message.updated_at = now;
            true
        });
        Ok(previous)
    }

    /// Adopts the server's copy of an edit even if its clock trails ours.
    pub fn confirm_edit(&mut self, confirmed: Message) -> bool {
        self.store
            .update(&confirmed.id.clone(), |message| {
                let changed =
                    message.body != confirmed.body || message.updated_at != confirmed.updated_at;
                message.body = confirmed.body;
                message.updated_at = confirmed.updated_at;
                changed
            })
            .unwrap_or(false)
    }

    pub fn revert_edit(&mut self, previous: &Message) -> bool {
        self.store
            .update(&previous.id, |message| {
                message.body = previous.body.clone();
                message.updated_at = previous.updated_at;
                true
            })
            .unwrap_or(false)
    }

    /// Removes the message optimistically and returns it for rollback.
    pub fn begin_delete(&mut self, id: &MessageId) -> Result<Message, CommandError> {
        self.authored(id)?;
        self.unseen.remove(id);
        self.tombstones.insert(id.clone());
        self.store
            .remove(id)
            .ok_or_else(|| CommandError::UnknownMessage(id.clone()))
    }

    pub fn restore_deleted(&mut self, message: Message) {
        let id = message.id.clone();
        self.tombstones.remove(&id);
        self.store.upsert(message);
        self.track_unseen(&id);
    }

    fn authored(&self, id: &MessageId) -> Result<&Message, CommandError> {
        let message = self
            .store
            .get(id)
            .ok_or_else(|| CommandError::UnknownMessage(id.clone()))?;
        if message.is_pending() {
            return Err(CommandError::NotConfirmed(id.clone()));
        }
        if message.sender_id != self.self_id {
            return Err(CommandError::NotAuthor(id.clone()));
        }
        Ok(message)
    }

    fn admits_typing(&self, signal: &TypingSignal) -> bool {
        signal.sender_id != self.self_id
            && self
                .conversation
                .admits(signal.sender_id, signal.receiver_id, signal.project_id)
    }

    /// Membership filter plus upsert. `None` means the message was discarded.
    fn ingest(&mut self, message: Message) -> Option<bool> {
        if !self.conversation.admits(
            message.sender_id,
            message.receiver_id,
            message.conversation.project_id(),
        ) {
            return None;
        }
        if self.tombstones.contains(&message.id) {
            debug!(message_id = %message.id, "sync: ignoring deleted message");
            return Some(false);
        }

        let mut replaced_placeholder = false;
        if let Some(client_ref) = message.client_ref.clone() {
            let placeholder = self
                .store
                .find_pending_by_client_ref(&client_ref)
                .map(|pending| pending.id.clone())
                .filter(|pending_id| *pending_id != message.id);
            if let Some(placeholder) = placeholder {
                if !self.store.contains(&message.id) {
                    let id = message.id.clone();
                    self.store.replace(&placeholder, message);
                    self.track_unseen(&id);
                    return Some(true);
                }
                self.store.remove(&placeholder);
                replaced_placeholder = true;
            }
        }

        let id = message.id.clone();
        let changed = match self.store.get(&id).map(Message::is_pending) {
            None | Some(true) => {
                self.store.upsert(message);
                true
            }
            Some(false) => self
                .store
                .update(&id, |existing| existing.merge_from(message))
                .unwrap_or(false),
        };
        self.track_unseen(&id);
        Some(changed || replaced_placeholder)
    }

    fn track_unseen(&mut self, id: &MessageId) {
        let unseen = self.store.get(id).is_some_and(|message| {
            message.sender_id != self.self_id
                && message.read_at.is_none()
                && !message.is_pending()
        });
        if unseen {
            self.unseen.insert(id.clone());
        } else {
            self.unseen.remove(id);
        }
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
