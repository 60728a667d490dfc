use std::{collections::HashMap, time::Duration};

use shared::domain::UserId;
use tokio::time::Instant;

/// Ephemeral "is typing" flags per sender. A start without a matching stop
/// expires after `guard`.
#[derive(Debug)]
pub(crate) struct TypingTracker {
    guard: Duration,
    started: HashMap<UserId, Instant>,
}

impl TypingTracker {
    pub(crate) fn new(guard: Duration) -> Self {
        Self {
            guard,
            started: HashMap::new(),
        }
    }

    pub(crate) fn guard(&self) -> Duration {
        self.guard
    }

    /// Returns true if the sender was not already flagged as typing.
    pub(crate) fn start(&mut self, sender: UserId, now: Instant) -> bool {
        let was_typing = self.is_typing(sender, now);
        self.started.insert(sender, now);
        !was_typing
    }

    /// Returns true if the sender was flagged as typing.
    pub(crate) fn stop(&mut self, sender: UserId, now: Instant) -> bool {
        let was_typing = self.is_typing(sender, now);
        self.started.remove(&sender);
        was_typing
    }

    pub(crate) fn is_typing(&self, sender: UserId, now: Instant) -> bool {
        self.started
            .get(&sender)
            .is_some_and(|started| now.saturating_duration_since(*started) < self.guard)
    }

    /// Drops expired flags and returns the senders that just expired.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<UserId> {
        let guard = self.guard;
        let mut expired = Vec::new();
        self.started.retain(|sender, started| {
            let live = now.saturating_duration_since(*started) < guard;
            if !live {
                expired.push(*sender);
            }
            live
        });
        expired
    }
}
