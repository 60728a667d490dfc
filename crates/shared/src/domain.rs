use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ProjectId);

/// Prefix of ids minted locally for messages the server has not confirmed yet.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Opaque message identifier, stable across REST and event-stream payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn local(sequence: u64) -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{sequence}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies a conversation: an unordered pair of participants, optionally
/// scoped to a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    first: UserId,
    second: UserId,
    project_id: Option<ProjectId>,
}

impl ConversationKey {
    pub fn new(a: UserId, b: UserId, project_id: Option<ProjectId>) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self {
            first,
            second,
            project_id,
        }
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        self.project_id
    }

    pub fn includes(&self, user_id: UserId) -> bool {
        self.first == user_id || self.second == user_id
    }

    /// Returns the other participant, or `None` if `user_id` is not part of
    /// this conversation.
    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if self.first == user_id {
            Some(self.second)
        } else if self.second == user_id {
            Some(self.first)
        } else {
            None
        }
    }

    /// Membership filter for events arriving on a channel shared by every
    /// conversation of a user. The pair must match in either direction; a
    /// project id, when the event carries one, must match too.
    pub fn admits(&self, sender: UserId, receiver: UserId, project_id: Option<ProjectId>) -> bool {
        let pair_matches = (self.first, self.second)
            == if sender <= receiver {
                (sender, receiver)
            } else {
                (receiver, sender)
            };
        if !pair_matches {
            return false;
        }
        match project_id {
            Some(project_id) => self.project_id == Some(project_id),
            None => true,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.project_id {
            Some(project_id) => write!(f, "{}:{}@{}", self.first, self.second, project_id),
            None => write!(f, "{}:{}", self.first, self.second),
        }
    }
}

/// Client-side view of a locally originated message. Never sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    #[default]
    Confirmed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_ignores_participant_order() {
        let a = ConversationKey::new(UserId(7), UserId(3), Some(ProjectId(1)));
        let b = ConversationKey::new(UserId(3), UserId(7), Some(ProjectId(1)));
        assert_eq!(a, b);
        assert_eq!(a.peer_of(UserId(3)), Some(UserId(7)));
    }

    #[test]
    fn admits_pair_in_either_direction() {
        let key = ConversationKey::new(UserId(1), UserId(2), None);
        assert!(key.admits(UserId(1), UserId(2), None));
        assert!(key.admits(UserId(2), UserId(1), None));
        assert!(!key.admits(UserId(1), UserId(3), None));
        assert!(!key.admits(UserId(3), UserId(2), None));
    }

    #[test]
    fn admits_checks_project_only_when_event_carries_one() {
        let key = ConversationKey::new(UserId(1), UserId(2), Some(ProjectId(9)));
        assert!(key.admits(UserId(1), UserId(2), Some(ProjectId(9))));
        assert!(key.admits(UserId(1), UserId(2), None));
        assert!(!key.admits(UserId(1), UserId(2), Some(ProjectId(10))));

        let unscoped = ConversationKey::new(UserId(1), UserId(2), None);
        assert!(!unscoped.admits(UserId(1), UserId(2), Some(ProjectId(9))));
    }

    #[test]
    fn peer_of_returns_other_participant() {
        let key = ConversationKey::new(UserId(5), UserId(4), None);
        assert_eq!(key.peer_of(UserId(5)), Some(UserId(4)));
        assert_eq!(key.peer_of(UserId(4)), Some(UserId(5)));
        assert_eq!(key.peer_of(UserId(6)), None);
    }

    #[test]
    fn local_ids_are_recognised() {
        assert!(MessageId::local(1).is_local());
        assert_eq!(MessageId::local(1).as_str(), "local-1");
        assert!(!MessageId::from("srv-9").is_local());
    }
}
