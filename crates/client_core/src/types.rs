//! Typed representations the sync core works with. Everything arriving from
//! the live channel is validated into a [`LiveEvent`] before the engine sees it.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationKey, DeliveryState, MessageId, ProjectId, UserId},
    protocol::{MessagePayload, ServerEvent},
};

use crate::error::EventValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationKey,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub delivery_state: DeliveryState,
    pub client_ref: Option<String>,
}

impl Message {
    pub fn from_payload(payload: MessagePayload) -> Self {
        Self {
            conversation: ConversationKey::new(
                payload.sender_id,
                payload.receiver_id,
                payload.project_id,
            ),
            id: payload.id,
            sender_id: payload.sender_id,
            receiver_id: payload.receiver_id,
            body: payload.body,
            updated_at: payload.updated_at.unwrap_or(payload.created_at),
            created_at: payload.created_at,
            read_at: payload.read_at,
            delivery_state: DeliveryState::Confirmed,
            client_ref: payload.client_ref,
        }
    }

    /// Optimistic record for a send that has not been confirmed yet.
    pub fn pending(
        id: MessageId,
        client_ref: String,
        conversation: ConversationKey,
        sender_id: UserId,
        body: String,
        now: DateTime<Utc>,
    ) -> Self {
        let receiver_id = conversation.peer_of(sender_id).unwrap_or(sender_id);
        Self {
            id,
            conversation,
            sender_id,
            receiver_id,
            body,
            created_at: now,
            updated_at: now,
            read_at: None,
            delivery_state: DeliveryState::Pending,
            client_ref: Some(client_ref),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    /// Sets `read_at` unless it is already set; read state only moves forward.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        true
    }

    /// Folds a newer authoritative copy of the same message into this one.
    /// Creation time and conversation never change; body only moves forward
    /// in `updated_at`; read state is monotonic.
    pub(crate) fn merge_from(&mut self, incoming: Message) -> bool {
        let mut changed = false;
        if incoming.updated_at >= self.updated_at
            && (incoming.body != self.body || incoming.updated_at != self.updated_at)
        {
            self.body = incoming.body;
            self.updated_at = incoming.updated_at;
            changed = true;
        }
        if let Some(read_at) = incoming.read_at {
            changed |= self.mark_read(read_at);
        }
        if self.client_ref.is_none() && incoming.client_ref.is_some() {
            self.client_ref = incoming.client_ref;
            changed = true;
        }
        if self.delivery_state != incoming.delivery_state
            && incoming.delivery_state == DeliveryState::Confirmed
        {
            self.delivery_state = DeliveryState::Confirmed;
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEdit {
    pub message_id: MessageId,
    pub body: String,
    pub updated_at: DateTime<Utc>,
    pub participants: Option<(UserId, UserId)>,
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeletion {
    pub message_id: MessageId,
    pub participants: Option<(UserId, UserId)>,
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub performer_id: UserId,
    pub message_ids: Vec<MessageId>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Created(Message),
    Edited(MessageEdit),
    Deleted(MessageDeletion),
    TypingStarted(TypingSignal),
    TypingStopped(TypingSignal),
    Seen(ReadReceipt),
}

impl LiveEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "message-created",
            Self::Edited(_) => "message-edited",
            Self::Deleted(_) => "message-deleted",
            Self::TypingStarted(_) => "typing-started",
            Self::TypingStopped(_) => "typing-stopped",
            Self::Seen(_) => "messages-seen",
        }
    }
}

fn participants(sender: Option<UserId>, receiver: Option<UserId>) -> Option<(UserId, UserId)> {
    sender.zip(receiver)
}

fn require_id(message_id: &MessageId) -> Result<(), EventValidationError> {
    if message_id.as_str().trim().is_empty() {
        return Err(EventValidationError::EmptyMessageId);
    }
    Ok(())
}

impl TryFrom<ServerEvent> for LiveEvent {
    type Error = EventValidationError;

    fn try_from(event: ServerEvent) -> Result<Self, Self::Error> {
        match event {
            ServerEvent::MessageCreated { message } => {
                require_id(&message.id)?;
                if message.sender_id == message.receiver_id {
                    return Err(EventValidationError::SelfAddressed(message.id));
                }
                Ok(Self::Created(Message::from_payload(message)))
            }
            ServerEvent::MessageEdited {
                message_id,
                body,
                updated_at,
                sender_id,
                receiver_id,
                project_id,
            } => {
                require_id(&message_id)?;
                Ok(Self::Edited(MessageEdit {
                    message_id,
                    body,
                    updated_at,
                    participants: participants(sender_id, receiver_id),
                    project_id,
                }))
            }
            ServerEvent::MessageDeleted {
                message_id,
                sender_id,
                receiver_id,
                project_id,
            } => {
                require_id(&message_id)?;
                Ok(Self::Deleted(MessageDeletion {
                    message_id,
                    participants: participants(sender_id, receiver_id),
                    project_id,
                }))
            }
            ServerEvent::TypingStarted {
                sender_id,
                receiver_id,
                project_id,
            } => Ok(Self::TypingStarted(TypingSignal {
                sender_id,
                receiver_id,
                project_id,
            })),
            ServerEvent::TypingStopped {
                sender_id,
                receiver_id,
                project_id,
            } => Ok(Self::TypingStopped(TypingSignal {
                sender_id,
                receiver_id,
                project_id,
            })),
            ServerEvent::MessagesSeen {
                performer_id,
                message_ids,
                seen_at,
            } => {
                if message_ids.is_empty() {
                    return Err(EventValidationError::EmptyReceipt);
                }
                for id in &message_ids {
                    require_id(id)?;
                }
                Ok(Self::Seen(ReadReceipt {
                    performer_id,
                    message_ids,
                    seen_at,
                }))
            }
            ServerEvent::Error(err) => Err(EventValidationError::Rejected(err)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessagesChanged {
        conversation: ConversationKey,
    },
    TypingChanged {
        user_id: UserId,
        typing: bool,
    },
    ProfileImageDiscovered {
        user_id: UserId,
        url: String,
    },
    ConnectionChanged(ConnectionState),
}
