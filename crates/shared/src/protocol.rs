use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, ProjectId, UserId},
    error::ApiError,
};

/// Message record as served by the history endpoint and carried by
/// `message-created` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Correlation id chosen by the sending client, echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_profile_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_profile_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    MessageCreated {
        message: MessagePayload,
    },
    MessageEdited {
        message_id: MessageId,
        body: String,
        updated_at: DateTime<Utc>,
        #[serde(default)]
        sender_id: Option<UserId>,
        #[serde(default)]
        receiver_id: Option<UserId>,
        #[serde(default)]
        project_id: Option<ProjectId>,
    },
    MessageDeleted {
        message_id: MessageId,
        #[serde(default)]
        sender_id: Option<UserId>,
        #[serde(default)]
        receiver_id: Option<UserId>,
        #[serde(default)]
        project_id: Option<ProjectId>,
    },
    TypingStarted {
        sender_id: UserId,
        receiver_id: UserId,
        #[serde(default)]
        project_id: Option<ProjectId>,
    },
    TypingStopped {
        sender_id: UserId,
        receiver_id: UserId,
        #[serde(default)]
        project_id: Option<ProjectId>,
    },
    MessagesSeen {
        performer_id: UserId,
        message_ids: Vec<MessageId>,
        seen_at: DateTime<Utc>,
    },
    Error(ApiError),
}

/// Frames the client pushes over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientRequest {
    TypingStarted {
        sender_id: UserId,
        receiver_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<ProjectId>,
    },
    TypingStopped {
        sender_id: UserId,
        receiver_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<ProjectId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub user_id: UserId,
    pub peer_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub body: String,
    pub client_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub user_id: UserId,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkSeenRequest {
    pub performer_id: UserId,
    pub message_ids: Vec<MessageId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_events_use_kebab_case_tags() {
        let raw = r#"{
            "type": "messages-seen",
            "payload": {
                "performer_id": 4,
                "message_ids": ["a", "b"],
                "seen_at": "2024-03-01T10:00:00Z"
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("decode");
        match event {
            ServerEvent::MessagesSeen {
                performer_id,
                message_ids,
                ..
            } => {
                assert_eq!(performer_id, UserId(4));
                assert_eq!(message_ids, vec![MessageId::from("a"), MessageId::from("b")]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn message_payload_tolerates_missing_optional_fields() {
        let raw = r#"{
            "type": "message-created",
            "payload": {
                "message": {
                    "id": "srv-1",
                    "sender_id": 1,
                    "receiver_id": 2,
                    "body": "hello",
                    "created_at": "2024-03-01T10:00:00Z"
                }
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("decode");
        let ServerEvent::MessageCreated { message } = event else {
            panic!("expected message-created");
        };
        assert_eq!(message.id, MessageId::from("srv-1"));
        assert!(message.project_id.is_none());
        assert!(message.updated_at.is_none());
        assert!(message.client_ref.is_none());
    }

    #[test]
    fn typing_request_serializes_without_absent_project() {
        let request = ClientRequest::TypingStarted {
            sender_id: UserId(1),
            receiver_id: UserId(2),
            project_id: None,
        };
        let json = serde_json::to_value(&request).expect("encode");
        assert_eq!(json["type"], "typing-started");
        assert!(json["payload"].get("project_id").is_none());
    }
}
