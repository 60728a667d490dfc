use shared::{domain::MessageId, error::ApiError};
use thiserror::Error;

use crate::types::Message;

/// Failure of a user-initiated command. These are the only failures the sync
/// core hands back to the caller; background sync errors are logged instead.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no conversation is open")]
    NoConversation,
    #[error("message body must not be empty")]
    EmptyBody,
    #[error("message {0} is not part of the open conversation")]
    UnknownMessage(MessageId),
    #[error("message {0} has not been confirmed by the server yet")]
    NotConfirmed(MessageId),
    #[error("message {0} was written by another participant")]
    NotAuthor(MessageId),
    /// Carries the failed message so the caller can put its text back into
    /// the input.
    #[error("failed to send message: {source}")]
    Send {
        message: Box<Message>,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to edit message {id}: {source}")]
    Edit {
        id: MessageId,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to delete message {id}: {source}")]
    Delete {
        id: MessageId,
        #[source]
        source: anyhow::Error,
    },
}

impl CommandError {
    /// Text to restore into the compose box, if any.
    pub fn draft(&self) -> Option<&str> {
        match self {
            Self::Send { message, .. } => Some(&message.body),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventValidationError {
    #[error("event carries an empty message id")]
    EmptyMessageId,
    #[error("message {0} has the same sender and receiver")]
    SelfAddressed(MessageId),
    #[error("read receipt lists no messages")]
    EmptyReceipt,
    #[error("server reported an error: {0:?}")]
    Rejected(ApiError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid server url '{0}'")]
    InvalidServerUrl(String),
}
