use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ConversationKey, MessageId},
    protocol::{MessagePayload, SendMessageRequest},
};

pub mod config;
pub mod error;
mod poller;
pub mod protocol_client;
pub mod reconcile;
mod session;
pub mod store;
pub mod transport;
mod typing;
pub mod types;

pub use config::{load_settings, load_settings_from, SyncSettings};
pub use error::{CommandError, EventValidationError, SettingsError};
pub use protocol_client::HttpChatBackend;
pub use reconcile::{Applied, ReconciliationEngine};
pub use session::ChatSession;
pub use store::MessageStore;
pub use transport::{LiveChannel, OfflineLiveChannel, WsLiveChannel};
pub use types::{ClientEvent, ConnectionState, LiveEvent, Message};

/// Request/response side of the chat service. Every call is authenticated as
/// the user the backend was built for.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Newest-last page of the conversation, at most `limit` entries, strictly
    /// older than `before` when given.
    async fn fetch_history(
        &self,
        conversation: ConversationKey,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>>;

    async fn send_message(&self, request: SendMessageRequest) -> Result<MessagePayload>;

    async fn edit_message(&self, id: &MessageId, body: &str) -> Result<MessagePayload>;

    async fn delete_message(&self, id: &MessageId) -> Result<()>;

    /// Reports a batch of messages as read by the authenticated user.
    async fn mark_seen(&self, message_ids: &[MessageId]) -> Result<()>;
}
