//! The store operations the sync engines consume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chat::{AppendRequest, ConversationSummary, Message};
use crate::entity::{AdminKey, SessionId};
use crate::error::SyncResult;

/// Conversation store as seen by a client. Implemented in-process by
/// [`crate::transport::LocalTransport`] and remotely by
/// [`crate::transport::HttpTransport`].
#[async_trait]
pub trait ConversationApi: Send + Sync + 'static {
    /// Ordered log of one conversation. Unknown sessions fail with `NotFound`.
    async fn get_conversation(&self, session_id: &SessionId) -> SyncResult<Vec<Message>>;

    /// Appends a message and returns the stored copy as the ack.
    async fn append_message(&self, req: AppendRequest) -> SyncResult<Message>;

    async fn list_conversations(&self, auth: &AdminKey) -> SyncResult<Vec<ConversationSummary>>;

    /// Marks a conversation read as of `seen`, the newest `last_updated` the
    /// operator has looked at. A no-op if the conversation changed since.
    async fn mark_read(&self, session_id: &SessionId, seen: DateTime<Utc>, auth: &AdminKey) -> SyncResult<()>;

    async fn delete_conversation(&self, session_id: &SessionId, auth: &AdminKey) -> SyncResult<()>;
}
