use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::api::ConversationApi;
use crate::chat::{AppendRequest, ConversationSummary, Message};
use crate::entity::{AdminKey, Sender, SessionId};
use crate::error::{SyncError, SyncResult};
use crate::store::Store;

/// In-process access to a [`Store`], enforcing the admin key the same way
/// the HTTP surface does. The server routes through this too.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    store: Store,
    admin_key: AdminKey,
}

impl LocalTransport {
    pub fn new(store: Store, admin_key: AdminKey) -> Self {
        Self { store, admin_key }
    }

    fn authorize(&self, auth: Option<&AdminKey>) -> SyncResult<()> {
        match auth {
            Some(key) if key.matches(&self.admin_key) => Ok(()),
            _ => Err(SyncError::AuthExpired),
        }
    }
}

#[async_trait]
impl ConversationApi for LocalTransport {
    async fn get_conversation(&self, session_id: &SessionId) -> SyncResult<Vec<Message>> {
        self.store.get_conversation(session_id).await
    }

    async fn append_message(&self, req: AppendRequest) -> SyncResult<Message> {
        if req.sender == Sender::Admin {
            self.authorize(req.auth.as_ref())?;
        }
        self.store.append_message(&req).await
    }

    async fn list_conversations(&self, auth: &AdminKey) -> SyncResult<Vec<ConversationSummary>> {
        self.authorize(Some(auth))?;
        self.store.list_conversations().await
    }

    async fn mark_read(&self, session_id: &SessionId, seen: DateTime<Utc>, auth: &AdminKey) -> SyncResult<()> {
        self.authorize(Some(auth))?;
        self.store.mark_read(session_id, seen).await.map(|_| ())
    }

    async fn delete_conversation(&self, session_id: &SessionId, auth: &AdminKey) -> SyncResult<()> {
        self.authorize(Some(auth))?;
        self.store.delete_conversation(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn transport() -> LocalTransport {
        let store = Store::in_memory().await.unwrap();
        store.init().await.unwrap();
        LocalTransport::new(store, AdminKey::new("letmein"))
    }

    #[tokio::test]
    async fn admin_operations_need_the_key() {
        let api = transport().await;
        let wrong = AdminKey::new("nope");
        let sid = SessionId::generate();

        assert_eq!(api.list_conversations(&wrong).await, Err(SyncError::AuthExpired));
        assert_eq!(api.mark_read(&sid, Utc::now(), &wrong).await, Err(SyncError::AuthExpired));
        assert_eq!(api.delete_conversation(&sid, &wrong).await, Err(SyncError::AuthExpired));

        let mut reply = AppendRequest::admin(sid.clone(), "hi", wrong);
        assert_eq!(api.append_message(reply.clone()).await, Err(SyncError::AuthExpired));
        reply.auth = None;
        assert_eq!(api.append_message(reply).await, Err(SyncError::AuthExpired));
    }

    #[tokio::test]
    async fn visitor_and_admin_share_one_log() {
        let api = transport().await;
        let key = AdminKey::new("letmein");
        let sid = SessionId::generate();

        api.append_message(AppendRequest::user(sid.clone(), "question")).await.unwrap();
        api.append_message(AppendRequest::admin(sid.clone(), "answer", key.clone()))
            .await
            .unwrap();

        let log = api.get_conversation(&sid).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].sender, Sender::User);
        assert_eq!(log[1].sender, Sender::Admin);
        assert_eq!(api.list_conversations(&key).await.unwrap().len(), 1);
    }
}
