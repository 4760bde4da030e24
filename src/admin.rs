//! Operator console synchronization.
//!
//! While authenticated the conversation list is polled continuously. A
//! second, faster poll follows the selected conversation and runs only
//! while something is selected. Selecting marks the conversation read in
//! the local view at once; the store learns about it on the next list
//! refresh, which pushes queued read marks before it lists.
//!
//! Every queued mark carries the newest `last_updated` the operator has
//! actually seen. The store ignores a mark older than the conversation, so
//! a visitor message that arrives after the operator moved on stays unread.
//!
//! Assumes a single active admin session. Two consoles sharing one key can
//! interleave replies.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::api::ConversationApi;
use crate::bus::{EventBus, SyncEvent};
use crate::chat::{AppendRequest, ConversationSummary, Message};
use crate::config::SyncSettings;
use crate::entity::{AdminKey, SessionId};
use crate::error::{SyncError, SyncResult};
use crate::identity::TokenStore;
use crate::scheduler::{PollHandle, Tick};

#[derive(Default)]
struct AdminView {
    auth: Option<AdminKey>,
    conversations: Vec<ConversationSummary>,
    selected: Option<SessionId>,
    detail: Vec<Message>,
    /// Read marks the store hasn't acknowledged yet, with the
    /// `last_updated` the operator saw.
    unsynced_reads: HashMap<SessionId, DateTime<Utc>>,
}

impl AdminView {
    fn set_conversations(&mut self, mut list: Vec<ConversationSummary>) {
        list.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        for summary in &mut list {
            let viewing = self.selected.as_ref() == Some(&summary.session_id);
            if viewing && !summary.is_read {
                // Something new arrived while the operator is looking at it.
                self.queue_read(&summary.session_id, summary.last_updated);
            }
            if !viewing {
                let stale = self
                    .unsynced_reads
                    .get(&summary.session_id)
                    .is_some_and(|seen| *seen < summary.last_updated);
                if stale {
                    self.unsynced_reads.remove(&summary.session_id);
                }
            }
            if viewing || self.unsynced_reads.contains_key(&summary.session_id) {
                summary.is_read = true;
            }
        }
        self.conversations = list;
    }

    fn queue_read(&mut self, session_id: &SessionId, seen: DateTime<Utc>) {
        let entry = self.unsynced_reads.entry(session_id.clone()).or_insert(seen);
        *entry = (*entry).max(seen);
    }

    fn last_seen(&self, session_id: &SessionId) -> Option<DateTime<Utc>> {
        self.conversations
            .iter()
            .find(|c| &c.session_id == session_id)
            .map(|c| c.last_updated)
    }

    fn show_read(&mut self, session_id: &SessionId) {
        if let Some(summary) = self
            .conversations
            .iter_mut()
            .find(|c| &c.session_id == session_id)
        {
            summary.is_read = true;
        }
    }
}

struct AdminInner {
    api: Arc<dyn ConversationApi>,
    settings: SyncSettings,
    credentials: Box<dyn TokenStore>,
    list_poll: PollHandle,
    detail_poll: PollHandle,
    view: Mutex<AdminView>,
    bus: Arc<EventBus>,
}

impl AdminInner {
    fn view(&self) -> MutexGuard<'_, AdminView> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auth(&self) -> SyncResult<AdminKey> {
        self.view().auth.clone().ok_or(SyncError::AuthExpired)
    }

    /// Leaves the authenticated state when the store rejects the key.
    fn guard<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        if matches!(&result, Err(e) if e.is_auth()) {
            self.drop_session("authorization expired");
        }
        result
    }

    fn drop_session(&self, reason: &str) {
        self.list_poll.stop();
        self.detail_poll.stop();
        *self.view() = AdminView::default();
        if let Err(e) = self.credentials.clear() {
            warn!("Failed to clear stored admin credential: {:#}", e);
        }
        info!("Admin session ended: {}", reason);
        self.bus.publish(SyncEvent::AdminLoggedOut {
            reason: reason.to_string(),
        });
    }

    async fn push_read_marks(&self, auth: &AdminKey) -> SyncResult<()> {
        let queued: Vec<(SessionId, DateTime<Utc>)> = self
            .view()
            .unsynced_reads
            .iter()
            .map(|(id, seen)| (id.clone(), *seen))
            .collect();
        for (session_id, seen) in queued {
            match self.api.mark_read(&session_id, seen, auth).await {
                Ok(()) | Err(SyncError::NotFound { .. }) => {
                    let mut view = self.view();
                    // Keep it if the operator saw something newer meanwhile.
                    if view.unsynced_reads.get(&session_id) == Some(&seen) {
                        view.unsynced_reads.remove(&session_id);
                    }
                }
                Err(SyncError::AuthExpired) => return Err(SyncError::AuthExpired),
                Err(e) => warn!("Could not mark {} read, will retry: {}", session_id, e),
            }
        }
        Ok(())
    }

    async fn refresh_list_in(&self, tick: Tick) -> SyncResult<()> {
        let auth = match self.view().auth.clone() {
            Some(auth) => auth,
            None => return Ok(()),
        };

        let result = async {
            self.push_read_marks(&auth).await?;
            self.api.list_conversations(&auth).await
        }
        .await;
        let list = self.guard(result)?;

        debug!("Conversation list refreshed ({} entries)", list.len());
        if self
            .list_poll
            .apply_if_current(tick, || self.view().set_conversations(list))
            .is_some()
        {
            self.bus.publish(SyncEvent::ConversationsUpdated);
        }
        Ok(())
    }

    async fn refresh_detail_in(&self, tick: Tick) -> SyncResult<()> {
        let Some(session_id) = self.view().selected.clone() else {
            return Ok(());
        };

        let messages = match self.api.get_conversation(&session_id).await {
            Ok(messages) => messages,
            Err(SyncError::NotFound { .. }) => Vec::new(),
            Err(e) => return self.guard(Err(e)),
        };

        let applied = self.detail_poll.apply_if_current(tick, || {
            let mut view = self.view();
            if view.selected.as_ref() == Some(&session_id) {
                if let Some(newest) = messages.last().map(|m| m.timestamp) {
                    if let Some(seen) = view.unsynced_reads.get_mut(&session_id) {
                        *seen = (*seen).max(newest);
                    }
                }
                view.detail = messages;
            }
        });
        if applied.is_some() {
            self.bus.publish(SyncEvent::SelectionUpdated {
                session_id: Some(session_id),
            });
        }
        Ok(())
    }
}

pub struct AdminSyncEngine {
    inner: Arc<AdminInner>,
}

impl AdminSyncEngine {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        settings: SyncSettings,
        credentials: impl TokenStore + 'static,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(AdminInner {
                api,
                settings,
                credentials: Box::new(credentials),
                list_poll: PollHandle::new("admin:list"),
                detail_poll: PollHandle::new("admin:detail"),
                view: Mutex::new(AdminView::default()),
                bus,
            }),
        }
    }

    /// Logs in with the key checked against the store.
    /// A rejected key leaves the console logged out.
    pub async fn login(&self, key: AdminKey) -> SyncResult<()> {
        let list = self.inner.api.list_conversations(&key).await?;

        if let Err(e) = self.inner.credentials.save(key.expose()) {
            warn!("Admin credential not persisted: {:#}", e);
        }
        {
            let mut view = self.inner.view();
            view.auth = Some(key);
            view.set_conversations(list);
        }
        self.inner.bus.publish(SyncEvent::ConversationsUpdated);
        self.start_list_poll(false);
        info!("Admin logged in");
        Ok(())
    }

    /// Resumes with a persisted credential, if there is one. The first list
    /// poll logs out again if the key is no longer valid.
    pub fn restore(&self) -> bool {
        let key = match self.inner.credentials.load() {
            Ok(Some(key)) => AdminKey::new(key),
            Ok(None) => return false,
            Err(e) => {
                warn!("Could not read stored admin credential: {:#}", e);
                return false;
            }
        };
        self.inner.view().auth = Some(key);
        self.start_list_poll(true);
        info!("Admin session restored");
        true
    }

    fn start_list_poll(&self, immediate: bool) {
        let weak = Arc::downgrade(&self.inner);
        let tick = move |tick: Tick| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.refresh_list_in(tick).await,
                    None => Ok(()),
                }
            }
        };
        let period = self.inner.settings.admin_list_interval;
        if immediate {
            self.inner.list_poll.start(period, tick);
        } else {
            self.inner.list_poll.start_delayed(period, tick);
        }
    }

    pub fn logout(&self) {
        self.inner.drop_session("logout");
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.view().auth.is_some()
    }

    /// Out-of-schedule list refresh.
    pub async fn refresh_list(&self) -> SyncResult<()> {
        let Some(tick) = self.inner.list_poll.ticket() else {
            return Ok(());
        };
        self.inner.refresh_list_in(tick).await
    }

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.view().conversations.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.inner
            .view()
            .conversations
            .iter()
            .filter(|c| !c.is_read)
            .count()
    }

    /// Opens one conversation in the detail view and starts following it.
    pub fn select(&self, session_id: SessionId) -> SyncResult<()> {
        self.inner.auth()?;
        self.inner.detail_poll.stop();

        {
            let mut view = self.inner.view();
            view.selected = Some(session_id.clone());
            view.detail.clear();
            // Not listed yet: the next list poll queues it once it shows up unread.
            if let Some(seen) = view.last_seen(&session_id) {
                view.queue_read(&session_id, seen);
            }
            view.show_read(&session_id);
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .detail_poll
            .start(self.inner.settings.admin_detail_interval, move |tick: Tick| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.refresh_detail_in(tick).await,
                        None => Ok(()),
                    }
                }
            });

        debug!("Selected {}", session_id);
        self.inner.bus.publish(SyncEvent::SelectionUpdated {
            session_id: Some(session_id),
        });
        self.inner.bus.publish(SyncEvent::ConversationsUpdated);
        Ok(())
    }

    pub fn deselect(&self) {
        self.inner.detail_poll.stop();
        {
            let mut view = self.inner.view();
            view.selected = None;
            view.detail.clear();
        }
        self.inner
            .bus
            .publish(SyncEvent::SelectionUpdated { session_id: None });
    }

    pub fn selected(&self) -> Option<SessionId> {
        self.inner.view().selected.clone()
    }

    pub fn selected_messages(&self) -> Vec<Message> {
        self.inner.view().detail.clone()
    }

    /// Out-of-schedule detail refresh. Does nothing without a selection.
    pub async fn refresh_detail(&self) -> SyncResult<()> {
        let Some(tick) = self.inner.detail_poll.ticket() else {
            return Ok(());
        };
        self.inner.refresh_detail_in(tick).await
    }

    /// Sends an admin message to the selected conversation, then reloads
    /// both views instead of echoing locally.
    pub async fn reply(&self, text: &str) -> SyncResult<Message> {
        let auth = self.inner.auth()?;
        let session_id = self
            .selected()
            .ok_or_else(|| SyncError::rejected("no conversation selected"))?;

        let req = AppendRequest::admin(session_id.clone(), text, auth);
        let message = self.inner.guard(self.inner.api.append_message(req).await)?;
        info!("Replied to {}", session_id);

        if let Err(e) = self.refresh_detail().await {
            warn!("Refresh after reply failed: {}", e);
        }
        if let Err(e) = self.refresh_list().await {
            warn!("Refresh after reply failed: {}", e);
        }
        Ok(message)
    }

    /// Marks a conversation read right away instead of on the next refresh.
    pub async fn mark_read(&self, session_id: &SessionId) -> SyncResult<()> {
        let auth = self.inner.auth()?;
        let seen = {
            let mut view = self.inner.view();
            view.show_read(session_id);
            view.last_seen(session_id).unwrap_or_else(Utc::now)
        };
        self.inner
            .guard(self.inner.api.mark_read(session_id, seen, &auth).await)?;
        self.inner.view().unsynced_reads.remove(session_id);
        self.inner.bus.publish(SyncEvent::ConversationsUpdated);
        Ok(())
    }

    pub async fn delete(&self, session_id: &SessionId) -> SyncResult<()> {
        let auth = self.inner.auth()?;
        match self
            .inner
            .guard(self.inner.api.delete_conversation(session_id, &auth).await)
        {
            Ok(()) | Err(SyncError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        info!("Deleted conversation {}", session_id);

        if self.selected().as_ref() == Some(session_id) {
            self.deselect();
        }
        {
            let mut view = self.inner.view();
            view.conversations.retain(|c| &c.session_id != session_id);
            view.unsynced_reads.remove(session_id);
        }
        self.inner.bus.publish(SyncEvent::ConversationsUpdated);

        if let Err(e) = self.refresh_list().await {
            warn!("Refresh after delete failed: {}", e);
        }
        Ok(())
    }
}
