//! Visitor-side synchronization for one conversation.
//!
//! The rendered transcript is always `reconcile(latest poll, pending echoes)`.
//! Polling runs only between [`ClientSyncEngine::open`] and
//! [`ClientSyncEngine::close`].

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::ConversationApi;
use crate::bus::{EventBus, SyncEvent};
use crate::chat::{self, AppendRequest, Message};
use crate::config::SyncSettings;
use crate::entity::{Sender, SessionId};
use crate::error::{SyncError, SyncResult};
use crate::merge::{self, EchoStatus, PendingEchoes, TranscriptEntry};
use crate::scheduler::{PollHandle, Tick};

#[derive(Default)]
struct ClientView {
    authoritative: Vec<Message>,
    pending: PendingEchoes,
}

struct ClientInner {
    api: Arc<dyn ConversationApi>,
    session_id: SessionId,
    display_name: Mutex<Option<String>>,
    settings: SyncSettings,
    poll: PollHandle,
    view: Mutex<ClientView>,
    bus: Arc<EventBus>,
}

impl ClientInner {
    fn view(&self) -> MutexGuard<'_, ClientView> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_and_apply(&self, tick: Tick) -> SyncResult<()> {
        let messages = match self.api.get_conversation(&self.session_id).await {
            Ok(messages) => messages,
            Err(SyncError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let window = self.settings.match_window;
        let applied = self.poll.apply_if_current(tick, || {
            let mut guard = self.view();
            let view = &mut *guard;
            view.authoritative = messages;
            merge::reconcile(&view.authoritative, &mut view.pending, window);
        });

        if applied.is_some() {
            self.bus.publish(SyncEvent::TranscriptUpdated {
                session_id: self.session_id.clone(),
            });
        }
        Ok(())
    }
}

pub struct ClientSyncEngine {
    inner: Arc<ClientInner>,
}

impl ClientSyncEngine {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        session_id: SessionId,
        settings: SyncSettings,
        bus: Arc<EventBus>,
    ) -> Self {
        let poll = PollHandle::new(format!("client:{}", session_id));
        Self {
            inner: Arc::new(ClientInner {
                api,
                session_id,
                display_name: Mutex::new(None),
                settings,
                poll,
                view: Mutex::new(ClientView::default()),
                bus,
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Name attached to subsequent sends.
    pub fn set_display_name(&self, name: Option<String>) {
        *self
            .inner
            .display_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = name;
    }

    /// Starts polling: one fetch right away, then one per poll interval.
    /// Calling it on an open view does nothing.
    pub fn open(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .poll
            .start(self.inner.settings.client_poll_interval, move |tick: Tick| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.fetch_and_apply(tick).await,
                        None => Ok(()),
                    }
                }
            });
        info!("Chat view opened for {}", self.inner.session_id);
    }

    /// Stops polling. Responses still in flight are dropped.
    pub fn close(&self) {
        self.inner.poll.stop();
        info!("Chat view closed for {}", self.inner.session_id);
    }

    pub fn is_open(&self) -> bool {
        self.inner.poll.is_active()
    }

    /// Out-of-schedule fetch. Does nothing while closed.
    pub async fn refresh(&self) -> SyncResult<()> {
        let Some(tick) = self.inner.poll.ticket() else {
            return Ok(());
        };
        self.inner.fetch_and_apply(tick).await
    }

    /// Shows `text` immediately and appends it to the store.
    ///
    /// On failure the echo stays, marked failed, and the error is returned.
    /// Nothing is re-sent automatically; see [`resend`](Self::resend).
    pub async fn send(&self, text: &str) -> SyncResult<Uuid> {
        let text = chat::validate_text(text).map_err(SyncError::Rejected)?;
        let inner = &self.inner;

        let echo_id = inner.view().pending.push(Sender::User, text.clone(), Utc::now());
        inner.bus.publish(SyncEvent::TranscriptUpdated {
            session_id: inner.session_id.clone(),
        });

        let display_name = inner
            .display_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let req = AppendRequest::user(inner.session_id.clone(), text).with_display_name(display_name);

        match inner.api.append_message(req).await {
            Ok(ack) => {
                debug!("Message {} acknowledged for echo {}", ack.id, echo_id);
                inner.view().pending.set_status(echo_id, EchoStatus::Sent);
                Ok(echo_id)
            }
            Err(e) => {
                warn!("Send failed for {}: {}", inner.session_id, e);
                inner.view().pending.mark_failed(echo_id);
                inner.bus.publish(SyncEvent::SendFailed {
                    session_id: inner.session_id.clone(),
                    echo_id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Replaces a failed echo with a brand new send of the same text.
    pub async fn resend(&self, echo_id: Uuid) -> SyncResult<Uuid> {
        let text = {
            let mut view = self.inner.view();
            match view.pending.get(echo_id).map(|e| e.status) {
                Some(EchoStatus::Failed) => {}
                Some(_) => return Err(SyncError::rejected("message is still being delivered")),
                None => return Err(SyncError::rejected("unknown message")),
            }
            view.pending
                .remove(echo_id)
                .map(|e| e.text)
                .ok_or_else(|| SyncError::rejected("unknown message"))?
        };
        self.send(&text).await
    }

    /// Drops a pending echo without sending anything.
    pub fn dismiss(&self, echo_id: Uuid) -> bool {
        let removed = self.inner.view().pending.remove(echo_id).is_some();
        if removed {
            self.inner.bus.publish(SyncEvent::TranscriptUpdated {
                session_id: self.inner.session_id.clone(),
            });
        }
        removed
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        let mut guard = self.inner.view();
        let view = &mut *guard;
        merge::reconcile(&view.authoritative, &mut view.pending, self.inner.settings.match_window)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.view().pending.len()
    }
}
