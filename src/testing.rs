//! In-memory `ConversationApi` with call counters and fault injection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::ConversationApi;
use crate::chat::{self, AppendRequest, ConversationSummary, Message, DEFAULT_DISPLAY_NAME};
use crate::entity::{AdminKey, Sender, SessionId};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Append,
    List,
    MarkRead,
    Delete,
}

#[derive(Default)]
struct FakeConversation {
    display_name: String,
    messages: Vec<Message>,
    last_updated: DateTime<Utc>,
    is_read: bool,
}

#[derive(Default)]
struct FakeState {
    conversations: BTreeMap<SessionId, FakeConversation>,
    next_id: i64,
    failures: VecDeque<(Op, SyncError)>,
    latency: Duration,
    /// One-off latencies that replace `latency` for the next call of an op.
    slow: Vec<(Op, Duration)>,
    /// When set, appends are acked but never stored.
    swallow_appends: bool,
}

#[derive(Default)]
pub struct Counter {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Counter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a Counter);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a Counter) -> Self {
        counter.calls.fetch_add(1, Ordering::SeqCst);
        let now = counter.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counter.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeApi {
    admin_key: AdminKey,
    state: Mutex<FakeState>,
    pub gets: Counter,
    pub appends: Counter,
    pub lists: Counter,
    pub marks: Counter,
    pub deletes: Counter,
}

impl FakeApi {
    pub fn new(admin_key: &str) -> Self {
        Self {
            admin_key: AdminKey::new(admin_key),
            state: Mutex::new(FakeState::default()),
            gets: Counter::default(),
            appends: Counter::default(),
            lists: Counter::default(),
            marks: Counter::default(),
            deletes: Counter::default(),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// The next call of `op` takes `latency` instead of the default.
    pub fn slow_next(&self, op: Op, latency: Duration) {
        self.state.lock().unwrap().slow.push((op, latency));
    }

    pub fn fail_next(&self, op: Op, err: SyncError) {
        self.state.lock().unwrap().failures.push_back((op, err));
    }

    pub fn swallow_appends(&self, on: bool) {
        self.state.lock().unwrap().swallow_appends = on;
    }

    /// Server-side insert with an explicit timestamp.
    pub fn insert(&self, session_id: &SessionId, sender: Sender, text: &str, timestamp: DateTime<Utc>) -> Message {
        let mut state = self.state.lock().unwrap();
        Self::store(&mut state, session_id, sender, text.to_string(), None, timestamp)
    }

    pub fn messages(&self, session_id: &SessionId) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .conversations
            .get(session_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn is_read(&self, session_id: &SessionId) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .conversations
            .get(session_id)
            .map(|c| c.is_read)
    }

    fn store(
        state: &mut FakeState,
        session_id: &SessionId,
        sender: Sender,
        text: String,
        display_name: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Message {
        state.next_id += 1;
        let message = Message {
            id: state.next_id,
            sender,
            text,
            timestamp,
        };
        let conversation = state
            .conversations
            .entry(session_id.clone())
            .or_insert_with(|| FakeConversation {
                display_name: DEFAULT_DISPLAY_NAME.to_string(),
                ..Default::default()
            });
        if let Some(name) = display_name {
            conversation.display_name = name;
        }
        conversation.messages.push(message.clone());
        conversation.last_updated = timestamp;
        conversation.is_read = sender == Sender::Admin;
        message
    }

    async fn prologue(&self, op: Op) -> SyncResult<()> {
        let (latency, failure) = {
            let mut state = self.state.lock().unwrap();
            let failure = match state.failures.front() {
                Some((queued, _)) if *queued == op => state.failures.pop_front().map(|(_, e)| e),
                _ => None,
            };
            let latency = match state.slow.iter().position(|(slow, _)| *slow == op) {
                Some(pos) => state.slow.remove(pos).1,
                None => state.latency,
            };
            (latency, failure)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn authorize(&self, auth: Option<&AdminKey>) -> SyncResult<()> {
        match auth {
            Some(key) if key.matches(&self.admin_key) => Ok(()),
            _ => Err(SyncError::AuthExpired),
        }
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn get_conversation(&self, session_id: &SessionId) -> SyncResult<Vec<Message>> {
        let _guard = InFlight::enter(&self.gets);
        // Answers with the state at request time, however late it arrives.
        let snapshot = self
            .state
            .lock()
            .unwrap()
            .conversations
            .get(session_id)
            .map(|c| c.messages.clone());
        self.prologue(Op::Get).await?;
        snapshot.ok_or_else(|| SyncError::not_found(session_id))
    }

    async fn append_message(&self, req: AppendRequest) -> SyncResult<Message> {
        let _guard = InFlight::enter(&self.appends);
        self.prologue(Op::Append).await?;
        if req.sender == Sender::Admin {
            self.authorize(req.auth.as_ref())?;
        }
        let text = chat::validate_text(&req.text).map_err(SyncError::Rejected)?;
        let mut state = self.state.lock().unwrap();
        if state.swallow_appends {
            return Ok(Message {
                id: -1,
                sender: req.sender,
                text,
                timestamp: Utc::now(),
            });
        }
        Ok(Self::store(
            &mut state,
            &req.session_id,
            req.sender,
            text,
            req.display_name,
            Utc::now(),
        ))
    }

    async fn list_conversations(&self, auth: &AdminKey) -> SyncResult<Vec<ConversationSummary>> {
        let _guard = InFlight::enter(&self.lists);
        self.prologue(Op::List).await?;
        self.authorize(Some(auth))?;
        let state = self.state.lock().unwrap();
        let mut list: Vec<ConversationSummary> = state
            .conversations
            .iter()
            .map(|(id, c)| ConversationSummary {
                session_id: id.clone(),
                display_name: c.display_name.clone(),
                last_message_preview: c
                    .messages
                    .last()
                    .map(|m| chat::preview(&m.text))
                    .unwrap_or_default(),
                last_updated: c.last_updated,
                is_read: c.is_read,
            })
            .collect();
        list.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(list)
    }

    async fn mark_read(&self, session_id: &SessionId, seen: DateTime<Utc>, auth: &AdminKey) -> SyncResult<()> {
        let _guard = InFlight::enter(&self.marks);
        self.prologue(Op::MarkRead).await?;
        self.authorize(Some(auth))?;
        let mut state = self.state.lock().unwrap();
        let conversation = state
            .conversations
            .get_mut(session_id)
            .ok_or_else(|| SyncError::not_found(session_id))?;
        if conversation.last_updated <= seen {
            conversation.is_read = true;
        }
        Ok(())
    }

    async fn delete_conversation(&self, session_id: &SessionId, auth: &AdminKey) -> SyncResult<()> {
        let _guard = InFlight::enter(&self.deletes);
        self.prologue(Op::Delete).await?;
        self.authorize(Some(auth))?;
        let mut state = self.state.lock().unwrap();
        state
            .conversations
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| SyncError::not_found(session_id))
    }
}
