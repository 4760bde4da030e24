//! Reconciliation of optimistic echoes against the authoritative log.
//!
//! An echo disappears the first time a matching authoritative message shows
//! up: same sender, same text, timestamps no further apart than the match
//! window. Echoes are paired oldest-first against the oldest unclaimed
//! candidate. Each authoritative id confirms at most one echo for the life
//! of a [`PendingEchoes`], so a later identical send can't be swallowed by a
//! message that already confirmed an earlier one.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use crate::chat::Message;
use crate::entity::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EchoStatus {
    /// Append request not answered yet.
    Sending,
    /// Append acknowledged, waiting to show up in a poll.
    Sent,
    /// Append failed. Kept until the user resends or dismisses it.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEcho {
    pub id: Uuid,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: EchoStatus,
}

/// Locally sent messages not yet seen in the authoritative log.
#[derive(Debug, Default)]
pub struct PendingEchoes {
    queue: Vec<PendingEcho>,
    claimed: HashSet<i64>,
}

impl PendingEchoes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sender: Sender, text: impl Into<String>, timestamp: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.queue.push(PendingEcho {
            id,
            sender,
            text: text.into(),
            timestamp,
            status: EchoStatus::Sending,
        });
        id
    }

    pub fn get(&self, id: Uuid) -> Option<&PendingEcho> {
        self.queue.iter().find(|e| e.id == id)
    }

    /// Updates the status of a still-pending echo. Returns false if the echo
    /// is already gone (confirmed or dismissed).
    pub fn set_status(&mut self, id: Uuid, status: EchoStatus) -> bool {
        match self.queue.iter_mut().find(|e| e.id == id) {
            Some(echo) => {
                echo.status = status;
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, id: Uuid) -> bool {
        self.set_status(id, EchoStatus::Failed)
    }

    pub fn remove(&mut self, id: Uuid) -> Option<PendingEcho> {
        let pos = self.queue.iter().position(|e| e.id == id)?;
        Some(self.queue.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEcho> {
        self.queue.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntryOrigin {
    Confirmed { id: i64 },
    Pending { echo_id: Uuid, status: EchoStatus },
}

/// One rendered line of a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub origin: EntryOrigin,
}

impl TranscriptEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self.origin, EntryOrigin::Pending { .. })
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    (a - b)
        .num_microseconds()
        .map(i64::unsigned_abs)
        .is_some_and(|delta| u128::from(delta) <= window.as_micros())
}

fn matches(echo: &PendingEcho, message: &Message, window: Duration) -> bool {
    echo.sender == message.sender
        && echo.text == message.text
        && within(echo.timestamp, message.timestamp, window)
}

/// Merges `authoritative` with whatever in `pending` it does not confirm.
///
/// Confirmed echoes are removed from `pending`. The result is ordered by
/// timestamp; on equal timestamps authoritative entries come first, then
/// echoes in send order.
pub fn reconcile(
    authoritative: &[Message],
    pending: &mut PendingEchoes,
    window: Duration,
) -> Vec<TranscriptEntry> {
    // Ids that vanished from the log (conversation deleted) can't confirm anything again.
    let present: HashSet<i64> = authoritative.iter().map(|m| m.id).collect();
    pending.claimed.retain(|id| present.contains(id));

    let mut confirmed = Vec::new();
    for echo in &pending.queue {
        let candidate = authoritative
            .iter()
            .find(|m| !pending.claimed.contains(&m.id) && matches(echo, m, window));
        if let Some(message) = candidate {
            pending.claimed.insert(message.id);
            confirmed.push(echo.id);
        }
    }
    pending.queue.retain(|e| !confirmed.contains(&e.id));

    let mut entries: Vec<TranscriptEntry> = authoritative
        .iter()
        .map(|m| TranscriptEntry {
            sender: m.sender,
            text: m.text.clone(),
            timestamp: m.timestamp,
            origin: EntryOrigin::Confirmed { id: m.id },
        })
        .chain(pending.queue.iter().map(|e| TranscriptEntry {
            sender: e.sender,
            text: e.text.clone(),
            timestamp: e.timestamp,
            origin: EntryOrigin::Pending {
                echo_id: e.id,
                status: e.status,
            },
        }))
        .collect();

    // Stable, so ties keep the authoritative-then-send order built above.
    entries.sort_by_key(|e| e.timestamp);
    entries
}
