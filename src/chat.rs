use crate::entity::{AdminKey, Sender, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DISPLAY_NAME: &str = "Guest";
pub const PREVIEW_CHARS: usize = 80;
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// One entry of the authoritative log. `id` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub session_id: SessionId,
    pub display_name: String,
    pub messages: Vec<Message>,
    pub last_updated: DateTime<Utc>,
    pub is_read: bool,
}

/// Row of the admin conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub session_id: SessionId,
    pub display_name: String,
    pub last_message_preview: String,
    pub last_updated: DateTime<Utc>,
    pub is_read: bool,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub session_id: SessionId,
    pub sender: Sender,
    pub text: String,
    pub display_name: Option<String>,
    /// Needed by remote transports when `sender` is the admin.
    pub auth: Option<AdminKey>,
}

impl AppendRequest {
    pub fn user(session_id: SessionId, text: impl Into<String>) -> Self {
        Self {
            session_id,
            sender: Sender::User,
            text: text.into(),
            display_name: None,
            auth: None,
        }
    }

    pub fn admin(session_id: SessionId, text: impl Into<String>, auth: AdminKey) -> Self {
        Self {
            session_id,
            sender: Sender::Admin,
            text: text.into(),
            display_name: None,
            auth: Some(auth),
        }
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }
}

/// Trims and bounds message text. Returns the text to store.
pub fn validate_text(text: &str) -> Result<String, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("message text is empty".to_string());
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(format!(
            "message text exceeds {} characters",
            MAX_MESSAGE_CHARS
        ));
    }
    Ok(trimmed.to_string())
}

pub fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(PREVIEW_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_short_text() {
        assert_eq!(preview("hello"), "hello");
    }

    #[test]
    fn preview_cuts_on_char_boundary() {
        let long = "ก".repeat(100);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 1);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn validate_text_trims_and_bounds() {
        assert_eq!(validate_text("  hi \n").as_deref(), Ok("hi"));
        assert!(validate_text("   ").is_err());
        assert!(validate_text(&"x".repeat(MAX_MESSAGE_CHARS + 1)).is_err());
        assert!(validate_text(&"x".repeat(MAX_MESSAGE_CHARS)).is_ok());
    }

    #[test]
    fn message_wire_format() {
        let message = Message {
            id: 3,
            sender: Sender::Admin,
            text: "hello".into(),
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["sender"], "admin");
        assert_eq!(value["id"], 3);

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }
}
