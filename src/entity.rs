use cmov::Cmov;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const SESSION_PREFIX: &str = "ses_";
const MAX_SESSION_ID_LEN: usize = 128;

/// Durable anonymous identity of one visitor device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random id. UUIDv4 carries 122 random bits.
    pub fn generate() -> Self {
        Self(format!("{}{}", SESSION_PREFIX, Uuid::new_v4().simple()))
    }

    /// Accepts a token that came from outside (storage, URL path).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_SESSION_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Admin,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Admin => "admin",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Sender::User),
            "admin" => Ok(Sender::Admin),
            other => Err(format!("unknown sender '{}'", other)),
        }
    }
}

/// Shared admin credential, sent as `X-Admin-Key`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdminKey(String);

impl AdminKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compares in time independent of where the keys differ. Length still
    /// short-circuits.
    pub fn matches(&self, other: &AdminKey) -> bool {
        let (a, b) = (self.0.as_bytes(), other.0.as_bytes());
        if a.len() != b.len() {
            return false;
        }

        let mut equal = 1u8;
        a.iter()
            .zip(b.iter())
            .for_each(|(x, y)| equal.cmovnz(&0u8, x ^ y));
        equal != 0u8
    }
}

// Keep the secret out of logs.
impl fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminKey(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_parseable() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("ses_"));
        assert_eq!(SessionId::parse(a.as_str()), Some(a));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SessionId::parse("").is_none());
        assert!(SessionId::parse("   ").is_none());
        assert!(SessionId::parse("../etc/passwd").is_none());
        assert!(SessionId::parse(&"a".repeat(129)).is_none());
        assert!(SessionId::parse("visitor-42").is_some());
    }

    #[test]
    fn sender_round_trips_through_str() {
        assert_eq!("admin".parse::<Sender>(), Ok(Sender::Admin));
        assert_eq!(Sender::User.to_string(), "user");
        assert!("system".parse::<Sender>().is_err());
    }

    #[test]
    fn admin_key_matching() {
        let key = AdminKey::new("hunter2");
        assert!(key.matches(&AdminKey::new("hunter2")));
        assert!(!key.matches(&AdminKey::new("hunter3")));
        assert!(!key.matches(&AdminKey::new("Hunter2")));
        assert!(!key.matches(&AdminKey::new("hunter22")));
        assert!(!key.matches(&AdminKey::new("")));
    }

    #[test]
    fn admin_key_debug_is_redacted() {
        let key = AdminKey::new("hunter2");
        assert!(!format!("{:?}", key).contains("hunter2"));
    }
}
