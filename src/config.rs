use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::entity::AdminKey;

/// Timing knobs for the sync engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub client_poll_interval: Duration,
    pub admin_list_interval: Duration,
    pub admin_detail_interval: Duration,
    /// Max timestamp distance between an echo and its authoritative copy.
    pub match_window: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            client_poll_interval: Duration::from_millis(3000),
            admin_list_interval: Duration::from_millis(5000),
            admin_detail_interval: Duration::from_millis(2000),
            match_window: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind: SocketAddr,
    pub admin_secret: AdminKey,
    pub sync: SyncSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = match lookup("CHATSYNC_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home).join(".chatsync").join("chatsync.db")
            }
        };

        let bind = lookup("CHATSYNC_BIND")
            .unwrap_or_else(|| "0.0.0.0:8000".into())
            .parse::<SocketAddr>()
            .context("CHATSYNC_BIND is not a socket address")?;

        let admin_secret = match lookup("CHATSYNC_ADMIN_SECRET").filter(|s| !s.trim().is_empty()) {
            Some(secret) => AdminKey::new(secret.trim()),
            None => {
                warn!("CHATSYNC_ADMIN_SECRET not set, using a random secret for this process");
                AdminKey::new(Uuid::new_v4().simple().to_string())
            }
        };

        let defaults = SyncSettings::default();
        let sync = SyncSettings {
            client_poll_interval: millis(&lookup, "CHATSYNC_CLIENT_POLL_MS", defaults.client_poll_interval)?,
            admin_list_interval: millis(&lookup, "CHATSYNC_ADMIN_LIST_POLL_MS", defaults.admin_list_interval)?,
            admin_detail_interval: millis(&lookup, "CHATSYNC_ADMIN_DETAIL_POLL_MS", defaults.admin_detail_interval)?,
            match_window: millis(&lookup, "CHATSYNC_MATCH_WINDOW_MS", defaults.match_window)?,
        };

        Ok(Self {
            db_path,
            bind,
            admin_secret,
            sync,
        })
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a number of milliseconds, got '{}'", key, raw))?;
    if ms == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup_from(&[("HOME", "/home/op")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/home/op/.chatsync/chatsync.db"));
        assert_eq!(config.bind.port(), 8000);
        assert_eq!(config.sync, SyncSettings::default());
        assert!(!config.admin_secret.expose().is_empty());
    }

    #[test]
    fn overrides_are_read() {
        let config = Config::from_lookup(lookup_from(&[
            ("CHATSYNC_DB_PATH", "/tmp/x.db"),
            ("CHATSYNC_BIND", "127.0.0.1:9999"),
            ("CHATSYNC_ADMIN_SECRET", " s3cret "),
            ("CHATSYNC_CLIENT_POLL_MS", "1500"),
            ("CHATSYNC_MATCH_WINDOW_MS", "4000"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.bind.port(), 9999);
        assert_eq!(config.admin_secret.expose(), "s3cret");
        assert_eq!(config.sync.client_poll_interval, Duration::from_millis(1500));
        assert_eq!(config.sync.match_window, Duration::from_millis(4000));
        assert_eq!(config.sync.admin_list_interval, Duration::from_millis(5000));
    }

    #[test]
    fn bad_numbers_are_errors() {
        assert!(Config::from_lookup(lookup_from(&[("CHATSYNC_CLIENT_POLL_MS", "soon")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("CHATSYNC_ADMIN_LIST_POLL_MS", "0")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("CHATSYNC_BIND", "nowhere")])).is_err());
    }
}
