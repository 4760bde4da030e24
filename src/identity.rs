//! Durable anonymous visitor identity.
//!
//! The token lives in an injected [`TokenStore`]. When that store can't be
//! read or written, the identity falls back to a token that only lives as
//! long as the process (degraded mode).

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::entity::SessionId;

/// Small persistent slot for one secret string.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Token kept in a single file.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                let token = raw.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create token directory")?;
            }
        }
        std::fs::write(&self.path, token)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// Process-lifetime store. Also handy in tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, token: &str) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

struct Resolved {
    id: SessionId,
    degraded: bool,
}

pub struct SessionIdentity {
    store: Box<dyn TokenStore>,
    resolved: Mutex<Option<Resolved>>,
}

impl SessionIdentity {
    pub fn new(store: impl TokenStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            resolved: Mutex::new(None),
        }
    }

    /// Returns the persisted id, or creates and persists a new one.
    /// Never touches the network and never fails.
    pub fn obtain_or_create(&self) -> SessionId {
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = resolved.as_ref() {
            return r.id.clone();
        }

        let r = self.resolve();
        let id = r.id.clone();
        *resolved = Some(r);
        id
    }

    /// True when the current id will not survive a restart.
    pub fn is_degraded(&self) -> bool {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.degraded)
            .unwrap_or(false)
    }

    fn resolve(&self) -> Resolved {
        match self.store.load() {
            Ok(Some(raw)) => match SessionId::parse(&raw) {
                Some(id) => {
                    return Resolved {
                        id,
                        degraded: false,
                    }
                }
                None => warn!("Persisted session token is malformed, replacing it"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!("Session storage unavailable, using an in-memory session: {:#}", e);
                return Resolved {
                    id: SessionId::generate(),
                    degraded: true,
                };
            }
        }

        let id = SessionId::generate();
        match self.store.save(id.as_str()) {
            Ok(()) => {
                info!("Created new session {}", id);
                Resolved {
                    id,
                    degraded: false,
                }
            }
            Err(e) => {
                warn!("Failed to persist session, it will not survive a restart: {:#}", e);
                Resolved { id, degraded: true }
            }
        }
    }
}
