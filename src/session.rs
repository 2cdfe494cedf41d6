//! Process-wide session registry.
//!
//! Maps session ids to their lifecycle state. Entries are never evicted;
//! they live until the process exits. Durable index directories outlive the
//! store and are used to rehydrate sessions it no longer knows about.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. No lock is held across an
//! `.await`; chains are handed out as `Arc`s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chain::ConversationalChain;
use crate::indexer::IndexError;

/// Lifecycle state of a session.
#[derive(Clone)]
pub enum SessionState {
    /// Indexing job queued or running.
    Processing,
    /// Conversational handle bound and ready for chat.
    Ready(Arc<ConversationalChain>),
    /// Indexing failed; the cause is kept for callers.
    Failed(Arc<IndexError>),
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Processing => SessionStatus::Processing,
            SessionState::Ready(_) => SessionStatus::Ready,
            SessionState::Failed(_) => SessionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Processing,
    Ready,
    Failed,
}

/// A session's attributes plus its current state.
#[derive(Clone)]
pub struct SessionEntry {
    /// Original filename; `None` for sessions rehydrated from disk.
    pub filename: Option<String>,
    pub upload_path: Option<PathBuf>,
    pub index_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

impl SessionEntry {
    pub fn processing(filename: String, upload_path: PathBuf, index_dir: PathBuf) -> Self {
        Self {
            filename: Some(filename),
            upload_path: Some(upload_path),
            index_dir,
            created_at: Utc::now(),
            state: SessionState::Processing,
        }
    }

    pub fn rehydrated(index_dir: PathBuf, chain: Arc<ConversationalChain>) -> Self {
        Self {
            filename: None,
            upload_path: None,
            index_dir,
            created_at: Utc::now(),
            state: SessionState::Ready(chain),
        }
    }
}

/// Concurrency-safe session registry.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session entry.
    pub fn put(&self, id: &str, entry: SessionEntry) {
        self.write().insert(id.to_string(), entry);
    }

    pub fn get(&self, id: &str) -> Option<SessionEntry> {
        self.read().get(id).cloned()
    }

    /// Convenience accessor for a ready session's chain.
    pub fn chain(&self, id: &str) -> Option<Arc<ConversationalChain>> {
        match self.read().get(id).map(|e| &e.state) {
            Some(SessionState::Ready(chain)) => Some(chain.clone()),
            _ => None,
        }
    }

    /// Insert `entry` unless the id is already known; returns whichever entry
    /// is stored afterwards.
    pub fn insert_if_absent(&self, id: &str, entry: SessionEntry) -> SessionEntry {
        self.write()
            .entry(id.to_string())
            .or_insert(entry)
            .clone()
    }

    /// Move a session to `Ready`. Unknown ids get a minimal entry.
    pub fn mark_ready(&self, id: &str, index_dir: PathBuf, chain: Arc<ConversationalChain>) {
        let mut sessions = self.write();
        match sessions.get_mut(id) {
            Some(entry) => entry.state = SessionState::Ready(chain),
            None => {
                sessions.insert(id.to_string(), SessionEntry::rehydrated(index_dir, chain));
            }
        }
    }

    /// Record an indexing failure. Unknown ids are ignored.
    pub fn mark_failed(&self, id: &str, error: IndexError) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.state = SessionState::Failed(Arc::new(error));
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every live entry, as a process restart would.
    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}
