// # Session Manager
//
// Maps logical session UUIDs to their server-side state and owns the store
// of borrowed backend sessions. Components reference backends only by their
// numeric id through this store, so there are no ownership cycles between
// sessions, the XA registry, and the pools.
//
// The per-backend async mutex is the serialization point for a session:
// clients never issue overlapping calls on one session, and the lock
// enforces it against misbehaving clients too.

use crate::backend::session::BackendSession;
use crate::error::{ProxyError, Result};
use crate::protocol::SessionInfo;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type BackendHandle = Arc<Mutex<Option<BackendSession>>>;

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub info: SessionInfo,
    pub backend_id: u64,
}

pub struct SessionManager {
    sessions: DashMap<Uuid, SessionEntry>,
    backends: DashMap<u64, BackendHandle>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            backends: DashMap::new(),
        }
    }

    /// Registers a new session bound to the given borrowed backend.
    pub fn register(&self, info: SessionInfo, backend: BackendSession) {
        let backend_id = backend.id();
        self.backends
            .insert(backend_id, Arc::new(Mutex::new(Some(backend))));
        self.sessions.insert(
            info.session_uuid,
            SessionEntry {
                info,
                backend_id,
            },
        );
    }

    pub fn lookup(&self, session_uuid: Uuid) -> Result<SessionEntry> {
        self.sessions
            .get(&session_uuid)
            .map(|e| e.clone())
            .ok_or_else(|| {
                ProxyError::SessionNotFound(format!(
                    "session {} is not registered on this server",
                    session_uuid
                ))
            })
    }

    /// The backend handle owning a session's physical connection.
    pub fn backend_for(&self, session_uuid: Uuid) -> Result<(u64, BackendHandle)> {
        let entry = self.lookup(session_uuid)?;
        let handle = self.backend_by_id(entry.backend_id).ok_or_else(|| {
            ProxyError::Internal(format!(
                "session {} references missing backend {}",
                session_uuid, entry.backend_id
            ))
        })?;
        Ok((entry.backend_id, handle))
    }

    /// Direct backend lookup, used when a branch outlives its session.
    pub fn backend_by_id(&self, backend_id: u64) -> Option<BackendHandle> {
        self.backends.get(&backend_id).map(|h| h.clone())
    }

    /// Drops the session entry. The backend stays in the store until
    /// [`take_backend`](Self::take_backend) claims it for release.
    pub fn remove_session(&self, session_uuid: Uuid) -> Option<SessionEntry> {
        self.sessions.remove(&session_uuid).map(|(_, entry)| entry)
    }

    /// Claims the backend session out of the store for return to its pool.
    pub async fn take_backend(&self, backend_id: u64) -> Option<BackendSession> {
        let handle = self
            .backends
            .remove(&backend_id)
            .map(|(_, handle)| handle)?;
        let mut guard = handle.lock().await;
        guard.take()
    }

    pub fn active_sessions(&self) -> u32 {
        self.sessions.len() as u32
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
