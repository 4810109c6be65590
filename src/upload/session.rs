//! Upload Session Manager
//!
//! Manages upload sessions with:
//! - An in-memory cache of live sessions over the `upload_sessions` table
//! - One async mutex per session, held for every transition and staging write
//! - An abort flag checked before and after taking that mutex

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, MutexGuard, OwnedSemaphorePermit, RwLock};

use super::types::{SessionRequest, SessionState, SessionToken, TransferError, UploadSession};
use crate::db::SessionRepository;

// ============================================================================
// Session Handle
// ============================================================================

/// Mutable state of one live session
pub struct SessionEntry {
    pub session: UploadSession,

    /// Transfer slot held until the session reaches a terminal state.
    /// Sessions reloaded after a restart may run without one.
    pub permit: Option<OwnedSemaphorePermit>,

    /// Staging verified and counted in progress by this process. False for
    /// sessions reloaded from the database until first touched.
    pub attached: bool,
}

/// Shared handle to one live session
pub struct SessionHandle {
    entry: Mutex<SessionEntry>,
    aborted: AtomicBool,
}

impl SessionHandle {
    fn new(session: UploadSession, permit: Option<OwnedSemaphorePermit>, attached: bool) -> Self {
        Self {
            entry: Mutex::new(SessionEntry {
                session,
                permit,
                attached,
            }),
            aborted: AtomicBool::new(false),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionEntry> {
        self.entry.lock().await
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, SessionEntry>> {
        self.entry.try_lock().ok()
    }

    /// Ask queued writers to stop; takes effect before the lock is acquired
    pub fn request_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    db: SqlitePool,

    /// Live (non-terminal) sessions indexed by token
    sessions: RwLock<HashMap<SessionToken, Arc<SessionHandle>>>,

    /// Inactivity window before a session expires
    timeout: chrono::Duration,
}

impl SessionManager {
    pub fn new(db: SqlitePool, timeout: std::time::Duration) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            inner: Arc::new(SessionManagerInner {
                db,
                sessions: RwLock::new(HashMap::new()),
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> chrono::Duration {
        self.inner.timeout
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create, persist and cache a new Open session
    pub async fn create(
        &self,
        request: &SessionRequest,
        chunk_size: usize,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(UploadSession, Arc<SessionHandle>), TransferError> {
        let session = UploadSession::new(request, chunk_size, self.inner.timeout);
        self.persist(&session).await?;

        let handle = Arc::new(SessionHandle::new(session.clone(), permit, true));
        {
            let mut sessions = self.inner.sessions.write().await;
            sessions.insert(session.token, handle.clone());
        }

        tracing::info!(
            session_id = %session.token,
            file_name = %session.file_name,
            declared_size = session.declared_size,
            chunk_size = session.chunk_size,
            "Created upload session"
        );

        Ok((session, handle))
    }

    /// Live handle for `token`, reloading the durable row on a cache miss.
    ///
    /// Terminal sessions are returned too so callers can report their state.
    pub async fn handle(&self, token: &SessionToken) -> Result<Arc<SessionHandle>, TransferError> {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(handle) = sessions.get(token) {
                return Ok(handle.clone());
            }
        }

        let session = SessionRepository::new(&self.inner.db)
            .get(token)
            .await?
            .ok_or_else(|| TransferError::SessionNotFound(token.to_string()))?;

        let terminal = session.state.is_terminal();
        let handle = Arc::new(SessionHandle::new(session, None, false));
        if terminal {
            return Ok(handle);
        }

        let mut sessions = self.inner.sessions.write().await;
        // A concurrent reload may have won
        let handle = sessions.entry(*token).or_insert(handle).clone();

        tracing::info!(session_id = %token, "Reloaded upload session from database");
        Ok(handle)
    }

    /// Write the durable copy of a session
    pub async fn persist(&self, session: &UploadSession) -> Result<(), TransferError> {
        SessionRepository::new(&self.inner.db).save(session).await?;
        Ok(())
    }

    /// Drop a terminal session from the cache
    pub async fn evict(&self, token: &SessionToken) {
        let mut sessions = self.inner.sessions.write().await;
        sessions.remove(token);
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Cached live handles
    pub async fn cached(&self) -> Vec<(SessionToken, Arc<SessionHandle>)> {
        let sessions = self.inner.sessions.read().await;
        sessions.iter().map(|(t, h)| (*t, h.clone())).collect()
    }

    /// Durable tokens of non-terminal sessions whose deadline passed
    pub async fn stale_tokens(&self, now: DateTime<Utc>) -> Result<Vec<SessionToken>, TransferError> {
        Ok(SessionRepository::new(&self.inner.db).list_stale(now).await?)
    }

    /// Non-terminal sessions, from the database
    pub async fn list_active(&self) -> Result<Vec<UploadSession>, TransferError> {
        Ok(SessionRepository::new(&self.inner.db).list_active().await?)
    }

    /// Number of sessions held in memory
    pub async fn session_count(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions.len()
    }

    pub async fn count_in_state(&self, state: SessionState) -> Result<i64, TransferError> {
        Ok(SessionRepository::new(&self.inner.db)
            .count_by_state(state)
            .await?)
    }
}

// ============================================================================
// Tests
// ============================================================================
