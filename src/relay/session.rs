//! # Relay Session Registry
//!
//! Bookkeeping for live relay sessions. Each browser connection gets one
//! [`RelaySession`] record, identified by a UUID, for as long as its bridge runs.
//! The registry is only read by the health and metrics endpoints; the data path
//! of a session never touches another session's record.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: browser connected, upstream connection being established
//! 2. **Open**: both sockets up, frames flowing
//! 3. **Closed**: either side went away; the record is removed right after
//!
//! Removal is tied to [`SessionGuard`]'s `Drop`, so a session is released on
//! every exit path, including panics in the relay task.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::RelayError;

/// Current status of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Open,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Open => "open",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Frame and byte counters for one session, one pair per direction.
///
/// Each direction is written by exactly one relay task.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_up: AtomicU64,
    bytes_up: AtomicU64,
    frames_down: AtomicU64,
    bytes_down: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_up: u64,
    pub bytes_up: u64,
    pub frames_down: u64,
    pub bytes_down: u64,
}

impl SessionStats {
    pub fn record_uplink(&self, bytes: usize) {
        self.frames_up.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_downlink(&self, bytes: usize) {
        self.frames_down.fetch_add(1, Ordering::Relaxed);
        self.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_up: self.frames_up.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            frames_down: self.frames_down.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

impl std::ops::AddAssign for StatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.frames_up += other.frames_up;
        self.bytes_up += other.bytes_up;
        self.frames_down += other.frames_down;
        self.bytes_down += other.bytes_down;
    }
}

/// One browser connection paired with one upstream connection.
#[derive(Debug)]
pub struct RelaySession {
    pub id: Uuid,
    /// Browser address as reported by the connection info
    pub peer: Option<String>,
    pub created_at: DateTime<Utc>,
    opened_at: RwLock<Option<DateTime<Utc>>>,
    status: RwLock<SessionStatus>,
    stats: Arc<SessionStats>,
}

impl RelaySession {
    fn new(peer: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            created_at: Utc::now(),
            opened_at: RwLock::new(None),
            status: RwLock::new(SessionStatus::Connecting),
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        *self.opened_at.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }
}

/// Session lifecycle counters since startup.
#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug)]
struct RegistryInner {
    sessions: RwLock<HashMap<Uuid, Arc<RelaySession>>>,
    max_concurrent_sessions: usize,
    counters: Counters,
    /// Traffic of sessions that have already ended
    retired: RwLock<StatsSnapshot>,
}

/// Tracks every live relay session.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                max_concurrent_sessions,
                counters: Counters::default(),
                retired: RwLock::new(StatsSnapshot::default()),
            }),
        }
    }

    /// Register a new session, or refuse it when the registry is full.
    pub fn open(&self, peer: Option<String>) -> Result<SessionGuard, RelayError> {
        let mut sessions = self.inner.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.inner.max_concurrent_sessions {
            self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::SessionLimit(self.inner.max_concurrent_sessions));
        }

        let session = Arc::new(RelaySession::new(peer));
        sessions.insert(session.id, session.clone());
        self.inner.counters.started.fetch_add(1, Ordering::Relaxed);

        Ok(SessionGuard {
            registry: self.clone(),
            session,
            failed: false,
        })
    }

    #[cfg(test)]
    pub fn get(&self, id: &Uuid) -> Option<Arc<RelaySession>> {
        let sessions = self.inner.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(id).cloned()
    }

    /// Live sessions, oldest first.
    pub fn sessions(&self) -> Vec<Arc<RelaySession>> {
        let sessions = self.inner.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = sessions.values().cloned().collect();
        list.sort_by_key(|session| session.created_at);
        list
    }

    pub fn active_count(&self) -> usize {
        let sessions = self.inner.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.max_concurrent_sessions
    }

    fn release(&self, session: &RelaySession, failed: bool) {
        session.set_status(SessionStatus::Closed);

        let removed = {
            let mut sessions = self.inner.sessions.write().unwrap_or_else(PoisonError::into_inner);
            sessions.remove(&session.id).is_some()
        };
        if !removed {
            return;
        }

        *self.inner.retired.write().unwrap_or_else(PoisonError::into_inner) += session.stats.snapshot();
        let counter = if failed {
            &self.inner.counters.failed
        } else {
            &self.inner.counters.completed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %session.id, failed, "Session released");
    }

    /// Aggregate view for the health and metrics endpoints.
    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.inner.sessions.read().unwrap_or_else(PoisonError::into_inner);

        let mut status_counts = HashMap::new();
        let mut traffic = *self.inner.retired.read().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            *status_counts.entry(session.status().as_str()).or_insert(0) += 1;
            traffic += session.stats.snapshot();
        }

        let counters = &self.inner.counters;
        RegistrySummary {
            active_sessions: sessions.len(),
            max_sessions: self.inner.max_concurrent_sessions,
            status_counts,
            sessions_started: counters.started.load(Ordering::Relaxed),
            sessions_completed: counters.completed.load(Ordering::Relaxed),
            sessions_failed: counters.failed.load(Ordering::Relaxed),
            sessions_rejected: counters.rejected.load(Ordering::Relaxed),
            traffic,
        }
    }
}

/// Summary of registry state.
#[derive(Debug, Clone)]
pub struct RegistrySummary {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub status_counts: HashMap<&'static str, usize>,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_rejected: u64,
    /// Frames and bytes relayed by live and finished sessions together
    pub traffic: StatsSnapshot,
}

/// Owned handle to a registered session. Dropping it releases the session.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    session: Arc<RelaySession>,
    failed: bool,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn session(&self) -> &Arc<RelaySession> {
        &self.session
    }

    /// Upstream is connected; frames may flow.
    pub fn mark_open(&self) {
        *self.session.opened_at.write().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.session.set_status(SessionStatus::Open);
    }

    /// Count this session as failed instead of completed when it is released.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.session, self.failed);
    }
}
