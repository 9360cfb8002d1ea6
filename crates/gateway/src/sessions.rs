//! Registry of in-flight transfer sessions
//!
//! Every WriteObject/ReadObject call holds a [`SessionGuard`] for as long as
//! it streams. Shutdown calls [`SessionRegistry::quiesce`] to stop admitting
//! new transfers and wait for the running ones to finish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Write,
    Read,
}

/// One active transfer
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub kind: SessionKind,
    pub key: String,
    pub started_at: DateTime<Utc>,
}

/// Shared handle to the registry
pub type SessionRegistryHandle = Arc<SessionRegistry>;

/// Tracks active sessions for coordinated shutdown
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionInfo>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    drained: Notify,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            drained: Notify::new(),
        }
    }

    /// Register a session, or `None` once the registry is quiescing
    pub fn begin(self: &Arc<Self>, kind: SessionKind, key: &str) -> Option<SessionGuard> {
        if !self.is_accepting() {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            SessionInfo {
                id,
                kind,
                key: key.to_string(),
                started_at: Utc::now(),
            },
        );

        let guard = SessionGuard {
            registry: self.clone(),
            id,
        };

        // quiesce may have started between the check and the insert
        if !self.is_accepting() {
            return None;
        }

        debug!(session = id, ?kind, key, "Session started");
        Some(guard)
    }

    /// Number of active sessions
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    /// Copy of every active session
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop admitting sessions and wait up to `grace` for active ones
    ///
    /// Returns `true` if every session finished in time.
    pub async fn quiesce(&self, grace: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + grace;

        info!(active = self.active(), grace_ms = grace.as_millis() as u64, "Draining sessions");

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.sessions.is_empty() {
                info!("All sessions drained");
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    remaining = self.active(),
                    "Drain timeout elapsed with sessions still active"
                );
                return false;
            }
        }
    }

    fn finish(&self, id: u64) {
        if let Some((_, info)) = self.sessions.remove(&id) {
            debug!(session = id, kind = ?info.kind, key = %info.key, "Session finished");
        }
        if self.sessions.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

/// Removes its session from the registry when dropped
pub struct SessionGuard {
    registry: SessionRegistryHandle,
    id: u64,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.finish(self.id);
    }
}
