//! Session registry: creates, looks up, and tears down sessions under a
//! configured ceiling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

use crate::session::{
    session_channel, SessionEvent, SessionHandle, SessionId, SessionStats, SessionStatus,
    StatsCell,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session limit reached")]
    LimitReached,
    #[error("session already registered")]
    Duplicate,
}

#[derive(Debug)]
pub struct SessionRegistry {
    max_sessions: usize,
    mailbox_capacity: usize,
    // Insert/remove serialize on this lock; the critical sections never
    // block or await.
    inner: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, mailbox_capacity: usize) -> Self {
        Self {
            max_sessions,
            mailbox_capacity,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session and create its mailbox, atomically under the
    /// ceiling.
    pub(crate) fn create(
        &self,
        id: SessionId,
        next_inbound: u64,
        next_outbound: u64,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>, Arc<StatsCell>), RegistryError>
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.contains_key(&id) {
            return Err(RegistryError::Duplicate);
        }
        if inner.len() >= self.max_sessions {
            return Err(RegistryError::LimitReached);
        }
        let stats = Arc::new(StatsCell::new(
            SessionStatus::Connecting,
            next_inbound,
            next_outbound,
        ));
        let (handle, rx) = session_channel(id.clone(), Arc::clone(&stats), self.mailbox_capacity);
        inner.insert(id, handle.clone());
        Ok((handle, rx, stats))
    }

    pub fn lookup(&self, id: &SessionId) -> Option<SessionHandle> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Ask a session to log out gracefully. The entry disappears once its
    /// task finishes.
    pub fn remove(&self, id: &SessionId) {
        if let Some(handle) = self.lookup(id) {
            handle.shutdown();
        }
    }

    /// Drop a finished session's entry. Called by the session task on exit.
    pub(crate) fn unregister(&self, id: &SessionId) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time operator view.
    pub fn snapshot(&self) -> Vec<SessionStats> {
        let handles: Vec<SessionHandle> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        handles.iter().map(SessionHandle::stats).collect()
    }

    /// Dispatch one timer tick to every session mailbox.
    pub(crate) fn tick_all(&self) {
        let handles: Vec<SessionHandle> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.tick();
        }
    }

    /// Fan out graceful logouts and wait until every session task has
    /// finished or the deadline passes. Session tasks bound their own
    /// logout wait, so expiry here means something is badly stuck.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let handles: Vec<SessionHandle> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        info!(sessions = handles.len(), "shutting down all sessions");
        for handle in &handles {
            handle.shutdown();
        }
        let expire = Instant::now() + deadline;
        while Instant::now() < expire {
            if handles.iter().all(SessionHandle::is_closed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
