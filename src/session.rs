use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{errors::ProcessError, types::BatchOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub start_index: usize,
    pub end_index: usize,
    pub batch_size: usize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed_count: usize,
    pub failed_count: usize,
    pub persist_failed_count: usize,
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(id: &str, start_index: usize, end_index: usize, batch_size: usize) -> Self {
        Session {
            id: id.into(),
            start_index,
            end_index,
            batch_size,
            status: SessionStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            processed_count: 0,
            failed_count: 0,
            persist_failed_count: 0,
            last_error: None,
        }
    }

    pub fn total_urls(&self) -> usize {
        self.end_index - self.start_index + 1
    }
}

/// Point-in-time copy of a session, safe to hand out of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub status: SessionStatus,
    pub start_index: usize,
    pub end_index: usize,
    pub batch_size: usize,
    pub total_urls: usize,
    pub processed_count: usize,
    pub failed_count: usize,
    pub persist_failed_count: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&Session> for SessionView {
    fn from(s: &Session) -> Self {
        SessionView {
            id: s.id.clone(),
            status: s.status,
            start_index: s.start_index,
            end_index: s.end_index,
            batch_size: s.batch_size,
            total_urls: s.total_urls(),
            processed_count: s.processed_count,
            failed_count: s.failed_count,
            persist_failed_count: s.persist_failed_count,
            created_at: s.created_at,
            finished_at: s.finished_at,
            last_error: s.last_error.clone(),
        }
    }
}

type Entry = Arc<Mutex<Session>>;

// a panicking worker must not take the session's bookkeeping down with it
fn lock(entry: &Entry) -> MutexGuard<'_, Session> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide table of sessions. The map lock is only held to find or
/// insert an entry; every counter update locks that one entry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    /// Fails with `DuplicateSession` while another session with the same id
    /// is still running. A terminal entry with that id is replaced.
    pub fn register(&self, session: Session) -> Result<SessionHandle, ProcessError> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = sessions.get(&session.id) {
            if !lock(existing).status.is_terminal() {
                return Err(ProcessError::DuplicateSession(session.id));
            }
        }

        let id = session.id.clone();
        let entry = Arc::new(Mutex::new(session));
        sessions.insert(id.clone(), entry.clone());
        debug!("[session {}] registered", id);

        Ok(SessionHandle { id, entry })
    }

    fn entry(&self, id: &str) -> Option<Entry> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn get(&self, id: &str) -> Option<SessionView> {
        self.entry(id).map(|e| SessionView::from(&*lock(&e)))
    }

    /// Applies `mutator` under the entry's lock. Returns false for unknown ids.
    pub fn update<F>(&self, id: &str, mutator: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        match self.entry(id) {
            Some(e) => {
                mutator(&mut lock(&e));
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<SessionView> {
        let entries: Vec<Entry> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut views: Vec<SessionView> = entries
            .iter()
            .map(|e| SessionView::from(&*lock(e)))
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        views
    }

    pub fn list_active(&self) -> Vec<SessionView> {
        self.list()
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.list_active().len()
    }

    /// Removes a terminal session. Running sessions stay put and `None` is
    /// returned.
    pub fn retire(&self, id: &str) -> Option<SessionView> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let view = SessionView::from(&*lock(sessions.get(id)?));
        if !view.status.is_terminal() {
            return None;
        }
        sessions.remove(id);
        debug!("[session {}] retired", id);
        Some(view)
    }

    pub fn retire_terminal(&self) -> usize {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, e| !lock(e).status.is_terminal());
        before - sessions.len()
    }
}

/// Handle given to every worker of one session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    entry: Entry,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Folds one url outcome into the counters. Terminal sessions are frozen
    /// and ignore late outcomes.
    pub fn record(&self, outcome: &BatchOutcome) {
        let mut session = lock(&self.entry);
        if session.status.is_terminal() {
            return;
        }
        if outcome.success {
            session.processed_count += 1;
        } else {
            session.failed_count += 1;
            if let Some(e) = &outcome.error {
                session.last_error = Some(format!("{}: {}", outcome.url, e));
            }
        }
    }

    pub fn record_persist_failure(&self, count: usize, error: &str) {
        let mut session = lock(&self.entry);
        session.persist_failed_count += count;
        session.last_error = Some(error.into());
    }

    pub fn finish(&self, status: SessionStatus) {
        let mut session = lock(&self.entry);
        session.status = status;
        session.finished_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> SessionView {
        SessionView::from(&*lock(&self.entry))
    }

    /// Guard that fails the session if it is dropped while still running.
    pub fn guard(&self) -> FinishGuard {
        FinishGuard {
            handle: self.clone(),
        }
    }
}

/// Held for the lifetime of a `process` call. When that future is dropped
/// before the session was finished, the session ends `Failed` instead of
/// staying `Running` and blocking its id.
#[derive(Debug)]
pub struct FinishGuard {
    handle: SessionHandle,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut session = lock(&self.handle.entry);
        if session.status.is_terminal() {
            return;
        }
        session.status = SessionStatus::Failed;
        session.finished_at = Some(Utc::now());
        session.last_error = Some("session abandoned before commit".into());
        warn!("[session {}] abandoned before commit", session.id);
    }
}
