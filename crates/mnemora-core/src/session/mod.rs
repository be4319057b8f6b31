//! Session Manager: tracks open conversational sessions and their
//! inactivity-based closure.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::model::Session;

/// In-memory session registry. Sessions are lightweight bookkeeping, not
/// durable entities Retrieval or Storage depend on for correctness.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    inactivity_timeout: Duration,
}

impl SessionManager {
    pub fn new(inactivity_timeout_s: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            inactivity_timeout: Duration::seconds(inactivity_timeout_s as i64),
        }
    }

    fn sessions_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new session or refresh `last_activity_at` on an existing one.
    pub fn open_or_refresh(&self, session_id: &str) -> Session {
        let mut sessions = self.sessions_lock();
        let now = Utc::now();
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| Session {
            session_id: session_id.to_string(),
            opened_at: now,
            last_activity_at: now,
            closed_at: None,
        });
        session.last_activity_at = now;
        session.closed_at = None;
        session.clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions_lock().get(session_id).cloned()
    }

    /// Close every session whose last activity is older than the
    /// configured inactivity timeout. Returns the ids closed.
    pub fn close_inactive(&self) -> Vec<String> {
        let mut sessions = self.sessions_lock();
        let now = Utc::now();
        let mut closed = vec![];
        for session in sessions.values_mut() {
            if session.closed_at.is_none() && now.signed_duration_since(session.last_activity_at) >= self.inactivity_timeout {
                session.closed_at = Some(now);
                closed.push(session.session_id.clone());
            }
        }
        closed
    }

    fn is_stale(last_activity_at: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
        now.signed_duration_since(last_activity_at) >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_or_refresh_creates_then_refreshes() {
        let mgr = SessionManager::new(1800);
        let s1 = mgr.open_or_refresh("s1");
        let s2 = mgr.open_or_refresh("s1");
        assert_eq!(s1.session_id, s2.session_id);
        assert_eq!(s1.opened_at, s2.opened_at);
    }

    #[test]
    fn close_inactive_respects_timeout() {
        let mgr = SessionManager::new(0);
        mgr.open_or_refresh("s1");
        std::thread::sleep(std::time::Duration::from_millis(10));
        let closed = mgr.close_inactive();
        assert_eq!(closed, vec!["s1".to_string()]);
    }

    #[test]
    fn is_stale_boundary() {
        let now = Utc::now();
        assert!(SessionManager::is_stale(now - Duration::seconds(30), now, Duration::seconds(30)));
        assert!(!SessionManager::is_stale(now - Duration::seconds(10), now, Duration::seconds(30)));
    }
}
