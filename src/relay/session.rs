//! Session store - maps a user to their AI conversation continuation token.
//!
//! Sessions live in memory only. TTL and a maximum cardinality bound the
//! map; a background sweeper removes expired sessions for users who
//! never come back.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// One user's conversation state.
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user_id: i64,
    /// Opaque token from the AI backend. Empty until the backend assigns one.
    pub conversation_token: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub request_count: u64,
}

impl UserSession {
    fn new(user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            conversation_token: String::new(),
            created_at: now,
            last_accessed: now,
            request_count: 0,
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// User id missing or not a positive number.
    InvalidIdentifier(i64),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdentifier(id) => write!(f, "invalid user identifier: {id}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// In-memory session store with TTL and cardinality bounds.
pub struct SessionStore {
    ttl: chrono::Duration,
    max_sessions: usize,
    sessions: Mutex<HashMap<i64, UserSession>>,
}

impl SessionStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl.as_secs() as i64),
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the user's session, creating a fresh one if none exists
    /// or the stored one has outlived its TTL.
    pub fn get_or_create(&self, user_id: i64) -> Result<UserSession, SessionError> {
        if user_id <= 0 {
            return Err(SessionError::InvalidIdentifier(user_id));
        }

        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");

        if let Some(session) = sessions.get_mut(&user_id) {
            if now.signed_duration_since(session.created_at) <= self.ttl {
                session.last_accessed = now;
                return Ok(session.clone());
            }
            debug!("Session for user {user_id} expired, recreating");
            sessions.remove(&user_id);
        }

        // Make room before inserting: evict the coldest session.
        if sessions.len() >= self.max_sessions {
            let coldest = sessions
                .values()
                .min_by_key(|s| s.last_accessed)
                .map(|s| s.user_id);
            if let Some(victim) = coldest {
                debug!("Session cap reached, evicting user {victim}");
                sessions.remove(&victim);
            }
        }

        let session = UserSession::new(user_id);
        sessions.insert(user_id, session.clone());
        Ok(session)
    }

    /// Record a new continuation token for the user.
    ///
    /// An empty token is ignored: a failed or inconclusive AI call must
    /// never clear a previously known token.
    pub fn update(&self, user_id: i64, conversation_token: &str) {
        if conversation_token.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");

        match sessions.get_mut(&user_id) {
            Some(session) => {
                session.conversation_token = conversation_token.to_string();
                session.last_accessed = now;
                session.request_count += 1;
            }
            None => {
                // Session was evicted while the AI call was in flight.
                // Last write wins: recreate it carrying the new token.
                let mut session = UserSession::new(user_id);
                session.conversation_token = conversation_token.to_string();
                session.request_count = 1;
                sessions.insert(user_id, session);
            }
        }
    }

    /// Remove every TTL-expired session. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session store lock poisoned");
        let before = sessions.len();
        let ttl = self.ttl;
        sessions.retain(|_, s| now.signed_duration_since(s.created_at) <= ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic sweeper task. The returned handle aborts the
    /// task when dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> SweeperHandle {
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    info!("Session sweep removed {removed} expired session(s)");
                }
            }
        });
        SweeperHandle { handle }
    }
}

/// Handle for a background sweeper task. Dropping it stops the task.
pub struct SweeperHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    pub(crate) fn new(handle: tokio::task::JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_reuse() {
        let store = SessionStore::new(Duration::from_secs(3600), 10);
        let first = store.get_or_create(7).unwrap();
        assert_eq!(first.conversation_token, "");
        assert_eq!(first.request_count, 0);

        store.update(7, "abc");
        let second = store.get_or_create(7).unwrap();
        assert_eq!(second.conversation_token, "abc");
        assert_eq!(second.request_count, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalid_identifier() {
        let store = SessionStore::new(Duration::from_secs(3600), 10);
        assert!(matches!(
            store.get_or_create(0),
            Err(SessionError::InvalidIdentifier(0))
        ));
        assert!(store.get_or_create(-5).is_err());
    }

    #[test]
    fn test_empty_token_never_clears() {
        let store = SessionStore::new(Duration::from_secs(3600), 10);
        store.get_or_create(7).unwrap();
        store.update(7, "abc");
        store.update(7, "");
        let session = store.get_or_create(7).unwrap();
        assert_eq!(session.conversation_token, "abc");
    }

    #[test]
    fn test_cap_evicts_coldest() {
        let store = SessionStore::new(Duration::from_secs(3600), 3);
        store.get_or_create(1).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.get_or_create(2).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.get_or_create(3).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        // Touch user 1 so user 2 is now the coldest.
        store.get_or_create(1).unwrap();
        store.get_or_create(4).unwrap();

        assert_eq!(store.len(), 3);
        let sessions = store.sessions.lock().unwrap();
        assert!(sessions.contains_key(&1));
        assert!(!sessions.contains_key(&2));
        assert!(sessions.contains_key(&3));
        assert!(sessions.contains_key(&4));
    }

    #[test]
    fn test_ttl_expiry_recreates() {
        let store = SessionStore::new(Duration::from_secs(0), 10);
        store.get_or_create(7).unwrap();
        store.update(7, "abc");
        std::thread::sleep(Duration::from_millis(1100));

        let fresh = store.get_or_create(7).unwrap();
        assert_eq!(fresh.conversation_token, "");
        assert_eq!(fresh.request_count, 0);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let store = SessionStore::new(Duration::from_secs(0), 10);
        store.get_or_create(1).unwrap();
        store.get_or_create(2).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(store.sweep(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_keeps_live_sessions() {
        let store = SessionStore::new(Duration::from_secs(3600), 10);
        store.get_or_create(1).unwrap();
        assert_eq!(store.sweep(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_task_runs() {
        let store = Arc::new(SessionStore::new(Duration::from_secs(0), 10));
        store.get_or_create(1).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let _sweeper = store.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.is_empty());
    }
}
