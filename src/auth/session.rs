//! OAuth rendezvous sessions.
//!
//! Short-lived in-memory records pairing a CLI-initiated authorization
//! with its provider callback. Session ids are random 16-byte values;
//! the state parameter is a 32-byte CSRF nonce. Expired entries are
//! swept opportunistically on read.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;

/// Session lifetime.
const SESSION_LIFETIME_MINUTES: i64 = 30;

/// One in-flight OAuth handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// CSRF nonce echoed back by the provider.
    pub state: String,
    /// Filled when the callback completes.
    pub auth_result: Option<serde_json::Value>,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: random_hex(16),
            created_at: now,
            expires_at: now + Duration::minutes(SESSION_LIFETIME_MINUTES),
            state: random_hex(32),
            auth_result: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// In-memory session table guarded by a mutex.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session and returns a copy of it.
    pub fn create(&self) -> Session {
        let session = Session::new();
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        sessions.insert(session.session_id.clone(), session.clone());
        session
    }

    /// Looks up a live session, sweeping expired entries first.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        sessions.retain(|_, session| !session.is_expired());
        sessions.get(session_id).cloned()
    }

    /// Completes a session's handshake.
    ///
    /// The provider-echoed state must match the session's CSRF nonce;
    /// on mismatch nothing is recorded and false is returned.
    pub fn complete(&self, session_id: &str, state: &str, result: serde_json::Value) -> bool {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        sessions.retain(|_, session| !session.is_expired());
        match sessions.get_mut(session_id) {
            Some(session) if session.state == state => {
                session.auth_result = Some(result);
                true
            }
            _ => false,
        }
    }

    /// Finds the session owning a state nonce (for callbacks that carry
    /// only the state).
    pub fn find_by_state(&self, state: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        sessions.retain(|_, session| !session.is_expired());
        sessions
            .values()
            .find(|session| session.state == state)
            .cloned()
    }

    /// Live session count (after sweeping).
    pub fn len(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        sessions.retain(|_, session| !session.is_expired());
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buffer);
    buffer.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_and_get() {
        let table = SessionTable::new();
        let session = table.create();
        assert_eq!(session.session_id.len(), 32); // 16 bytes hex
        assert_eq!(session.state.len(), 64); // 32 bytes hex

        let fetched = table.get(&session.session_id).unwrap();
        assert_eq!(fetched.state, session.state);
        assert!(fetched.auth_result.is_none());
    }

    #[test]
    fn test_complete_with_matching_state() {
        let table = SessionTable::new();
        let session = table.create();
        assert!(table.complete(&session.session_id, &session.state, json!({"team": "T01"})));

        let fetched = table.get(&session.session_id).unwrap();
        assert_eq!(fetched.auth_result.unwrap()["team"], json!("T01"));
    }

    #[test]
    fn test_mismatched_state_records_nothing() {
        let table = SessionTable::new();
        let session = table.create();
        assert!(!table.complete(&session.session_id, "forged-state", json!({"team": "evil"})));

        let fetched = table.get(&session.session_id).unwrap();
        assert!(fetched.auth_result.is_none());
    }

    #[test]
    fn test_expired_sessions_swept_on_read() {
        let table = SessionTable::new();
        let session = table.create();
        {
            let mut sessions = table.sessions.lock().unwrap();
            let entry = sessions.get_mut(&session.session_id).unwrap();
            entry.expires_at = Utc::now() - Duration::minutes(1);
        }
        assert!(table.get(&session.session_id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_find_by_state() {
        let table = SessionTable::new();
        let session = table.create();
        let found = table.find_by_state(&session.state).unwrap();
        assert_eq!(found.session_id, session.session_id);
        assert!(table.find_by_state("nope").is_none());
    }

    #[test]
    fn test_session_ids_unique() {
        let table = SessionTable::new();
        let a = table.create();
        let b = table.create();
        assert_ne!(a.session_id, b.session_id);
        assert_ne!(a.state, b.state);
    }
}
