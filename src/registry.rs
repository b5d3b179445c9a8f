//! Session registry: SSH session id → authenticated identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use rand::Rng;

/// Opaque identifier for one SSH connection, minted at accept time and
/// stable for the connection's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Identity recorded for a session at public-key auth time.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    /// Canonical authorized-keys line of the presented key.
    pub key_line: String,
    /// Unique user id, either assigned by the auth hook or derived from
    /// the key.
    pub user_id: String,
}

/// Thread-safe map of live sessions. Entries are inserted by the public-key
/// callback and removed at session end.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl SessionRegistry {
    /// Record an authenticated session.
    ///
    /// A session id is registered at most once for its lifetime; a
    /// duplicate insertion is a programmer error.
    pub fn insert(&self, id: SessionId, record: SessionRecord) {
        let previous = self.sessions.lock().unwrap().insert(id, record);
        assert!(previous.is_none(), "session should be unique");
    }

    pub fn get(&self, id: SessionId) -> Option<SessionRecord> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: SessionId) {
        self.sessions.lock().unwrap().remove(&id);
    }
}
