//! Ephemeral pending-MFA-session store.
//!
//! Lives only in process memory: a session is created when a login passes
//! the password check but still needs a second factor, and is destroyed by
//! the matching verification or by TTL expiry. Expiry is lazy (checked on
//! take) plus a retain sweep on every insert, so no per-session timer is
//! ever spawned and an expired session is unusable even before it is
//! physically removed.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Login context captured between the password check and MFA verification.
#[derive(Clone, Debug)]
pub struct PendingMfaSession {
    pub account_id: Uuid,
    pub device_fingerprint: String,
    pub ip_address: String,
    pub user_agent: String,
    created_at: Instant,
}

pub struct PendingSessions {
    ttl: Duration,
    sessions: Mutex<HashMap<Uuid, PendingMfaSession>>,
}

impl PendingSessions {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Store a new pending session and return its opaque id.
    pub async fn insert(
        &self,
        account_id: Uuid,
        device_fingerprint: String,
        ip_address: String,
        user_agent: String,
    ) -> Uuid {
        let session_id = Uuid::new_v4();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        sessions.insert(
            session_id,
            PendingMfaSession {
                account_id,
                device_fingerprint,
                ip_address,
                user_agent,
                created_at: Instant::now(),
            },
        );
        session_id
    }

    /// Atomically remove and return the session, if present and unexpired.
    ///
    /// Single-use by construction: a concurrent duplicate take observes the
    /// entry as gone.
    pub async fn take(&self, session_id: Uuid) -> Option<PendingMfaSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(&session_id) {
            if session.created_at.elapsed() < self.ttl {
                return Some(session);
            }
        }
        None
    }

    /// Re-insert a session taken by a verification attempt that failed the
    /// code check, preserving its original creation time so the TTL keeps
    /// running.
    pub async fn restore(&self, session_id: Uuid, session: PendingMfaSession) {
        let mut sessions = self.sessions.lock().await;
        if session.created_at.elapsed() < self.ttl {
            sessions.insert(session_id, session);
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
