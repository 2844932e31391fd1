//! Session management.
//!
//! Owns every live session, indexed both by session-id (primary) and by
//! user-id (for the single-session-per-id invariant and admin kicks). Holds
//! the single `Remove` path so teardown fan-out (Matchmaker/Tracker/Match/
//! Party) always runs, even on a slow-consumer close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::protocol::Envelope;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[inline]
pub fn generate_session_id() -> u64 {
    SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Authenticated,
    Disconnecting,
}

/// Reason a session was closed, carried into the teardown fan-out and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Network,
    IdleTimeout,
    Logout,
    ReplacedBySameUser,
    AdminKick,
    TooSlow,
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Network => "network",
            CloseReason::IdleTimeout => "idle-timeout",
            CloseReason::Logout => "logout",
            CloseReason::ReplacedBySameUser => "session-id-reuse",
            CloseReason::AdminKick => "admin-kick",
            CloseReason::TooSlow => "too-slow",
            CloseReason::ServerShutdown => "server-shutdown",
        }
    }
}

/// A live session. Outbound writes are serialized through a bounded queue;
/// a full queue is the slow-consumer signal (§4.1, §5).
pub struct Session {
    pub id: u64,
    pub user_id: String,
    pub username: Option<String>,
    pub lang: String,
    pub addr: SocketAddr,
    pub state: SessionState,
    pub expires_at: u64,
    pub created_at: Instant,
    pub last_heartbeat: Instant,
    pub vars: DashMap<String, String>,
    outbound_tx: Sender<Envelope>,
    outbound_rx: Receiver<Envelope>,
}

impl Session {
    pub fn new(
        user_id: String,
        username: Option<String>,
        addr: SocketAddr,
        expires_at: u64,
        queue_size: usize,
    ) -> Self {
        let now = Instant::now();
        let (outbound_tx, outbound_rx) = bounded(queue_size.max(1));
        Self {
            id: generate_session_id(),
            user_id,
            username,
            lang: "en".to_string(),
            addr,
            state: SessionState::Connecting,
            expires_at,
            created_at: now,
            last_heartbeat: now,
            vars: DashMap::new(),
            outbound_tx,
            outbound_rx,
        }
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn is_stale(&self, timeout_secs: u64) -> bool {
        self.last_heartbeat.elapsed().as_secs() > timeout_secs
    }

    pub fn is_expired(&self, now_unix: u64) -> bool {
        self.expires_at != 0 && now_unix >= self.expires_at
    }

    /// Enqueues an outbound envelope. A full queue is the slow-consumer
    /// signal: the caller should close the session with `CloseReason::TooSlow`.
    pub fn try_send(&self, envelope: Envelope) -> std::result::Result<(), TrySendError<Envelope>> {
        self.outbound_tx.try_send(envelope)
    }

    pub fn outbound(&self) -> &Receiver<Envelope> {
        &self.outbound_rx
    }

    pub fn presence(&self) -> Presence {
        Presence {
            session_id: self.id,
            user_id: self.user_id.clone(),
            username: self.username.clone().unwrap_or_default(),
        }
    }
}

/// Presence info carried into Tracker/MessageRouter fan-out.
#[derive(Debug, Clone)]
pub struct Presence {
    pub session_id: u64,
    pub user_id: String,
    pub username: String,
}

impl From<&Session> for Presence {
    fn from(session: &Session) -> Self {
        session.presence()
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(u64),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) => ErrorCode::Unauthorized,
        }
    }
}

type Result<T> = std::result::Result<T, SessionError>;

/// Side-effects fired by `SessionRegistry::remove`. Matchmaker, Tracker,
/// MatchRegistry and PartyRegistry each implement this and register
/// themselves so Remove stays idempotent and never leaves partial state
/// in any other registry (§4.1).
pub trait TeardownHook: Send + Sync {
    fn on_session_removed(&self, session_id: u64);
}

/// Session registry: owns every live session, indexed by id and by user.
pub struct SessionRegistry {
    sessions: DashMap<u64, Session>,
    by_user: DashMap<String, Vec<u64>>,
    teardown_hooks: parking_lot::RwLock<Vec<Arc<dyn TeardownHook>>>,
    queue_size: usize,
}

impl SessionRegistry {
    pub fn new(queue_size: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            by_user: DashMap::new(),
            teardown_hooks: parking_lot::RwLock::new(Vec::new()),
            queue_size,
        }
    }

    pub fn register_teardown_hook(&self, hook: Arc<dyn TeardownHook>) {
        self.teardown_hooks.write().push(hook);
    }

    /// Add(session): enforces the single-session-per-user-id invariant by
    /// closing any prior session for the same user before inserting.
    pub fn add(
        &self,
        user_id: String,
        username: Option<String>,
        addr: SocketAddr,
        expires_at: u64,
    ) -> u64 {
        if let Some(existing_ids) = self.by_user.get(&user_id).map(|r| r.clone()) {
            for prior in existing_ids {
                debug!(session_id = prior, %user_id, "replacing prior session for user");
                self.remove(prior, CloseReason::ReplacedBySameUser);
            }
        }

        let session = Session::new(user_id.clone(), username, addr, expires_at, self.queue_size);
        let id = session.id;
        self.sessions.insert(id, session);
        self.by_user.entry(user_id).or_default().push(id);
        id
    }

    pub fn get(&self, id: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, Session>> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&self, id: u64) -> Option<dashmap::mapref::one::RefMut<'_, u64, Session>> {
        self.sessions.get_mut(&id)
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<u64> {
        self.by_user.get(user_id).map(|r| r.clone()).unwrap_or_default()
    }

    pub fn touch(&self, id: u64) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.touch();
        }
    }

    /// Remove(session): idempotent; runs the teardown fan-out regardless of
    /// whether the session was actually present, so repeated close calls
    /// (network error racing with explicit logout) are harmless.
    pub fn remove(&self, id: u64, reason: CloseReason) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            if let Some(mut ids) = self.by_user.get_mut(&session.user_id) {
                ids.retain(|&sid| sid != id);
            }
            debug!(session_id = id, reason = reason.as_str(), "session removed");
        }
        for hook in self.teardown_hooks.read().iter() {
            hook.on_session_removed(id);
        }
    }

    /// Attempts to send; on a full outbound queue, closes the session with
    /// `too-slow` per the slow-consumer policy (§4.1, §5) and returns an error.
    pub fn send(&self, id: u64, envelope: Envelope) -> Result<()> {
        let full = {
            let session = self.sessions.get(&id).ok_or(SessionError::NotFound(id))?;
            matches!(session.try_send(envelope), Err(TrySendError::Full(_)))
        };
        if full {
            warn!(session_id = id, "outbound queue saturated, closing session");
            self.remove(id, CloseReason::TooSlow);
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Remove stale sessions (idle timeout), returns removed IDs.
    pub fn cleanup_stale(&self, timeout_secs: u64) -> Vec<u64> {
        let stale: Vec<u64> = self
            .sessions
            .iter()
            .filter(|r| r.is_stale(timeout_secs))
            .map(|r| *r.key())
            .collect();
        for id in &stale {
            self.remove(*id, CloseReason::IdleTimeout);
        }
        stale
    }

    /// Stop(): close every session; blocks until outbound queues drain or a
    /// bounded timeout elapses (§4.1).
    pub fn stop(&self, drain_timeout: Duration) {
        let ids: Vec<u64> = self.sessions.iter().map(|r| *r.key()).collect();
        let deadline = Instant::now() + drain_timeout;
        for id in &ids {
            if let Some(session) = self.sessions.get(id) {
                while !session.outbound().is_empty() && Instant::now() < deadline {
                    std::thread::yield_now();
                }
            }
        }
        for id in ids {
            self.remove(id, CloseReason::ServerShutdown);
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn test_session_creation() {
        let registry = SessionRegistry::new(8);
        let id = registry.add("user-1".into(), None, addr(), 0);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn test_single_session_per_user_invariant() {
        let registry = SessionRegistry::new(8);
        let first = registry.add("user-1".into(), None, addr(), 0);
        let second = registry.add("user-1".into(), None, addr(), 0);

        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_remove_is_idempotent_and_fans_out() {
        struct CountingHook(Arc<AtomicUsize>);
        impl TeardownHook for CountingHook {
            fn on_session_removed(&self, _session_id: u64) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = SessionRegistry::new(8);
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register_teardown_hook(Arc::new(CountingHook(counter.clone())));

        let id = registry.add("user-1".into(), None, addr(), 0);
        registry.remove(id, CloseReason::Logout);
        registry.remove(id, CloseReason::Logout);

        assert_eq!(registry.count(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_slow_consumer_closes_session() {
        let registry = SessionRegistry::new(1);
        let id = registry.add("user-1".into(), None, addr(), 0);

        registry.send(id, Envelope::ping()).unwrap();
        registry.send(id, Envelope::ping()).unwrap();

        assert!(registry.get(id).is_none());
    }
}
