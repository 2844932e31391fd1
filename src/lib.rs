//! # kaosnet
//!
//! Realtime session, presence and match core for game backends: session
//! handshake and heartbeat tracking, chat channels, authoritative matches
//! on dedicated executor threads, skill-based matchmaking with parties,
//! and a unified leaderboard/tournament model with scheduled resets.
//!
//! ## Modules
//!
//! - **Sessions**: [`session`] — per-connection state, single-session-per-user,
//!   teardown fan-out.
//! - **Presence**: [`tracker`], [`router`] — stream subscriptions and diff
//!   broadcast.
//! - **Protocol**: [`protocol`], [`transport`] — wire envelopes over a
//!   WebSocket framing.
//! - **Pipeline**: [`server`] — hook-wrapped request dispatch and runtime
//!   orchestration.
//! - **Chat**: [`chat`] — channel message history.
//! - **Matches**: [`match_handler`] — authoritative match executors.
//! - **Matchmaking & parties**: [`matchmaker`], [`party`].
//! - **Status**: [`status`] — online/status-text subscriptions.
//! - **Leaderboards & tournaments**: [`leaderboard`], [`scheduler`].
//! - **Hooks**: [`hooks`] — before/after interception points.
//! - **Auth**: [`auth`] — session handshake token verification.
//! - **Config**: [`config`].
//! - **Logging**: [`logging`] — `tracing-subscriber` init helper.

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod hooks;
pub mod leaderboard;
pub mod logging;
pub mod match_handler;
pub mod matchmaker;
pub mod party;
pub mod protocol;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod status;
pub mod tracker;
pub mod transport;

pub use auth::{SessionClaims, TokenService};
pub use config::Config;
pub use error::{CoreError, ErrorCode};
pub use hooks::{AfterHook, BeforeHook, BeforeHookResult, HookContext, HookOperation, HookRegistry};
pub use leaderboard::{LeaderboardCache, LeaderboardConfig, LeaderboardRecord, ScoreOperator, SortOrder};
pub use match_handler::{
    MatchContext, MatchDispatcher, MatchError, MatchHandle, MatchHandler, MatchHandlerRegistry,
    MatchInit, MatchLifecycle, MatchMessage, MatchPresence, MatchRegistry, MatchState,
};
pub use matchmaker::{Matchmaker, MatchmakerMatch, PropertyValue, RendezvousTokens, Ticket};
pub use party::{Party, PartyError, PartyRegistry};
pub use protocol::{Envelope, Payload, PresenceDiff, PresenceEvent, StreamMode};
pub use router::MessageRouter;
pub use scheduler::{LeaderboardScheduler, SchedulerEvent};
pub use server::{Pipeline, Runtime, RuntimeDispatcher};
pub use session::{CloseReason, Presence, Session, SessionRegistry, SessionState};
pub use status::StatusRegistry;
pub use tracker::{DiffEvent, PresenceKey, PresenceMeta, PresenceStream, Tracker};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope::new(Payload::Ping).with_correlation("corr-1");
        let encoded = envelope.encode().unwrap();
        let (decoded, len) = Envelope::decode(&encoded).unwrap();
        let decoded = decoded.unwrap();

        assert_eq!(len, encoded.len());
        assert_eq!(decoded.correlation_id.as_deref(), Some("corr-1"));
        assert!(matches!(decoded.payload, Some(Payload::Ping)));
    }

    #[test]
    fn test_session_lifecycle() {
        let registry = SessionRegistry::new(16);
        let addr = "127.0.0.1:8080".parse().unwrap();

        let id = registry.add("user-1".to_string(), Some("Player1".to_string()), addr, 0);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(id).is_some());

        registry.remove(id, CloseReason::Logout);
        assert_eq!(registry.count(), 0);
    }
}
