//! Crate-level error taxonomy.
//!
//! Every registry keeps its own `thiserror` enum (`SessionError`, `PartyError`,
//! `MatchmakerError`, `MatchError`, `LeaderboardError`, ...). `CoreError` wraps
//! each of those with `#[from]` and exposes [`CoreError::code`], the single
//! place that maps a failure onto the wire taxonomy of the error envelope.
//! The Pipeline is the only caller of `code()`.

use thiserror::Error;

use crate::match_handler::MatchError;
use crate::matchmaker::MatchmakerError;
use crate::party::PartyError;
use crate::session::SessionError;
use crate::leaderboard::LeaderboardError;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Wire-visible error codes (§7 of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    BadInput,
    MissingPayload,
    UnrecognizedPayload,
    RuntimeException,
    RuntimeFunctionException,
    MatchNotFound,
    MatchmakerTicketNotFound,
    TournamentNotFound,
    TournamentOutsideDuration,
    TournamentMaxSizeReached,
    TournamentWriteMaxNumScoreReached,
    TournamentWriteJoinRequired,
    PartyClosed,
    PartyNotAMember,
    PartyFull,
    SessionExpired,
    Unauthorized,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Party(#[from] PartyError),

    #[error(transparent)]
    Matchmaker(#[from] MatchmakerError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Leaderboard(#[from] LeaderboardError),

    #[error("missing payload")]
    MissingPayload,

    #[error("unrecognized payload")]
    UnrecognizedPayload,

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("runtime hook failed: {0}")]
    RuntimeFunctionException(String),

    #[error("session expired")]
    SessionExpired,

    #[error("unauthorized")]
    Unauthorized,
}

impl CoreError {
    /// Maps any core failure onto the wire error taxonomy (§7).
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Io(_) | CoreError::Serde(_) => ErrorCode::RuntimeException,
            CoreError::MissingPayload => ErrorCode::MissingPayload,
            CoreError::UnrecognizedPayload => ErrorCode::UnrecognizedPayload,
            CoreError::BadInput(_) => ErrorCode::BadInput,
            CoreError::RuntimeFunctionException(_) => ErrorCode::RuntimeFunctionException,
            CoreError::SessionExpired => ErrorCode::SessionExpired,
            CoreError::Unauthorized => ErrorCode::Unauthorized,
            CoreError::Session(e) => e.code(),
            CoreError::Party(e) => e.code(),
            CoreError::Matchmaker(e) => e.code(),
            CoreError::Match(e) => e.code(),
            CoreError::Leaderboard(e) => e.code(),
        }
    }
}
