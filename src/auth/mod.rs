//! Session handshake authentication (§6).
//!
//! The realtime socket's HTTP upgrade carries a bearer JWT; this module
//! only validates that token and hands back the claims `SessionRegistry`
//! needs to open a session. Account creation, login providers and linking
//! are outside this core's scope — issuing player tokens is the job of
//! whatever front-door auth service sits in front of this socket.

mod tokens;

pub use tokens::{SessionClaims, TokenService};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;
