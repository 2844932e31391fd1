//! Process-wide configuration consumed by the core.
//!
//! The loader itself (env parsing, file layering, secrets) is out of scope;
//! this module only defines the shape the core is handed at startup.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub encryption_key: String,
    pub token_expiry_secs: u64,
    pub ping_period_ms: u64,
    pub pong_wait_ms: u64,
    pub outgoing_queue_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            encryption_key: String::new(),
            token_expiry_secs: 60 * 60,
            ping_period_ms: 15_000,
            pong_wait_ms: 20_000,
            outgoing_queue_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub input_queue_size: usize,
    pub call_queue_size: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            input_queue_size: 128,
            call_queue_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerConfigValues {
    pub interval_sec: u64,
    pub max_tickets_per_session: usize,
    pub rendezvous_token_ttl_secs: u64,
}

impl Default for MatchmakerConfigValues {
    fn default() -> Self {
        Self {
            interval_sec: 1,
            max_tickets_per_session: 8,
            rendezvous_token_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardConfigValues {
    pub blacklist: Vec<String>,
}

impl Default for LeaderboardConfigValues {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
        }
    }
}

/// Top-level configuration, grouped by subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server_key: String,
    pub session: SessionConfig,
    pub r#match: MatchConfig,
    pub matchmaker: MatchmakerConfigValues,
    pub leaderboard: LeaderboardConfigValues,
}
