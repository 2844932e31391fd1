//! Leaderboard / tournament cache and rank index (§3, §4.7).
//!
//! The teacher implements `leaderboard.rs` and `tournament.rs` as two fully
//! parallel modules — separate config/record/error types, separate
//! `BTreeMap<SortKey,String>` per-board index. Per "a Tournament is a
//! Leaderboard with duration > 0" this merges them into one
//! `LeaderboardConfig`/`LeaderboardRecord`/`LeaderboardCache` triad;
//! `duration == 0` boards behave like the teacher's non-resetting
//! leaderboards, `duration > 0` boards behave like the teacher's
//! tournaments (join window, max-size, max-submissions). The
//! `BTreeMap<SortKey, String>` ordered-index both teacher modules already
//! use is kept verbatim as `RankCache`, generalized to be keyed per-epoch
//! `(leaderboard_id, expiry_time)` since the teacher's version has no
//! epoch dimension at all.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use cron::Schedule;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Descending,
    Ascending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreOperator {
    Best,
    Set,
    Increment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardConfig {
    pub id: String,
    pub category: String,
    pub sort_order: SortOrder,
    pub operator: ScoreOperator,
    /// Cron expression; `None` means the board never resets.
    pub reset_schedule: Option<String>,
    pub start_time: u64,
    pub end_time: Option<u64>,
    /// Seconds; `> 0` makes this a tournament (enforces the active window).
    pub duration: u64,
    pub max_size: Option<usize>,
    pub max_num_score: Option<u32>,
    pub join_required: bool,
    pub metadata: Option<serde_json::Value>,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            category: String::new(),
            sort_order: SortOrder::Descending,
            operator: ScoreOperator::Best,
            reset_schedule: None,
            start_time: 0,
            end_time: None,
            duration: 0,
            max_size: None,
            max_num_score: None,
            join_required: false,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardRecord {
    pub leaderboard_id: String,
    pub owner_id: String,
    pub username: String,
    pub expiry_time: u64,
    pub score: i64,
    pub subscore: i64,
    pub num_score: u32,
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Error, Debug)]
pub enum LeaderboardError {
    #[error("leaderboard not found: {0}")]
    NotFound(String),
    #[error("leaderboard already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("tournament not found: {0}")]
    TournamentNotFound(String),
    #[error("write outside the tournament's active window")]
    OutsideDuration,
    #[error("tournament is full")]
    MaxSizeReached,
    #[error("max submission count reached")]
    MaxNumScoreReached,
    #[error("tournament requires joining before writing a score")]
    JoinRequired,
}

impl LeaderboardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LeaderboardError::NotFound(_) | LeaderboardError::AlreadyExists(_) | LeaderboardError::InvalidConfig(_) => {
                ErrorCode::BadInput
            }
            LeaderboardError::TournamentNotFound(_) => ErrorCode::TournamentNotFound,
            LeaderboardError::OutsideDuration => ErrorCode::TournamentOutsideDuration,
            LeaderboardError::MaxSizeReached => ErrorCode::TournamentMaxSizeReached,
            LeaderboardError::MaxNumScoreReached => ErrorCode::TournamentWriteMaxNumScoreReached,
            LeaderboardError::JoinRequired => ErrorCode::TournamentWriteJoinRequired,
        }
    }
}

type Result<T> = std::result::Result<T, LeaderboardError>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    primary: i64,
    subscore: i64,
    owner_id: String,
}

/// RankCache: the ordered index for a single (leaderboard, epoch) pair.
struct EpochIndex {
    by_owner: DashMap<String, LeaderboardRecord>,
    sorted: RwLock<BTreeMap<SortKey, String>>,
}

impl EpochIndex {
    fn new() -> Self {
        Self { by_owner: DashMap::new(), sorted: RwLock::new(BTreeMap::new()) }
    }

    fn sort_key(config: &LeaderboardConfig, score: i64, subscore: i64, owner_id: &str) -> SortKey {
        let (primary, sub) = match config.sort_order {
            SortOrder::Descending => (-score, -subscore),
            SortOrder::Ascending => (score, subscore),
        };
        SortKey { primary, subscore: sub, owner_id: owner_id.to_string() }
    }

    fn rank_of(&self, owner_id: &str) -> u64 {
        let sorted = self.sorted.read();
        for (rank, (_, uid)) in sorted.iter().enumerate() {
            if uid == owner_id {
                return (rank + 1) as u64;
            }
        }
        0
    }

    fn top(&self, limit: usize) -> Vec<LeaderboardRecord> {
        let sorted = self.sorted.read();
        sorted
            .iter()
            .take(limit)
            .enumerate()
            .filter_map(|(rank, (_, uid))| {
                self.by_owner.get(uid).map(|r| {
                    let mut rec = r.clone();
                    rec.rank = Some((rank + 1) as u64);
                    rec
                })
            })
            .collect()
    }
}

/// A board: its config plus one `EpochIndex` per expiry-time, generalizing
/// the teacher's single always-current index into one per epoch.
struct Board {
    config: LeaderboardConfig,
    epochs: DashMap<u64, Arc<EpochIndex>>,
}

impl Board {
    fn epoch(&self, expiry_time: u64) -> Arc<EpochIndex> {
        self.epochs.entry(expiry_time).or_insert_with(|| Arc::new(EpochIndex::new())).clone()
    }
}

/// Computes the active epoch for a leaderboard at time `now` (§4.7).
/// Returns `(epoch_start, expiry_time, active_until)`. `expiry_time == 0`
/// means the board never resets.
fn epoch_bounds(config: &LeaderboardConfig, now: u64) -> (u64, u64, u64) {
    match &config.reset_schedule {
        None => {
            let active_until = if config.duration > 0 { config.start_time + config.duration } else { u64::MAX };
            let expiry = if config.duration > 0 { config.start_time + config.duration } else { 0 };
            (config.start_time, expiry, active_until)
        }
        Some(expr) => {
            let schedule = Schedule::from_str(expr).expect("validated at create");
            let start_dt = Utc.timestamp_opt(config.start_time as i64, 0).single().unwrap_or_else(|| Utc::now());
            let mut prev = start_dt;
            for dt in schedule.after(&start_dt) {
                if dt.timestamp() as u64 > now {
                    break;
                }
                prev = dt;
            }
            let next = schedule.after(&prev).next().map(|dt| dt.timestamp() as u64).unwrap_or(u64::MAX);
            let epoch_start = prev.timestamp() as u64;
            let active_until = if config.duration > 0 { epoch_start + config.duration } else { next };
            (epoch_start, next, active_until)
        }
    }
}

/// Cache of leaderboard/tournament configs plus their per-epoch rank
/// indexes. Loaded from durable storage at startup in a real deployment;
/// here it is mutated purely through `create`/`delete` (§4.7).
pub struct LeaderboardCache {
    boards: DashMap<String, Board>,
    blacklist: HashSet<String>,
}

impl LeaderboardCache {
    pub fn new(blacklist: Vec<String>) -> Self {
        Self { boards: DashMap::new(), blacklist: blacklist.into_iter().collect() }
    }

    /// Create(config). Validates `reset` parsability and the tournament
    /// gap-vs-duration invariant (§3): each reset cycle's active window
    /// must fit strictly inside the gap between successive reset instants,
    /// and `end_time`, if set, must be after the first reset.
    pub fn create(&self, config: LeaderboardConfig) -> Result<()> {
        if config.id.is_empty() {
            return Err(LeaderboardError::InvalidConfig("id cannot be empty".into()));
        }
        if self.boards.contains_key(&config.id) {
            return Err(LeaderboardError::AlreadyExists(config.id.clone()));
        }
        if let Some(expr) = &config.reset_schedule {
            let schedule = Schedule::from_str(expr).map_err(|e| LeaderboardError::InvalidConfig(e.to_string()))?;
            let start_dt = Utc.timestamp_opt(config.start_time as i64, 0).single().ok_or_else(|| LeaderboardError::InvalidConfig("bad start_time".into()))?;
            let mut occurrences = schedule.after(&start_dt);
            let first = occurrences.next().ok_or_else(|| LeaderboardError::InvalidConfig("reset schedule never fires".into()))?;
            let second = occurrences.next();
            if let Some(second) = second {
                let gap = (second.timestamp() - first.timestamp()).max(0) as u64;
                if config.duration > 0 && config.duration >= gap {
                    return Err(LeaderboardError::InvalidConfig("duration does not fit inside the reset interval".into()));
                }
            }
            if let Some(end_time) = config.end_time {
                if end_time <= first.timestamp() as u64 {
                    return Err(LeaderboardError::InvalidConfig("end_time must be after the first reset".into()));
                }
            }
        } else if let Some(end_time) = config.end_time {
            if end_time <= config.start_time {
                return Err(LeaderboardError::InvalidConfig("end_time must be after start_time".into()));
            }
        }

        self.boards.insert(config.id.clone(), Board { config, epochs: DashMap::new() });
        Ok(())
    }

    pub fn delete(&self, id: &str) -> bool {
        self.boards.remove(id).is_some()
    }

    pub fn get_config(&self, id: &str) -> Option<LeaderboardConfig> {
        self.boards.get(id).map(|b| b.config.clone())
    }

    pub fn list(&self) -> Vec<LeaderboardConfig> {
        self.boards.iter().map(|b| b.config.clone()).collect()
    }

    pub fn current_expiry(&self, id: &str, now: u64) -> Result<u64> {
        let board = self.boards.get(id).ok_or_else(|| LeaderboardError::NotFound(id.to_string()))?;
        Ok(epoch_bounds(&board.config, now).1)
    }

    fn cache_enabled(&self, id: &str) -> bool {
        !self.blacklist.contains(id)
    }

    /// Join(board, owner) — creates a zero-value record if one doesn't
    /// exist yet, satisfying `join_required` tournaments.
    pub fn join(&self, id: &str, owner_id: &str, username: &str, now: u64) -> Result<()> {
        let board = self.boards.get(id).ok_or_else(|| LeaderboardError::NotFound(id.to_string()))?;
        let (_, expiry_time, active_until) = epoch_bounds(&board.config, now);
        if board.config.duration > 0 && now >= active_until {
            return Err(LeaderboardError::OutsideDuration);
        }
        let epoch = board.epoch(expiry_time);
        if epoch.by_owner.contains_key(owner_id) {
            return Ok(());
        }
        if let Some(max) = board.config.max_size {
            if epoch.by_owner.len() >= max {
                return Err(LeaderboardError::MaxSizeReached);
            }
        }
        let record = LeaderboardRecord {
            leaderboard_id: id.to_string(),
            owner_id: owner_id.to_string(),
            username: username.to_string(),
            expiry_time,
            score: 0,
            subscore: 0,
            num_score: 0,
            metadata: None,
            rank: None,
            created_at: now,
            updated_at: now,
        };
        epoch.by_owner.insert(owner_id.to_string(), record);
        Ok(())
    }

    /// Submit(board, owner, score, subscore) — applies the configured
    /// operator and enforces tournament window/size/submission-count rules
    /// (§4.7, Testable properties 5-6).
    pub fn submit(
        &self,
        id: &str,
        owner_id: &str,
        username: &str,
        score: i64,
        subscore: i64,
        metadata: Option<serde_json::Value>,
        now: u64,
    ) -> Result<LeaderboardRecord> {
        let board = self.boards.get(id).ok_or_else(|| LeaderboardError::NotFound(id.to_string()))?;
        let (_, expiry_time, active_until) = epoch_bounds(&board.config, now);
        if board.config.duration > 0 && now >= active_until {
            return Err(LeaderboardError::OutsideDuration);
        }
        let epoch = board.epoch(expiry_time);
        let existing = epoch.by_owner.get(owner_id).map(|r| r.clone());

        if board.config.join_required && board.config.duration > 0 && existing.is_none() {
            return Err(LeaderboardError::JoinRequired);
        }
        if existing.is_none() {
            if let Some(max) = board.config.max_size {
                if epoch.by_owner.len() >= max {
                    return Err(LeaderboardError::MaxSizeReached);
                }
            }
        }
        if let Some(max_num) = board.config.max_num_score {
            if existing.as_ref().map(|e| e.num_score).unwrap_or(0) >= max_num {
                return Err(LeaderboardError::MaxNumScoreReached);
            }
        }

        let (new_score, new_subscore) = match board.config.operator {
            ScoreOperator::Set => (score, subscore),
            ScoreOperator::Increment => {
                let base = existing.as_ref();
                (base.map(|e| e.score).unwrap_or(0) + score, base.map(|e| e.subscore).unwrap_or(0) + subscore)
            }
            ScoreOperator::Best => match &existing {
                Some(e) => {
                    let candidate = (score, subscore);
                    let current = (e.score, e.subscore);
                    let better = match board.config.sort_order {
                        SortOrder::Descending => candidate > current,
                        SortOrder::Ascending => candidate < current,
                    };
                    if better { candidate } else { current }
                }
                None => (score, subscore),
            },
        };

        let record = LeaderboardRecord {
            leaderboard_id: id.to_string(),
            owner_id: owner_id.to_string(),
            username: username.to_string(),
            expiry_time,
            score: new_score,
            subscore: new_subscore,
            num_score: existing.as_ref().map(|e| e.num_score + 1).unwrap_or(1),
            metadata,
            rank: None,
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
        };

        if self.cache_enabled(id) {
            let mut sorted = epoch.sorted.write();
            if let Some(e) = &existing {
                sorted.remove(&EpochIndex::sort_key(&board.config, e.score, e.subscore, owner_id));
            }
            sorted.insert(EpochIndex::sort_key(&board.config, new_score, new_subscore, owner_id), owner_id.to_string());
        }
        epoch.by_owner.insert(owner_id.to_string(), record.clone());
        Ok(record)
    }

    pub fn get_record(&self, id: &str, owner_id: &str, now: u64) -> Result<Option<LeaderboardRecord>> {
        let board = self.boards.get(id).ok_or_else(|| LeaderboardError::NotFound(id.to_string()))?;
        let (_, expiry_time, _) = epoch_bounds(&board.config, now);
        let epoch = board.epoch(expiry_time);
        Ok(epoch.by_owner.get(owner_id).map(|r| {
            let mut rec = r.clone();
            rec.rank = Some(epoch.rank_of(owner_id));
            rec
        }))
    }

    pub fn get_top(&self, id: &str, expiry_time: u64, limit: usize) -> Result<Vec<LeaderboardRecord>> {
        let board = self.boards.get(id).ok_or_else(|| LeaderboardError::NotFound(id.to_string()))?;
        Ok(board.epoch(expiry_time).top(limit))
    }

    pub fn get_around(&self, id: &str, owner_id: &str, count: usize, now: u64) -> Result<Vec<LeaderboardRecord>> {
        let board = self.boards.get(id).ok_or_else(|| LeaderboardError::NotFound(id.to_string()))?;
        let (_, expiry_time, _) = epoch_bounds(&board.config, now);
        let epoch = board.epoch(expiry_time);
        let rank = epoch.rank_of(owner_id);
        if rank == 0 {
            return Ok(Vec::new());
        }
        let sorted = epoch.sorted.read();
        let total = sorted.len();
        let half = count / 2;
        let start = (rank as usize).saturating_sub(half + 1);
        let end = (start + count).min(total);
        let start = if end == total { end.saturating_sub(count) } else { start };
        drop(sorted);
        Ok(board
            .epoch(expiry_time)
            .sorted
            .read()
            .iter()
            .enumerate()
            .skip(start)
            .take(end.saturating_sub(start))
            .filter_map(|(rank, (_, uid))| {
                epoch.by_owner.get(uid).map(|r| {
                    let mut rec = r.clone();
                    rec.rank = Some((rank + 1) as u64);
                    rec
                })
            })
            .collect())
    }

    /// Clears a finished epoch's rank index, called by the scheduler after
    /// finalizing winners (§4.7 step 4).
    pub fn clear_epoch(&self, id: &str, expiry_time: u64) {
        if let Some(board) = self.boards.get(id) {
            board.epochs.remove(&expiry_time);
        }
    }

    pub fn count(&self, id: &str, now: u64) -> Result<usize> {
        let board = self.boards.get(id).ok_or_else(|| LeaderboardError::NotFound(id.to_string()))?;
        let (_, expiry_time, _) = epoch_bounds(&board.config, now);
        Ok(board.epoch(expiry_time).by_owner.len())
    }
}

impl Default for LeaderboardCache {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_desc_keeps_max() {
        let cache = LeaderboardCache::default();
        cache
            .create(LeaderboardConfig { id: "hs".into(), operator: ScoreOperator::Best, sort_order: SortOrder::Descending, ..Default::default() })
            .unwrap();

        cache.submit("hs", "u1", "Alice", 10, 0, None, 100).unwrap();
        cache.submit("hs", "u1", "Alice", 4, 0, None, 101).unwrap();
        let rec = cache.submit("hs", "u1", "Alice", 25, 0, None, 102).unwrap();

        assert_eq!(rec.score, 25);
        assert_eq!(rec.num_score, 3);
        assert_eq!(cache.get_record("hs", "u1", 103).unwrap().unwrap().rank, Some(1));
    }

    #[test]
    fn test_increment_operator_sums() {
        let cache = LeaderboardCache::default();
        cache.create(LeaderboardConfig { id: "coins".into(), operator: ScoreOperator::Increment, ..Default::default() }).unwrap();

        cache.submit("coins", "u1", "Alice", 100, 0, None, 1).unwrap();
        let rec = cache.submit("coins", "u1", "Alice", 50, 0, None, 2).unwrap();
        assert_eq!(rec.score, 150);
    }

    #[test]
    fn test_ascending_order_ranks_smallest_first() {
        let cache = LeaderboardCache::default();
        cache.create(LeaderboardConfig { id: "speedrun".into(), sort_order: SortOrder::Ascending, operator: ScoreOperator::Best, ..Default::default() }).unwrap();

        cache.submit("speedrun", "u1", "Alice", 120, 0, None, 1).unwrap();
        cache.submit("speedrun", "u2", "Bob", 90, 0, None, 1).unwrap();
        cache.submit("speedrun", "u3", "Charlie", 150, 0, None, 1).unwrap();

        let top = cache.get_top("speedrun", 0, 10).unwrap();
        assert_eq!(top[0].username, "Bob");
        assert_eq!(top[2].username, "Charlie");
    }

    #[test]
    fn test_tournament_window_enforced() {
        let cache = LeaderboardCache::default();
        cache
            .create(LeaderboardConfig {
                id: "daily".into(),
                reset_schedule: Some("0 0 0 * * *".into()),
                duration: 3600,
                start_time: 0,
                ..Default::default()
            })
            .unwrap();

        // 00:30 UTC on day 1: inside window.
        cache.submit("daily", "u1", "Alice", 10, 0, None, 1_800).unwrap();
        // 02:00 UTC same day: outside window.
        let err = cache.submit("daily", "u1", "Alice", 10, 0, None, 7_200);
        assert!(matches!(err, Err(LeaderboardError::OutsideDuration)));
    }

    #[test]
    fn test_max_size_reached() {
        let cache = LeaderboardCache::default();
        cache.create(LeaderboardConfig { id: "small".into(), max_size: Some(1), ..Default::default() }).unwrap();

        cache.submit("small", "u1", "Alice", 10, 0, None, 1).unwrap();
        let err = cache.submit("small", "u2", "Bob", 20, 0, None, 1);
        assert!(matches!(err, Err(LeaderboardError::MaxSizeReached)));
    }

    #[test]
    fn test_join_required_blocks_unjoined_write() {
        let cache = LeaderboardCache::default();
        cache
            .create(LeaderboardConfig { id: "t".into(), join_required: true, duration: 3600, end_time: Some(10_000), ..Default::default() })
            .unwrap();

        let err = cache.submit("t", "u1", "Alice", 10, 0, None, 1);
        assert!(matches!(err, Err(LeaderboardError::JoinRequired)));

        cache.join("t", "u1", "Alice", 1).unwrap();
        cache.submit("t", "u1", "Alice", 10, 0, None, 1).unwrap();
    }

    #[test]
    fn test_invalid_reset_schedule_rejected() {
        let cache = LeaderboardCache::default();
        let err = cache.create(LeaderboardConfig { id: "bad".into(), reset_schedule: Some("not a cron".into()), ..Default::default() });
        assert!(matches!(err, Err(LeaderboardError::InvalidConfig(_))));
    }

    #[test]
    fn test_duration_must_fit_inside_reset_gap() {
        let cache = LeaderboardCache::default();
        let err = cache.create(LeaderboardConfig {
            id: "overlap".into(),
            reset_schedule: Some("0 0 0 * * *".into()),
            duration: 24 * 3600,
            ..Default::default()
        });
        assert!(matches!(err, Err(LeaderboardError::InvalidConfig(_))));
    }
}
