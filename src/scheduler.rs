//! Leaderboard/tournament epoch scheduler (§4.7).
//!
//! Drives cron-scheduled leaderboards forward: when a board's current
//! epoch has advanced since the last observation, finalizes the old
//! epoch's winners (top-K from its `RankCache` entry in `LeaderboardCache`),
//! fires a [`SchedulerEvent`] for the caller to dispatch `leaderboard_reset`/
//! `tournament_end` hooks against, then clears the old epoch. Driven by an
//! explicit `tick(now)` call from the server's main loop rather than an
//! owned OS timer, matching this crate's synchronous, poll-driven core.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use cron::Schedule;
use dashmap::DashMap;

use crate::leaderboard::{LeaderboardCache, LeaderboardRecord};

#[derive(Debug, Clone)]
pub struct SchedulerEvent {
    pub leaderboard_id: String,
    pub old_expiry_time: u64,
    pub new_expiry_time: u64,
    pub winners: Vec<LeaderboardRecord>,
}

/// Tracks the last expiry-time observed per leaderboard so the epoch
/// sequence's monotonicity can be checked (Testable property 8) and so a
/// missed reset is detected rather than silently skipped.
pub struct LeaderboardScheduler {
    last_expiry: DashMap<String, u64>,
}

impl LeaderboardScheduler {
    pub fn new() -> Self {
        Self { last_expiry: DashMap::new() }
    }

    /// Advances every cron-scheduled leaderboard to its epoch at `now`.
    /// Any reset instants between the last observed epoch and `now` are
    /// walked in ascending order, each producing its own event, so a
    /// restart that missed several resets catches up in order rather than
    /// jumping straight to the latest epoch.
    pub fn tick(&self, cache: &LeaderboardCache, now: u64, top_k: usize) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();

        for config in cache.list() {
            let Some(expr) = &config.reset_schedule else { continue };
            let Ok(schedule) = Schedule::from_str(expr) else { continue };

            let last = self.last_expiry.get(&config.id).map(|r| *r);
            let Some(last) = last else {
                // First observation: record the current epoch without
                // firing a reset (nothing preceded it to finalize).
                if let Ok(expiry) = cache.current_expiry(&config.id, now) {
                    self.last_expiry.insert(config.id.clone(), expiry);
                }
                continue;
            };

            let Some(start_dt) = Utc.timestamp_opt(last as i64, 0).single() else { continue };
            let missed: Vec<u64> = schedule
                .after(&start_dt)
                .take_while(|dt| dt.timestamp() as u64 <= now)
                .map(|dt| dt.timestamp() as u64)
                .collect();

            let mut prev = last;
            for expiry in missed {
                let winners = cache.get_top(&config.id, prev, top_k).unwrap_or_default();
                cache.clear_epoch(&config.id, prev);
                events.push(SchedulerEvent {
                    leaderboard_id: config.id.clone(),
                    old_expiry_time: prev,
                    new_expiry_time: expiry,
                    winners,
                });
                prev = expiry;
            }
            self.last_expiry.insert(config.id.clone(), prev);
        }

        events
    }
}

impl Default for LeaderboardScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::{LeaderboardConfig, ScoreOperator};

    #[test]
    fn test_first_tick_bootstraps_without_firing() {
        let cache = LeaderboardCache::default();
        cache
            .create(LeaderboardConfig { id: "daily".into(), reset_schedule: Some("0 0 0 * * *".into()), ..Default::default() })
            .unwrap();
        let scheduler = LeaderboardScheduler::new();

        let events = scheduler.tick(&cache, 1_000, 10);
        assert!(events.is_empty());
    }

    #[test]
    fn test_reset_fires_after_boundary_crossed() {
        let cache = LeaderboardCache::default();
        cache
            .create(LeaderboardConfig { id: "daily".into(), reset_schedule: Some("0 0 0 * * *".into()), operator: ScoreOperator::Best, ..Default::default() })
            .unwrap();
        let scheduler = LeaderboardScheduler::new();

        scheduler.tick(&cache, 1_000, 10);
        cache.submit("daily", "u1", "Alice", 42, 0, None, 1_000).unwrap();

        // Cross the midnight boundary into day two.
        let events = scheduler.tick(&cache, 90_000, 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].winners.len(), 1);
        assert_eq!(events[0].winners[0].owner_id, "u1");
    }

    #[test]
    fn test_epoch_sequence_strictly_increasing() {
        let cache = LeaderboardCache::default();
        cache
            .create(LeaderboardConfig { id: "daily".into(), reset_schedule: Some("0 0 0 * * *".into()), ..Default::default() })
            .unwrap();
        let scheduler = LeaderboardScheduler::new();

        scheduler.tick(&cache, 1_000, 10);
        let first = scheduler.tick(&cache, 90_000, 10);
        let second = scheduler.tick(&cache, 200_000, 10);

        assert!(first[0].new_expiry_time < second[0].new_expiry_time);
    }
}
