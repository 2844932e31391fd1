//! Presence tracker: "who is where" across logical streams.
//!
//! Maintains a bidirectional index — `stream -> presences` and
//! `session -> streams` — behind per-stream sharded locks (DashMap shards
//! the way the teacher's own registries do), and accumulates join/leave/
//! update events into a diff queue that `MessageRouter` drains per tick
//! (§4.3).

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::protocol::StreamMode;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceStream {
    pub mode: StreamMode,
    pub subject: String,
    pub subcontext: String,
    pub label: String,
}

impl PresenceStream {
    pub fn new(mode: StreamMode, subject: impl Into<String>) -> Self {
        Self {
            mode,
            subject: subject.into(),
            subcontext: String::new(),
            label: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceKey {
    pub session_id: u64,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub username: String,
    pub status: Option<String>,
    pub hidden: bool,
    pub persistence: bool,
    pub format: String,
}

impl Default for PresenceMeta {
    fn default() -> Self {
        Self {
            username: String::new(),
            status: None,
            hidden: false,
            persistence: true,
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DiffEvent {
    Join(PresenceKey, PresenceMeta),
    Leave(PresenceKey, PresenceMeta),
    Update(PresenceKey, PresenceMeta),
}

struct StreamState {
    presences: DashMap<PresenceKey, PresenceMeta>,
    diffs: parking_lot::Mutex<Vec<DiffEvent>>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            presences: DashMap::new(),
            diffs: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

/// Presence fabric. Streams are created lazily on first join and destroyed
/// when the last presence leaves.
pub struct Tracker {
    streams: DashMap<PresenceStream, StreamState>,
    by_session: DashMap<u64, HashSet<PresenceStream>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    /// Track(session, stream, user, meta). Idempotent per tuple; returns
    /// whether this was a new presence.
    pub fn track(
        &self,
        session_id: u64,
        user_id: impl Into<String>,
        stream: PresenceStream,
        meta: PresenceMeta,
    ) -> bool {
        let user_id = user_id.into();
        let key = PresenceKey { session_id, user_id };

        let state = self.streams.entry(stream.clone()).or_insert_with(StreamState::new);
        let is_new = !state.presences.contains_key(&key);
        state.presences.insert(key.clone(), meta.clone());

        if is_new && meta.persistence {
            state.diffs.lock().push(DiffEvent::Join(key.clone(), meta));
        }
        drop(state);

        self.by_session.entry(session_id).or_default().insert(stream);
        is_new
    }

    /// Untrack(session, stream, user) — remove one tuple.
    pub fn untrack(&self, session_id: u64, user_id: &str, stream: &PresenceStream) {
        let key = PresenceKey { session_id, user_id: user_id.to_string() };
        let mut empty = false;
        if let Some(state) = self.streams.get(stream) {
            if let Some((_, meta)) = state.presences.remove(&key) {
                if meta.persistence {
                    state.diffs.lock().push(DiffEvent::Leave(key, meta));
                }
            }
            empty = state.presences.is_empty();
        }
        if empty {
            self.streams.remove(stream);
        }
        if let Some(mut streams) = self.by_session.get_mut(&session_id) {
            streams.remove(stream);
        }
    }

    /// UntrackAll(session) — remove every tuple for a session, emitting a
    /// leave event per stream (§4.3, tested by property 2).
    pub fn untrack_all(&self, session_id: u64) {
        let streams = self.by_session.remove(&session_id).map(|(_, s)| s).unwrap_or_default();
        for stream in streams {
            let mut empty = false;
            if let Some(state) = self.streams.get(&stream) {
                let keys: Vec<PresenceKey> = state
                    .presences
                    .iter()
                    .filter(|e| e.key().session_id == session_id)
                    .map(|e| e.key().clone())
                    .collect();
                for key in keys {
                    if let Some((_, meta)) = state.presences.remove(&key) {
                        if meta.persistence {
                            state.diffs.lock().push(DiffEvent::Leave(key, meta));
                        }
                    }
                }
                empty = state.presences.is_empty();
            }
            if empty {
                self.streams.remove(&stream);
            }
        }
    }

    /// Update(session, stream, user, meta) — replace meta in place,
    /// emitting a join-style event.
    pub fn update(&self, session_id: u64, user_id: &str, stream: &PresenceStream, meta: PresenceMeta) {
        let key = PresenceKey { session_id, user_id: user_id.to_string() };
        if let Some(state) = self.streams.get(stream) {
            state.presences.insert(key.clone(), meta.clone());
            if meta.persistence {
                state.diffs.lock().push(DiffEvent::Update(key, meta));
            }
        }
    }

    pub fn list_by_stream(&self, stream: &PresenceStream) -> Vec<(PresenceKey, PresenceMeta)> {
        self.streams
            .get(stream)
            .map(|state| state.presences.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
            .unwrap_or_default()
    }

    pub fn count_by_stream(&self, stream: &PresenceStream) -> usize {
        self.streams.get(stream).map(|s| s.presences.len()).unwrap_or(0)
    }

    pub fn streams_for_session(&self, session_id: u64) -> Vec<PresenceStream> {
        self.by_session.get(&session_id).map(|r| r.iter().cloned().collect()).unwrap_or_default()
    }

    /// Drains every stream's accumulated diff queue (called once per router
    /// tick); events for a single stream preserve observation order.
    pub fn drain_diffs(&self) -> Vec<(PresenceStream, Vec<DiffEvent>)> {
        let mut out = Vec::new();
        for entry in self.streams.iter() {
            let mut diffs = entry.value().diffs.lock();
            if !diffs.is_empty() {
                out.push((entry.key().clone(), std::mem::take(&mut *diffs)));
            }
        }
        out
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notif_stream(user: &str) -> PresenceStream {
        PresenceStream::new(StreamMode::Notifications, user)
    }

    #[test]
    fn test_track_is_idempotent() {
        let tracker = Tracker::new();
        let stream = notif_stream("user-1");

        assert!(tracker.track(1, "user-1", stream.clone(), PresenceMeta::default()));
        assert!(!tracker.track(1, "user-1", stream.clone(), PresenceMeta::default()));
        assert_eq!(tracker.count_by_stream(&stream), 1);
    }

    #[test]
    fn test_untrack_all_emits_one_leave_per_stream() {
        let tracker = Tracker::new();
        let s1 = notif_stream("user-1");
        let s2 = PresenceStream::new(StreamMode::Match, "match-1");

        tracker.track(1, "user-1", s1.clone(), PresenceMeta::default());
        tracker.track(1, "user-1", s2.clone(), PresenceMeta::default());
        tracker.drain_diffs();

        tracker.untrack_all(1);
        let diffs = tracker.drain_diffs();

        let total_leaves: usize = diffs
            .iter()
            .map(|(_, events)| events.iter().filter(|e| matches!(e, DiffEvent::Leave(..))).count())
            .sum();
        assert_eq!(total_leaves, 2);
        assert_eq!(tracker.streams_for_session(1).len(), 0);
    }

    #[test]
    fn test_hidden_presence_excluded_when_not_persistent() {
        let tracker = Tracker::new();
        let stream = notif_stream("user-1");
        let meta = PresenceMeta { persistence: false, ..Default::default() };

        tracker.track(1, "user-1", stream.clone(), meta);
        let diffs = tracker.drain_diffs();
        assert!(diffs.is_empty());
        assert_eq!(tracker.count_by_stream(&stream), 1);
    }
}
