//! Status registry: per-user online/status-text subscriptions (§2, §3).
//!
//! A "follow" is modeled as tracking the follower's presence on the
//! target user's status stream (`PresenceStream{mode: Status, subject: target}`),
//! reusing Tracker's join/leave/update diff machinery rather than keeping a
//! second parallel index — the teacher's own `room.rs` has no equivalent
//! concept, so this module is grounded directly on `tracker.rs`'s stream
//! model (§4.3) rather than on a skill-free analogue.

use crate::protocol::StreamMode;
use crate::session::Presence;
use crate::tracker::{PresenceMeta, PresenceStream, Tracker};

pub struct StatusRegistry<'a> {
    tracker: &'a Tracker,
}

impl<'a> StatusRegistry<'a> {
    pub fn new(tracker: &'a Tracker) -> Self {
        Self { tracker }
    }

    fn stream_for(target_user_id: &str) -> PresenceStream {
        PresenceStream::new(StreamMode::Status, target_user_id)
    }

    /// Follow(follower, target_user_ids) — subscribes the follower's
    /// session to each target's status stream.
    pub fn follow(&self, follower: &Presence, target_user_ids: &[String]) {
        for target in target_user_ids {
            let meta = PresenceMeta {
                username: follower.username.clone(),
                ..Default::default()
            };
            self.tracker.track(follower.session_id, follower.user_id.clone(), Self::stream_for(target), meta);
        }
    }

    /// Unfollow(follower, target_user_ids).
    pub fn unfollow(&self, follower: &Presence, target_user_ids: &[String]) {
        for target in target_user_ids {
            self.tracker.untrack(follower.session_id, &follower.user_id, &Self::stream_for(target));
        }
    }

    /// Update(self, status) — pushes a new status-text onto every stream
    /// the user themself appears on as a followable subject: since the
    /// stream is keyed by the *target's* user-id, the updating user's own
    /// presence lives on their own status stream under their own id, and
    /// followers are the stream's subscribers. Updating replaces that
    /// subject-presence's meta, which fans a status-presence diff out to
    /// every follower via the router (§4.3).
    pub fn update(&self, who: &Presence, status: Option<String>) {
        let stream = Self::stream_for(&who.user_id);
        let meta = PresenceMeta {
            username: who.username.clone(),
            status,
            ..Default::default()
        };
        // The subject tracks themself on their own status stream so
        // followers joining later see current status immediately, and so
        // `update` has a tuple to replace.
        self.tracker.track(who.session_id, who.user_id.clone(), stream.clone(), PresenceMeta::default());
        self.tracker.update(who.session_id, &who.user_id, &stream, meta);
    }

    pub fn followers(&self, target_user_id: &str) -> usize {
        self.tracker.count_by_stream(&Self::stream_for(target_user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(session_id: u64, user_id: &str) -> Presence {
        Presence { session_id, user_id: user_id.to_string(), username: user_id.to_string() }
    }

    #[test]
    fn test_follow_tracks_follower_on_target_status_stream() {
        let tracker = Tracker::new();
        let status = StatusRegistry::new(&tracker);
        let follower = presence(1, "alice");

        status.follow(&follower, &["bob".to_string()]);
        assert_eq!(status.followers("bob"), 1);
    }

    #[test]
    fn test_unfollow_removes_subscription() {
        let tracker = Tracker::new();
        let status = StatusRegistry::new(&tracker);
        let follower = presence(1, "alice");

        status.follow(&follower, &["bob".to_string()]);
        status.unfollow(&follower, &["bob".to_string()]);
        assert_eq!(status.followers("bob"), 0);
    }

    #[test]
    fn test_update_emits_diff_to_followers() {
        let tracker = Tracker::new();
        let status = StatusRegistry::new(&tracker);
        let bob = presence(2, "bob");
        let follower = presence(1, "alice");

        status.follow(&follower, &["bob".to_string()]);
        tracker.drain_diffs();

        status.update(&bob, Some("in a match".to_string()));
        let diffs = tracker.drain_diffs();
        let has_update = diffs.iter().any(|(_, events)| {
            events.iter().any(|e| matches!(e, crate::tracker::DiffEvent::Update(..)))
        });
        assert!(has_update);
    }
}
