//! Message router (§4.3).
//!
//! Resolves the subscriber set for a stream from `Tracker` and enqueues
//! envelopes onto each subscriber's session via `SessionRegistry::send`.
//! `route_presence_diffs` is the tick-driven half: it drains `Tracker`'s
//! accumulated diff queue and turns each stream's joins/leaves into the
//! matching `*Presence` wire payload, fanned out to every presence
//! currently on that stream (so a joiner also hears about concurrent
//! joins/leaves observed in the same tick). `send_to_stream` is the
//! immediate half, used for chat messages and match data relay.
//!
//! This is the single-node direct-enqueue implementation (§4.3 Non-goals):
//! no cluster fan-out, no at-least-once redelivery.

use std::sync::Arc;

use crate::protocol::{Envelope, Payload, PresenceDiff, PresenceEvent};
use crate::session::SessionRegistry;
use crate::tracker::{DiffEvent, PresenceKey, PresenceStream, Tracker};
use crate::protocol::StreamMode;

pub struct MessageRouter {
    tracker: Arc<Tracker>,
    sessions: Arc<SessionRegistry>,
}

fn presence_event(key: &PresenceKey, username: &str) -> PresenceEvent {
    PresenceEvent { session_id: key.session_id, user_id: key.user_id.clone(), username: username.to_string() }
}

fn wrap_diff(stream: &PresenceStream, diff: PresenceDiff) -> Option<Payload> {
    match stream.mode {
        StreamMode::Notifications => Some(Payload::NotificationsPresence(diff)),
        StreamMode::Status => Some(Payload::StatusPresence(diff)),
        StreamMode::ChatChannel => Some(Payload::ChannelPresence { channel_id: stream.subject.clone(), diff }),
        StreamMode::Match => Some(Payload::MatchPresence { match_id: stream.subject.clone(), diff }),
        StreamMode::Party => Some(Payload::PartyPresence { party_id: stream.subject.clone(), diff }),
        StreamMode::Matchmaker => None,
    }
}

impl MessageRouter {
    pub fn new(tracker: Arc<Tracker>, sessions: Arc<SessionRegistry>) -> Self {
        Self { tracker, sessions }
    }

    /// Drains the tracker's diff queue and broadcasts one presence-diff
    /// envelope per affected stream to every presence currently on it.
    pub fn route_presence_diffs(&self) {
        for (stream, events) in self.tracker.drain_diffs() {
            let mut joins = Vec::new();
            let mut leaves = Vec::new();
            for event in events {
                match event {
                    DiffEvent::Join(key, meta) => joins.push(presence_event(&key, &meta.username)),
                    DiffEvent::Leave(key, meta) => leaves.push(presence_event(&key, &meta.username)),
                    DiffEvent::Update(key, meta) => {
                        joins.push(presence_event(&key, &meta.username));
                        leaves.push(presence_event(&key, &meta.username));
                    }
                }
            }
            let Some(payload) = wrap_diff(&stream, PresenceDiff { joins, leaves }) else { continue };
            self.broadcast_to_stream(&stream, Envelope::new(payload));
        }
    }

    /// Sends `envelope` to every presence currently subscribed to `stream`.
    pub fn broadcast_to_stream(&self, stream: &PresenceStream, envelope: Envelope) {
        for (key, _meta) in self.tracker.list_by_stream(stream) {
            let _ = self.sessions.send(key.session_id, envelope.clone());
        }
    }

    /// Sends `envelope` to a single session, ignoring a missing session
    /// (it may have just disconnected).
    pub fn send_to_session(&self, session_id: u64, envelope: Envelope) {
        let _ = self.sessions.send(session_id, envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::PresenceMeta;

    fn new_router() -> (MessageRouter, Arc<Tracker>, Arc<SessionRegistry>) {
        let tracker = Arc::new(Tracker::new());
        let sessions = Arc::new(SessionRegistry::new(16));
        let router = MessageRouter::new(tracker.clone(), sessions.clone());
        (router, tracker, sessions)
    }

    #[test]
    fn test_route_presence_diffs_reaches_other_subscriber() {
        let (router, tracker, sessions) = new_router();
        let addr: std::net::SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let alice = sessions.add("alice".into(), Some("alice".into()), addr, 0);
        let bob = sessions.add("bob".into(), Some("bob".into()), addr, 0);

        let stream = PresenceStream::new(StreamMode::ChatChannel, "general");
        tracker.track(alice, "alice", stream.clone(), PresenceMeta { username: "alice".into(), ..Default::default() });
        tracker.drain_diffs();

        tracker.track(bob, "bob", stream.clone(), PresenceMeta { username: "bob".into(), ..Default::default() });
        router.route_presence_diffs();

        let session = sessions.get(alice).unwrap();
        assert!(!session.outbound().is_empty());
    }

    #[test]
    fn test_send_to_stream_reaches_all_subscribers() {
        let (router, tracker, sessions) = new_router();
        let addr: std::net::SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let alice = sessions.add("alice".into(), Some("alice".into()), addr, 0);
        let bob = sessions.add("bob".into(), Some("bob".into()), addr, 0);

        let stream = PresenceStream::new(StreamMode::ChatChannel, "general");
        tracker.track(alice, "alice", stream.clone(), PresenceMeta::default());
        tracker.track(bob, "bob", stream.clone(), PresenceMeta::default());

        router.broadcast_to_stream(&stream, Envelope::new(Payload::ChannelMessageSend { channel_id: "general".into(), content: serde_json::json!("hi") }));

        assert!(!sessions.get(alice).unwrap().outbound().is_empty());
        assert!(!sessions.get(bob).unwrap().outbound().is_empty());
    }
}
