//! Channel message history (§6 `channel.message.*`).
//!
//! Membership and presence fan-out for `channel.join`/`channel.leave` live
//! entirely in `Tracker`/`MessageRouter` (a channel is just a
//! `PresenceStream` of mode `ChatChannel`); this module only keeps the
//! bounded message history a channel needs so `message.update`/`remove`
//! can find a prior message and check its author, mirroring the teacher's
//! own per-channel `VecDeque<ChatMessage>` history with a capped length.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::StreamMode;
use crate::tracker::PresenceStream;

/// Channels are identified by their `(type, target)` pair so repeat joins
/// against the same target converge on one channel.
pub fn channel_id(kind: StreamMode, target: &str) -> String {
    format!("{kind:?}:{target}")
}

pub fn stream_for(kind: StreamMode, target: &str) -> PresenceStream {
    PresenceStream::new(kind, target)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub content: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("not the sender")]
    NotSender,
}

struct History {
    messages: VecDeque<ChatMessage>,
    max: usize,
}

pub struct ChannelStore {
    channels: DashMap<String, History>,
    max_history: usize,
}

impl ChannelStore {
    pub fn new(max_history: usize) -> Self {
        Self { channels: DashMap::new(), max_history }
    }

    pub fn send(&self, channel_id: &str, sender_id: &str, sender_username: &str, content: serde_json::Value) -> ChatMessage {
        let now = now_millis();
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_username: sender_username.to_string(),
            content,
            created_at: now,
            updated_at: now,
        };
        let mut history = self.channels.entry(channel_id.to_string()).or_insert_with(|| History { messages: VecDeque::new(), max: self.max_history });
        history.messages.push_front(message.clone());
        while history.messages.len() > history.max {
            history.messages.pop_back();
        }
        message
    }

    pub fn update(&self, channel_id: &str, message_id: &str, sender_id: &str, content: serde_json::Value) -> std::result::Result<ChatMessage, ChatError> {
        let mut history = self.channels.get_mut(channel_id).ok_or_else(|| ChatError::ChannelNotFound(channel_id.to_string()))?;
        let message = history.messages.iter_mut().find(|m| m.id == message_id).ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        if message.sender_id != sender_id {
            return Err(ChatError::NotSender);
        }
        message.content = content;
        message.updated_at = now_millis();
        Ok(message.clone())
    }

    pub fn remove(&self, channel_id: &str, message_id: &str, sender_id: &str) -> std::result::Result<(), ChatError> {
        let mut history = self.channels.get_mut(channel_id).ok_or_else(|| ChatError::ChannelNotFound(channel_id.to_string()))?;
        let pos = history.messages.iter().position(|m| m.id == message_id).ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        if history.messages[pos].sender_id != sender_id {
            return Err(ChatError::NotSender);
        }
        history.messages.remove(pos);
        Ok(())
    }

    pub fn history(&self, channel_id: &str, limit: usize) -> Vec<ChatMessage> {
        self.channels.get(channel_id).map(|h| h.messages.iter().take(limit).cloned().collect()).unwrap_or_default()
    }
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new(100)
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_history() {
        let store = ChannelStore::new(10);
        let id = channel_id(StreamMode::ChatChannel, "general");
        store.send(&id, "u1", "alice", serde_json::json!("hi"));
        store.send(&id, "u2", "bob", serde_json::json!("hey"));

        let history = store.history(&id, 10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sender_id, "u2");
    }

    #[test]
    fn test_update_requires_sender() {
        let store = ChannelStore::new(10);
        let id = channel_id(StreamMode::ChatChannel, "general");
        let msg = store.send(&id, "u1", "alice", serde_json::json!("hi"));

        assert!(matches!(store.update(&id, &msg.id, "u2", serde_json::json!("edited")), Err(ChatError::NotSender)));
        let updated = store.update(&id, &msg.id, "u1", serde_json::json!("edited")).unwrap();
        assert_eq!(updated.content, serde_json::json!("edited"));
    }

    #[test]
    fn test_history_capped() {
        let store = ChannelStore::new(2);
        let id = channel_id(StreamMode::ChatChannel, "general");
        store.send(&id, "u1", "alice", serde_json::json!("1"));
        store.send(&id, "u1", "alice", serde_json::json!("2"));
        store.send(&id, "u1", "alice", serde_json::json!("3"));

        assert_eq!(store.history(&id, 10).len(), 2);
    }
}
