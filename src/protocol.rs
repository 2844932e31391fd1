//! Realtime wire protocol.
//!
//! Frames are length-prefixed (4-byte little-endian length) carrying a
//! `serde_json`-encoded [`Envelope`], mirroring the teacher's fixed-header +
//! payload framing in shape even though the payload set below is this
//! core's dispatch set (§6), not the teacher's room/RPC set.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Stream mode, shared with `tracker`/`presence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Notifications,
    Status,
    ChatChannel,
    Match,
    Party,
    Matchmaker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub session_id: u64,
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceDiff {
    pub joins: Vec<PresenceEvent>,
    pub leaves: Vec<PresenceEvent>,
}

/// Inbound/outbound payload variants (§6). Only the fields the dispatch
/// table and handlers actually need are modeled; opaque blobs stay as
/// `Vec<u8>`/`serde_json::Value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    ChannelJoin { target: String, r#type: StreamMode, persistence: bool, hidden: bool },
    ChannelLeave { channel_id: String },
    ChannelMessageSend { channel_id: String, content: serde_json::Value },
    ChannelMessageUpdate { channel_id: String, message_id: String, content: serde_json::Value },
    ChannelMessageRemove { channel_id: String, message_id: String },

    MatchCreate { module: String, label: Option<String>, tick_rate: u32 },
    MatchJoin { token_or_id: String, metadata: serde_json::Value },
    MatchLeave { match_id: String },
    MatchDataSend { match_id: String, op_code: i64, data: Vec<u8>, reliable: bool },

    MatchmakerAdd {
        query: String,
        min_count: u32,
        max_count: u32,
        count_multiple: Option<u32>,
        properties: std::collections::HashMap<String, serde_json::Value>,
    },
    MatchmakerRemove { ticket: String },

    StatusFollow { user_ids: Vec<String> },
    StatusUnfollow { user_ids: Vec<String> },
    StatusUpdate { status: Option<String> },

    PartyCreate { open: bool, max_size: usize },
    PartyJoin { party_id: String },
    PartyLeave { party_id: String },
    PartyPromote { party_id: String, session_id: u64 },
    PartyAccept { party_id: String, session_id: u64 },
    PartyRemove { party_id: String, session_id: u64 },
    PartyClose { party_id: String },
    PartyJoinRequestList { party_id: String },
    PartyMatchmakerAdd {
        party_id: String,
        query: String,
        min_count: u32,
        max_count: u32,
    },
    PartyMatchmakerRemove { party_id: String, ticket: String },
    PartyDataSend { party_id: String, op_code: i64, data: Vec<u8> },

    Rpc { id: String, payload: Vec<u8> },

    Ping,
    Pong,

    Error { code: ErrorCode, message: String, context: serde_json::Value },

    MatchmakerTicket { ticket: String },
    MatchmakerMatched {
        id: String,
        users: Vec<PresenceEvent>,
        self_presence: PresenceEvent,
        ticket: String,
    },

    NotificationsPresence(PresenceDiff),
    StatusPresence(PresenceDiff),
    ChannelPresence { channel_id: String, diff: PresenceDiff },
    MatchPresence { match_id: String, diff: PresenceDiff },
    PartyPresence { party_id: String, diff: PresenceDiff },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: Option<String>,
    pub payload: Option<Payload>,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self { correlation_id: None, payload: Some(payload) }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn ping() -> Self {
        Self::new(Payload::Ping)
    }

    pub fn pong() -> Self {
        Self::new(Payload::Pong)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(Payload::Error {
            code,
            message: message.into(),
            context: serde_json::Value::Null,
        })
    }

    /// Encodes to the wire: 4-byte little-endian length prefix + JSON body.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decodes one frame from the front of `data`, returning the envelope
    /// and the number of bytes consumed, or `None` if the buffer does not
    /// yet hold a complete frame.
    pub fn decode(data: &[u8]) -> Option<(serde_json::Result<Self>, usize)> {
        if data.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes(data[0..4].try_into().ok()?) as usize;
        let total = 4 + len;
        if data.len() < total {
            return None;
        }
        Some((serde_json::from_slice(&data[4..total]), total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_roundtrip() {
        let envelope = Envelope::ping().with_correlation("abc");
        let encoded = envelope.encode().unwrap();
        let (decoded, len) = Envelope::decode(&encoded).unwrap();
        let decoded = decoded.unwrap();

        assert_eq!(len, encoded.len());
        assert_eq!(decoded.correlation_id, Some("abc".to_string()));
        assert!(matches!(decoded.payload, Some(Payload::Ping)));
    }

    #[test]
    fn test_match_data_send_roundtrip() {
        let envelope = Envelope::new(Payload::MatchDataSend {
            match_id: "m1".into(),
            op_code: 7,
            data: vec![1, 2, 3],
            reliable: true,
        });
        let encoded = envelope.encode().unwrap();
        let (decoded, _) = Envelope::decode(&encoded).unwrap();
        match decoded.unwrap().payload {
            Some(Payload::MatchDataSend { op_code, data, .. }) => {
                assert_eq!(op_code, 7);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_frame_returns_none() {
        let envelope = Envelope::ping();
        let encoded = envelope.encode().unwrap();
        assert!(Envelope::decode(&encoded[..encoded.len() - 1]).is_none());
    }
}
