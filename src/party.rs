//! Party registry: small coordinated groups (≤max-size, typically 8).
//!
//! Grounded on the teacher's `room.rs` `Room`/`RoomRegistry` (owner-less,
//! flat `HashSet` of members) generalized with an explicit leader slot,
//! insertion-ordered membership (`Vec` preserving join order for leader
//! succession), and separate invite/join-request sets, since `room.rs`'s
//! model has neither a leader nor invite semantics (§4.6).

use std::collections::HashSet;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::session::Presence;

#[derive(Error, Debug)]
pub enum PartyError {
    #[error("party not found: {0}")]
    NotFound(String),
    #[error("party is closed")]
    Closed,
    #[error("session is not a member of this party")]
    NotAMember,
    #[error("party is full")]
    Full,
    #[error("only the leader may perform this action")]
    NotLeader,
}

impl PartyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PartyError::NotFound(_) => ErrorCode::BadInput,
            PartyError::Closed => ErrorCode::PartyClosed,
            PartyError::NotAMember => ErrorCode::PartyNotAMember,
            PartyError::Full => ErrorCode::PartyFull,
            PartyError::NotLeader => ErrorCode::Unauthorized,
        }
    }
}

type Result<T> = std::result::Result<T, PartyError>;

/// A party's mutable membership state, held behind one lock so
/// leader-transfer-on-leave stays atomic with member removal.
struct PartyMembers {
    leader: u64,
    /// Insertion order, oldest first; leadership transfers to the front
    /// remaining member when the leader leaves.
    members: Vec<u64>,
    invites: HashSet<u64>,
    join_requests: HashSet<u64>,
    open: bool,
    closed: bool,
}

pub struct Party {
    pub id: String,
    pub max_size: usize,
    pub label: String,
    pub created_at: Instant,
    state: RwLock<PartyMembers>,
}

impl Party {
    fn new(id: String, leader: u64, open: bool, max_size: usize, label: String) -> Self {
        Self {
            id,
            max_size,
            label,
            created_at: Instant::now(),
            state: RwLock::new(PartyMembers {
                leader,
                members: vec![leader],
                invites: HashSet::new(),
                join_requests: HashSet::new(),
                open,
                closed: false,
            }),
        }
    }

    pub fn leader(&self) -> u64 {
        self.state.read().leader
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    pub fn members(&self) -> Vec<u64> {
        self.state.read().members.clone()
    }

    pub fn member_count(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn is_member(&self, session_id: u64) -> bool {
        self.state.read().members.contains(&session_id)
    }

    pub fn join_requests(&self) -> Vec<u64> {
        self.state.read().join_requests.iter().copied().collect()
    }
}

/// Side effects the registry performs as a result of an operation, so the
/// server layer can feed Tracker/Matchmaker without the party module
/// depending on either directly.
#[derive(Debug, Clone)]
pub enum PartyEvent {
    MemberJoined(u64),
    MemberLeft(u64),
    LeaderChanged(u64),
    Closed,
}

pub struct PartyRegistry {
    parties: DashMap<String, Party>,
    by_session: DashMap<u64, String>,
}

impl PartyRegistry {
    pub fn new() -> Self {
        Self {
            parties: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    /// Create(leader, open, max_size) — the creating session becomes leader
    /// and sole member.
    pub fn create(&self, leader: u64, open: bool, max_size: usize, label: String) -> String {
        let id = Uuid::new_v4().to_string();
        let party = Party::new(id.clone(), leader, open, max_size.max(1), label);
        self.parties.insert(id.clone(), party);
        self.by_session.insert(leader, id.clone());
        id
    }

    pub fn get(&self, id: &str) -> Option<dashmap::mapref::one::Ref<'_, String, Party>> {
        self.parties.get(id)
    }

    pub fn party_for_session(&self, session_id: u64) -> Option<String> {
        self.by_session.get(&session_id).map(|r| r.clone())
    }

    /// Join(party, session) — succeeds immediately on an open party;
    /// otherwise registers a join request for the leader to accept.
    pub fn join(&self, party_id: &str, session_id: u64) -> Result<bool> {
        let party = self.parties.get(party_id).ok_or_else(|| PartyError::NotFound(party_id.to_string()))?;
        let mut state = party.state.write();
        if state.closed {
            return Err(PartyError::Closed);
        }
        if state.members.len() >= party.max_size {
            return Err(PartyError::Full);
        }
        if state.open {
            if !state.members.contains(&session_id) {
                state.members.push(session_id);
                drop(state);
                self.by_session.insert(session_id, party_id.to_string());
            }
            Ok(true)
        } else {
            state.join_requests.insert(session_id);
            Ok(false)
        }
    }

    /// Accept(party, leader, session) — leader admits a pending join request.
    /// Returns `true` if a request was actually pending and the session was
    /// admitted, `false` on a no-op (stale/duplicate accept of a session with
    /// no pending request), mirroring `join`'s admitted/queued bool so the
    /// caller can tell a real membership change from a no-op before mirroring
    /// it into presence tracking.
    pub fn accept(&self, party_id: &str, leader: u64, session_id: u64) -> Result<bool> {
        let party = self.parties.get(party_id).ok_or_else(|| PartyError::NotFound(party_id.to_string()))?;
        let mut state = party.state.write();
        if state.closed {
            return Err(PartyError::Closed);
        }
        if state.leader != leader {
            return Err(PartyError::NotLeader);
        }
        if state.members.len() >= party.max_size {
            return Err(PartyError::Full);
        }
        if state.join_requests.remove(&session_id) && !state.members.contains(&session_id) {
            state.members.push(session_id);
            drop(state);
            self.by_session.insert(session_id, party_id.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Promote(party, leader, session) — transfers leadership explicitly.
    pub fn promote(&self, party_id: &str, leader: u64, session_id: u64) -> Result<()> {
        let party = self.parties.get(party_id).ok_or_else(|| PartyError::NotFound(party_id.to_string()))?;
        let mut state = party.state.write();
        if state.leader != leader {
            return Err(PartyError::NotLeader);
        }
        if !state.members.contains(&session_id) {
            return Err(PartyError::NotAMember);
        }
        state.leader = session_id;
        Ok(())
    }

    /// Remove(party, actor, session) — leader kicks a member, or a member
    /// removes itself. If the leader leaves, leadership transfers to the
    /// next member by insertion order; the party is destroyed when empty.
    pub fn remove(&self, party_id: &str, actor: u64, session_id: u64) -> Result<bool> {
        let party = self.parties.get(party_id).ok_or_else(|| PartyError::NotFound(party_id.to_string()))?;
        let destroy;
        {
            let mut state = party.state.write();
            if actor != session_id && state.leader != actor {
                return Err(PartyError::NotLeader);
            }
            if !state.members.contains(&session_id) {
                return Err(PartyError::NotAMember);
            }
            state.members.retain(|&m| m != session_id);
            if state.leader == session_id {
                if let Some(&next) = state.members.first() {
                    state.leader = next;
                }
            }
            destroy = state.members.is_empty();
        }
        self.by_session.remove(&session_id);
        if destroy {
            self.parties.remove(party_id);
        }
        Ok(destroy)
    }

    /// Close(party, leader) — leader dissolves the party outright; every
    /// member is evicted and the party removed.
    pub fn close(&self, party_id: &str, leader: u64) -> Result<Vec<u64>> {
        let (_, party) = self.parties.remove(party_id).ok_or_else(|| PartyError::NotFound(party_id.to_string()))?;
        let members = {
            let mut state = party.state.write();
            if state.leader != leader {
                // re-insert; close failed
                let members = state.members.clone();
                drop(state);
                self.parties.insert(party_id.to_string(), party);
                return if members.contains(&leader) { Err(PartyError::NotLeader) } else { Err(PartyError::NotAMember) };
            }
            state.closed = true;
            state.members.clone()
        };
        for m in &members {
            self.by_session.remove(m);
        }
        Ok(members)
    }

    /// RemoveActive(session) — called on session teardown; removes the
    /// session from whatever party it belongs to without requiring leader
    /// authorization (idempotent).
    pub fn remove_active(&self, session_id: u64) {
        let Some(party_id) = self.by_session.get(&session_id).map(|r| r.clone()) else {
            return;
        };
        let Some(party) = self.parties.get(&party_id) else {
            self.by_session.remove(&session_id);
            return;
        };
        let destroy = {
            let mut state = party.state.write();
            state.members.retain(|&m| m != session_id);
            state.invites.remove(&session_id);
            state.join_requests.remove(&session_id);
            if state.leader == session_id {
                if let Some(&next) = state.members.first() {
                    state.leader = next;
                }
            }
            state.members.is_empty()
        };
        drop(party);
        self.by_session.remove(&session_id);
        if destroy {
            self.parties.remove(&party_id);
        }
    }

    pub fn member_presences(&self, party_id: &str, lookup: impl Fn(u64) -> Option<Presence>) -> Vec<Presence> {
        self.get(party_id)
            .map(|p| p.members().into_iter().filter_map(&lookup).collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.parties.len()
    }
}

impl Default for PartyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::session::TeardownHook for PartyRegistry {
    fn on_session_removed(&self, session_id: u64) {
        self.remove_active(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_join_open_party() {
        let registry = PartyRegistry::new();
        let id = registry.create(1, true, 4, "squad".into());
        assert!(registry.join(&id, 2).unwrap());
        assert_eq!(registry.get(&id).unwrap().member_count(), 2);
    }

    #[test]
    fn test_closed_party_requires_accept() {
        let registry = PartyRegistry::new();
        let id = registry.create(1, false, 4, "".into());
        assert!(!registry.join(&id, 2).unwrap());
        assert_eq!(registry.get(&id).unwrap().member_count(), 1);
        assert!(registry.accept(&id, 1, 2).unwrap());
        assert_eq!(registry.get(&id).unwrap().member_count(), 2);
    }

    #[test]
    fn test_accept_is_noop_without_pending_request() {
        let registry = PartyRegistry::new();
        let id = registry.create(1, false, 4, "".into());
        assert!(!registry.accept(&id, 1, 2).unwrap());
        assert_eq!(registry.get(&id).unwrap().member_count(), 1);
        assert!(!registry.get(&id).unwrap().is_member(2));
    }

    #[test]
    fn test_leader_succession_on_leave() {
        let registry = PartyRegistry::new();
        let id = registry.create(1, true, 4, "".into());
        registry.join(&id, 2).unwrap();
        registry.join(&id, 3).unwrap();

        registry.remove(&id, 1, 1).unwrap();
        assert_eq!(registry.get(&id).unwrap().leader(), 2);
    }

    #[test]
    fn test_party_destroyed_when_empty() {
        let registry = PartyRegistry::new();
        let id = registry.create(1, true, 4, "".into());
        let destroyed = registry.remove(&id, 1, 1).unwrap();
        assert!(destroyed);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_remove_active_is_idempotent_teardown() {
        let registry = PartyRegistry::new();
        let id = registry.create(1, true, 4, "".into());
        registry.join(&id, 2).unwrap();

        registry.remove_active(2);
        registry.remove_active(2);
        assert_eq!(registry.get(&id).unwrap().member_count(), 1);
    }

    #[test]
    fn test_close_evicts_all_members() {
        let registry = PartyRegistry::new();
        let id = registry.create(1, true, 4, "".into());
        registry.join(&id, 2).unwrap();

        let evicted = registry.close(&id, 1).unwrap();
        assert_eq!(evicted.len(), 2);
        assert!(registry.get(&id).is_none());
        assert!(registry.party_for_session(2).is_none());
    }
}
