//! Matchmaker: a pool of tickets evaluated on a periodic pass (§4.5).
//!
//! Each ticket carries `min_count`/`max_count`/`count_multiple_of`, a
//! property map, and a query expression referencing other tickets'
//! properties. A small parsed boolean AST (`Query::{Term,Compare,And,Or,Not}`)
//! generalizes the teacher's fixed `required_properties`/`range_properties`
//! equality/range checks in `MatchmakerConfig` into the subset of Nakama's
//! matchmaker query grammar the spec calls for.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::session::Presence;

#[derive(Error, Debug)]
pub enum MatchmakerError {
    #[error("matchmaker ticket not found: {0}")]
    TicketNotFound(String),
    #[error("min_count must be >= 2 and max_count must be >= min_count")]
    InvalidRange,
    #[error("count_multiple_of does not divide the ticket's valid group sizes")]
    InvalidCountMultiple,
    #[error("session has reached its matchmaker ticket cap")]
    TicketCapExceeded,
    #[error("invalid query expression: {0}")]
    InvalidQuery(String),
}

impl MatchmakerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MatchmakerError::TicketNotFound(_) => ErrorCode::MatchmakerTicketNotFound,
            MatchmakerError::InvalidRange
            | MatchmakerError::InvalidCountMultiple
            | MatchmakerError::TicketCapExceeded
            | MatchmakerError::InvalidQuery(_) => ErrorCode::BadInput,
        }
    }
}

type Result<T> = std::result::Result<T, MatchmakerError>;

/// A ticket property value: string or number (§4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Str(String),
    Num(f64),
}

impl PropertyValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Num(n) => Some(*n),
            PropertyValue::Str(s) => s.parse().ok(),
        }
    }

    fn as_str(&self) -> String {
        match self {
            PropertyValue::Str(s) => s.clone(),
            PropertyValue::Num(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

/// Small boolean query AST over a ticket's property map (§4.5 supplement).
#[derive(Debug, Clone)]
pub enum Query {
    /// Bare/`+`-prefixed token: true when `field` is present with a truthy value.
    Term(String),
    Compare { field: String, op: CompareOp, value: String },
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
}

impl Query {
    /// Parses the grammar: space-separated `+term`/`-term`/bare-`term`
    /// tokens and `field:value` / `field:>=value` comparisons. A `|`
    /// inside a comparison value is sugar for an `Or` over equality
    /// alternatives (`region:us|eu`).
    pub fn parse(expr: &str) -> Result<Query> {
        let expr = expr.trim();
        if expr.is_empty() || expr == "*" {
            return Ok(Query::And(Vec::new()));
        }
        let mut clauses = Vec::new();
        for token in expr.split_whitespace() {
            let (negate, body) = if let Some(rest) = token.strip_prefix('-') {
                (true, rest)
            } else if let Some(rest) = token.strip_prefix('+') {
                (false, rest)
            } else {
                (false, token)
            };
            if body.is_empty() {
                return Err(MatchmakerError::InvalidQuery(token.to_string()));
            }
            let clause = Self::parse_clause(body)?;
            clauses.push(if negate { Query::Not(Box::new(clause)) } else { clause });
        }
        Ok(if clauses.len() == 1 { clauses.into_iter().next().unwrap() } else { Query::And(clauses) })
    }

    fn parse_clause(body: &str) -> Result<Query> {
        let Some((field, rest)) = body.split_once(':') else {
            return Ok(Query::Term(body.to_string()));
        };
        if field.is_empty() || rest.is_empty() {
            return Err(MatchmakerError::InvalidQuery(body.to_string()));
        }
        let (op, value) = if let Some(v) = rest.strip_prefix(">=") {
            (CompareOp::Ge, v)
        } else if let Some(v) = rest.strip_prefix("<=") {
            (CompareOp::Le, v)
        } else if let Some(v) = rest.strip_prefix("!=") {
            (CompareOp::Ne, v)
        } else if let Some(v) = rest.strip_prefix('>') {
            (CompareOp::Gt, v)
        } else if let Some(v) = rest.strip_prefix('<') {
            (CompareOp::Lt, v)
        } else {
            (CompareOp::Eq, rest)
        };

        if op == CompareOp::Eq && value.contains('|') {
            let alts: Vec<Query> = value
                .split('|')
                .map(|v| Query::Compare { field: field.to_string(), op: CompareOp::Eq, value: v.to_string() })
                .collect();
            return Ok(Query::Or(alts));
        }
        Ok(Query::Compare { field: field.to_string(), op, value: value.to_string() })
    }

    pub fn evaluate(&self, properties: &HashMap<String, PropertyValue>) -> bool {
        match self {
            Query::Term(field) => properties.get(field).map(is_truthy).unwrap_or(false),
            Query::Compare { field, op, value } => {
                let Some(candidate) = properties.get(field) else { return false };
                compare(candidate, *op, value)
            }
            Query::And(children) => children.iter().all(|q| q.evaluate(properties)),
            Query::Or(children) => children.iter().any(|q| q.evaluate(properties)),
            Query::Not(inner) => !inner.evaluate(properties),
        }
    }
}

fn is_truthy(value: &PropertyValue) -> bool {
    match value {
        PropertyValue::Num(n) => *n != 0.0,
        PropertyValue::Str(s) => !s.is_empty() && s != "false" && s != "0",
    }
}

fn compare(candidate: &PropertyValue, op: CompareOp, value: &str) -> bool {
    if let (Some(c), Ok(v)) = (candidate.as_f64(), value.parse::<f64>()) {
        return match op {
            CompareOp::Eq => (c - v).abs() < f64::EPSILON,
            CompareOp::Ne => (c - v).abs() >= f64::EPSILON,
            CompareOp::Ge => c >= v,
            CompareOp::Le => c <= v,
            CompareOp::Gt => c > v,
            CompareOp::Lt => c < v,
        };
    }
    let c = candidate.as_str();
    match op {
        CompareOp::Eq => c == value,
        CompareOp::Ne => c != value,
        CompareOp::Ge => c.as_str() >= value,
        CompareOp::Le => c.as_str() <= value,
        CompareOp::Gt => c.as_str() > value,
        CompareOp::Lt => c.as_str() < value,
    }
}

/// A pending matchmaker entry. `presences` holds every session folded in by
/// a party-scoped add (§4.6); a solo add has exactly one.
pub struct Ticket {
    pub id: String,
    pub session_id: Option<u64>,
    pub party_id: Option<String>,
    pub presences: Vec<Presence>,
    pub query_text: String,
    pub query: Query,
    pub min_count: u32,
    pub max_count: u32,
    pub count_multiple_of: Option<u32>,
    pub properties: HashMap<String, PropertyValue>,
    pub created_at: Instant,
}

impl Ticket {
    fn group_size(&self) -> u32 {
        self.presences.len() as u32
    }
}

/// A formed match: the output of a successful matching pass.
pub struct MatchmakerMatch {
    pub rendezvous: String,
    pub ticket_ids: Vec<String>,
    pub participants: Vec<Presence>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RendezvousClaims {
    mid: String,
    exp: u64,
}

/// Mints and verifies the signed opaque rendezvous token handed to clients
/// on a successful match, reusing the teacher's JWT `TokenService` shape
/// (`auth::tokens`) re-scoped to a single `mid`/`exp` claim pair (§4.5).
pub struct RendezvousTokens {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: u64,
}

impl RendezvousTokens {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    pub fn mint(&self, match_id: &str) -> String {
        let exp = unix_now() + self.ttl_secs;
        let claims = RendezvousClaims { mid: match_id.to_string(), exp };
        encode(&Header::default(), &claims, &self.encoding_key).expect("rendezvous token encoding")
    }

    pub fn verify(&self, token: &str) -> Option<String> {
        decode::<RendezvousClaims>(token, &self.decoding_key, &Validation::default())
            .ok()
            .map(|data| data.claims.mid)
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Hook invoked when a group is formed, letting the embedder reroute
/// participants into an existing match instead of minting a rendezvous
/// token. Returning `None` falls back to the token.
pub trait MatchmakerMatchedHook: Send + Sync {
    fn matched(&self, participants: &[Presence], properties: &[HashMap<String, PropertyValue>]) -> Option<String>;
}

struct Pool {
    tickets: HashMap<String, Ticket>,
    by_session: HashMap<u64, Vec<String>>,
}

impl Pool {
    fn new() -> Self {
        Self { tickets: HashMap::new(), by_session: HashMap::new() }
    }
}

pub struct Matchmaker {
    pool: RwLock<Pool>,
    max_tickets_per_session: usize,
    hook: RwLock<Option<Box<dyn MatchmakerMatchedHook>>>,
}

impl Matchmaker {
    pub fn new(max_tickets_per_session: usize) -> Self {
        Self {
            pool: RwLock::new(Pool::new()),
            max_tickets_per_session,
            hook: RwLock::new(None),
        }
    }

    pub fn on_matched(&self, hook: Box<dyn MatchmakerMatchedHook>) {
        *self.hook.write() = Some(hook);
    }

    /// Add(session, query, min, max, properties, count_multiple_of).
    pub fn add(
        &self,
        presences: Vec<Presence>,
        party_id: Option<String>,
        query_text: String,
        min_count: u32,
        max_count: u32,
        count_multiple_of: Option<u32>,
        properties: HashMap<String, PropertyValue>,
    ) -> Result<String> {
        if min_count < 2 || max_count < min_count {
            return Err(MatchmakerError::InvalidRange);
        }
        if let Some(m) = count_multiple_of {
            if m == 0 || min_count % m != 0 || max_count % m != 0 {
                return Err(MatchmakerError::InvalidCountMultiple);
            }
        }
        let query = Query::parse(&query_text)?;
        let session_id = presences.first().map(|p| p.session_id);

        let mut pool = self.pool.write();
        for p in &presences {
            let count = pool.by_session.get(&p.session_id).map(|v| v.len()).unwrap_or(0);
            if count >= self.max_tickets_per_session {
                return Err(MatchmakerError::TicketCapExceeded);
            }
        }

        let id = Uuid::new_v4().to_string();
        for p in &presences {
            pool.by_session.entry(p.session_id).or_default().push(id.clone());
        }
        pool.tickets.insert(
            id.clone(),
            Ticket {
                id: id.clone(),
                session_id,
                party_id,
                presences,
                query_text,
                query,
                min_count,
                max_count,
                count_multiple_of,
                properties,
                created_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Remove(session, ticket) — O(1) by ticket id.
    pub fn remove(&self, ticket_id: &str) -> Result<()> {
        let mut pool = self.pool.write();
        let ticket = pool.tickets.remove(ticket_id).ok_or_else(|| MatchmakerError::TicketNotFound(ticket_id.to_string()))?;
        for p in &ticket.presences {
            if let Some(ids) = pool.by_session.get_mut(&p.session_id) {
                ids.retain(|t| t != ticket_id);
            }
        }
        Ok(())
    }

    /// RemoveAll(session-id) — used by SessionRegistry on disconnect.
    pub fn remove_all(&self, session_id: u64) {
        let mut pool = self.pool.write();
        let ids = pool.by_session.remove(&session_id).unwrap_or_default();
        for id in ids {
            if let Some(ticket) = pool.tickets.remove(&id) {
                for p in &ticket.presences {
                    if p.session_id == session_id {
                        continue;
                    }
                    if let Some(other) = pool.by_session.get_mut(&p.session_id) {
                        other.retain(|t| t != &id);
                    }
                }
            }
        }
    }

    pub fn ticket_count(&self) -> usize {
        self.pool.read().tickets.len()
    }

    pub fn is_queued(&self, ticket_id: &str) -> bool {
        self.pool.read().tickets.contains_key(ticket_id)
    }

    /// One evaluation pass: greedily forms the largest mutually-compatible
    /// group within `[min,max]` for each unmatched ticket, oldest first
    /// (§4.5, Testable property 4 — consistency and no double-matching).
    pub fn tick(&self) -> Vec<MatchmakerMatch> {
        let mut pool = self.pool.write();
        let mut ordered: Vec<String> = pool.tickets.values().map(|t| t.id.clone()).collect();
        ordered.sort_by_key(|id| pool.tickets[id].created_at);

        let mut matched_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut results = Vec::new();

        for seed_id in &ordered {
            if matched_ids.contains(seed_id) {
                continue;
            }
            let Some(seed) = pool.tickets.get(seed_id) else { continue };
            let mut group = vec![seed_id.clone()];
            let mut count = seed.group_size();

            for cand_id in &ordered {
                if cand_id == seed_id || matched_ids.contains(cand_id) || group.contains(cand_id) {
                    continue;
                }
                if count >= seed.max_count {
                    break;
                }
                let Some(cand) = pool.tickets.get(cand_id) else { continue };
                let mutual = seed.query.evaluate(&cand.properties) && cand.query.evaluate(&seed.properties);
                if !mutual {
                    continue;
                }
                let next_count = count + cand.group_size();
                if next_count > seed.max_count {
                    continue;
                }
                group.push(cand_id.clone());
                count = next_count;
            }

            let multiple_ok = seed.count_multiple_of.map(|m| count % m == 0).unwrap_or(true);
            if count < seed.min_count || !multiple_ok {
                continue;
            }

            for id in &group {
                matched_ids.insert(id.clone());
            }

            let tickets: Vec<Ticket> = group.iter().map(|id| pool.tickets.remove(id).unwrap()).collect();
            for ticket in &tickets {
                for p in &ticket.presences {
                    if let Some(ids) = pool.by_session.get_mut(&p.session_id) {
                        ids.retain(|t| t != &ticket.id);
                    }
                }
            }

            let participants: Vec<Presence> = tickets.iter().flat_map(|t| t.presences.clone()).collect();
            let properties: Vec<HashMap<String, PropertyValue>> = tickets.iter().map(|t| t.properties.clone()).collect();
            let match_id = Uuid::new_v4().to_string();
            let rendezvous = self.hook.read().as_ref().and_then(|h| h.matched(&participants, &properties)).unwrap_or(match_id);

            results.push(MatchmakerMatch {
                rendezvous,
                ticket_ids: group,
                participants,
            });
        }

        results
    }
}

impl crate::session::TeardownHook for Matchmaker {
    fn on_session_removed(&self, session_id: u64) {
        self.remove_all(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(session_id: u64, user_id: &str) -> Presence {
        Presence { session_id, user_id: user_id.to_string(), username: user_id.to_string() }
    }

    #[test]
    fn test_query_term_and_compare() {
        let mut props = HashMap::new();
        props.insert("ranked".to_string(), PropertyValue::Num(1.0));
        props.insert("region".to_string(), PropertyValue::Str("eu".to_string()));
        props.insert("mmr".to_string(), PropertyValue::Num(1500.0));

        let q = Query::parse("+ranked region:eu mmr:>=1000").unwrap();
        assert!(q.evaluate(&props));

        let q2 = Query::parse("region:us").unwrap();
        assert!(!q2.evaluate(&props));

        let q3 = Query::parse("region:us|eu").unwrap();
        assert!(q3.evaluate(&props));

        let q4 = Query::parse("-region:eu").unwrap();
        assert!(!q4.evaluate(&props));
    }

    #[test]
    fn test_invalid_range_rejected() {
        let mm = Matchmaker::new(8);
        let err = mm.add(vec![presence(1, "a")], None, "*".into(), 1, 1, None, HashMap::new());
        assert!(matches!(err, Err(MatchmakerError::InvalidRange)));
    }

    #[test]
    fn test_two_compatible_tickets_match() {
        let mm = Matchmaker::new(8);
        let id1 = mm.add(vec![presence(1, "a")], None, "*".into(), 2, 2, None, HashMap::new()).unwrap();
        let id2 = mm.add(vec![presence(2, "b")], None, "*".into(), 2, 2, None, HashMap::new()).unwrap();

        let matches = mm.tick();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].participants.len(), 2);
        assert!(!mm.is_queued(&id1));
        assert!(!mm.is_queued(&id2));
    }

    #[test]
    fn test_never_matched_twice_in_same_pass() {
        let mm = Matchmaker::new(8);
        mm.add(vec![presence(1, "a")], None, "*".into(), 2, 2, None, HashMap::new()).unwrap();
        mm.add(vec![presence(2, "b")], None, "*".into(), 2, 2, None, HashMap::new()).unwrap();
        mm.add(vec![presence(3, "c")], None, "*".into(), 2, 2, None, HashMap::new()).unwrap();

        let matches = mm.tick();
        let matched_sessions: usize = matches.iter().map(|m| m.participants.len()).sum();
        assert_eq!(matched_sessions, 2);
        assert_eq!(mm.ticket_count(), 1);
    }

    #[test]
    fn test_remove_before_match_prevents_matching() {
        let mm = Matchmaker::new(8);
        let id1 = mm.add(vec![presence(1, "a")], None, "*".into(), 2, 2, None, HashMap::new()).unwrap();
        mm.add(vec![presence(2, "b")], None, "*".into(), 2, 2, None, HashMap::new()).unwrap();
        mm.remove(&id1).unwrap();

        let matches = mm.tick();
        assert!(matches.is_empty());
        assert_eq!(mm.ticket_count(), 1);
    }

    #[test]
    fn test_rendezvous_token_roundtrip() {
        let tokens = RendezvousTokens::new("test-secret-key-at-least-32-ch", 30);
        let token = tokens.mint("match-123");
        assert_eq!(tokens.verify(&token), Some("match-123".to_string()));
    }
}
