//! Authoritative match runtime (§4.4).
//!
//! Each match owns a dedicated OS thread (the executor) so all mutation of
//! match state happens on a single thread per match, matching the "parallel
//! with cooperative per-entity serialization" model of §5. Two bounded
//! `crossbeam-channel`s feed the executor: a data queue for unreliable
//! in-match messages (`match.input_queue_size`, drop-and-log on full) and a
//! call queue for control operations that need a reply (join/leave/signal/
//! stop, `match.call_queue_size`). A panic inside a handler callback is
//! trapped with `catch_unwind`; the match terminates and broadcasts a
//! terminal presence event rather than poisoning the process.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;

#[derive(Debug, Clone, Error)]
pub enum MatchError {
    #[error("match not found: {0}")]
    NotFound(String),
    #[error("match full: {current}/{max} players")]
    MatchFull { current: usize, max: usize },
    #[error("player already in match")]
    AlreadyJoined,
    #[error("player not in match")]
    NotInMatch,
    #[error("match ended")]
    MatchEnded,
    #[error("join rejected: {0}")]
    JoinRejected(String),
    #[error("handler error: {0}")]
    HandlerError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MatchError::NotFound(_) => ErrorCode::MatchNotFound,
            MatchError::HandlerError(_) => ErrorCode::RuntimeFunctionException,
            MatchError::MatchFull { .. }
            | MatchError::AlreadyJoined
            | MatchError::NotInMatch
            | MatchError::MatchEnded
            | MatchError::JoinRejected(_)
            | MatchError::Internal(_) => ErrorCode::BadInput,
        }
    }
}

pub type Result<T> = std::result::Result<T, MatchError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPresence {
    pub user_id: String,
    pub session_id: u64,
    pub username: String,
    pub node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchMessage {
    pub sender: MatchPresence,
    pub op_code: i64,
    pub data: Vec<u8>,
    pub reliable: bool,
    pub received_at: u64,
}

#[derive(Debug, Clone)]
pub struct MatchContext {
    pub match_id: String,
    pub node: String,
    pub created_at: Instant,
    pub label: Option<String>,
    pub vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchState {
    pub state: serde_json::Value,
    pub tick: u64,
    pub presences: Vec<MatchPresence>,
    pub label: Option<String>,
    pub tick_rate: u32,
    pub max_size: usize,
    pub empty_timeout_secs: Option<u32>,
}

impl MatchState {
    pub fn new(initial_state: serde_json::Value) -> Self {
        Self {
            state: initial_state,
            tick: 0,
            presences: Vec::new(),
            label: None,
            tick_rate: 10,
            max_size: 16,
            empty_timeout_secs: Some(30),
        }
    }

    pub fn with_tick_rate(mut self, rate: u32) -> Self {
        self.tick_rate = rate;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }
}

#[derive(Debug, Clone)]
pub struct MatchInit {
    pub state: MatchState,
    pub tick_rate: u32,
    pub label: Option<String>,
}

pub trait MatchDispatcher: Send + Sync {
    fn broadcast(&self, match_id: &str, op_code: i64, data: &[u8], reliable: bool);
    fn send(&self, match_id: &str, presences: &[MatchPresence], op_code: i64, data: &[u8], reliable: bool);
    fn kick(&self, match_id: &str, presence: &MatchPresence);
    /// Broadcasts the terminal match-presence event fired when a match
    /// terminates, including on a trapped panic (§4.4).
    fn terminate(&self, match_id: &str);
}

pub struct NullDispatcher;

impl MatchDispatcher for NullDispatcher {
    fn broadcast(&self, _match_id: &str, _op_code: i64, _data: &[u8], _reliable: bool) {}
    fn send(&self, _match_id: &str, _presences: &[MatchPresence], _op_code: i64, _data: &[u8], _reliable: bool) {}
    fn kick(&self, _match_id: &str, _presence: &MatchPresence) {}
    fn terminate(&self, _match_id: &str) {}
}

pub trait MatchHandler: Send + Sync {
    fn init(&self, ctx: &MatchContext, params: serde_json::Value) -> Result<MatchInit>;

    /// Validates a prospective joiner before any state mutation or presence
    /// tracking happens (§4.4's `match_join_attempt`). Default: accept.
    fn join_attempt(&self, ctx: &MatchContext, state: &MatchState, presence: &MatchPresence) -> (bool, Option<String>) {
        let _ = (ctx, state, presence);
        (true, None)
    }

    fn join(&self, ctx: &MatchContext, dispatcher: &dyn MatchDispatcher, state: &mut MatchState, presences: Vec<MatchPresence>) -> Result<()>;

    fn leave(&self, ctx: &MatchContext, dispatcher: &dyn MatchDispatcher, state: &mut MatchState, presences: Vec<MatchPresence>) -> Result<()>;

    fn tick(&self, ctx: &MatchContext, dispatcher: &dyn MatchDispatcher, state: &mut MatchState, messages: Vec<MatchMessage>) -> Result<()>;

    fn terminate(&self, ctx: &MatchContext, state: &MatchState) -> Result<()>;

    fn signal(&self, ctx: &MatchContext, dispatcher: &dyn MatchDispatcher, state: &mut MatchState, data: &str) -> Result<Option<String>> {
        let _ = (ctx, dispatcher, state, data);
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLifecycle {
    Created,
    Running,
    Stopped,
}

enum Call {
    Join { presence: MatchPresence, reply: Sender<Result<()>> },
    Leave { session_id: u64, reply: Sender<Result<()>> },
    Signal { data: String, reply: Sender<Result<Option<String>>> },
    Stop { reply: Sender<Result<()>> },
}

/// Info the registry can read without crossing into the executor thread.
struct SharedInfo {
    lifecycle: Mutex<MatchLifecycle>,
    player_count: AtomicUsize,
    label: RwLock<Option<String>>,
    tick: AtomicU64,
    created_at: Instant,
}

/// A live match: the registry's handle onto its dedicated executor thread.
pub struct MatchHandle {
    pub id: String,
    call_tx: Sender<Call>,
    data_tx: Sender<MatchMessage>,
    shared: Arc<SharedInfo>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl MatchHandle {
    pub fn lifecycle(&self) -> MatchLifecycle {
        *self.shared.lifecycle.lock()
    }

    pub fn player_count(&self) -> usize {
        self.shared.player_count.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> Option<String> {
        self.shared.label.read().clone()
    }

    pub fn tick(&self) -> u64 {
        self.shared.tick.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    const CALL_TIMEOUT: Duration = Duration::from_secs(2);

    fn call<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Call) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.call_tx
            .send(build(reply_tx))
            .map_err(|_| MatchError::Internal("match executor gone".into()))?;
        reply_rx
            .recv_timeout(Self::CALL_TIMEOUT)
            .map_err(|_| MatchError::Internal("match executor did not reply".into()))?
    }

    pub fn join(&self, presence: MatchPresence) -> Result<()> {
        self.call(|reply| Call::Join { presence, reply })
    }

    pub fn leave(&self, session_id: u64) -> Result<()> {
        self.call(|reply| Call::Leave { session_id, reply })
    }

    pub fn signal(&self, data: String) -> Result<Option<String>> {
        self.call(|reply| Call::Signal { data, reply })
    }

    pub fn stop(&self) -> Result<()> {
        self.call(|reply| Call::Stop { reply })
    }

    /// Enqueues in-match data; a full queue is dropped and logged, never
    /// blocked on (§4.4, §5 suspension-point note).
    pub fn send_data(&self, msg: MatchMessage) {
        if let Err(TrySendError::Full(_)) = self.data_tx.try_send(msg) {
            tracing::warn!(match_id = %self.id, "match input queue full, dropping message");
        }
    }
}

fn run_executor(
    handler: Arc<dyn MatchHandler>,
    ctx: MatchContext,
    mut state: MatchState,
    call_rx: Receiver<Call>,
    data_rx: Receiver<MatchMessage>,
    shared: Arc<SharedInfo>,
    dispatcher: Arc<dyn MatchDispatcher>,
) {
    let mut pending: Vec<MatchMessage> = Vec::new();
    let mut pending_joins: Vec<(MatchPresence, Sender<Result<()>>)> = Vec::new();
    let match_id = ctx.match_id.clone();

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        loop {
            let tick_rate = state.tick_rate.max(1) as u64;
            let tick_interval = Duration::from_millis(1000 / tick_rate);

            select! {
                recv(call_rx) -> msg => {
                    let Ok(call) = msg else { break };
                    match call {
                        Call::Join { presence, reply } => {
                            match check_join(&handler, &ctx, &state, &pending_joins, &presence) {
                                Ok(()) => pending_joins.push((presence, reply)),
                                Err(e) => { let _ = reply.send(Err(e)); }
                            }
                        }
                        Call::Leave { session_id, reply } => {
                            let result = handle_leave(&handler, &ctx, dispatcher.as_ref(), &mut state, session_id);
                            shared.player_count.store(state.presences.len(), Ordering::Relaxed);
                            let _ = reply.send(result);
                        }
                        Call::Signal { data, reply } => {
                            let result = handler.signal(&ctx, dispatcher.as_ref(), &mut state, &data)
                                .map_err(|e| MatchError::HandlerError(e.to_string()));
                            let _ = reply.send(result);
                        }
                        Call::Stop { reply } => {
                            let _ = reply.send(Ok(()));
                            return;
                        }
                    }
                }
                recv(data_rx) -> msg => {
                    if let Ok(m) = msg {
                        pending.push(m);
                    }
                }
                default(tick_interval) => {
                    // Joiners accepted since the last tick are applied and handed to
                    // the handler as one batch, on this tick, per §4.4.
                    if !pending_joins.is_empty() {
                        let joiners = std::mem::take(&mut pending_joins);
                        apply_pending_joins(&handler, &ctx, dispatcher.as_ref(), &mut state, shared.as_ref(), joiners);
                    }
                    if *shared.lifecycle.lock() == MatchLifecycle::Running {
                        state.tick += 1;
                        let messages = std::mem::take(&mut pending);
                        if let Err(e) = handler.tick(&ctx, dispatcher.as_ref(), &mut state, messages) {
                            tracing::warn!(match_id = %ctx.match_id, error = %e, "match tick handler failed");
                        }
                        shared.tick.store(state.tick, Ordering::Relaxed);
                    }
                }
            }
        }
    }));

    *shared.lifecycle.lock() = MatchLifecycle::Stopped;
    match outcome {
        Ok(()) => {
            let _ = handler.terminate(&ctx, &state);
        }
        Err(_) => {
            tracing::error!(match_id = %match_id, "match executor panicked, terminating");
        }
    }
    dispatcher.terminate(&match_id);
}

/// Validates a prospective joiner against both committed state and any
/// joiners already accepted for the next tick's batch (§4.4). Runs
/// synchronously off the `Call::Join` arm so a caller gets an immediate
/// accept/reject verdict; the state mutation and handler callback are
/// deferred to `apply_pending_joins` on the next tick.
fn check_join(
    handler: &Arc<dyn MatchHandler>,
    ctx: &MatchContext,
    state: &MatchState,
    pending_joins: &[(MatchPresence, Sender<Result<()>>)],
    presence: &MatchPresence,
) -> Result<()> {
    let already_in = state.presences.iter().any(|p| p.session_id == presence.session_id)
        || pending_joins.iter().any(|(p, _)| p.session_id == presence.session_id);
    if already_in {
        return Err(MatchError::AlreadyJoined);
    }
    let prospective = state.presences.len() + pending_joins.len();
    if prospective >= state.max_size {
        return Err(MatchError::MatchFull { current: prospective, max: state.max_size });
    }
    let (accept, reason) = handler.join_attempt(ctx, state, presence);
    if !accept {
        return Err(MatchError::JoinRejected(reason.unwrap_or_default()));
    }
    Ok(())
}

/// Commits every joiner accepted since the last tick in one batch: records
/// their presences, calls the handler's `join` once with the whole group,
/// then replies to each caller with that shared result (§4.4, Concrete
/// Scenario S2 — join lands on the subsequent tick, not inline on accept).
fn apply_pending_joins(
    handler: &Arc<dyn MatchHandler>,
    ctx: &MatchContext,
    dispatcher: &dyn MatchDispatcher,
    state: &mut MatchState,
    shared: &SharedInfo,
    joiners: Vec<(MatchPresence, Sender<Result<()>>)>,
) {
    let presences: Vec<MatchPresence> = joiners.iter().map(|(p, _)| p.clone()).collect();
    state.presences.extend(presences.clone());
    let result = handler.join(ctx, dispatcher, state, presences).map_err(|e| MatchError::HandlerError(e.to_string()));

    shared.player_count.store(state.presences.len(), Ordering::Relaxed);
    *shared.lifecycle.lock() = MatchLifecycle::Running;

    for (_, reply) in joiners {
        let _ = reply.send(result.clone());
    }
}

fn handle_leave(
    handler: &Arc<dyn MatchHandler>,
    ctx: &MatchContext,
    dispatcher: &dyn MatchDispatcher,
    state: &mut MatchState,
    session_id: u64,
) -> Result<()> {
    let idx = state.presences.iter().position(|p| p.session_id == session_id).ok_or(MatchError::NotInMatch)?;
    let presence = state.presences.remove(idx);
    handler.leave(ctx, dispatcher, state, vec![presence]).map_err(|e| MatchError::HandlerError(e.to_string()))
}

pub struct MatchHandlerRegistry {
    handlers: dashmap::DashMap<String, Arc<dyn MatchHandler>>,
}

impl MatchHandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: dashmap::DashMap::new() }
    }

    pub fn register(&self, name: impl Into<String>, handler: impl MatchHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MatchHandler>> {
        self.handlers.get(name).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<String> {
        self.handlers.iter().map(|r| r.key().clone()).collect()
    }
}

impl Default for MatchHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MatchRegistry {
    matches: dashmap::DashMap<String, MatchHandle>,
    handlers: Arc<MatchHandlerRegistry>,
    dispatcher: Arc<dyn MatchDispatcher>,
    id_counter: AtomicU64,
    input_queue_size: usize,
    call_queue_size: usize,
}

impl MatchRegistry {
    pub fn new(handlers: Arc<MatchHandlerRegistry>, dispatcher: Arc<dyn MatchDispatcher>, input_queue_size: usize, call_queue_size: usize) -> Self {
        Self {
            matches: dashmap::DashMap::new(),
            handlers,
            dispatcher,
            id_counter: AtomicU64::new(1),
            input_queue_size: input_queue_size.max(1),
            call_queue_size: call_queue_size.max(1),
        }
    }

    /// Create(handler, params, label) — spawns the match's dedicated
    /// executor thread (§4.4).
    pub fn create(&self, handler_name: &str, params: serde_json::Value, label: Option<String>) -> Result<String> {
        let handler = self.handlers.get(handler_name).ok_or_else(|| MatchError::NotFound(format!("handler not found: {handler_name}")))?;
        let id = format!("match-{}", self.id_counter.fetch_add(1, Ordering::Relaxed));

        let ctx = MatchContext { match_id: id.clone(), node: "local".to_string(), created_at: Instant::now(), label: label.clone(), vars: HashMap::new() };
        let init = handler.init(&ctx, params).map_err(|e| MatchError::HandlerError(e.to_string()))?;
        let mut state = init.state;
        state.tick_rate = init.tick_rate;
        state.label = init.label.or(label);

        let shared = Arc::new(SharedInfo {
            lifecycle: Mutex::new(MatchLifecycle::Created),
            player_count: AtomicUsize::new(0),
            label: RwLock::new(state.label.clone()),
            tick: AtomicU64::new(0),
            created_at: ctx.created_at,
        });

        let (call_tx, call_rx) = bounded(self.call_queue_size);
        let (data_tx, data_rx) = bounded(self.input_queue_size);

        let thread_handler = handler;
        let thread_ctx = ctx;
        let thread_shared = shared.clone();
        let thread_dispatcher = self.dispatcher.clone();
        let thread = std::thread::Builder::new()
            .name(format!("match-{id}"))
            .spawn(move || run_executor(thread_handler, thread_ctx, state, call_rx, data_rx, thread_shared, thread_dispatcher))
            .map_err(|e| MatchError::Internal(e.to_string()))?;

        self.matches.insert(
            id.clone(),
            MatchHandle { id: id.clone(), call_tx, data_tx, shared, _thread: Some(thread) },
        );
        Ok(id)
    }

    pub fn get(&self, match_id: &str) -> Option<dashmap::mapref::one::Ref<'_, String, MatchHandle>> {
        self.matches.get(match_id)
    }

    pub fn join(&self, match_id: &str, presence: MatchPresence) -> Result<()> {
        let handle = self.matches.get(match_id).ok_or_else(|| MatchError::NotFound(match_id.to_string()))?;
        handle.join(presence)
    }

    pub fn leave(&self, match_id: &str, session_id: u64) -> Result<()> {
        let handle = self.matches.get(match_id).ok_or_else(|| MatchError::NotFound(match_id.to_string()))?;
        handle.leave(session_id)
    }

    /// LeaveActive(session) — best-effort leave across every match, used
    /// by SessionRegistry teardown fan-out; errors are swallowed since the
    /// session may not be a member of most matches.
    pub fn leave_active(&self, session_id: u64) {
        for entry in self.matches.iter() {
            let _ = entry.value().leave(session_id);
        }
    }

    pub fn send_message(&self, match_id: &str, msg: MatchMessage) -> Result<()> {
        let handle = self.matches.get(match_id).ok_or_else(|| MatchError::NotFound(match_id.to_string()))?;
        handle.send_data(msg);
        Ok(())
    }

    pub fn signal(&self, match_id: &str, data: String) -> Result<Option<String>> {
        let handle = self.matches.get(match_id).ok_or_else(|| MatchError::NotFound(match_id.to_string()))?;
        handle.signal(data)
    }

    pub fn stop(&self, match_id: &str) -> Result<()> {
        let handle = self.matches.get(match_id).ok_or_else(|| MatchError::NotFound(match_id.to_string()))?;
        handle.stop()
    }

    pub fn remove(&self, match_id: &str) -> Option<MatchHandle> {
        self.matches.remove(match_id).map(|(_, m)| m)
    }

    pub fn list(&self) -> Vec<(String, MatchLifecycle, usize, Option<String>)> {
        self.matches.iter().map(|r| (r.id.clone(), r.lifecycle(), r.player_count(), r.label())).collect()
    }

    /// List matches whose label contains `needle` (§4.4 supplement:
    /// substring search, generalizing the teacher's exact-match lookup).
    pub fn list_by_label(&self, needle: &str) -> Vec<String> {
        self.matches
            .iter()
            .filter(|r| r.label().as_deref().map(|l| l.contains(needle)).unwrap_or(false))
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.matches.len()
    }
}

impl crate::session::TeardownHook for MatchRegistry {
    fn on_session_removed(&self, session_id: u64) {
        self.leave_active(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHandler;

    impl MatchHandler for TestHandler {
        fn init(&self, ctx: &MatchContext, _params: serde_json::Value) -> Result<MatchInit> {
            Ok(MatchInit { state: MatchState::new(serde_json::json!({"score": 0})).with_tick_rate(1000), tick_rate: 1000, label: ctx.label.clone() })
        }

        fn join(&self, _ctx: &MatchContext, _dispatcher: &dyn MatchDispatcher, state: &mut MatchState, presences: Vec<MatchPresence>) -> Result<()> {
            if let Some(obj) = state.state.as_object_mut() {
                let current = obj.get("players").and_then(|v| v.as_i64()).unwrap_or(0);
                obj.insert("players".to_string(), serde_json::json!(current + presences.len() as i64));
            }
            Ok(())
        }

        fn leave(&self, _ctx: &MatchContext, _dispatcher: &dyn MatchDispatcher, state: &mut MatchState, presences: Vec<MatchPresence>) -> Result<()> {
            if let Some(obj) = state.state.as_object_mut() {
                let current = obj.get("players").and_then(|v| v.as_i64()).unwrap_or(0);
                obj.insert("players".to_string(), serde_json::json!((current - presences.len() as i64).max(0)));
            }
            Ok(())
        }

        fn tick(&self, _ctx: &MatchContext, _dispatcher: &dyn MatchDispatcher, state: &mut MatchState, messages: Vec<MatchMessage>) -> Result<()> {
            if !messages.is_empty() {
                if let Some(obj) = state.state.as_object_mut() {
                    let score = obj.get("score").and_then(|v| v.as_i64()).unwrap_or(0);
                    obj.insert("score".to_string(), serde_json::json!(score + messages.len() as i64));
                }
            }
            Ok(())
        }

        fn terminate(&self, _ctx: &MatchContext, _state: &MatchState) -> Result<()> {
            Ok(())
        }
    }

    fn presence(session_id: u64, user_id: &str) -> MatchPresence {
        MatchPresence { user_id: user_id.to_string(), session_id, username: user_id.to_string(), node: None }
    }

    fn registry() -> MatchRegistry {
        let handlers = Arc::new(MatchHandlerRegistry::new());
        handlers.register("test", TestHandler);
        MatchRegistry::new(handlers, Arc::new(NullDispatcher), 32, 8)
    }

    #[test]
    fn test_create_match() {
        let registry = registry();
        let id = registry.create("test", serde_json::json!({}), None).unwrap();
        assert!(registry.get(&id).is_some());
        registry.stop(&id).unwrap();
    }

    #[test]
    fn test_join_leave() {
        let registry = registry();
        let id = registry.create("test", serde_json::json!({}), None).unwrap();

        registry.join(&id, presence(1, "a")).unwrap();
        assert_eq!(registry.get(&id).unwrap().player_count(), 1);

        registry.leave(&id, 1).unwrap();
        assert_eq!(registry.get(&id).unwrap().player_count(), 0);
        registry.stop(&id).unwrap();
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let registry = registry();
        let id = registry.create("test", serde_json::json!({}), None).unwrap();

        registry.join(&id, presence(1, "a")).unwrap();
        let err = registry.join(&id, presence(1, "a"));
        assert!(matches!(err, Err(MatchError::AlreadyJoined)));
        registry.stop(&id).unwrap();
    }

    #[test]
    fn test_list_by_label_substring() {
        let registry = registry();
        let a = registry.create("test", serde_json::json!({}), Some("ranked-na".to_string())).unwrap();
        let b = registry.create("test", serde_json::json!({}), Some("casual-na".to_string())).unwrap();

        let na = registry.list_by_label("na");
        assert_eq!(na.len(), 2);
        let ranked = registry.list_by_label("ranked");
        assert_eq!(ranked, vec![a.clone()]);

        registry.stop(&a).unwrap();
        registry.stop(&b).unwrap();
    }

    #[test]
    fn test_leave_active_used_on_teardown() {
        let registry = registry();
        let id = registry.create("test", serde_json::json!({}), None).unwrap();
        registry.join(&id, presence(7, "a")).unwrap();

        registry.leave_active(7);
        assert_eq!(registry.get(&id).unwrap().player_count(), 0);
        registry.stop(&id).unwrap();
    }
}
