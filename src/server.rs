//! Runtime orchestration: wires every registry together and implements the
//! request Pipeline (§4.2).
//!
//! `Runtime` bundles the subsystems a session's socket loop needs; `Pipeline`
//! is the per-request dispatcher the transport layer drives one envelope at
//! a time, strictly in arrival order per session (§4.2, §5). Handler bodies
//! live as methods on `Runtime` grouped by surface (`channel_*`, `match_*`,
//! `matchmaker_*`, `status_*`, `party_*`) so `Pipeline::dispatch` stays a
//! thin match over payload variants, mirroring how the teacher keeps its
//! opcode handlers separate from its own dispatch loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::auth::TokenService;
use crate::chat::{self, ChannelStore};
use crate::config::Config;
use crate::error::{CoreError, ErrorCode};
use crate::hooks::{BeforeHookResult, HookContext, HookOperation, HookRegistry};
use crate::leaderboard::LeaderboardCache;
use crate::match_handler::{MatchDispatcher, MatchHandlerRegistry, MatchMessage, MatchPresence, MatchRegistry};
use crate::matchmaker::{Matchmaker, PropertyValue, RendezvousTokens};
use crate::party::PartyRegistry;
use crate::protocol::{Envelope, Payload, PresenceDiff, PresenceEvent, StreamMode};
use crate::router::MessageRouter;
use crate::scheduler::LeaderboardScheduler;
use crate::session::{Presence, Session, SessionRegistry};
use crate::status::StatusRegistry;
use crate::tracker::{PresenceMeta, PresenceStream, Tracker};

/// Bridges `MatchHandler` callbacks back onto the socket fabric: broadcasts
/// and targeted sends become `Payload::MatchDataSend` envelopes routed
/// through `MessageRouter`/`Tracker`.
pub struct RuntimeDispatcher {
    router: Arc<MessageRouter>,
    tracker: Arc<Tracker>,
}

fn match_stream(match_id: &str) -> PresenceStream {
    PresenceStream::new(StreamMode::Match, match_id)
}

impl MatchDispatcher for RuntimeDispatcher {
    fn broadcast(&self, match_id: &str, op_code: i64, data: &[u8], reliable: bool) {
        let payload = Payload::MatchDataSend { match_id: match_id.to_string(), op_code, data: data.to_vec(), reliable };
        self.router.broadcast_to_stream(&match_stream(match_id), Envelope::new(payload));
    }

    fn send(&self, match_id: &str, presences: &[MatchPresence], op_code: i64, data: &[u8], reliable: bool) {
        let payload = Payload::MatchDataSend { match_id: match_id.to_string(), op_code, data: data.to_vec(), reliable };
        let envelope = Envelope::new(payload);
        for presence in presences {
            self.router.send_to_session(presence.session_id, envelope.clone());
        }
    }

    fn kick(&self, match_id: &str, presence: &MatchPresence) {
        self.tracker.untrack(presence.session_id, &presence.user_id, &match_stream(match_id));
    }

    /// Untracks every remaining presence on the match stream; their leave
    /// diffs reach subscribers on the router's next tick.
    fn terminate(&self, match_id: &str) {
        let stream = match_stream(match_id);
        for (key, _meta) in self.tracker.list_by_stream(&stream) {
            self.tracker.untrack(key.session_id, &key.user_id, &stream);
        }
    }
}

/// A native closure-based RPC handler, standing in for the teacher's
/// lua-invoked RPC surface (lua is out of scope here; see DESIGN.md).
pub type RpcHandler = Box<dyn Fn(&HookContext, Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Every subsystem a live socket needs, plus the process-wide config it was
/// built from. One `Runtime` per server process.
pub struct Runtime {
    pub config: Config,
    pub sessions: Arc<SessionRegistry>,
    pub tracker: Arc<Tracker>,
    pub router: Arc<MessageRouter>,
    pub channels: Arc<ChannelStore>,
    channel_streams: DashMap<String, PresenceStream>,
    pub match_handlers: Arc<MatchHandlerRegistry>,
    pub matches: Arc<MatchRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub parties: Arc<PartyRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub leaderboards: Arc<LeaderboardCache>,
    pub scheduler: Arc<LeaderboardScheduler>,
    pub tokens: Arc<TokenService>,
    pub rendezvous: Arc<RendezvousTokens>,
    rpc_handlers: DashMap<String, RpcHandler>,
    running: AtomicBool,
    background: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

struct TrackerTeardown(Arc<Tracker>);
impl crate::session::TeardownHook for TrackerTeardown {
    fn on_session_removed(&self, session_id: u64) {
        self.0.untrack_all(session_id);
    }
}

impl Runtime {
    pub fn new(config: Config) -> Arc<Self> {
        let tracker = Arc::new(Tracker::new());
        let sessions = Arc::new(SessionRegistry::new(config.session.outgoing_queue_size));
        let router = Arc::new(MessageRouter::new(tracker.clone(), sessions.clone()));

        let dispatcher: Arc<dyn MatchDispatcher> = Arc::new(RuntimeDispatcher { router: router.clone(), tracker: tracker.clone() });
        let match_handlers = Arc::new(MatchHandlerRegistry::new());
        let matches = Arc::new(MatchRegistry::new(match_handlers.clone(), dispatcher, config.r#match.input_queue_size, config.r#match.call_queue_size));

        let matchmaker = Arc::new(Matchmaker::new(config.matchmaker.max_tickets_per_session));
        let parties = Arc::new(PartyRegistry::new());

        sessions.register_teardown_hook(Arc::new(TrackerTeardown(tracker.clone())));
        sessions.register_teardown_hook(matchmaker.clone());
        sessions.register_teardown_hook(parties.clone());
        sessions.register_teardown_hook(matches.clone());

        let tokens = Arc::new(TokenService::new(&config.session.encryption_key));
        let rendezvous = Arc::new(RendezvousTokens::new(&config.session.encryption_key, config.matchmaker.rendezvous_token_ttl_secs));

        Arc::new(Self {
            tracker,
            sessions,
            router,
            channels: Arc::new(ChannelStore::default()),
            channel_streams: DashMap::new(),
            match_handlers,
            matches,
            matchmaker,
            parties,
            hooks: Arc::new(HookRegistry::new()),
            leaderboards: Arc::new(LeaderboardCache::new(config.leaderboard.blacklist.clone())),
            scheduler: Arc::new(LeaderboardScheduler::new()),
            tokens,
            rendezvous,
            rpc_handlers: DashMap::new(),
            running: AtomicBool::new(true),
            background: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn register_rpc(&self, id: impl Into<String>, handler: RpcHandler) {
        self.rpc_handlers.insert(id.into(), handler);
    }

    /// Starts the matchmaker-tick, leaderboard-scheduler, presence-router
    /// and stale-session background loops. Each polls on its own dedicated
    /// thread rather than through an async runtime, matching this crate's
    /// synchronous, thread-per-concern style.
    pub fn start_background(self: &Arc<Self>) {
        let matchmaker_interval = Duration::from_secs(self.config.matchmaker.interval_sec.max(1));
        let me = self.clone();
        let matchmaker_thread = std::thread::Builder::new()
            .name("matchmaker-tick".into())
            .spawn(move || {
                while me.running.load(Ordering::Relaxed) {
                    std::thread::sleep(matchmaker_interval);
                    me.matchmaker_tick();
                }
            })
            .expect("spawn matchmaker tick thread");

        let me = self.clone();
        let scheduler_thread = std::thread::Builder::new()
            .name("leaderboard-scheduler-tick".into())
            .spawn(move || {
                while me.running.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(1));
                    let events = me.scheduler.tick(&me.leaderboards, crate::leaderboard::unix_now(), 100);
                    for event in events {
                        tracing::info!(leaderboard_id = %event.leaderboard_id, winners = event.winners.len(), "leaderboard epoch rolled over");
                    }
                }
            })
            .expect("spawn scheduler tick thread");

        let me = self.clone();
        let stale_thread = std::thread::Builder::new()
            .name("session-stale-cleanup".into())
            .spawn(move || {
                while me.running.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(me.config.session.pong_wait_ms));
                    let pong_wait_secs = (me.config.session.pong_wait_ms / 1000).max(1);
                    me.sessions.cleanup_stale(pong_wait_secs);
                }
            })
            .expect("spawn stale-session cleanup thread");

        let me = self.clone();
        let router_thread = std::thread::Builder::new()
            .name("presence-router-tick".into())
            .spawn(move || {
                while me.running.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(100));
                    me.router.route_presence_diffs();
                }
            })
            .expect("spawn presence router thread");

        let mut background = self.background.lock();
        background.push(matchmaker_thread);
        background.push(scheduler_thread);
        background.push(stale_thread);
        background.push(router_thread);
    }

    fn matchmaker_tick(&self) {
        for m in self.matchmaker.tick() {
            let token = self.rendezvous.mint(&m.rendezvous);
            for participant in &m.participants {
                let others: Vec<PresenceEvent> = m
                    .participants
                    .iter()
                    .map(|p| PresenceEvent { session_id: p.session_id, user_id: p.user_id.clone(), username: p.username.clone() })
                    .collect();
                let self_presence = PresenceEvent { session_id: participant.session_id, user_id: participant.user_id.clone(), username: participant.username.clone() };
                let payload = Payload::MatchmakerMatched { id: m.rendezvous.clone(), users: others, self_presence, ticket: token.clone() };
                self.router.send_to_session(participant.session_id, Envelope::new(payload));
            }
        }
    }

    /// Graceful shutdown order (§9): stop background loops, stop every
    /// match, then drain and close every session.
    pub fn shutdown(&self, drain_timeout: Duration) {
        self.running.store(false, Ordering::Relaxed);
        for thread in self.background.lock().drain(..) {
            let _ = thread.join();
        }
        for (id, _, _, _) in self.matches.list() {
            let _ = self.matches.stop(&id);
        }
        self.sessions.stop(drain_timeout);
    }

    fn hook_context(session: &Session) -> HookContext {
        let vars = session.vars.iter().map(|e| (e.key().clone(), e.value().clone())).collect::<HashMap<_, _>>();
        HookContext {
            user_id: session.user_id.clone(),
            username: session.username.clone().unwrap_or_default(),
            session_id: session.id,
            vars,
        }
    }

    // ---- channel surface (§6 channel.*) ----

    fn channel_join(&self, session_id: u64, presence: &Presence, target: String, kind: StreamMode, persistence: bool, hidden: bool) -> Payload {
        let stream = chat::stream_for(kind, &target);
        let channel_id = chat::channel_id(kind, &target);
        self.channel_streams.insert(channel_id.clone(), stream.clone());
        let meta = PresenceMeta { username: presence.username.clone(), hidden, persistence, ..Default::default() };
        self.tracker.track(session_id, presence.user_id.clone(), stream, meta);
        let joined = PresenceEvent { session_id, user_id: presence.user_id.clone(), username: presence.username.clone() };
        Payload::ChannelPresence { channel_id, diff: PresenceDiff { joins: vec![joined], leaves: Vec::new() } }
    }

    fn channel_leave(&self, session_id: u64, presence: &Presence, channel_id: &str) {
        if let Some(stream) = self.channel_streams.get(channel_id).map(|r| r.clone()) {
            self.tracker.untrack(session_id, &presence.user_id, &stream);
        }
    }

    fn channel_message_send(&self, presence: &Presence, channel_id: &str, content: serde_json::Value) {
        let message = self.channels.send(channel_id, &presence.user_id, &presence.username, content);
        if let Some(stream) = self.channel_streams.get(channel_id).map(|r| r.clone()) {
            let payload = Payload::ChannelMessageSend { channel_id: channel_id.to_string(), content: serde_json::to_value(&message).unwrap_or_default() };
            self.router.broadcast_to_stream(&stream, Envelope::new(payload));
        }
    }

    fn channel_message_update(&self, presence: &Presence, channel_id: &str, message_id: &str, content: serde_json::Value) -> Result<(), CoreError> {
        let message = self.channels.update(channel_id, message_id, &presence.user_id, content).map_err(chat_error)?;
        if let Some(stream) = self.channel_streams.get(channel_id).map(|r| r.clone()) {
            let payload = Payload::ChannelMessageUpdate { channel_id: channel_id.to_string(), message_id: message_id.to_string(), content: serde_json::to_value(&message).unwrap_or_default() };
            self.router.broadcast_to_stream(&stream, Envelope::new(payload));
        }
        Ok(())
    }

    fn channel_message_remove(&self, presence: &Presence, channel_id: &str, message_id: &str) -> Result<(), CoreError> {
        self.channels.remove(channel_id, message_id, &presence.user_id).map_err(chat_error)?;
        if let Some(stream) = self.channel_streams.get(channel_id).map(|r| r.clone()) {
            let payload = Payload::ChannelMessageRemove { channel_id: channel_id.to_string(), message_id: message_id.to_string() };
            self.router.broadcast_to_stream(&stream, Envelope::new(payload));
        }
        Ok(())
    }

    // ---- match surface (§6 match.*) ----

    fn match_create(&self, presence: &Presence, module: String, label: Option<String>, tick_rate: u32) -> Result<Payload, CoreError> {
        let _ = tick_rate;
        let match_id = self.matches.create(&module, serde_json::Value::Null, label)?;
        self.match_join_presence(presence, &match_id)
    }

    fn match_join(&self, presence: &Presence, token_or_id: String, _metadata: serde_json::Value) -> Result<Payload, CoreError> {
        let match_id = self.rendezvous.verify(&token_or_id).unwrap_or(token_or_id);
        self.match_join_presence(presence, &match_id)
    }

    fn match_join_presence(&self, presence: &Presence, match_id: &str) -> Result<Payload, CoreError> {
        let match_presence = MatchPresence { user_id: presence.user_id.clone(), session_id: presence.session_id, username: presence.username.clone(), node: None };
        self.matches.join(match_id, match_presence)?;
        let meta = PresenceMeta { username: presence.username.clone(), ..Default::default() };
        self.tracker.track(presence.session_id, presence.user_id.clone(), match_stream(match_id), meta);
        let joined = PresenceEvent { session_id: presence.session_id, user_id: presence.user_id.clone(), username: presence.username.clone() };
        Ok(Payload::MatchPresence { match_id: match_id.to_string(), diff: PresenceDiff { joins: vec![joined], leaves: Vec::new() } })
    }

    fn match_leave(&self, presence: &Presence, match_id: &str) -> Result<(), CoreError> {
        self.matches.leave(match_id, presence.session_id)?;
        self.tracker.untrack(presence.session_id, &presence.user_id, &match_stream(match_id));
        Ok(())
    }

    fn match_data_send(&self, presence: &Presence, match_id: &str, op_code: i64, data: Vec<u8>, reliable: bool) -> Result<(), CoreError> {
        let sender = MatchPresence { user_id: presence.user_id.clone(), session_id: presence.session_id, username: presence.username.clone(), node: None };
        let msg = MatchMessage { sender, op_code, data, reliable, received_at: crate::leaderboard::unix_now() };
        self.matches.send_message(match_id, msg)?;
        Ok(())
    }

    // ---- matchmaker surface (§6 matchmaker.*) ----

    fn matchmaker_properties(properties: HashMap<String, serde_json::Value>) -> Result<HashMap<String, PropertyValue>, CoreError> {
        properties
            .into_iter()
            .map(|(k, v)| {
                let pv = match v {
                    serde_json::Value::String(s) => PropertyValue::Str(s),
                    serde_json::Value::Number(n) => PropertyValue::Num(n.as_f64().unwrap_or(0.0)),
                    _ => return Err(CoreError::BadInput(format!("matchmaker property {k} must be a string or number"))),
                };
                Ok((k, pv))
            })
            .collect()
    }

    fn matchmaker_add(
        &self,
        presence: &Presence,
        query: String,
        min_count: u32,
        max_count: u32,
        count_multiple: Option<u32>,
        properties: HashMap<String, serde_json::Value>,
    ) -> Result<Payload, CoreError> {
        let properties = Self::matchmaker_properties(properties)?;
        let ticket = self
            .matchmaker
            .add(vec![presence.clone()], None, query, min_count, max_count, count_multiple, properties)?;
        Ok(Payload::MatchmakerTicket { ticket })
    }

    // ---- status surface (§6 status.*) ----

    fn status_follow(&self, presence: &Presence, user_ids: &[String]) {
        StatusRegistry::new(&self.tracker).follow(presence, user_ids);
    }

    fn status_unfollow(&self, presence: &Presence, user_ids: &[String]) {
        StatusRegistry::new(&self.tracker).unfollow(presence, user_ids);
    }

    fn status_update(&self, presence: &Presence, status: Option<String>) {
        StatusRegistry::new(&self.tracker).update(presence, status);
    }

    // ---- party surface (§6 party.*) ----

    fn party_presence(&self, party_id: &str, joins: Vec<PresenceEvent>, leaves: Vec<PresenceEvent>) -> Payload {
        Payload::PartyPresence { party_id: party_id.to_string(), diff: PresenceDiff { joins, leaves } }
    }

    fn party_create(&self, presence: &Presence, open: bool, max_size: usize) -> Payload {
        let party_id = self.parties.create(presence.session_id, open, max_size, String::new());
        let stream = PresenceStream::new(StreamMode::Party, &party_id);
        let meta = PresenceMeta { username: presence.username.clone(), ..Default::default() };
        self.tracker.track(presence.session_id, presence.user_id.clone(), stream, meta);
        let joined = PresenceEvent { session_id: presence.session_id, user_id: presence.user_id.clone(), username: presence.username.clone() };
        self.party_presence(&party_id, vec![joined], Vec::new())
    }

    fn party_join(&self, presence: &Presence, party_id: &str) -> Result<Option<Payload>, CoreError> {
        let joined = self.parties.join(party_id, presence.session_id)?;
        if !joined {
            return Ok(None);
        }
        let stream = PresenceStream::new(StreamMode::Party, party_id);
        let meta = PresenceMeta { username: presence.username.clone(), ..Default::default() };
        self.tracker.track(presence.session_id, presence.user_id.clone(), stream, meta);
        let event = PresenceEvent { session_id: presence.session_id, user_id: presence.user_id.clone(), username: presence.username.clone() };
        Ok(Some(self.party_presence(party_id, vec![event], Vec::new())))
    }

    fn party_leave(&self, presence: &Presence, party_id: &str) -> Result<(), CoreError> {
        self.parties.remove(party_id, presence.session_id, presence.session_id)?;
        self.tracker.untrack(presence.session_id, &presence.user_id, &PresenceStream::new(StreamMode::Party, party_id));
        Ok(())
    }

    fn party_promote(&self, leader: u64, party_id: &str, target: u64) -> Result<(), CoreError> {
        self.parties.promote(party_id, leader, target)?;
        Ok(())
    }

    fn party_accept(&self, leader: u64, party_id: &str, target: u64) -> Result<(), CoreError> {
        let admitted = self.parties.accept(party_id, leader, target)?;
        if !admitted {
            return Ok(());
        }
        if let Some(session) = self.sessions.get(target) {
            let target_presence = session.presence();
            let stream = PresenceStream::new(StreamMode::Party, party_id);
            let meta = PresenceMeta { username: target_presence.username.clone(), ..Default::default() };
            self.tracker.track(target, target_presence.user_id.clone(), stream, meta);
        }
        Ok(())
    }

    fn party_remove(&self, actor: u64, party_id: &str, target: u64) -> Result<(), CoreError> {
        self.parties.remove(party_id, actor, target)?;
        if let Some(session) = self.sessions.get(target) {
            self.tracker.untrack(target, &session.user_id, &PresenceStream::new(StreamMode::Party, party_id));
        }
        Ok(())
    }

    fn party_close(&self, leader: u64, party_id: &str) -> Result<(), CoreError> {
        let evicted = self.parties.close(party_id, leader)?;
        let stream = PresenceStream::new(StreamMode::Party, party_id);
        for session_id in evicted {
            if let Some(session) = self.sessions.get(session_id) {
                self.tracker.untrack(session_id, &session.user_id, &stream);
            }
        }
        Ok(())
    }

    fn party_join_request_list(&self, party_id: &str) -> Payload {
        // No dedicated wire variant exists for listing pending requests;
        // reusing `PartyPresence` with the requesters as the "joins" side
        // is a pragmatic compromise over inventing a new payload kind.
        let requesters = self.parties.get(party_id).map(|p| p.join_requests()).unwrap_or_default();
        let events = requesters
            .into_iter()
            .filter_map(|sid| self.sessions.get(sid).map(|s| PresenceEvent { session_id: sid, user_id: s.user_id.clone(), username: s.username.clone().unwrap_or_default() }))
            .collect();
        self.party_presence(party_id, events, Vec::new())
    }

    fn party_matchmaker_add(&self, party_id: &str, query: String, min_count: u32, max_count: u32) -> Result<Payload, CoreError> {
        let presences = self.parties.member_presences(party_id, |sid| self.sessions.get(sid).map(|s| s.presence()));
        let ticket = self.matchmaker.add(presences, Some(party_id.to_string()), query, min_count, max_count, None, HashMap::new())?;
        Ok(Payload::MatchmakerTicket { ticket })
    }

    fn party_data_send(&self, party_id: &str, op_code: i64, data: Vec<u8>) {
        let stream = PresenceStream::new(StreamMode::Party, party_id);
        let payload = Payload::PartyDataSend { party_id: party_id.to_string(), op_code, data };
        self.router.broadcast_to_stream(&stream, Envelope::new(payload));
    }

    // ---- RPC surface ----

    fn rpc_invoke(&self, ctx: &HookContext, id: &str, payload: Vec<u8>) -> Result<Vec<u8>, CoreError> {
        let payload = self.hooks.run_rpc_before(id, ctx, payload).map_err(|e| CoreError::RuntimeFunctionException(e.to_string()))?;
        let Some(handler) = self.rpc_handlers.get(id) else {
            return Err(CoreError::UnrecognizedPayload);
        };
        let result = handler(ctx, payload.clone());
        drop(handler);
        self.hooks.run_rpc_after(id, ctx, &payload, &result);
        Ok(result)
    }
}

fn chat_error(e: crate::chat::ChatError) -> CoreError {
    CoreError::BadInput(e.to_string())
}

/// Maps a payload variant onto the hook surface it brackets, if any.
/// Variants absent here never pass through the before/after bracket —
/// either because they're server-to-client only, or because (RPC) they
/// have their own dedicated hook surface (§4.2).
fn hook_operation_for(payload: &Payload) -> Option<HookOperation> {
    use Payload::*;
    Some(match payload {
        ChannelJoin { .. } => HookOperation::ChannelJoin,
        ChannelLeave { .. } => HookOperation::ChannelLeave,
        ChannelMessageSend { .. } => HookOperation::ChannelMessageSend,
        ChannelMessageUpdate { .. } => HookOperation::ChannelMessageUpdate,
        ChannelMessageRemove { .. } => HookOperation::ChannelMessageRemove,
        MatchCreate { .. } => HookOperation::MatchCreate,
        MatchJoin { .. } => HookOperation::MatchJoin,
        MatchLeave { .. } => HookOperation::MatchLeave,
        MatchDataSend { .. } => HookOperation::MatchDataSend,
        MatchmakerAdd { .. } => HookOperation::MatchmakerAdd,
        MatchmakerRemove { .. } => HookOperation::MatchmakerRemove,
        StatusFollow { .. } => HookOperation::StatusFollow,
        StatusUnfollow { .. } => HookOperation::StatusUnfollow,
        StatusUpdate { .. } => HookOperation::StatusUpdate,
        PartyCreate { .. } => HookOperation::PartyCreate,
        PartyJoin { .. } => HookOperation::PartyJoin,
        PartyLeave { .. } => HookOperation::PartyLeave,
        PartyPromote { .. } => HookOperation::PartyPromote,
        PartyAccept { .. } => HookOperation::PartyAccept,
        PartyRemove { .. } => HookOperation::PartyRemove,
        PartyClose { .. } => HookOperation::PartyClose,
        PartyDataSend { .. } => HookOperation::PartyDataSend,
        _ => return None,
    })
}

/// Per-session request dispatcher (§4.2). Stateless beyond the shared
/// `Runtime` it wraps; transports construct one per connection.
pub struct Pipeline {
    runtime: Arc<Runtime>,
}

impl Pipeline {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// `ProcessRequest(session, envelope) -> bool` (§4.2). The return value
    /// is keep-session-open: `true` keeps reading, `false` tells the
    /// transport to close the connection.
    pub fn process(&self, session_id: u64, envelope: Envelope) -> bool {
        let correlation_id = envelope.correlation_id.clone();
        let Some(payload) = envelope.payload else {
            self.runtime.router.send_to_session(session_id, Envelope::error(ErrorCode::MissingPayload, "missing payload"));
            return true;
        };

        let Some(session) = self.runtime.sessions.get(session_id) else {
            return false;
        };
        let ctx = Runtime::hook_context(&session);
        let presence = session.presence();
        drop(session);

        if let Payload::Rpc { id, payload: body } = payload {
            return self.process_rpc(session_id, &ctx, &id, body, correlation_id);
        }

        let op = hook_operation_for(&payload);
        let mut payload = payload;

        if let Some(op) = op {
            if self.runtime.hooks.has_before(op) {
                match self.runtime.hooks.run_before(op, &ctx, payload.clone()) {
                    Ok(BeforeHookResult::Continue(replaced)) => payload = replaced,
                    Ok(BeforeHookResult::Reject(reason)) => {
                        self.runtime.router.send_to_session(session_id, Envelope::error(ErrorCode::RuntimeFunctionException, reason));
                        return true;
                    }
                    Ok(BeforeHookResult::Disabled) => {
                        self.runtime.router.send_to_session(session_id, Envelope::error(ErrorCode::UnrecognizedPayload, "resource disabled"));
                        return false;
                    }
                    Err(e) => {
                        self.runtime.router.send_to_session(session_id, Envelope::error(ErrorCode::RuntimeFunctionException, e.to_string()));
                        return true;
                    }
                }
            }
        }

        let before_after_payload = payload.clone();
        match self.dispatch(session_id, &presence, payload) {
            Ok(response) => {
                if let Some(op) = op {
                    self.runtime.hooks.run_after(op, &ctx, &before_after_payload);
                }
                if let Some(payload) = response {
                    let mut reply = Envelope::new(payload);
                    reply.correlation_id = correlation_id;
                    self.runtime.router.send_to_session(session_id, reply);
                }
                true
            }
            Err(CoreError::UnrecognizedPayload) => {
                self.runtime.router.send_to_session(session_id, Envelope::error(ErrorCode::UnrecognizedPayload, "unrecognized payload"));
                false
            }
            Err(e) => {
                self.runtime.router.send_to_session(session_id, Envelope::error(e.code(), e.to_string()));
                true
            }
        }
    }

    fn process_rpc(&self, session_id: u64, ctx: &HookContext, id: &str, body: Vec<u8>, correlation_id: Option<String>) -> bool {
        match self.runtime.rpc_invoke(ctx, id, body) {
            Ok(result) => {
                let mut reply = Envelope::new(Payload::Rpc { id: id.to_string(), payload: result });
                reply.correlation_id = correlation_id;
                self.runtime.router.send_to_session(session_id, reply);
                true
            }
            Err(CoreError::UnrecognizedPayload) => {
                self.runtime.router.send_to_session(session_id, Envelope::error(ErrorCode::UnrecognizedPayload, format!("no rpc handler registered for {id}")));
                false
            }
            Err(e) => {
                self.runtime.router.send_to_session(session_id, Envelope::error(e.code(), e.to_string()));
                true
            }
        }
    }

    fn dispatch(&self, session_id: u64, presence: &Presence, payload: Payload) -> Result<Option<Payload>, CoreError> {
        let runtime = &self.runtime;
        match payload {
            Payload::ChannelJoin { target, r#type, persistence, hidden } => Ok(Some(runtime.channel_join(session_id, presence, target, r#type, persistence, hidden))),
            Payload::ChannelLeave { channel_id } => {
                runtime.channel_leave(session_id, presence, &channel_id);
                Ok(None)
            }
            Payload::ChannelMessageSend { channel_id, content } => {
                runtime.channel_message_send(presence, &channel_id, content);
                Ok(None)
            }
            Payload::ChannelMessageUpdate { channel_id, message_id, content } => {
                runtime.channel_message_update(presence, &channel_id, &message_id, content)?;
                Ok(None)
            }
            Payload::ChannelMessageRemove { channel_id, message_id } => {
                runtime.channel_message_remove(presence, &channel_id, &message_id)?;
                Ok(None)
            }

            Payload::MatchCreate { module, label, tick_rate } => runtime.match_create(presence, module, label, tick_rate).map(Some),
            Payload::MatchJoin { token_or_id, metadata } => runtime.match_join(presence, token_or_id, metadata).map(Some),
            Payload::MatchLeave { match_id } => {
                runtime.match_leave(presence, &match_id)?;
                Ok(None)
            }
            Payload::MatchDataSend { match_id, op_code, data, reliable } => {
                runtime.match_data_send(presence, &match_id, op_code, data, reliable)?;
                Ok(None)
            }

            Payload::MatchmakerAdd { query, min_count, max_count, count_multiple, properties } => {
                runtime.matchmaker_add(presence, query, min_count, max_count, count_multiple, properties).map(Some)
            }
            Payload::MatchmakerRemove { ticket } => {
                runtime.matchmaker.remove(&ticket)?;
                Ok(None)
            }

            Payload::StatusFollow { user_ids } => {
                runtime.status_follow(presence, &user_ids);
                Ok(None)
            }
            Payload::StatusUnfollow { user_ids } => {
                runtime.status_unfollow(presence, &user_ids);
                Ok(None)
            }
            Payload::StatusUpdate { status } => {
                runtime.status_update(presence, status);
                Ok(None)
            }

            Payload::PartyCreate { open, max_size } => Ok(Some(runtime.party_create(presence, open, max_size))),
            Payload::PartyJoin { party_id } => runtime.party_join(presence, &party_id),
            Payload::PartyLeave { party_id } => {
                runtime.party_leave(presence, &party_id)?;
                Ok(None)
            }
            Payload::PartyPromote { party_id, session_id: target } => {
                runtime.party_promote(presence.session_id, &party_id, target)?;
                Ok(None)
            }
            Payload::PartyAccept { party_id, session_id: target } => {
                runtime.party_accept(presence.session_id, &party_id, target)?;
                Ok(None)
            }
            Payload::PartyRemove { party_id, session_id: target } => {
                runtime.party_remove(presence.session_id, &party_id, target)?;
                Ok(None)
            }
            Payload::PartyClose { party_id } => {
                runtime.party_close(presence.session_id, &party_id)?;
                Ok(None)
            }
            Payload::PartyJoinRequestList { party_id } => Ok(Some(runtime.party_join_request_list(&party_id))),
            Payload::PartyMatchmakerAdd { party_id, query, min_count, max_count } => runtime.party_matchmaker_add(&party_id, query, min_count, max_count).map(Some),
            Payload::PartyMatchmakerRemove { ticket, .. } => {
                runtime.matchmaker.remove(&ticket)?;
                Ok(None)
            }
            Payload::PartyDataSend { party_id, op_code, data } => {
                runtime.party_data_send(&party_id, op_code, data);
                Ok(None)
            }

            Payload::Ping => Ok(Some(Payload::Pong)),
            Payload::Pong => Ok(None),

            Payload::Rpc { .. } => unreachable!("RPC is handled in process() before dispatch"),

            Payload::Error { .. }
            | Payload::MatchmakerTicket { .. }
            | Payload::MatchmakerMatched { .. }
            | Payload::NotificationsPresence(_)
            | Payload::StatusPresence(_)
            | Payload::ChannelPresence { .. }
            | Payload::MatchPresence { .. }
            | Payload::PartyPresence { .. } => Err(CoreError::UnrecognizedPayload),
        }
    }
}
