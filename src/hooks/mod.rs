//! Runtime hook registry (§4.2).
//!
//! Before/after hooks bracket Pipeline dispatch for every hookable payload
//! variant; RPC has its own separate hook surface (`rpc_before`/`rpc_after`)
//! since RPC is explicitly exempted from the before/after bracket (§4.2).
//! `matchmaker_matched` is a third, distinct hook kind — not bracketing a
//! client request but supplying a match-id in place of a rendezvous token
//! (§4.5) — and lives on `Matchmaker` itself (`MatchmakerMatchedHook`)
//! rather than here, since it fires from the matchmaker's own evaluation
//! pass, not from Pipeline dispatch.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook rejected request: {0}")]
    Rejected(String),
    #[error("hook execution failed: {0}")]
    ExecutionFailed(String),
}

pub type Result<T> = std::result::Result<T, HookError>;

/// Hookable payload variants (§4.2, §6). Unlisted variants (presence
/// diffs, ping/pong, errors) never reach the hook bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOperation {
    ChannelJoin,
    ChannelLeave,
    ChannelMessageSend,
    ChannelMessageUpdate,
    ChannelMessageRemove,
    MatchCreate,
    MatchJoin,
    MatchLeave,
    MatchDataSend,
    MatchmakerAdd,
    MatchmakerRemove,
    StatusFollow,
    StatusUnfollow,
    StatusUpdate,
    PartyCreate,
    PartyJoin,
    PartyLeave,
    PartyPromote,
    PartyAccept,
    PartyRemove,
    PartyClose,
    PartyDataSend,
}

/// Context carried into a hook: the originating session, not the payload
/// (the payload is threaded separately so a before-hook can replace it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookContext {
    pub user_id: String,
    pub username: String,
    pub session_id: u64,
    #[serde(default)]
    pub vars: std::collections::HashMap<String, String>,
}

/// Result from a before hook. `Disabled` models "hook returns nil" (§4.2):
/// the resource is switched off and dispatch must answer
/// `UNRECOGNIZED_PAYLOAD`/close, distinct from an explicit `Reject`.
pub enum BeforeHookResult {
    Continue(crate::protocol::Payload),
    Reject(String),
    Disabled,
}

pub trait BeforeHook: Send + Sync {
    fn execute(&self, ctx: &HookContext, payload: crate::protocol::Payload) -> Result<BeforeHookResult>;
}

pub trait AfterHook: Send + Sync {
    fn execute(&self, ctx: &HookContext, payload: &crate::protocol::Payload);
}

pub trait RpcBeforeHook: Send + Sync {
    fn execute(&self, ctx: &HookContext, id: &str, payload: Vec<u8>) -> Result<Vec<u8>>;
}

pub trait RpcAfterHook: Send + Sync {
    fn execute(&self, ctx: &HookContext, id: &str, payload: &[u8], result: &[u8]);
}

type BoxedBeforeHook = Box<dyn BeforeHook>;
type BoxedAfterHook = Box<dyn AfterHook>;

pub struct HookRegistry {
    before: DashMap<HookOperation, Vec<BoxedBeforeHook>>,
    after: DashMap<HookOperation, Vec<BoxedAfterHook>>,
    rpc_before: DashMap<String, Box<dyn RpcBeforeHook>>,
    rpc_after: DashMap<String, Box<dyn RpcAfterHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            before: DashMap::new(),
            after: DashMap::new(),
            rpc_before: DashMap::new(),
            rpc_after: DashMap::new(),
        }
    }

    pub fn register_before(&self, op: HookOperation, hook: impl BeforeHook + 'static) {
        self.before.entry(op).or_default().push(Box::new(hook));
    }

    pub fn register_after(&self, op: HookOperation, hook: impl AfterHook + 'static) {
        self.after.entry(op).or_default().push(Box::new(hook));
    }

    pub fn register_rpc_before(&self, id: impl Into<String>, hook: impl RpcBeforeHook + 'static) {
        self.rpc_before.insert(id.into(), Box::new(hook));
    }

    pub fn register_rpc_after(&self, id: impl Into<String>, hook: impl RpcAfterHook + 'static) {
        self.rpc_after.insert(id.into(), Box::new(hook));
    }

    /// Runs every before-hook registered for `op` in registration order.
    /// Stops at the first `Reject`/`Disabled`.
    pub fn run_before(&self, op: HookOperation, ctx: &HookContext, mut payload: crate::protocol::Payload) -> Result<BeforeHookResult> {
        if let Some(hooks) = self.before.get(&op) {
            for hook in hooks.iter() {
                match hook.execute(ctx, payload)? {
                    BeforeHookResult::Continue(p) => payload = p,
                    other => return Ok(other),
                }
            }
        }
        Ok(BeforeHookResult::Continue(payload))
    }

    /// Fire-and-forget (§4.2: after-hook errors never affect the client).
    pub fn run_after(&self, op: HookOperation, ctx: &HookContext, payload: &crate::protocol::Payload) {
        if let Some(hooks) = self.after.get(&op) {
            for hook in hooks.iter() {
                hook.execute(ctx, payload);
            }
        }
    }

    pub fn run_rpc_before(&self, id: &str, ctx: &HookContext, payload: Vec<u8>) -> Result<Vec<u8>> {
        match self.rpc_before.get(id) {
            Some(hook) => hook.execute(ctx, id, payload),
            None => Ok(payload),
        }
    }

    pub fn run_rpc_after(&self, id: &str, ctx: &HookContext, payload: &[u8], result: &[u8]) {
        if let Some(hook) = self.rpc_after.get(id) {
            hook.execute(ctx, id, payload, result);
        }
    }

    pub fn has_before(&self, op: HookOperation) -> bool {
        self.before.contains_key(&op)
    }

    pub fn has_after(&self, op: HookOperation) -> bool {
        self.after.contains_key(&op)
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;

    struct AddVarHook;
    impl BeforeHook for AddVarHook {
        fn execute(&self, _ctx: &HookContext, payload: crate::protocol::Payload) -> Result<BeforeHookResult> {
            Ok(BeforeHookResult::Continue(payload))
        }
    }

    struct RejectHook(String);
    impl BeforeHook for RejectHook {
        fn execute(&self, _ctx: &HookContext, _payload: crate::protocol::Payload) -> Result<BeforeHookResult> {
            Ok(BeforeHookResult::Reject(self.0.clone()))
        }
    }

    struct DisableHook;
    impl BeforeHook for DisableHook {
        fn execute(&self, _ctx: &HookContext, _payload: crate::protocol::Payload) -> Result<BeforeHookResult> {
            Ok(BeforeHookResult::Disabled)
        }
    }

    #[test]
    fn test_before_hook_passthrough() {
        let registry = HookRegistry::new();
        registry.register_before(HookOperation::StatusUpdate, AddVarHook);

        let ctx = HookContext::default();
        let result = registry.run_before(HookOperation::StatusUpdate, &ctx, Payload::StatusUpdate { status: None }).unwrap();
        assert!(matches!(result, BeforeHookResult::Continue(_)));
    }

    #[test]
    fn test_before_hook_reject() {
        let registry = HookRegistry::new();
        registry.register_before(HookOperation::PartyCreate, RejectHook("nope".into()));

        let ctx = HookContext::default();
        let result = registry.run_before(HookOperation::PartyCreate, &ctx, Payload::PartyCreate { open: true, max_size: 4 }).unwrap();
        assert!(matches!(result, BeforeHookResult::Reject(msg) if msg == "nope"));
    }

    #[test]
    fn test_before_hook_disabled() {
        let registry = HookRegistry::new();
        registry.register_before(HookOperation::MatchCreate, DisableHook);

        let ctx = HookContext::default();
        let result = registry
            .run_before(HookOperation::MatchCreate, &ctx, Payload::MatchCreate { module: "m".into(), label: None, tick_rate: 10 })
            .unwrap();
        assert!(matches!(result, BeforeHookResult::Disabled));
    }

    #[test]
    fn test_rpc_hook_passthrough_when_unregistered() {
        let registry = HookRegistry::new();
        let ctx = HookContext::default();
        let out = registry.run_rpc_before("unregistered", &ctx, vec![1, 2, 3]).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }
}
