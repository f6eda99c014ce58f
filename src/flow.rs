//! Flow Registry & Router (C7).
//!
//! Maps an incoming MCP request to the [`Flow`] that handles it. Flows are
//! plain data plus a predicate — "decorators become configuration" (§9):
//! each flow is a struct describing its name, plan, access level, and a
//! `can_activate` predicate, registered once at startup rather than
//! discovered via runtime reflection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::authz::Authorization;
use crate::invoker::{FlowContext, Hook, HookEntry, HookKind, Plan};
use crate::{Error, Result};

/// Whether a flow requires a materialized [`Authorization`] to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No authorization required.
    Public,
    /// Requires a valid, non-anonymous authorization.
    Authenticated,
}

/// Routing context passed to [`Flow::can_activate`].
pub struct RouteScope<'a> {
    /// The JSON-RPC method name of the incoming request.
    pub method: &'a str,
    /// The caller's authorization, if one was materialized for this request.
    pub authorization: Option<&'a Authorization>,
}

/// A registrable unit of request handling (§3 `Flow`, §9's redesign note).
pub trait Flow: Send + Sync {
    /// Unique flow name, used for lookup and as the invoker plan name.
    fn name(&self) -> &str;

    /// Stage pipeline for this flow's `execute` stages (pre/post/finalize/error
    /// are filled in by the registry from the default plan unless overridden).
    fn plan(&self) -> Plan;

    /// Required authorization level.
    fn access(&self) -> Access {
        Access::Public
    }

    /// Static routing priority; higher is tried first. Ties broken by
    /// registration order.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether this flow should handle `request` under `scope`.
    fn can_activate(&self, request: &Value, scope: &RouteScope<'_>) -> bool;

    /// Hooks this flow contributes beyond the default plan's ambient stages
    /// (its `execute` stage bodies, plus any flow-specific will/did/around).
    fn hooks(&self) -> Vec<HookEntry>;

    /// JSON schema describing expected input, if the flow validates one.
    fn input_schema(&self) -> Option<Value> {
        None
    }

    /// JSON schema describing produced output, if the flow validates one.
    fn output_schema(&self) -> Option<Value> {
        None
    }
}

struct RegisteredFlow {
    flow: Arc<dyn Flow>,
    registration_order: usize,
}

/// Holds registered flows and resolves incoming requests to one of them.
#[derive(Default)]
pub struct FlowRegistry {
    flows: Vec<RegisteredFlow>,
    by_name: HashMap<String, Arc<dyn Flow>>,
}

impl FlowRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow. Extracts its plan, schemas, and `can_activate`
    /// predicate by holding onto the trait object; order of registration
    /// is preserved for tie-breaking.
    pub fn register(&mut self, flow: Arc<dyn Flow>) {
        self.by_name.insert(flow.name().to_string(), Arc::clone(&flow));
        let registration_order = self.flows.len();
        self.flows.push(RegisteredFlow { flow, registration_order });
    }

    /// Return the first registered flow whose `can_activate` accepts
    /// `request` under `scope`. Flows are considered in descending
    /// priority order, ties broken by registration order; registration
    /// order alone is authoritative when no flow sets a nonzero priority.
    #[must_use]
    pub fn route(&self, request: &Value, scope: &RouteScope<'_>) -> Option<Arc<dyn Flow>> {
        let mut candidates: Vec<&RegisteredFlow> = self.flows.iter().collect();
        candidates.sort_by(|a, b| {
            b.flow
                .priority()
                .cmp(&a.flow.priority())
                .then(a.registration_order.cmp(&b.registration_order))
        });
        candidates
            .into_iter()
            .find(|candidate| candidate.flow.can_activate(request, scope))
            .map(|candidate| Arc::clone(&candidate.flow))
    }

    /// Look up a flow by name, for direct invocation or tests.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Flow>> {
        self.by_name.get(name).map(Arc::clone)
    }

    /// All registered flows, in registration order.
    #[must_use]
    pub fn flows(&self) -> impl Iterator<Item = &Arc<dyn Flow>> {
        self.flows.iter().map(|r| &r.flow)
    }
}

/// The `will(checkToolAuthorization)` hook the router attaches to every
/// authenticated flow's plan so the 401-equivalent policy lives in one
/// place rather than duplicated per flow (§4.7).
struct CheckToolAuthorization {
    access: Access,
}

#[async_trait]
impl Hook for CheckToolAuthorization {
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        if self.access == Access::Authenticated && ctx.authorization.is_none() {
            return Err(Error::InvalidToken);
        }
        Ok(())
    }
}

/// Build the `will(checkToolAuthorization)` entry for `flow`'s first
/// `pre` stage. Call this alongside [`Flow::hooks`] when wiring a flow's
/// plan into an [`crate::invoker::Invoker`].
#[must_use]
pub fn check_tool_authorization_hook(flow: &dyn Flow, stage: &str, priority: i32) -> HookEntry {
    HookEntry::plain(
        HookKind::Will,
        stage,
        priority,
        Arc::new(CheckToolAuthorization { access: flow.access() }),
    )
}
