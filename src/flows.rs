//! Built-in MCP flows (§4.6 "Default plan applied to MCP operations").
//!
//! Concrete MCP message codecs and individual tool/resource/prompt business
//! logic are out of scope (§1) — these flows wire the invoker, the Skill
//! Guard, and the approval store together and delegate content lookup to
//! externally supplied catalogs, the same "drive via clean contracts"
//! pattern the teacher applies to backends in `backend/mod.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::approval::{ApprovalStore, GrantApproval, PolicyMode, SkillGuard};
use crate::flow::{Access, Flow, RouteScope};
use crate::invoker::{FlowContext, Hook, HookEntry, HookKind, Plan};
use crate::protocol::{Prompt, Resource, Tool};
use crate::{Error, Result};

/// External collaborator exposing the tool catalog and tool execution.
/// Tool execution itself is explicitly out of scope here; this trait is the
/// contract the core drives rather than implements.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    /// Every tool this catalog knows about.
    fn list_tools(&self) -> Vec<Tool>;

    /// Invoke `name` with `arguments`. Errors are surfaced verbatim to the
    /// flow's `error` stages.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
}

/// External collaborator exposing the resource catalog.
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    /// Every resource this catalog advertises.
    fn list_resources(&self) -> Vec<Resource>;

    /// Read the content at `uri`.
    async fn read_resource(&self, uri: &str) -> Result<Value>;
}

/// External collaborator exposing the prompt catalog.
#[async_trait]
pub trait PromptCatalog: Send + Sync {
    /// Every prompt this catalog advertises.
    fn list_prompts(&self) -> Vec<Prompt>;

    /// Render `name` with `arguments`.
    async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value>;
}

fn method_is(request: &Value, method: &str) -> bool {
    request.get("method").and_then(Value::as_str) == Some(method)
}

fn param(request: &Value, key: &str) -> Value {
    request
        .get("params")
        .and_then(|p| p.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

/// `tools/list`.
pub struct ListToolsFlow {
    catalog: Arc<dyn ToolCatalog>,
}

impl ListToolsFlow {
    /// Build the flow over `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<dyn ToolCatalog>) -> Self {
        Self { catalog }
    }
}

struct ListToolsHook(Arc<dyn ToolCatalog>);

#[async_trait]
impl Hook for ListToolsHook {
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        let Some(auth) = &ctx.authorization else {
            return Err(Error::InvalidToken);
        };
        let visible: Vec<Tool> = self
            .0
            .list_tools()
            .into_iter()
            .filter(|t| auth.is_tool_authorized(&t.name))
            .collect();
        ctx.respond(serde_json::json!({ "tools": visible }));
        Ok(())
    }
}

impl Flow for ListToolsFlow {
    fn name(&self) -> &str {
        "tools/list"
    }

    fn plan(&self) -> Plan {
        Plan::default_mcp_plan("tools/list", vec!["execute".to_string()])
    }

    fn access(&self) -> Access {
        Access::Authenticated
    }

    fn can_activate(&self, request: &Value, _scope: &RouteScope<'_>) -> bool {
        method_is(request, "tools/list")
    }

    fn hooks(&self) -> Vec<HookEntry> {
        vec![HookEntry::plain(
            HookKind::Stage,
            "execute",
            0,
            Arc::new(ListToolsHook(Arc::clone(&self.catalog))),
        )]
    }
}

/// `tools/call`. Runs the Skill Guard before delegating to the catalog.
pub struct CallToolFlow {
    catalog: Arc<dyn ToolCatalog>,
    approvals: Arc<ApprovalStore>,
    guards: Arc<dashmap::DashMap<String, SkillGuard>>,
}

impl CallToolFlow {
    /// Build the flow over `catalog`, consulting `approvals` and the
    /// per-session `guards` table for policy decisions.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn ToolCatalog>,
        approvals: Arc<ApprovalStore>,
        guards: Arc<dashmap::DashMap<String, SkillGuard>>,
    ) -> Self {
        Self { catalog, approvals, guards }
    }
}

struct CallToolHook {
    catalog: Arc<dyn ToolCatalog>,
    approvals: Arc<ApprovalStore>,
    guards: Arc<dashmap::DashMap<String, SkillGuard>>,
}

#[async_trait]
impl Hook for CallToolHook {
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        let Some(auth) = &ctx.authorization else {
            return Err(Error::InvalidToken);
        };
        let tool_name = ctx
            .input
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::json_rpc(crate::error::rpc_codes::INVALID_PARAMS, "missing tool name"))?
            .to_string();
        let arguments = param(&ctx.input, "arguments");

        if !auth.is_tool_authorized(&tool_name) {
            return Err(Error::ToolNotAllowed(tool_name));
        }

        let session_id = ctx.session.as_ref().map(|s| s.id.clone()).unwrap_or_default();
        let check = self
            .guards
            .get(&session_id)
            .map(|guard| guard.check_tool_authorization(&tool_name));

        if let Some(check) = check {
            if !check.allowed {
                if check.requires_approval
                    && self
                        .approvals
                        .is_approved(&tool_name, Some(&session_id), None, None)
                        .await?
                {
                    // A prior approval already covers this call.
                } else if check.requires_approval {
                    return Err(Error::ToolApprovalRequired(tool_name));
                } else {
                    return Err(Error::ToolNotAllowed(tool_name));
                }
            }
        }

        let result = self.catalog.call_tool(&tool_name, arguments).await?;
        ctx.respond(result);
        Ok(())
    }
}

impl Flow for CallToolFlow {
    fn name(&self) -> &str {
        "tools/call"
    }

    fn plan(&self) -> Plan {
        Plan::default_mcp_plan("tools/call", vec!["execute".to_string()])
    }

    fn access(&self) -> Access {
        Access::Authenticated
    }

    fn can_activate(&self, request: &Value, _scope: &RouteScope<'_>) -> bool {
        method_is(request, "tools/call")
    }

    fn hooks(&self) -> Vec<HookEntry> {
        vec![HookEntry::plain(
            HookKind::Stage,
            "execute",
            0,
            Arc::new(CallToolHook {
                catalog: Arc::clone(&self.catalog),
                approvals: Arc::clone(&self.approvals),
                guards: Arc::clone(&self.guards),
            }),
        )]
    }
}

/// `resources/list`.
pub struct ListResourcesFlow {
    catalog: Arc<dyn ResourceCatalog>,
}

impl ListResourcesFlow {
    /// Build the flow over `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<dyn ResourceCatalog>) -> Self {
        Self { catalog }
    }
}

struct ListResourcesHook(Arc<dyn ResourceCatalog>);

#[async_trait]
impl Hook for ListResourcesHook {
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        let Some(auth) = &ctx.authorization else {
            return Err(Error::InvalidToken);
        };
        let visible: Vec<Resource> = self
            .0
            .list_resources()
            .into_iter()
            .filter(|r| auth.is_resource_authorized(&r.uri))
            .collect();
        ctx.respond(serde_json::json!({ "resources": visible }));
        Ok(())
    }
}

impl Flow for ListResourcesFlow {
    fn name(&self) -> &str {
        "resources/list"
    }

    fn plan(&self) -> Plan {
        Plan::default_mcp_plan("resources/list", vec!["execute".to_string()])
    }

    fn access(&self) -> Access {
        Access::Authenticated
    }

    fn can_activate(&self, request: &Value, _scope: &RouteScope<'_>) -> bool {
        method_is(request, "resources/list")
    }

    fn hooks(&self) -> Vec<HookEntry> {
        vec![HookEntry::plain(
            HookKind::Stage,
            "execute",
            0,
            Arc::new(ListResourcesHook(Arc::clone(&self.catalog))),
        )]
    }
}

/// `resources/read`.
pub struct ReadResourceFlow {
    catalog: Arc<dyn ResourceCatalog>,
}

impl ReadResourceFlow {
    /// Build the flow over `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<dyn ResourceCatalog>) -> Self {
        Self { catalog }
    }
}

struct ReadResourceHook(Arc<dyn ResourceCatalog>);

#[async_trait]
impl Hook for ReadResourceHook {
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        let Some(auth) = &ctx.authorization else {
            return Err(Error::InvalidToken);
        };
        let uri = ctx
            .input
            .get("params")
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::json_rpc(crate::error::rpc_codes::INVALID_PARAMS, "missing resource uri"))?
            .to_string();
        if !auth.is_resource_authorized(&uri) {
            return Err(Error::ToolNotAllowed(uri));
        }
        let contents = self.0.read_resource(&uri).await?;
        ctx.respond(contents);
        Ok(())
    }
}

impl Flow for ReadResourceFlow {
    fn name(&self) -> &str {
        "resources/read"
    }

    fn plan(&self) -> Plan {
        Plan::default_mcp_plan("resources/read", vec!["execute".to_string()])
    }

    fn access(&self) -> Access {
        Access::Authenticated
    }

    fn can_activate(&self, request: &Value, _scope: &RouteScope<'_>) -> bool {
        method_is(request, "resources/read")
    }

    fn hooks(&self) -> Vec<HookEntry> {
        vec![HookEntry::plain(
            HookKind::Stage,
            "execute",
            0,
            Arc::new(ReadResourceHook(Arc::clone(&self.catalog))),
        )]
    }
}

/// `prompts/list`.
pub struct ListPromptsFlow {
    catalog: Arc<dyn PromptCatalog>,
}

impl ListPromptsFlow {
    /// Build the flow over `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<dyn PromptCatalog>) -> Self {
        Self { catalog }
    }
}

struct ListPromptsHook(Arc<dyn PromptCatalog>);

#[async_trait]
impl Hook for ListPromptsHook {
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        let Some(auth) = &ctx.authorization else {
            return Err(Error::InvalidToken);
        };
        let visible: Vec<Prompt> = self
            .0
            .list_prompts()
            .into_iter()
            .filter(|p| auth.is_prompt_authorized(&p.name))
            .collect();
        ctx.respond(serde_json::json!({ "prompts": visible }));
        Ok(())
    }
}

impl Flow for ListPromptsFlow {
    fn name(&self) -> &str {
        "prompts/list"
    }

    fn plan(&self) -> Plan {
        Plan::default_mcp_plan("prompts/list", vec!["execute".to_string()])
    }

    fn access(&self) -> Access {
        Access::Authenticated
    }

    fn can_activate(&self, request: &Value, _scope: &RouteScope<'_>) -> bool {
        method_is(request, "prompts/list")
    }

    fn hooks(&self) -> Vec<HookEntry> {
        vec![HookEntry::plain(
            HookKind::Stage,
            "execute",
            0,
            Arc::new(ListPromptsHook(Arc::clone(&self.catalog))),
        )]
    }
}

/// `prompts/get`.
pub struct GetPromptFlow {
    catalog: Arc<dyn PromptCatalog>,
}

impl GetPromptFlow {
    /// Build the flow over `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<dyn PromptCatalog>) -> Self {
        Self { catalog }
    }
}

struct GetPromptHook(Arc<dyn PromptCatalog>);

#[async_trait]
impl Hook for GetPromptHook {
    async fn call(&self, ctx: &mut FlowContext) -> Result<()> {
        let Some(auth) = &ctx.authorization else {
            return Err(Error::InvalidToken);
        };
        let name = ctx
            .input
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::json_rpc(crate::error::rpc_codes::INVALID_PARAMS, "missing prompt name"))?
            .to_string();
        if !auth.is_prompt_authorized(&name) {
            return Err(Error::ToolNotAllowed(name));
        }
        let arguments = param(&ctx.input, "arguments");
        let rendered = self.0.get_prompt(&name, arguments).await?;
        ctx.respond(rendered);
        Ok(())
    }
}

impl Flow for GetPromptFlow {
    fn name(&self) -> &str {
        "prompts/get"
    }

    fn plan(&self) -> Plan {
        Plan::default_mcp_plan("prompts/get", vec!["execute".to_string()])
    }

    fn access(&self) -> Access {
        Access::Authenticated
    }

    fn can_activate(&self, request: &Value, _scope: &RouteScope<'_>) -> bool {
        method_is(request, "prompts/get")
    }

    fn hooks(&self) -> Vec<HookEntry> {
        vec![HookEntry::plain(
            HookKind::Stage,
            "execute",
            0,
            Arc::new(GetPromptHook(Arc::clone(&self.catalog))),
        )]
    }
}

/// Grant a session-scoped approval and allowlist entry after an external
/// approval callback accepts a call (§4.5 `PolicyMode::Approval` path).
pub async fn approve_tool_for_session(
    approvals: &ApprovalStore,
    guards: &dashmap::DashMap<String, SkillGuard>,
    session_id: &str,
    tool_name: &str,
    granted_by: &str,
) -> Result<()> {
    approvals
        .grant_approval(GrantApproval {
            tool_id: tool_name.to_string(),
            scope: crate::approval::ApprovalScope::Session,
            session_id: Some(session_id.to_string()),
            user_id: None,
            ttl_ms: None,
            context: None,
            granted_by: granted_by.to_string(),
            reason: None,
            metadata: None,
        })
        .await?;
    if let Some(mut guard) = guards.get_mut(session_id) {
        guard.allow(tool_name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{AnonymousAuthorization, Authorization};
    use crate::invoker::Invoker;
    use crate::storage::MemoryStorage;
    use std::collections::HashSet;

    struct StubTools;

    #[async_trait]
    impl ToolCatalog for StubTools {
        fn list_tools(&self) -> Vec<Tool> {
            vec![Tool {
                name: "echo".to_string(),
                title: None,
                description: None,
                input_schema: serde_json::json!({}),
                output_schema: None,
                annotations: None,
            }]
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
            Ok(serde_json::json!({ "tool": name, "echoed": arguments }))
        }
    }

    fn auth() -> Arc<Authorization> {
        Arc::new(Authorization::Anonymous(AnonymousAuthorization::create(
            "s1",
            HashSet::from(["anonymous".to_string()]),
        )))
    }

    #[tokio::test]
    async fn list_tools_returns_authorized_only() {
        let flow = ListToolsFlow::new(Arc::new(StubTools));
        let plan = flow.plan();
        let hooks = flow.hooks();
        let mut invoker = Invoker::new();
        invoker.register_plan(plan, hooks);

        let mut ctx = FlowContext::new(serde_json::json!({"method": "tools/list"}));
        ctx.authorization = Some(auth());
        let result = invoker.dispatch("tools/list", ctx).await.unwrap();
        assert_eq!(result["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn call_tool_without_authorization_is_rejected() {
        let guards = Arc::new(dashmap::DashMap::new());
        let approvals = Arc::new(ApprovalStore::new(Arc::new(MemoryStorage::new())));
        let flow = CallToolFlow::new(Arc::new(StubTools), approvals, guards);
        let mut invoker = Invoker::new();
        invoker.register_plan(flow.plan(), flow.hooks());

        let ctx = FlowContext::new(serde_json::json!({
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {}}
        }));
        let result = invoker.dispatch("tools/call", ctx).await;
        assert!(matches!(result, Err(Error::InvalidToken)));
    }

    #[tokio::test]
    async fn call_tool_strict_policy_denies_off_allowlist_tool() {
        let guards = Arc::new(dashmap::DashMap::new());
        guards.insert(
            "s1".to_string(),
            SkillGuard::new(PolicyMode::Strict, HashSet::new(), None),
        );
        let approvals = Arc::new(ApprovalStore::new(Arc::new(MemoryStorage::new())));
        let flow = CallToolFlow::new(Arc::new(StubTools), approvals, guards);
        let mut invoker = Invoker::new();
        invoker.register_plan(flow.plan(), flow.hooks());

        let mut ctx = FlowContext::new(serde_json::json!({
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {}}
        }));
        ctx.authorization = Some(auth());
        ctx.session = Some(crate::session::SessionRecord::new(
            "s1".to_string(),
            "anon:s1".to_string(),
            crate::session::ClientInfo { name: "t".to_string(), version: "1".to_string() },
            serde_json::json!({}),
            vec!["anonymous".to_string()],
            3_600_000,
            86_400_000,
        ));

        let result = invoker.dispatch("tools/call", ctx).await;
        assert!(matches!(result, Err(Error::ToolNotAllowed(_))));
    }
}
