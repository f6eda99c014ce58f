//! Runtime wiring — builds the dependency graph described in §6 ("Inbound
//! from transport layer") from a [`Config`] and exposes the three entry
//! points a transport adapter drives: `create_session`, `dispatch`, and
//! `close_session`.
//!
//! Mirrors the way the teacher's `Gateway` assembles backends, cache, and
//! policy from `Config` in `gateway/server.rs`, generalized to this
//! session/authorization/invoker graph instead of a tool-proxy graph.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::approval::{ApprovalStore, PolicyMode, SkillGuard};
use crate::authz::{
    AnonymousAuthorization, Authorization, CreateCommon, ForwardedAuthorization, OrchestratedAuthorization,
    TokenRefresher,
};
use crate::config::{AuthMode, Config, PolicyModeConfig};
use crate::flow::{FlowRegistry, RouteScope};
use crate::flows::{PromptCatalog, ResourceCatalog, ToolCatalog};
use crate::invoker::{FlowContext, Invoker};
use crate::session::{ClientInfo, RateLimitConfig, SessionRecord, SessionStore};
use crate::storage::{MemoryStorage, RedisStorage, Storage};
use crate::vault::TokenVault;
use crate::{Error, Result};

/// External tool/resource/prompt catalogs a concrete deployment supplies.
/// Business logic for individual tools is out of scope here; the runtime
/// only drives these contracts.
#[derive(Clone)]
pub struct Catalogs {
    /// Tool catalog, required to register `tools/list` and `tools/call`.
    pub tools: Arc<dyn ToolCatalog>,
    /// Resource catalog, required to register `resources/list` and
    /// `resources/read`.
    pub resources: Arc<dyn ResourceCatalog>,
    /// Prompt catalog, required to register `prompts/list` and
    /// `prompts/get`.
    pub prompts: Arc<dyn PromptCatalog>,
}

fn policy_mode_from_config(mode: PolicyModeConfig) -> PolicyMode {
    match mode {
        PolicyModeConfig::Strict => PolicyMode::Strict,
        PolicyModeConfig::Approval => PolicyMode::Approval,
        PolicyModeConfig::Permissive => PolicyMode::Permissive,
    }
}

fn build_storage(config: &Config) -> Arc<dyn Storage> {
    match config.storage.backend {
        crate::config::StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        crate::config::StorageBackend::Redis => {
            let base_url = config.storage.redis_url.clone().unwrap_or_default();
            Arc::new(RedisStorage::new(base_url, config.storage.redis_token.clone()))
        }
    }
}

fn build_invoker(config: &Config, registry: &FlowRegistry) -> Invoker {
    let mut invoker = Invoker::new();
    let overrides = config.invoker.default_plan.as_ref();
    for flow in registry.flows() {
        let mut plan = flow.plan();
        if let Some(o) = overrides {
            if let Some(pre) = &o.pre {
                plan.pre = pre.clone();
            }
            if let Some(post) = &o.post {
                plan.post = post.clone();
            }
            if let Some(finalize) = &o.finalize {
                plan.finalize = finalize.clone();
            }
            if let Some(error) = &o.error {
                plan.error = error.clone();
            }
        }
        invoker.register_plan(plan, flow.hooks());
    }
    invoker
}

fn build_flow_registry(
    catalogs: &Catalogs,
    approvals: &Arc<ApprovalStore>,
    guards: &Arc<DashMap<String, SkillGuard>>,
) -> FlowRegistry {
    let mut registry = FlowRegistry::default();
    registry.register(Arc::new(crate::flows::ListToolsFlow::new(Arc::clone(&catalogs.tools))));
    registry.register(Arc::new(crate::flows::CallToolFlow::new(
        Arc::clone(&catalogs.tools),
        Arc::clone(approvals),
        Arc::clone(guards),
    )));
    registry.register(Arc::new(crate::flows::ListResourcesFlow::new(Arc::clone(&catalogs.resources))));
    registry.register(Arc::new(crate::flows::ReadResourceFlow::new(Arc::clone(&catalogs.resources))));
    registry.register(Arc::new(crate::flows::ListPromptsFlow::new(Arc::clone(&catalogs.prompts))));
    registry.register(Arc::new(crate::flows::GetPromptFlow::new(Arc::clone(&catalogs.prompts))));
    registry
}

/// Owns the full dependency graph for one running instance: storage,
/// session store, approval store, optional token vault, the compiled
/// invoker, and the flow registry.
pub struct Runtime {
    config: Config,
    sessions: Arc<SessionStore>,
    approvals: Arc<ApprovalStore>,
    vault: Option<Arc<TokenVault>>,
    token_refresher: Option<Arc<dyn TokenRefresher>>,
    invoker: Arc<Invoker>,
    flows: Arc<FlowRegistry>,
    guards: Arc<DashMap<String, SkillGuard>>,
    authorizations: Arc<DashMap<String, Arc<Authorization>>>,
}

impl Runtime {
    /// Assemble a runtime from `config`. `token_refresher` is required when
    /// `auth.mode = orchestrated`; it backs `vault.onTokenRefresh` (§6),
    /// which is a behavior and cannot be expressed as literal config.
    ///
    /// # Errors
    ///
    /// Returns an error if `auth.mode = orchestrated` and either the vault
    /// master secret or `token_refresher` is missing, or if `catalogs`
    /// requires a tool/resource/prompt provider that was not supplied.
    pub fn new(config: Config, token_refresher: Option<Arc<dyn TokenRefresher>>, catalogs: Catalogs) -> Result<Self> {
        let storage = build_storage(&config);

        let session_key_prefix = config.storage.session_key_prefix.clone().unwrap_or_else(|| "session:".to_string());
        let signing_secret = config.session.signing_secret.clone().map(String::into_bytes);
        let rate_limit = config.session.rate_limit.map(|r| RateLimitConfig {
            window: std::time::Duration::from_millis(r.window_ms),
            max_requests: r.max_requests,
        });
        let sessions = Arc::new(SessionStore::new(
            Arc::clone(&storage),
            session_key_prefix,
            signing_secret,
            config.session.ttl_ms,
            rate_limit,
        ));

        let approvals = Arc::new(ApprovalStore::new(Arc::clone(&storage)));

        let vault = if config.auth.mode == AuthMode::Orchestrated {
            let secret = config
                .vault
                .master_secret
                .clone()
                .ok_or_else(|| Error::Config("vault.masterSecret is required for orchestrated auth".to_string()))?;
            if token_refresher.is_none() {
                return Err(Error::Config(
                    "a token refresher is required for orchestrated auth".to_string(),
                ));
            }
            Some(Arc::new(TokenVault::new(Arc::clone(&storage), secret.into_bytes())))
        } else {
            None
        };

        let guards = Arc::new(DashMap::new());
        let flows = Arc::new(build_flow_registry(&catalogs, &approvals, &guards));
        let invoker = Arc::new(build_invoker(&config, &flows));

        Ok(Self {
            config,
            sessions,
            approvals,
            vault,
            token_refresher,
            invoker,
            flows,
            guards,
            authorizations: Arc::new(DashMap::new()),
        })
    }

    /// Materialize a fresh [`Authorization`] for `token` under the
    /// configured `auth.mode`, without allocating a session (§4.3).
    fn materialize_authorization(&self, session_id: &str, token: Option<String>) -> Result<Arc<Authorization>> {
        let scopes: std::collections::HashSet<String> = self.config.auth.anonymous_scopes.iter().cloned().collect();

        let authorization = match self.config.auth.mode {
            AuthMode::Public => Authorization::Anonymous(AnonymousAuthorization::create(session_id, scopes)),
            AuthMode::Forwarded => {
                let token = token.ok_or(Error::InvalidToken)?;
                Authorization::Forwarded(ForwardedAuthorization::create(token, CreateCommon::default()))
            }
            AuthMode::Orchestrated => {
                let token = token.ok_or(Error::InvalidToken)?;
                let vault = self.vault.clone().ok_or(Error::TokenStoreRequired)?;
                let refresher = self.token_refresher.clone().ok_or(Error::TokenStoreRequired)?;
                Authorization::Orchestrated(OrchestratedAuthorization::create(
                    token,
                    None,
                    HashMap::new(),
                    vault,
                    refresher,
                    CreateCommon::default(),
                ))
            }
        };
        Ok(Arc::new(authorization))
    }

    /// Create a new session for a client's `initialize` call. Not routed
    /// through the invoker: no session/authorization exists yet to drive a
    /// flow's `pre` stages (§6 control-flow note).
    ///
    /// # Errors
    ///
    /// Returns an error if `auth.mode` requires a token that was not
    /// supplied, or if the session store rejects the write.
    pub async fn create_session(
        &self,
        client_info: ClientInfo,
        capabilities: Value,
        token: Option<String>,
    ) -> Result<(SessionRecord, Arc<Authorization>)> {
        let id = SessionStore::alloc_id();
        let authorization = self.materialize_authorization(&id, token)?;

        let record = SessionRecord::new(
            id.clone(),
            authorization.id().to_string(),
            client_info,
            capabilities,
            self.config.auth.anonymous_scopes.clone(),
            self.config.session.ttl_ms,
            self.config.session.max_lifetime_ms,
        );

        self.sessions.create(&record, None).await?;
        self.authorizations.insert(authorization.id().to_string(), Arc::clone(&authorization));

        let policy = policy_mode_from_config(self.config.approval.default_policy_mode);
        self.guards.insert(id, SkillGuard::new(policy, std::collections::HashSet::new(), None));

        Ok((record, authorization))
    }

    /// Destroy a session, its Skill Guard state, and any approvals scoped
    /// to it (§3, §4.5).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage delete fails.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.sessions.delete(session_id).await?;
        self.guards.remove(session_id);
        self.approvals.clear_session_approvals(session_id).await?;
        Ok(())
    }

    /// Route and run `request` against `session_id`'s materialized
    /// authorization (§6 single-request control flow: transport → session
    /// load → authorization resolve → flow route → invoker dispatch).
    ///
    /// # Errors
    ///
    /// Returns `SessionExpired`/`SessionIdEmpty` if the session cannot be
    /// loaded, `FlowNotFound` if no registered flow claims the request, or
    /// whatever error the flow's stages raised.
    pub async fn dispatch(&self, request: Value, session_id: &str, client_identifier: Option<&str>) -> Result<Value> {
        let session = self
            .sessions
            .get(session_id, client_identifier)
            .await?
            .ok_or(Error::SessionExpired)?;

        let authorization = self.authorizations.get(&session.authorization_id).map(|e| Arc::clone(e.value()));

        let method = request.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
        let scope = RouteScope {
            method: &method,
            authorization: authorization.as_deref(),
        };

        let flow = self.flows.route(&request, &scope).ok_or(Error::FlowNotFound)?;

        let mut ctx = FlowContext::new(request);
        ctx.authorization = authorization;
        ctx.session = Some(session);

        self.invoker.dispatch(flow.name(), ctx).await
    }

    /// The compiled invoker, exposed for transport adapters that need to
    /// register additional ad hoc plans (e.g. a `ping` health flow).
    #[must_use]
    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.invoker
    }

    /// The flow registry, exposed read-only for introspection (e.g. a
    /// `tools/list` response built without a round-trip through dispatch).
    #[must_use]
    pub fn flows(&self) -> &Arc<FlowRegistry> {
        &self.flows
    }

    /// The Skill Guard table, exposed so an approval callback can grant a
    /// session-scoped allowance via [`crate::flows::approve_tool_for_session`].
    #[must_use]
    pub fn guards(&self) -> &Arc<DashMap<String, SkillGuard>> {
        &self.guards
    }

    /// The approval store, exposed for the same reason as [`Self::guards`].
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalStore> {
        &self.approvals
    }

    /// The configuration this runtime was built from.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Prompt, Resource, Tool};
    use async_trait::async_trait;

    struct EmptyTools;

    #[async_trait]
    impl ToolCatalog for EmptyTools {
        fn list_tools(&self) -> Vec<Tool> {
            vec![]
        }
        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Value> {
            Err(Error::FlowNotFound)
        }
    }

    struct EmptyResources;

    #[async_trait]
    impl ResourceCatalog for EmptyResources {
        fn list_resources(&self) -> Vec<Resource> {
            vec![]
        }
        async fn read_resource(&self, _uri: &str) -> Result<Value> {
            Err(Error::FlowNotFound)
        }
    }

    struct EmptyPrompts;

    #[async_trait]
    impl PromptCatalog for EmptyPrompts {
        fn list_prompts(&self) -> Vec<Prompt> {
            vec![]
        }
        async fn get_prompt(&self, _name: &str, _arguments: Value) -> Result<Value> {
            Err(Error::FlowNotFound)
        }
    }

    fn catalogs() -> Catalogs {
        Catalogs {
            tools: Arc::new(EmptyTools),
            resources: Arc::new(EmptyResources),
            prompts: Arc::new(EmptyPrompts),
        }
    }

    #[tokio::test]
    async fn public_mode_creates_anonymous_session() {
        let config = Config::default();
        let runtime = Runtime::new(config, None, catalogs()).unwrap();

        let (record, authorization) = runtime
            .create_session(ClientInfo { name: "t".to_string(), version: "1".to_string() }, Value::Null, None)
            .await
            .unwrap();

        assert!(matches!(authorization.as_ref(), Authorization::Anonymous(_)));
        assert_eq!(record.authorization_id, authorization.id());
    }

    #[tokio::test]
    async fn orchestrated_mode_without_refresher_is_rejected() {
        let config = Config {
            auth: crate::config::AuthConfig {
                mode: AuthMode::Orchestrated,
                anonymous_scopes: vec![],
            },
            vault: crate::config::VaultConfig {
                master_secret: Some("shh".to_string()),
            },
            ..Config::default()
        };
        let result = Runtime::new(config, None, catalogs());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dispatch_routes_list_tools_for_anonymous_session() {
        let config = Config::default();
        let runtime = Runtime::new(config, None, catalogs()).unwrap();

        let (record, _authorization) = runtime
            .create_session(ClientInfo { name: "t".to_string(), version: "1".to_string() }, Value::Null, None)
            .await
            .unwrap();

        let result = runtime
            .dispatch(serde_json::json!({"method": "tools/list"}), &record.id, None)
            .await
            .unwrap();
        assert_eq!(result["tools"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn dispatch_against_unknown_session_is_rejected() {
        let config = Config::default();
        let runtime = Runtime::new(config, None, catalogs()).unwrap();
        let result = runtime.dispatch(serde_json::json!({"method": "tools/list"}), "missing", None).await;
        assert!(matches!(result, Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn close_session_removes_guard_and_approvals() {
        let config = Config::default();
        let runtime = Runtime::new(config, None, catalogs()).unwrap();
        let (record, _) = runtime
            .create_session(ClientInfo { name: "t".to_string(), version: "1".to_string() }, Value::Null, None)
            .await
            .unwrap();

        runtime.close_session(&record.id).await.unwrap();
        assert!(runtime.guards().get(&record.id).is_none());
        assert!(!runtime.sessions.exists(&record.id).await.unwrap());
    }
}
