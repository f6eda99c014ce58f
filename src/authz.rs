//! Authorization Model (C3)
//!
//! A tagged variant `Authorization = Anonymous | Forwarded | Orchestrated`
//! per §9's "sum types for Authorization" design note — shared projections
//! live in [`Common`], embedded by each variant, instead of modeling this
//! as a class hierarchy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::crypto;
use crate::vault::{TokenPair, TokenVault};
use crate::{Error, Result};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Identity claims for the caller, when known.
#[derive(Debug, Clone, Default)]
pub struct UserIdentity {
    /// Subject identifier.
    pub subject: Option<String>,
    /// Display name, if available.
    pub name: Option<String>,
}

/// A grant of specific tool ids under an app id, per §3 `authorizedApps`.
#[derive(Debug, Clone)]
pub struct AppGrant {
    /// Tool ids this app grant authorizes.
    pub tool_ids: Vec<String>,
}

/// Capability projections shared by every `Authorization` variant.
#[derive(Debug, Clone, Default)]
pub struct Projections {
    /// `None` is the "all tools authorized" sentinel.
    pub authorized_tool_ids: Option<HashSet<String>>,
    /// `None` is the "all prompts authorized" sentinel.
    pub authorized_prompt_ids: Option<HashSet<String>>,
    /// `None` is the "all apps authorized" sentinel.
    pub authorized_app_ids: Option<HashSet<String>>,
    /// `None` is the "all resources authorized" sentinel.
    pub authorized_resources: Option<HashSet<String>>,
    /// Explicit provider allowlist; authoritative over the derived set when
    /// present (Open Question 1).
    pub authorized_provider_ids: Option<HashSet<String>>,
    /// `appId -> { toolIds }`.
    pub authorized_apps: HashMap<String, AppGrant>,
}

/// Fields common to every `Authorization` variant.
#[derive(Debug, Clone)]
pub struct Common {
    /// Identity derived from the token (SHA-256 prefix) or the anonymous
    /// sentinel.
    pub id: String,
    /// Identity claims, when known.
    pub user: Option<UserIdentity>,
    /// Issuer/audience/subject/arbitrary claims, opaque to the core.
    pub claims: serde_json::Value,
    /// Granted scopes.
    pub scopes: HashSet<String>,
    /// Absolute expiry, epoch milliseconds.
    pub expires_at: Option<i64>,
    /// Shared capability projections.
    pub projections: Projections,
}

impl Common {
    fn is_tool_authorized(&self, tool_id: &str) -> bool {
        match &self.projections.authorized_tool_ids {
            None => true,
            Some(ids) => ids.contains(tool_id),
        }
    }

    fn is_app_authorized(&self, app_id: &str) -> bool {
        match &self.projections.authorized_app_ids {
            None => true,
            Some(ids) => ids.contains(app_id) || self.projections.authorized_apps.contains_key(app_id),
        }
    }

    fn is_resource_authorized(&self, resource_id: &str) -> bool {
        match &self.projections.authorized_resources {
            None => true,
            Some(ids) => ids.contains(resource_id),
        }
    }

    fn is_prompt_authorized(&self, prompt_id: &str) -> bool {
        match &self.projections.authorized_prompt_ids {
            None => true,
            Some(ids) => ids.contains(prompt_id),
        }
    }

    fn is_provider_authorized(&self, provider_id: &str, derived: &HashSet<String>) -> bool {
        // Open Question 1: the explicit list is authoritative when present,
        // even if it names providers not yet connected.
        match &self.projections.authorized_provider_ids {
            Some(ids) => ids.contains(provider_id),
            None => derived.contains(provider_id),
        }
    }
}

/// Inputs shared by every `*::create` constructor.
#[derive(Debug, Clone, Default)]
pub struct CreateCommon {
    /// Identity claims.
    pub user: Option<UserIdentity>,
    /// Opaque claims blob.
    pub claims: serde_json::Value,
    /// Granted scopes.
    pub scopes: HashSet<String>,
    /// Absolute expiry.
    pub expires_at: Option<i64>,
    /// Capability projections.
    pub projections: Projections,
}

/// Anonymous/public authorization: `id = "anon:" + sessionId`.
#[derive(Debug, Clone)]
pub struct AnonymousAuthorization {
    common: Common,
}

impl AnonymousAuthorization {
    /// Construct an anonymous authorization scoped to `session_id`.
    #[must_use]
    pub fn create(session_id: &str, scopes: HashSet<String>) -> Self {
        Self {
            common: Common {
                id: format!("anon:{session_id}"),
                user: None,
                claims: serde_json::Value::Null,
                scopes,
                expires_at: None,
                projections: Projections::default(),
            },
        }
    }
}

/// Forwarded-bearer authorization: owns the raw token directly.
#[derive(Debug, Clone)]
pub struct ForwardedAuthorization {
    common: Common,
    token: String,
}

impl ForwardedAuthorization {
    /// Construct a forwarded authorization. `id = SHA-256(token).hex[:32]`.
    #[must_use]
    pub fn create(token: String, common: CreateCommon) -> Self {
        let id = crypto::sha256_hex(token.as_bytes())[..32].to_string();
        Self {
            common: Common {
                id,
                user: common.user,
                claims: common.claims,
                scopes: common.scopes,
                expires_at: common.expires_at,
                projections: common.projections,
            },
            token,
        }
    }
}

/// In-memory snapshot of a connected provider's refresh state.
#[derive(Debug, Clone)]
pub struct ProviderState {
    /// Absolute access-token expiry as last observed in-memory; a refresh
    /// updates this atomically alongside the vault write.
    pub expires_at: Option<i64>,
}

/// What an `onTokenRefresh` callback returns on success.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    /// New access token.
    pub access_token: String,
    /// New refresh token, if rotated.
    pub refresh_token: Option<String>,
    /// Seconds until the new access token expires.
    pub expires_in: Option<i64>,
}

/// Supplied at construction; performs the actual provider token refresh.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange `refresh_token` for a fresh token pair from `provider_id`.
    async fn refresh(&self, provider_id: &str, refresh_token: &str) -> Result<RefreshedTokens>;
}

/// Orchestrated (federated OAuth) authorization.
pub struct OrchestratedAuthorization {
    common: Common,
    vault: Arc<TokenVault>,
    primary_provider_id: Option<String>,
    providers: DashMap<String, ProviderState>,
    on_token_refresh: Arc<dyn TokenRefresher>,
    progressively_authorized_apps: DashMap<String, AppGrant>,
    refresh_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl std::fmt::Debug for OrchestratedAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratedAuthorization")
            .field("common", &self.common)
            .field("primary_provider_id", &self.primary_provider_id)
            .finish_non_exhaustive()
    }
}

impl OrchestratedAuthorization {
    /// Construct an orchestrated authorization. `id = SHA-256(token).hex[:32]`.
    #[must_use]
    pub fn create(
        token: String,
        primary_provider_id: Option<String>,
        providers: HashMap<String, ProviderState>,
        vault: Arc<TokenVault>,
        on_token_refresh: Arc<dyn TokenRefresher>,
        common: CreateCommon,
    ) -> Self {
        let id = crypto::sha256_hex(token.as_bytes())[..32].to_string();
        let provider_map = DashMap::new();
        for (k, v) in providers {
            provider_map.insert(k, v);
        }
        Self {
            common: Common {
                id,
                user: common.user,
                claims: common.claims,
                scopes: common.scopes,
                expires_at: common.expires_at,
                projections: common.projections,
            },
            vault,
            primary_provider_id,
            providers: provider_map,
            on_token_refresh,
            progressively_authorized_apps: DashMap::new(),
            refresh_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, provider_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            &self.refresh_locks
                .entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// §4.4 refresh contract, single-flighted per `(authorizationId, providerId)`.
    async fn get_token_for_provider(&self, provider_id: &str) -> Result<String> {
        let lock = self.lock_for(provider_id);
        let _guard = lock.lock().await;

        let now = now_ms();
        let fresh_in_memory = self
            .providers
            .get(provider_id)
            .is_some_and(|s| s.expires_at.is_some_and(|exp| exp > now));

        if fresh_in_memory {
            if let Some(token) = self.vault.get_access_token(&self.common.id, provider_id).await? {
                return Ok(token);
            }
        }

        let refresh_token = self
            .vault
            .get_refresh_token(&self.common.id, provider_id)
            .await?
            .ok_or(Error::TokenNotAvailable)?;

        match self.on_token_refresh.refresh(provider_id, &refresh_token).await {
            Ok(refreshed) => {
                let expires_at = refreshed.expires_in.map(|secs| now_ms() + secs * 1000);
                self.vault
                    .store_tokens(
                        &self.common.id,
                        provider_id,
                        &TokenPair {
                            access_token: refreshed.access_token.clone(),
                            refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
                            expires_at,
                        },
                    )
                    .await?;
                self.providers
                    .insert(provider_id.to_string(), ProviderState { expires_at });
                Ok(refreshed.access_token)
            }
            Err(e) => {
                self.vault.delete_access_token(&self.common.id, provider_id).await?;
                Err(e)
            }
        }
    }

    fn derived_provider_ids(&self) -> HashSet<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }
}

/// The authorization bound to a session: who the caller is and what they
/// may do. See §3.
pub enum Authorization {
    /// Public/unauthenticated caller.
    Anonymous(AnonymousAuthorization),
    /// Caller presented a bearer token the server does not interpret.
    Forwarded(ForwardedAuthorization),
    /// Caller is federated through one or more OAuth providers.
    Orchestrated(OrchestratedAuthorization),
}

impl Authorization {
    fn common(&self) -> &Common {
        match self {
            Self::Anonymous(a) => &a.common,
            Self::Forwarded(f) => &f.common,
            Self::Orchestrated(o) => &o.common,
        }
    }

    /// The authorization id: `"anon:" + sessionId` or `SHA-256(token)[:32]`.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.common().id
    }

    /// Granted scopes.
    #[must_use]
    pub fn scopes(&self) -> &HashSet<String> {
        &self.common().scopes
    }

    /// Whether `tool_id` is authorized, consulting the progressive app map
    /// for Orchestrated authorizations in addition to the static projection.
    #[must_use]
    pub fn is_tool_authorized(&self, tool_id: &str) -> bool {
        if self.common().is_tool_authorized(tool_id) {
            return true;
        }
        if let Self::Orchestrated(o) = self {
            return o
                .progressively_authorized_apps
                .iter()
                .any(|e| e.value().tool_ids.iter().any(|t| t == tool_id));
        }
        false
    }

    /// Whether `app_id` is authorized, consulting the mutable progressive
    /// map for Orchestrated authorizations.
    #[must_use]
    pub fn is_app_authorized(&self, app_id: &str) -> bool {
        if self.common().is_app_authorized(app_id) {
            return true;
        }
        if let Self::Orchestrated(o) = self {
            return o.progressively_authorized_apps.contains_key(app_id);
        }
        false
    }

    /// Whether `resource_id` (a resource URI) is authorized.
    #[must_use]
    pub fn is_resource_authorized(&self, resource_id: &str) -> bool {
        self.common().is_resource_authorized(resource_id)
    }

    /// Whether `prompt_id` is authorized.
    #[must_use]
    pub fn is_prompt_authorized(&self, prompt_id: &str) -> bool {
        self.common().is_prompt_authorized(prompt_id)
    }

    /// Tool ids granted under `app_id`, if any.
    #[must_use]
    pub fn get_app_tool_ids(&self, app_id: &str) -> Option<Vec<String>> {
        if let Some(grant) = self.common().projections.authorized_apps.get(app_id) {
            return Some(grant.tool_ids.clone());
        }
        if let Self::Orchestrated(o) = self {
            if let Some(grant) = o.progressively_authorized_apps.get(app_id) {
                return Some(grant.tool_ids.clone());
            }
        }
        None
    }

    /// Resolve a usable token. Anonymous always fails; Forwarded returns
    /// its bearer directly; Orchestrated runs the refresh contract.
    pub async fn get_token(&self, provider_id: Option<&str>) -> Result<String> {
        match self {
            Self::Anonymous(_) => Err(Error::TokenNotAvailable),
            Self::Forwarded(f) => Ok(f.token.clone()),
            Self::Orchestrated(o) => {
                let provider_id = provider_id
                    .map(str::to_string)
                    .or_else(|| o.primary_provider_id.clone())
                    .ok_or(Error::NoProviderId)?;

                let derived = o.derived_provider_ids();
                if !o.common.is_provider_authorized(&provider_id, &derived) {
                    return Err(Error::NoProviderId);
                }

                o.get_token_for_provider(&provider_id).await
            }
        }
    }

    /// Store tokens for a newly connected provider and update in-memory
    /// state (Orchestrated only).
    pub async fn add_provider(
        &self,
        provider_id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
    ) -> Result<()> {
        let Self::Orchestrated(o) = self else {
            return Err(Error::TokenStoreRequired);
        };
        let expires_at = expires_in.map(|secs| now_ms() + secs * 1000);
        o.vault
            .store_tokens(
                &o.common.id,
                provider_id,
                &TokenPair {
                    access_token,
                    refresh_token,
                    expires_at,
                },
            )
            .await?;
        o.providers.insert(provider_id.to_string(), ProviderState { expires_at });
        Ok(())
    }

    /// Grant an app-scoped tool set with its own provider-shaped token
    /// bucket (stored under provider id `"app:" + appId`). A second call
    /// for the same `app_id` replaces the first in full (Open Question 2).
    pub async fn add_app_authorization(
        &self,
        app_id: &str,
        tool_ids: Vec<String>,
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
    ) -> Result<()> {
        let Self::Orchestrated(o) = self else {
            return Err(Error::TokenStoreRequired);
        };
        let provider_id = format!("app:{app_id}");
        let expires_at = expires_in.map(|secs| now_ms() + secs * 1000);
        o.vault
            .store_tokens(
                &o.common.id,
                &provider_id,
                &TokenPair {
                    access_token,
                    refresh_token,
                    expires_at,
                },
            )
            .await?;
        o.progressively_authorized_apps
            .insert(app_id.to_string(), AppGrant { tool_ids });
        Ok(())
    }

    /// The app-scoped provider token for `app_id`, if granted.
    pub async fn get_app_token(&self, app_id: &str) -> Result<Option<String>> {
        let Self::Orchestrated(o) = self else {
            return Ok(None);
        };
        if !o.progressively_authorized_apps.contains_key(app_id) {
            return Ok(None);
        }
        o.vault
            .get_access_token(&o.common.id, &format!("app:{app_id}"))
            .await
    }

    /// Remove a connected provider's tokens and in-memory state.
    pub async fn remove_provider(&self, provider_id: &str) -> Result<()> {
        let Self::Orchestrated(o) = self else {
            return Err(Error::TokenStoreRequired);
        };
        o.vault.delete_tokens(&o.common.id, provider_id).await?;
        o.providers.remove(provider_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    struct FixedRefresher {
        access_token: String,
        expires_in: i64,
    }

    #[async_trait]
    impl TokenRefresher for FixedRefresher {
        async fn refresh(&self, _provider_id: &str, _refresh_token: &str) -> Result<RefreshedTokens> {
            Ok(RefreshedTokens {
                access_token: self.access_token.clone(),
                refresh_token: Some("new-refresh".to_string()),
                expires_in: Some(self.expires_in),
            })
        }
    }

    struct FailingRefresher;

    #[async_trait]
    impl TokenRefresher for FailingRefresher {
        async fn refresh(&self, _provider_id: &str, _refresh_token: &str) -> Result<RefreshedTokens> {
            Err(Error::Internal("provider rejected refresh".to_string()))
        }
    }

    fn vault() -> Arc<TokenVault> {
        Arc::new(TokenVault::new(Arc::new(MemoryStorage::new()), b"master".to_vec()))
    }

    #[test]
    fn anonymous_id_is_prefixed_with_session_id() {
        let auth = AnonymousAuthorization::create("s1", HashSet::from(["anonymous".to_string()]));
        let auth = Authorization::Anonymous(auth);
        assert_eq!(auth.id(), "anon:s1");
    }

    #[test]
    fn forwarded_id_is_sha256_prefix() {
        let auth = ForwardedAuthorization::create("my-token".to_string(), CreateCommon::default());
        let expected = crypto::sha256_hex(b"my-token");
        assert_eq!(auth.common.id, expected[..32]);
        assert_eq!(auth.common.id.len(), 32);
    }

    #[test]
    fn anonymous_get_token_always_fails() {
        let auth = Authorization::Anonymous(AnonymousAuthorization::create("s1", HashSet::new()));
        let result = tokio_test::block_on(auth.get_token(None));
        assert!(matches!(result, Err(Error::TokenNotAvailable)));
    }

    #[test]
    fn forwarded_get_token_returns_bearer_directly() {
        let auth = Authorization::Forwarded(ForwardedAuthorization::create(
            "bearer-xyz".to_string(),
            CreateCommon::default(),
        ));
        let token = tokio_test::block_on(auth.get_token(None)).unwrap();
        assert_eq!(token, "bearer-xyz");
    }

    #[tokio::test]
    async fn orchestrated_refreshes_expired_token_exactly_once() {
        let vault = vault();
        let orch = OrchestratedAuthorization::create(
            "session-token".to_string(),
            Some("github".to_string()),
            HashMap::from([("github".to_string(), ProviderState { expires_at: Some(now_ms() - 1) })]),
            Arc::clone(&vault),
            Arc::new(FixedRefresher {
                access_token: "fresh-access".to_string(),
                expires_in: 3600,
            }),
            CreateCommon::default(),
        );
        vault
            .store_tokens(
                &orch.common.id,
                "github",
                &TokenPair {
                    access_token: "stale-access".to_string(),
                    refresh_token: Some("refresh-r".to_string()),
                    expires_at: Some(now_ms() - 1),
                },
            )
            .await
            .unwrap();

        let auth = Authorization::Orchestrated(orch);
        let token = auth.get_token(Some("github")).await.unwrap();
        assert_eq!(token, "fresh-access");
    }

    #[tokio::test]
    async fn orchestrated_refresh_failure_deletes_access_not_refresh() {
        let vault = vault();
        let auth_id;
        {
            let orch = OrchestratedAuthorization::create(
                "session-token-2".to_string(),
                Some("github".to_string()),
                HashMap::from([("github".to_string(), ProviderState { expires_at: Some(now_ms() - 1) })]),
                Arc::clone(&vault),
                Arc::new(FailingRefresher),
                CreateCommon::default(),
            );
            auth_id = orch.common.id.clone();
            vault
                .store_tokens(
                    &auth_id,
                    "github",
                    &TokenPair {
                        access_token: "stale".to_string(),
                        refresh_token: Some("refresh-r".to_string()),
                        expires_at: Some(now_ms() - 1),
                    },
                )
                .await
                .unwrap();

            let auth = Authorization::Orchestrated(orch);
            let result = auth.get_token(Some("github")).await;
            assert!(result.is_err());
        }

        assert_eq!(vault.get_access_token(&auth_id, "github").await.unwrap(), None);
        assert_eq!(
            vault.get_refresh_token(&auth_id, "github").await.unwrap(),
            Some("refresh-r".to_string())
        );
    }

    #[tokio::test]
    async fn add_app_authorization_makes_tools_immediately_visible() {
        let vault = vault();
        let orch = OrchestratedAuthorization::create(
            "session-token-3".to_string(),
            None,
            HashMap::new(),
            vault,
            Arc::new(FixedRefresher {
                access_token: "x".to_string(),
                expires_in: 3600,
            }),
            CreateCommon::default(),
        );
        let auth = Authorization::Orchestrated(orch);

        assert!(!auth.is_tool_authorized("slack:send"));
        auth.add_app_authorization(
            "slack",
            vec!["slack:send".to_string(), "slack:list".to_string()],
            "slack-token".to_string(),
            None,
            Some(3600),
        )
        .await
        .unwrap();

        assert!(auth.is_app_authorized("slack"));
        assert!(auth.is_tool_authorized("slack:send"));
        assert_eq!(auth.get_app_token("slack").await.unwrap(), Some("slack-token".to_string()));
    }

    #[tokio::test]
    async fn add_app_authorization_replaces_not_merges() {
        let vault = vault();
        let orch = OrchestratedAuthorization::create(
            "session-token-4".to_string(),
            None,
            HashMap::new(),
            vault,
            Arc::new(FixedRefresher {
                access_token: "x".to_string(),
                expires_in: 3600,
            }),
            CreateCommon::default(),
        );
        let auth = Authorization::Orchestrated(orch);

        auth.add_app_authorization("slack", vec!["slack:send".to_string()], "t1".to_string(), None, None)
            .await
            .unwrap();
        auth.add_app_authorization("slack", vec!["slack:list".to_string()], "t2".to_string(), None, None)
            .await
            .unwrap();

        assert_eq!(auth.get_app_tool_ids("slack"), Some(vec!["slack:list".to_string()]));
        assert!(!auth.is_tool_authorized("slack:send"));
        assert!(auth.is_tool_authorized("slack:list"));
    }
}
