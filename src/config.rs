//! Configuration management
//!
//! Layered the way the teacher's `Config::load` does it: a YAML file merged
//! under environment variables (`MCP_RUNTIME_` prefix, `__` nesting), every
//! struct `serde(default)`, durations via `humantime_serde`. Carries exactly
//! the keys enumerated in §6 plus the ambient server/log settings every
//! runtime needs.

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Environment files to load before processing config. Paths support
    /// `~` expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Ambient server bind/timeout settings.
    pub server: ServerConfig,
    /// Storage Adapter backend selection (§4.1, §6).
    pub storage: StorageConfig,
    /// Session Store tuning (§4.2, §6).
    pub session: SessionConfig,
    /// Authorization mode selection (§4.3, §6).
    pub auth: AuthConfig,
    /// Token Vault settings (§4.4, §6).
    pub vault: VaultConfig,
    /// Approval / Skill Guard defaults (§4.5, §6).
    pub approval: ApprovalConfig,
    /// Invoker Core plan overrides (§4.6, §6).
    pub invoker: InvokerConfig,
    /// Transport protocol negotiation (§4.8, §6).
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from an optional YAML file, layered under
    /// `MCP_RUNTIME_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be
    /// parsed, or if mode-specific requirements are unmet (orchestrated
    /// auth without a vault master secret).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!("config file not found: {}", p.display())));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("MCP_RUNTIME_").split("__"));

        let mut config: Self = figment.extract().map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if let Some(rest) = path_str.strip_prefix('~') {
                dirs::home_dir().map_or_else(|| path_str.clone(), |home| format!("{}{rest}", home.display()))
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}`/`${VAR:-default}` in secret fields, so the vault
    /// master secret and the session signing secret can be sourced from the
    /// process environment rather than committed to a config file.
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        if let Some(secret) = &mut self.session.signing_secret {
            *secret = Self::expand_string(&re, secret);
        }
        if let Some(secret) = &mut self.vault.master_secret {
            *secret = Self::expand_string(&re, secret);
        }
        if let Some(token) = &mut self.storage.redis_token {
            *token = Self::expand_string(&re, token);
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    fn validate(&self) -> Result<()> {
        if self.auth.mode == AuthMode::Orchestrated && self.vault.master_secret.is_none() {
            return Err(Error::Config(
                "vault.masterSecret is required when auth.mode = orchestrated".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Redis && self.storage.redis_url.is_none() {
            return Err(Error::Config(
                "storage.redisUrl is required when storage.backend = redis".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ambient server bind/timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Per-request deadline, checked at every invoker stage boundary (§5).
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown drain window.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum accepted request body size, in bytes.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3939,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Storage Adapter backend selection (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process map with a TTL wheel.
    Memory,
    /// Redis-compatible REST backend.
    Redis,
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::Memory
    }
}

/// `storage.*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Which backend to construct.
    pub backend: StorageBackend,
    /// Base URL of the Redis-compatible REST endpoint. Required when
    /// `backend = redis`.
    pub redis_url: Option<String>,
    /// Bearer token for the REST endpoint, if required.
    pub redis_token: Option<String>,
    /// Key prefix applied to every session record (§6 persisted layout).
    pub session_key_prefix: Option<String>,
}

/// `session.rateLimit.*` (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionRateLimitConfig {
    /// Window, in milliseconds, over which `max_requests` applies.
    pub window_ms: u64,
    /// Burst/request budget per window.
    pub max_requests: u32,
}

impl Default for SessionRateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            max_requests: 100,
        }
    }
}

/// `session.*` (§6, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Default session TTL, milliseconds.
    pub ttl_ms: i64,
    /// Hard session lifetime cap, milliseconds.
    pub max_lifetime_ms: i64,
    /// HMAC-SHA-256 key used to sign persisted session blobs. `None`
    /// disables signing (not recommended outside tests).
    pub signing_secret: Option<String>,
    /// Per-client/session read-rate-limit bucket. `None` disables limiting.
    pub rate_limit: Option<SessionRateLimitConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 3_600_000,
            max_lifetime_ms: 30 * 24 * 60 * 60 * 1000,
            signing_secret: None,
            rate_limit: Some(SessionRateLimitConfig::default()),
        }
    }
}

/// Authorization mode (§4.3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No token required; sessions get `auth.anonymousScopes`.
    Public,
    /// Caller's bearer token is forwarded verbatim, uninterpreted.
    Forwarded,
    /// Federated OAuth via the Token Vault, with refresh.
    Orchestrated,
}

impl Default for AuthMode {
    fn default() -> Self {
        Self::Public
    }
}

/// `auth.*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    /// Which authorization mode governs newly created sessions.
    pub mode: AuthMode,
    /// Scopes granted to an anonymous authorization.
    pub anonymous_scopes: Vec<String>,
}

/// `vault.*` (§6, §4.4).
///
/// `vault.onTokenRefresh` is not representable as literal config — it is a
/// behavior, not data — so it is wired as a [`crate::authz::TokenRefresher`]
/// trait object at [`crate::runtime::Runtime`] construction instead of
/// being deserialized here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct VaultConfig {
    /// Master secret HKDF-derives every per-authorization vault key from.
    /// Required when `auth.mode = orchestrated`.
    pub master_secret: Option<String>,
}

/// Default Skill Guard policy mode for newly created sessions (§4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyModeConfig {
    /// Deny anything outside the allowlist.
    Strict,
    /// Allow via a callback-mediated approval prompt; deny without one.
    Approval,
    /// Allow with a warning; no gating.
    Permissive,
}

impl Default for PolicyModeConfig {
    fn default() -> Self {
        Self::Strict
    }
}

/// `approval.*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ApprovalConfig {
    /// Policy mode new sessions start in, absent a more specific grant.
    pub default_policy_mode: PolicyModeConfig,
}

/// Stage-list overrides for [`crate::invoker::Plan::default_mcp_plan`] (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanOverrideConfig {
    /// Override for the `pre` stage list.
    pub pre: Option<Vec<String>>,
    /// Override for the `post` stage list.
    pub post: Option<Vec<String>>,
    /// Override for the `finalize` stage list.
    pub finalize: Option<Vec<String>>,
    /// Override for the `error` stage list.
    pub error: Option<Vec<String>>,
}

/// `invoker.*` (§6, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct InvokerConfig {
    /// Overrides applied on top of [`crate::invoker::Plan::default_mcp_plan`].
    pub default_plan: Option<PlanOverrideConfig>,
}

/// `transport.protocol.*` (§6, §4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// Accept plain single-shot JSON responses outside of SSE.
    pub json: bool,
    /// Tolerate pre-session-header legacy clients.
    pub legacy: bool,
    /// Reject requests missing the `Mcp-Session-Id` header once a session
    /// exists.
    pub strict_session: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            json: true,
            legacy: false,
            strict_session: true,
        }
    }
}

/// `transport.*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Wire protocol negotiation flags.
    pub protocol: ProtocolConfig,
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_round_trip_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.auth.mode, AuthMode::Public);
    }

    #[test]
    fn orchestrated_without_master_secret_is_rejected() {
        let yaml = "auth:\n  mode: orchestrated\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn orchestrated_with_master_secret_is_accepted() {
        let yaml = "auth:\n  mode: orchestrated\nvault:\n  masterSecret: shh\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn redis_backend_without_url_is_rejected() {
        let yaml = "storage:\n  backend: redis\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_var_expansion_resolves_from_process_environment() {
        // SAFETY: test-local env var, not read concurrently elsewhere in
        // this test binary's session-config tests.
        unsafe {
            std::env::set_var("MCP_RUNTIME_TEST_SECRET", "resolved-secret");
        }
        let mut config = Config {
            session: SessionConfig {
                signing_secret: Some("${MCP_RUNTIME_TEST_SECRET}".to_string()),
                ..SessionConfig::default()
            },
            ..Config::default()
        };
        config.expand_env_vars();
        assert_eq!(config.session.signing_secret.as_deref(), Some("resolved-secret"));
        unsafe {
            std::env::remove_var("MCP_RUNTIME_TEST_SECRET");
        }
    }

    #[test]
    fn load_env_files_sets_process_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "MCP_RUNTIME_TEST_KEY=hello").unwrap();

        let config = Config {
            env_files: vec![env_path.display().to_string()],
            ..Config::default()
        };
        config.load_env_files();
        assert_eq!(std::env::var("MCP_RUNTIME_TEST_KEY").as_deref(), Ok("hello"));
        unsafe {
            std::env::remove_var("MCP_RUNTIME_TEST_KEY");
        }
    }
}
