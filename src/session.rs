//! Session Store (C2)
//!
//! Persists, retrieves, validates, and expires [`SessionRecord`]s on top of
//! a [`Storage`] backend, HMAC-signing the serialized blob when a signing
//! secret is configured and rate-limiting reads with a token bucket
//! (grounded in the teacher's `governor`-based backend rate limiter,
//! `failsafe/rate_limiter.rs`, keyed instead of global).

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::storage::{SetOptions, Storage};
use crate::{Error, Result};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Client-declared `{ name, version }` supplied on `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client-reported name.
    pub name: String,
    /// Client-reported version string.
    pub version: String,
}

/// A persisted session: see §3 `SessionRecord`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    /// Opaque 128-bit identifier, stable for the session lifetime.
    pub id: String,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last successful read, epoch milliseconds.
    pub last_accessed_at: i64,
    /// Soft expiry; reads past this are rejected and the blob removed.
    pub expires_at: i64,
    /// Hard expiry the session can never be extended past.
    pub max_lifetime_at: i64,
    /// Authorization bound to this session (may be the anonymous sentinel).
    pub authorization_id: String,
    /// Client info from `initialize`.
    pub client_info: ClientInfo,
    /// Client-declared capabilities, opaque to the core.
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Scopes granted when no token is presented.
    #[serde(default)]
    pub anonymous_scopes: Vec<String>,
}

impl SessionRecord {
    /// Construct a new record with `ttl_ms` governing `expires_at` and
    /// `max_lifetime_ms` governing `max_lifetime_at`, both relative to now.
    #[must_use]
    pub fn new(
        id: String,
        authorization_id: String,
        client_info: ClientInfo,
        capabilities: serde_json::Value,
        anonymous_scopes: Vec<String>,
        ttl_ms: i64,
        max_lifetime_ms: i64,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + ttl_ms,
            max_lifetime_at: now + max_lifetime_ms,
            authorization_id,
            client_info,
            capabilities,
            anonymous_scopes,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at < now || self.max_lifetime_at < now
    }
}

/// Rate-limit configuration for session reads.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Window over which `max_requests` applies.
    pub window: Duration,
    /// Burst/request budget per window.
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_requests: 100,
        }
    }
}

/// Per-key token-bucket limiter for [`SessionStore::get`].
///
/// Key is `client_identifier.unwrap_or(session_id)` (binding Open Question
/// 3): this bounds how fast any single client can exhaust session reads,
/// but an attacker already holding one valid session id is rate-limited
/// independently per *other* session ids they hold — it does not prevent
/// id enumeration across many sessions, only per-key exhaustion.
pub struct RateLimiter {
    inner: GovernorRateLimiter<String, dashmap_clock::DashMapStateStore, governor::clock::DefaultClock>,
}

// governor's keyed state store needs a concrete map type; DashMap already
// implements the trait it needs via the `dashmap` feature re-export path,
// so we alias it here for readability.
mod dashmap_clock {
    pub type DashMapStateStore = governor::state::keyed::DefaultKeyedStateStore<String>;
}

impl RateLimiter {
    /// Build a limiter from `config`.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let per_request = config.window / config.max_requests.max(1);
        let quota = Quota::with_period(per_request)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
            .allow_burst(NonZeroU32::new(config.max_requests.max(1)).unwrap());
        Self {
            inner: GovernorRateLimiter::keyed(quota),
        }
    }

    /// Whether a read keyed by `key` is currently allowed.
    #[must_use]
    pub fn check(&self, key: &str) -> bool {
        self.inner.check_key(&key.to_string()).is_ok()
    }
}

fn session_key(prefix: &str, id: &str) -> String {
    format!("{prefix}{id}")
}

/// Session Store: see §4.2.
pub struct SessionStore {
    storage: Arc<dyn Storage>,
    key_prefix: String,
    signing_secret: Option<Vec<u8>>,
    default_ttl_ms: i64,
    rate_limiter: Option<RateLimiter>,
}

impl SessionStore {
    /// Construct a store over `storage`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        key_prefix: impl Into<String>,
        signing_secret: Option<Vec<u8>>,
        default_ttl_ms: i64,
        rate_limit: Option<RateLimitConfig>,
    ) -> Self {
        Self {
            storage,
            key_prefix: key_prefix.into(),
            signing_secret,
            default_ttl_ms,
            rate_limiter: rate_limit.map(RateLimiter::new),
        }
    }

    /// Return a fresh, cryptographically random 128-bit session id.
    #[must_use]
    pub fn alloc_id() -> String {
        crypto::random_uuid().simple().to_string()
    }

    fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.signing_secret.as_ref()?;
        let sig = crypto::hmac_sha256(secret, body).ok()?;
        let b64_body = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, body);
        Some(format!("{b64_body}.{}", hex::encode(sig)))
    }

    fn verify(&self, blob: &str) -> Option<Vec<u8>> {
        let Some(secret) = &self.signing_secret else {
            // Signing disabled: the blob is the raw JSON body.
            return Some(blob.as_bytes().to_vec());
        };
        let (b64_body, sig_hex) = blob.rsplit_once('.')?;
        let body = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64_body).ok()?;
        let expected = crypto::hmac_sha256(secret, &body).ok()?;
        let given = hex::decode(sig_hex).ok()?;
        if crypto::timing_safe_eq(&expected, &given) {
            Some(body)
        } else {
            None
        }
    }

    /// Persist `record`. `ttl_ms` overrides the store's default; the
    /// backend TTL is additionally bounded by `record.expires_at`.
    pub async fn create(&self, record: &SessionRecord, ttl_ms: Option<i64>) -> Result<()> {
        let body = serde_json::to_vec(record)?;
        let blob = self.sign(&body).unwrap_or_else(|| {
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &body)
        });
        let ttl_ms = ttl_ms.unwrap_or(self.default_ttl_ms);
        let bounded_ttl_ms = ttl_ms.min((record.expires_at - now_ms()).max(0));
        let key = session_key(&self.key_prefix, &record.id);
        self.storage
            .set(
                &key,
                blob.into_bytes(),
                SetOptions::with_ttl((bounded_ttl_ms / 1000).max(0) as u64),
            )
            .await
    }

    /// Load, verify, and validate a session; bumps `last_accessed_at` on
    /// success and re-extends the backend TTL bounded by `expires_at`
    /// (never past it — application-level expiry is authoritative).
    ///
    /// Returns `Err(Error::SessionIdEmpty)` for an empty id. Returns
    /// `Ok(None)` for: missing, tampered (blob deleted), expired (blob
    /// deleted), or rate-limited (logged) sessions.
    pub async fn get(
        &self,
        id: &str,
        client_identifier: Option<&str>,
    ) -> Result<Option<SessionRecord>> {
        if id.trim().is_empty() {
            return Err(Error::SessionIdEmpty);
        }

        if let Some(limiter) = &self.rate_limiter {
            let key = client_identifier.unwrap_or(id);
            if !limiter.check(key) {
                tracing::warn!(session_id = id, key, "session read rate-limited");
                return Ok(None);
            }
        }

        let key = session_key(&self.key_prefix, id);
        let Some(raw) = self.storage.get(&key).await? else {
            return Ok(None);
        };
        let blob = String::from_utf8_lossy(&raw).into_owned();

        let Some(body) = self.verify(&blob) else {
            tracing::warn!(session_id = id, "session signature verification failed, deleting");
            self.storage.delete(&key).await?;
            return Ok(None);
        };

        let mut record: SessionRecord = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!(session_id = id, "session schema validation failed, deleting");
                self.storage.delete(&key).await?;
                return Ok(None);
            }
        };

        let now = now_ms();
        if record.is_expired(now) {
            self.storage.delete(&key).await?;
            return Ok(None);
        }

        record.last_accessed_at = now;
        let remaining_ms = (record.expires_at - now).max(0);
        let body = serde_json::to_vec(&record)?;
        let blob = self.sign(&body).unwrap_or_else(|| {
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &body)
        });
        self.storage
            .set(
                &key,
                blob.into_bytes(),
                SetOptions::with_ttl((remaining_ms / 1000).max(0) as u64),
            )
            .await?;

        Ok(Some(record))
    }

    /// Idempotent remove.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let key = session_key(&self.key_prefix, id);
        self.storage.delete(&key).await?;
        Ok(())
    }

    /// Presence check; does not extend TTL or bump `last_accessed_at`.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let key = session_key(&self.key_prefix, id);
        self.storage.exists(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn test_record(id: &str) -> SessionRecord {
        SessionRecord::new(
            id.to_string(),
            "anon:".to_string() + id,
            ClientInfo {
                name: "test-client".to_string(),
                version: "1.0".to_string(),
            },
            serde_json::json!({}),
            vec!["anonymous".to_string()],
            3_600_000,
            86_400_000,
        )
    }

    fn store(signing_secret: Option<&str>) -> SessionStore {
        let storage = Arc::new(MemoryStorage::new());
        SessionStore::new(
            storage,
            "session:",
            signing_secret.map(|s| s.as_bytes().to_vec()),
            3_600_000,
            None,
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store(Some("secret"));
        let record = test_record("s1");
        store.create(&record, None).await.unwrap();
        let got = store.get("s1", None).await.unwrap().unwrap();
        assert_eq!(got.id, "s1");
    }

    #[tokio::test]
    async fn empty_id_fails_typed() {
        let store = store(None);
        let err = store.get("  ", None).await.unwrap_err();
        assert!(matches!(err, Error::SessionIdEmpty));
    }

    #[tokio::test]
    async fn tampered_blob_is_treated_as_absent_and_deleted() {
        let store = store(Some("secret"));
        let record = test_record("s1");
        store.create(&record, None).await.unwrap();

        // Tamper: overwrite with an unsigned, bogus blob.
        store
            .storage
            .set("session:s1", b"not-a-valid-blob".to_vec(), SetOptions::default())
            .await
            .unwrap();

        assert_eq!(store.get("s1", None).await.unwrap(), None);
        assert!(!store.exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn expired_session_is_absent_and_deleted() {
        let store = store(None);
        let mut record = test_record("s1");
        record.expires_at = now_ms() - 1;
        store.create(&record, Some(60_000)).await.unwrap();

        assert_eq!(store.get("s1", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_accessed_at_is_monotonic_across_reads() {
        let store = store(Some("secret"));
        let record = test_record("s1");
        store.create(&record, None).await.unwrap();

        let first = store.get("s1", None).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.get("s1", None).await.unwrap().unwrap();
        assert!(second.last_accessed_at >= first.last_accessed_at);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = store(None);
        let record = test_record("s1");
        store.create(&record, None).await.unwrap();
        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(!store.exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn rate_limit_blocks_excess_reads() {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(
            storage,
            "session:",
            None,
            3_600_000,
            Some(RateLimitConfig {
                window: Duration::from_secs(10),
                max_requests: 2,
            }),
        );
        let record = test_record("s1");
        store.create(&record, None).await.unwrap();

        assert!(store.get("s1", None).await.unwrap().is_some());
        assert!(store.get("s1", None).await.unwrap().is_some());
        assert_eq!(store.get("s1", None).await.unwrap(), None);
    }
}
