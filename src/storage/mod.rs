//! Storage Adapter (C1)
//!
//! A uniform key/value contract that the Session Store, Token Vault, and
//! Approval Store all sit on top of. Two backends ship here: an in-process
//! map with a TTL wheel ([`memory::MemoryStorage`]) and a Redis-compatible
//! REST backend ([`redis::RedisStorage`]). Both implement [`Storage`].

mod memory;
mod redis;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{Error, Result};

/// A channel subscription returned by [`Storage::subscribe`]; yields each
/// message published after the subscription was created.
pub type Subscription = broadcast::Receiver<Vec<u8>>;

/// Options accepted by [`Storage::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Expire the key after this many seconds.
    pub ttl_seconds: Option<u64>,
    /// Only set if the key does not already exist (`NX`).
    pub if_not_exists: bool,
    /// Only set if the key already exists (`XX`).
    pub if_exists: bool,
}

impl SetOptions {
    /// Plain set with a TTL and no conditional semantics.
    #[must_use]
    pub fn with_ttl(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds: Some(ttl_seconds),
            ..Self::default()
        }
    }
}

/// The uniform data-plane contract described in §4.1.
///
/// `get` returning `Ok(None)` is not an error. Any network/transport
/// failure surfaces as [`crate::Error::StorageConnection`]. All operations
/// are idempotent on retry except `incr`/`decr`/`incr_by`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the raw bytes stored at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Fetch `key` and, in the same round trip where the backend supports
    /// it, extend its TTL to `ttl_seconds`. Backends without an atomic
    /// get-and-extend-ttl primitive MUST fall back to a non-atomic
    /// get + expire and log that the fallback occurred (§4.1).
    async fn get_and_extend_ttl(&self, key: &str, ttl_seconds: u64) -> Result<Option<Vec<u8>>> {
        let value = self.get(key).await?;
        if value.is_some() {
            tracing::debug!(key, ttl_seconds, "get_and_extend_ttl: non-atomic fallback");
            self.expire(key, ttl_seconds).await?;
        }
        Ok(value)
    }

    /// Store `value` at `key` under `opts`.
    async fn set(&self, key: &str, value: Vec<u8>, opts: SetOptions) -> Result<()>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether `key` is currently present (and unexpired).
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Set (or replace) the TTL on an existing key. Returns whether the key
    /// existed.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool>;

    /// Remaining seconds-to-live for `key`, or `None` if it has no TTL or
    /// does not exist.
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    /// Atomically add `amount` to the integer stored at `key` (treating a
    /// missing key as `0`) and return the new value.
    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64>;

    /// Increment `key` by 1.
    async fn incr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, 1).await
    }

    /// Decrement `key` by 1.
    async fn decr(&self, key: &str) -> Result<i64> {
        self.incr_by(key, -1).await
    }

    /// Fetch several keys in one call.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Delete several keys in one call, returning how many existed.
    async fn mdelete(&self, keys: &[String]) -> Result<u64> {
        let mut count = 0;
        for key in keys {
            if self.delete(key).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Lazily enumerate keys matching a glob-style `pattern` (only `*` is
    /// interpreted as a wildcard; all other characters are literal).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Publish `message` to `channel`, returning the number of current
    /// subscribers. The default implementation treats pub/sub as
    /// unsupported and always reports zero subscribers.
    async fn publish(&self, _channel: &str, _message: Vec<u8>) -> Result<u64> {
        Ok(0)
    }

    /// Subscribe to `channel`. The default implementation treats pub/sub as
    /// unsupported; only backends with a native publish/subscribe
    /// primitive override it.
    async fn subscribe(&self, _channel: &str) -> Result<Subscription> {
        Err(Error::Unsupported("pub/sub"))
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut parts = pattern.split('*').peekable();
    let Some(first) = parts.next() else {
        return candidate.is_empty();
    };
    if !candidate.starts_with(first) {
        return false;
    }
    let mut rest = &candidate[first.len()..];
    while let Some(part) = parts.next() {
        if part.is_empty() {
            if parts.peek().is_none() {
                return true;
            }
            continue;
        }
        if let Some(idx) = rest.find(part) {
            rest = &rest[idx + part.len()..];
        } else {
            return false;
        }
    }
    rest.is_empty() || pattern.ends_with('*')
}

#[cfg(test)]
mod glob_tests {
    use super::glob_match;

    #[test]
    fn exact_match() {
        assert!(glob_match("session:abc", "session:abc"));
        assert!(!glob_match("session:abc", "session:abcd"));
    }

    #[test]
    fn wildcard_suffix() {
        assert!(glob_match("session:*", "session:abc"));
        assert!(!glob_match("session:*", "vault:abc"));
    }

    #[test]
    fn wildcard_middle() {
        assert!(glob_match("vault:*:github", "vault:auth1:github"));
        assert!(!glob_match("vault:*:github", "vault:auth1:slack"));
    }
}
