//! Token Vault (C4)
//!
//! Encrypted, per-`(authorizationId, providerId)` token storage with
//! refresh-friendly primitives. Every token is AES-256-GCM encrypted under
//! a key derived once per authorization via HKDF-SHA-256 from a master
//! secret (§4.4), grounded in the `aes-gcm`+`hkdf` pairing pulled in from
//! the broader example pack and in the teacher's `key_server::store`
//! dual-keyed storage shape (access/refresh as separate records).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, GCM_NONCE_LEN, GCM_TAG_LEN};
use crate::storage::{SetOptions, Storage};
use crate::{Error, Result};

const KEY_ID: &str = "tokens-v1";

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedBlob {
    iv: [u8; GCM_NONCE_LEN],
    ciphertext: Vec<u8>,
    tag: [u8; GCM_TAG_LEN],
    key_id: String,
}

fn derive_key(master_secret: &[u8], auth_id: &str) -> Result<Vec<u8>> {
    crypto::hkdf_sha256(master_secret, auth_id.as_bytes(), KEY_ID.as_bytes(), 32)
}

fn encrypt(key: &[u8], plaintext: &str) -> Result<EncryptedBlob> {
    let (iv, enc) = crypto::encrypt_aes_gcm(key, plaintext.as_bytes())?;
    Ok(EncryptedBlob {
        iv,
        ciphertext: enc.ciphertext,
        tag: enc.tag,
        key_id: KEY_ID.to_string(),
    })
}

fn decrypt(key: &[u8], blob: &EncryptedBlob) -> Result<String> {
    let plaintext = crypto::decrypt_aes_gcm(key, &blob.iv, &blob.ciphertext, &blob.tag)?;
    String::from_utf8(plaintext).map_err(|e| Error::Internal(format!("vault blob not utf8: {e}")))
}

fn access_key(auth_id: &str, provider_id: &str) -> String {
    format!("vault:{auth_id}:{provider_id}")
}

fn refresh_key(auth_id: &str, provider_id: &str) -> String {
    format!("vault:{auth_id}:{provider_id}:refresh")
}

fn index_key(auth_id: &str) -> String {
    format!("vault:{auth_id}:providers")
}

/// A freshly stored or refreshed token pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    /// The access token.
    pub access_token: String,
    /// The refresh token, if the provider issued one.
    pub refresh_token: Option<String>,
    /// Absolute expiry for the access token, epoch milliseconds.
    pub expires_at: Option<i64>,
}

/// Encrypted per-authorization per-provider token store.
pub struct TokenVault {
    storage: Arc<dyn Storage>,
    master_secret: Vec<u8>,
}

impl TokenVault {
    /// Construct a vault over `storage`, keyed by `master_secret`
    /// (supplied at startup via config/environment; rotation is out of
    /// scope per §4.4).
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, master_secret: Vec<u8>) -> Self {
        Self {
            storage,
            master_secret,
        }
    }

    async fn add_to_index(&self, auth_id: &str, provider_id: &str) -> Result<()> {
        let key = index_key(auth_id);
        let mut ids = self.read_index(auth_id).await?;
        if !ids.iter().any(|p| p == provider_id) {
            ids.push(provider_id.to_string());
            self.storage
                .set(&key, serde_json::to_vec(&ids)?, SetOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn remove_from_index(&self, auth_id: &str, provider_id: &str) -> Result<()> {
        let key = index_key(auth_id);
        let mut ids = self.read_index(auth_id).await?;
        ids.retain(|p| p != provider_id);
        if ids.is_empty() {
            self.storage.delete(&key).await?;
        } else {
            self.storage
                .set(&key, serde_json::to_vec(&ids)?, SetOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn read_index(&self, auth_id: &str) -> Result<Vec<String>> {
        let key = index_key(auth_id);
        match self.storage.get(&key).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Encrypt and store an access token (and optional refresh token) for
    /// `(auth_id, provider_id)`. TTL on the access-token record equals
    /// `expires_at - now` when `expires_at` is present.
    pub async fn store_tokens(
        &self,
        auth_id: &str,
        provider_id: &str,
        tokens: &TokenPair,
    ) -> Result<()> {
        let key = derive_key(&self.master_secret, auth_id)?;
        let blob = encrypt(&key, &tokens.access_token)?;
        let mut opts = SetOptions::default();
        if let Some(expires_at) = tokens.expires_at {
            let ttl_seconds = ((expires_at - now_ms()).max(0) / 1000) as u64;
            opts.ttl_seconds = Some(ttl_seconds);
        }
        self.storage
            .set(&access_key(auth_id, provider_id), serde_json::to_vec(&blob)?, opts)
            .await?;

        if let Some(refresh_token) = &tokens.refresh_token {
            let refresh_blob = encrypt(&key, refresh_token)?;
            self.storage
                .set(
                    &refresh_key(auth_id, provider_id),
                    serde_json::to_vec(&refresh_blob)?,
                    SetOptions::default(),
                )
                .await?;
        }

        self.add_to_index(auth_id, provider_id).await
    }

    /// Store only a refresh token, for a provider whose access token was
    /// already deleted (§4.4 step 4) but whose refresh token still moves.
    async fn store_refresh_only(&self, auth_id: &str, provider_id: &str, refresh_token: &str) -> Result<()> {
        let key = derive_key(&self.master_secret, auth_id)?;
        let blob = encrypt(&key, refresh_token)?;
        self.storage
            .set(&refresh_key(auth_id, provider_id), serde_json::to_vec(&blob)?, SetOptions::default())
            .await?;
        self.add_to_index(auth_id, provider_id).await
    }

    async fn get_decrypted(&self, auth_id: &str, storage_key: &str) -> Result<Option<String>> {
        let Some(raw) = self.storage.get(storage_key).await? else {
            return Ok(None);
        };
        let blob: EncryptedBlob = match serde_json::from_slice(&raw) {
            Ok(b) => b,
            Err(_) => {
                self.storage.delete(storage_key).await?;
                return Ok(None);
            }
        };
        let key = derive_key(&self.master_secret, auth_id)?;
        match decrypt(&key, &blob) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(_) => {
                // Tag mismatch is treated as corruption (§7 "Crypto"):
                // delete the offending blob and report absence.
                self.storage.delete(storage_key).await?;
                Ok(None)
            }
        }
    }

    /// Decrypt and return the access token, or `None` if absent/corrupt
    /// (corrupt blobs are deleted as a side effect).
    pub async fn get_access_token(&self, auth_id: &str, provider_id: &str) -> Result<Option<String>> {
        self.get_decrypted(auth_id, &access_key(auth_id, provider_id)).await
    }

    /// Decrypt and return the refresh token, or `None` if absent/corrupt.
    pub async fn get_refresh_token(&self, auth_id: &str, provider_id: &str) -> Result<Option<String>> {
        self.get_decrypted(auth_id, &refresh_key(auth_id, provider_id)).await
    }

    /// Whether any record exists for `(auth_id, provider_id)`.
    pub async fn has_tokens(&self, auth_id: &str, provider_id: &str) -> Result<bool> {
        Ok(self.storage.exists(&access_key(auth_id, provider_id)).await?
            || self.storage.exists(&refresh_key(auth_id, provider_id)).await?)
    }

    /// Remove only the access-token record, leaving any refresh token
    /// intact. Used on refresh failure (§4.4 step 4): the access token is
    /// no longer trustworthy but the refresh token may still work on a
    /// later attempt.
    pub async fn delete_access_token(&self, auth_id: &str, provider_id: &str) -> Result<()> {
        self.storage.delete(&access_key(auth_id, provider_id)).await?;
        Ok(())
    }

    /// Remove both the access and refresh records for `(auth_id, provider_id)`.
    pub async fn delete_tokens(&self, auth_id: &str, provider_id: &str) -> Result<()> {
        self.storage.delete(&access_key(auth_id, provider_id)).await?;
        self.storage.delete(&refresh_key(auth_id, provider_id)).await?;
        self.remove_from_index(auth_id, provider_id).await
    }

    /// List every provider id with a stored record under `auth_id`.
    pub async fn get_provider_ids(&self, auth_id: &str) -> Result<Vec<String>> {
        self.read_index(auth_id).await
    }

    /// Move every `(from_auth_id, *)` record to `(to_auth_id, *)`.
    ///
    /// Each provider's tokens are decrypted under the source's derived key
    /// and re-encrypted under the destination's (the derivation salt is
    /// the authorization id, so a raw copy would be undecryptable).
    /// Migration proceeds per-provider; if the backend lacks multi-key
    /// transactions, a retry after partial failure is safe — already
    /// migrated providers are absent from `from`'s index and are skipped.
    pub async fn migrate_tokens(&self, from_auth_id: &str, to_auth_id: &str) -> Result<()> {
        let provider_ids = self.read_index(from_auth_id).await?;
        for provider_id in provider_ids {
            let access = self.get_access_token(from_auth_id, &provider_id).await?;
            let refresh = self.get_refresh_token(from_auth_id, &provider_id).await?;
            let expires_at_ttl = self.storage.ttl(&access_key(from_auth_id, &provider_id)).await?;

            if let Some(access_token) = access {
                let expires_at = expires_at_ttl.map(|s| now_ms() + i64::try_from(s).unwrap_or(0) * 1000);
                self.store_tokens(
                    to_auth_id,
                    &provider_id,
                    &TokenPair {
                        access_token,
                        refresh_token: refresh,
                        expires_at,
                    },
                )
                .await?;
            } else if let Some(refresh_token) = &refresh {
                // Access token was already deleted (refresh failure path);
                // the refresh token still has to move or it's lost.
                self.store_refresh_only(to_auth_id, &provider_id, refresh_token).await?;
            }

            self.delete_tokens(from_auth_id, &provider_id).await?;
        }
        Ok(())
    }
}
