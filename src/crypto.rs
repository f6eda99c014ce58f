//! Crypto primitives (C9)
//!
//! A small, runtime-detected-free provider over well-known primitives:
//! UUID generation, HKDF-SHA-256 key derivation, HMAC-SHA-256 signing,
//! AES-256-GCM encryption, SHA-256 hashing, and constant-time comparison.
//!
//! Every backend here is pure-Rust (`aws_lc`/`ring` are not pulled in), so
//! there is exactly one implementation per primitive — the "byte-identical
//! across backends" invariant from the spec holds trivially.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Length in bytes of an AES-GCM nonce (96 bits, per NIST SP 800-38D).
pub const GCM_NONCE_LEN: usize = 12;
/// Length in bytes of an AES-GCM authentication tag.
pub const GCM_TAG_LEN: usize = 16;
/// Length in bytes of a derived AES-256 key.
pub const KEY_LEN: usize = 32;

/// Generate a fresh random UUID (v4), used for session ids, approval ids.
#[must_use]
pub fn random_uuid() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

/// Fill a buffer with cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// SHA-256 digest of `data`, returned as raw bytes.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 digest of `data`, returned as a lowercase hex string.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA-256 over `data` keyed by `key`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if `key` cannot be used to initialize HMAC
/// (HMAC accepts any key length, so this only happens under allocation
/// failure conditions and is included for API symmetry with the other
/// primitives).
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac: HmacSha256 =
        Mac::new_from_slice(key).map_err(|e| Error::Internal(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Derive `length` bytes via HKDF-SHA-256(`ikm`, `salt`, `info`).
///
/// # Errors
///
/// Returns [`Error::Internal`] if `length` exceeds HKDF's maximum output
/// (255 * 32 bytes for SHA-256), which none of this crate's callers ever
/// request.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|e| Error::Internal(format!("hkdf expand: {e}")))?;
    Ok(okm)
}

/// An AES-256-GCM ciphertext with its tag split out for storage alongside
/// the IV, matching the `{iv, ciphertext, tag, keyId}` blob shape in §4.4.
#[derive(Debug, Clone)]
pub struct GcmCiphertext {
    /// Ciphertext bytes (same length as the plaintext).
    pub ciphertext: Vec<u8>,
    /// 16-byte authentication tag.
    pub tag: [u8; GCM_TAG_LEN],
}

/// Encrypt `plaintext` under `key` (32 bytes) with a fresh random 12-byte
/// IV, returning the IV alongside the ciphertext/tag split.
///
/// # Errors
///
/// Returns [`Error::Internal`] if `key` is not exactly 32 bytes.
pub fn encrypt_aes_gcm(key: &[u8], plaintext: &[u8]) -> Result<([u8; GCM_NONCE_LEN], GcmCiphertext)> {
    let key = Key::<Aes256Gcm>::from_slice(check_key_len(key)?);
    let cipher = Aes256Gcm::new(key);
    let mut iv = [0u8; GCM_NONCE_LEN];
    rand::rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let mut out = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|e| Error::Internal(format!("aes-gcm encrypt: {e}")))?;
    let tag_start = out.len() - GCM_TAG_LEN;
    let tag_bytes = out.split_off(tag_start);
    let mut tag = [0u8; GCM_TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    Ok((iv, GcmCiphertext { ciphertext: out, tag }))
}

/// Decrypt an AES-256-GCM blob. Returns `Err` on tag mismatch (treated by
/// callers as corruption — see §4.4/§7 "Crypto" error kind).
///
/// # Errors
///
/// Returns [`Error::Internal`] if `key` is not 32 bytes, or
/// [`Error::CryptoTagMismatch`] if authentication fails.
pub fn decrypt_aes_gcm(
    key: &[u8],
    iv: &[u8; GCM_NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; GCM_TAG_LEN],
) -> Result<Vec<u8>> {
    let key = Key::<Aes256Gcm>::from_slice(check_key_len(key)?);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(iv);

    let mut combined = Vec::with_capacity(ciphertext.len() + GCM_TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(nonce, Payload { msg: &combined, aad: &[] })
        .map_err(|_| Error::CryptoTagMismatch)
}

fn check_key_len(key: &[u8]) -> Result<&[u8]> {
    if key.len() != KEY_LEN {
        return Err(Error::Internal(format!(
            "expected a {KEY_LEN}-byte key, got {}",
            key.len()
        )));
    }
    Ok(key)
}

/// Constant-time byte comparison. Used for signature/tag verification so
/// that timing does not leak how many leading bytes matched.
#[must_use]
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
