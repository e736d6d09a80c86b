//! Token-derived symmetric encryption for chat payloads.
//!
//! The session token doubles as the pre-shared secret: both participants hash it to the
//! same AES-256-GCM key, so the relay (which routes on the token but never sees channel
//! traffic) is the only party that has to be trusted with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("secure random source unavailable")]
    CryptoUnavailable,
    #[error("invalid encrypted payload: {0}")]
    InvalidPayload(String),
    #[error("payload failed authentication")]
    AuthenticationFailed,
}

/// AES-256-GCM key derived from a session token.
#[derive(Clone)]
pub struct SessionKey {
    bytes: [u8; 32],
}

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.bytes)
            .map_err(|err| CryptoError::InvalidPayload(format!("invalid key: {err}")))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

static KEY_CACHE: Lazy<Mutex<HashMap<String, Arc<SessionKey>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn secure_random_available() -> bool {
    let mut probe = [0u8; 1];
    OsRng.try_fill_bytes(&mut probe).is_ok()
}

/// Hashes the token with SHA-256 and imports the digest as the session key.
///
/// Identical tokens always yield identical keys.
pub fn derive_key(token: &str) -> Result<SessionKey, CryptoError> {
    if !secure_random_available() {
        return Err(CryptoError::CryptoUnavailable);
    }
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Ok(SessionKey { bytes })
}

/// Same as [`derive_key`] but memoized per token.
pub fn cached_key(token: &str) -> Result<Arc<SessionKey>, CryptoError> {
    if let Some(key) = KEY_CACHE.lock().get(token) {
        return Ok(Arc::clone(key));
    }
    let key = Arc::new(derive_key(token)?);
    KEY_CACHE
        .lock()
        .insert(token.to_string(), Arc::clone(&key));
    Ok(key)
}

pub fn forget_key(token: &str) {
    KEY_CACHE.lock().remove(token);
}

/// Encrypts `plaintext` and returns base64(nonce ‖ ciphertext ‖ tag).
pub fn encrypt(key: &SessionKey, plaintext: &str) -> Result<String, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|_| CryptoError::CryptoUnavailable)?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = key
        .cipher()?
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::CryptoUnavailable)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64_STANDARD.encode(out))
}

pub fn decrypt(key: &SessionKey, payload: &str) -> Result<String, CryptoError> {
    let data = BASE64_STANDARD
        .decode(payload.as_bytes())
        .map_err(|err| CryptoError::InvalidPayload(format!("invalid encoding: {err}")))?;
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidPayload(format!(
            "payload of {} bytes is shorter than nonce and tag",
            data.len()
        )));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let plaintext = key
        .cipher()?
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    String::from_utf8(plaintext)
        .map_err(|err| CryptoError::InvalidPayload(format!("plaintext is not utf-8: {err}")))
}

/// Integrity digest over the message identity and its plaintext content.
pub fn hash(session_id: &str, participant_id: &str, message_id: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b":");
    hasher.update(participant_id.as_bytes());
    hasher.update(b":");
    hasher.update(message_id.as_bytes());
    hasher.update(b":");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a random UUIDv4 drawn from the OS source.
///
/// When no secure source is available the id degrades to `fallback-<millis>-<counter>-<random>`,
/// with the random part from a generator seeded by the clock and the counter.
/// Those ids are unique within the process but predictable; they are only ever used as
/// de-duplication keys, never as key material.
pub fn new_message_id() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string(),
        Err(err) => {
            tracing::warn!(
                target = "cove::crypto",
                error = %err,
                "secure random unavailable; using non-cryptographic message id"
            );
            fallback_message_id()
        }
    }
}

fn fallback_message_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = (now.as_nanos() as u64) ^ counter.rotate_left(32);
    let random = StdRng::seed_from_u64(seed).next_u64();
    format!("fallback-{:x}-{:x}-{random:016x}", now.as_millis(), counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_tokens_derive_identical_keys() {
        let a = derive_key("river-otter-42").unwrap();
        let b = derive_key("river-otter-42").unwrap();
        let c = derive_key("river-otter-43").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn round_trip_across_independently_derived_keys() {
        let sender = derive_key("token-abc").unwrap();
        let receiver = derive_key("token-abc").unwrap();
        let long = "x".repeat(4096);
        for plaintext in ["", "hi", "ünïcødé ✓", long.as_str()] {
            let sealed = encrypt(&sender, plaintext).unwrap();
            assert_eq!(decrypt(&receiver, &sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let key = derive_key("token-abc").unwrap();
        let first = encrypt(&key, "same").unwrap();
        let second = encrypt(&key, "same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampering_any_byte_fails_authentication() {
        let key = derive_key("token-abc").unwrap();
        let sealed = BASE64_STANDARD.decode(encrypt(&key, "hello there").unwrap()).unwrap();
        for index in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0x01;
            let err = decrypt(&key, &BASE64_STANDARD.encode(&tampered)).unwrap_err();
            assert_eq!(err, CryptoError::AuthenticationFailed, "byte {index}");
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = encrypt(&derive_key("a").unwrap(), "secret").unwrap();
        let err = decrypt(&derive_key("b").unwrap(), &sealed).unwrap_err();
        assert_eq!(err, CryptoError::AuthenticationFailed);
    }

    #[test]
    fn short_or_malformed_payloads_are_invalid() {
        let key = derive_key("token").unwrap();
        let short = BASE64_STANDARD.encode([0u8; NONCE_LEN + TAG_LEN - 1]);
        assert!(matches!(
            decrypt(&key, &short),
            Err(CryptoError::InvalidPayload(_))
        ));
        assert!(matches!(
            decrypt(&key, "not base64 at all!"),
            Err(CryptoError::InvalidPayload(_))
        ));
    }

    #[test]
    fn hash_covers_every_component() {
        let base = hash("s", "p", "m", "content");
        assert_eq!(base, hash("s", "p", "m", "content"));
        assert_ne!(base, hash("s2", "p", "m", "content"));
        assert_ne!(base, hash("s", "p2", "m", "content"));
        assert_ne!(base, hash("s", "p", "m2", "content"));
        assert_ne!(base, hash("s", "p", "m", "content2"));
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn message_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..256).map(|_| new_message_id()).collect();
        assert_eq!(ids.len(), 256);
        let fallback: std::collections::HashSet<_> =
            (0..256).map(|_| fallback_message_id()).collect();
        assert_eq!(fallback.len(), 256);
    }

    #[test]
    fn fallback_ids_carry_time_counter_and_random_parts() {
        let id = fallback_message_id();
        let parts: Vec<_> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "fallback");
        assert!(u64::from_str_radix(parts[1], 16).is_ok());
        assert!(u64::from_str_radix(parts[2], 16).is_ok());
        assert_eq!(parts[3].len(), 16);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cached_key_matches_derived_key() {
        let cached = cached_key("cache-me").unwrap();
        let again = cached_key("cache-me").unwrap();
        assert!(Arc::ptr_eq(&cached, &again));
        assert_eq!(cached.as_bytes(), derive_key("cache-me").unwrap().as_bytes());
        forget_key("cache-me");
    }
}
