//! # Encryption engine (C2)
//!
//! Wraps every WAL frame and on-disk page with one of three algorithms,
//! selected by `EncryptionType` in `EngineConfig`:
//!
//! - [`Cipher::None`] — identity, used when encryption is disabled.
//! - [`Cipher::Xor`] — a cyclically-repeated key XORed across the data.
//!   Not authenticated; a cheap obfuscation fast path only.
//! - [`Cipher::Aes256Gcm`] — authenticated encryption. Frame layout is
//!   `IV(12) || ciphertext || tag(16)`.
//!
//! The WAL and B+-tree page codec both call through this crate so that a
//! single key schedule and a single IV counter back every encrypted frame in
//! the engine.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of SHA-256 rounds applied when deriving an AES-256 key from a
/// passphrase (§4.2).
const KEY_DERIVATION_ROUNDS: u32 = 10_000;
/// Constant salt mixed into the passphrase before the first round. Fixed so
/// that reopening the same database with the same passphrase re-derives the
/// same key; this is obfuscation against casual inspection, not a defense
/// against offline brute force (no per-database random salt is persisted).
const CONST_SALT: &[u8] = b"riptide-core-static-salt-v1";
/// XOR key expansion length in bytes (§4.2).
const XOR_KEY_LEN: usize = 512;

/// Errors surfaced by [`Cipher::encrypt`]/[`Cipher::decrypt`].
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AES-GCM tag verification failed — the data was tampered with or the
    /// wrong key was used.
    #[error("authentication failed")]
    AuthError,
    /// Input too short to contain a valid frame for this cipher.
    #[error("input too short for this cipher's frame format")]
    ShortInput,
    /// A keyed cipher was used without a key.
    #[error("cipher requires a key but none was configured")]
    NotInitialized,
}

/// Which algorithm `EngineConfig::encryption_type` selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    None,
    Xor,
    Aes256,
}

/// A frame-level encryption engine. One instance is owned by the engine and
/// shared by the WAL writer/reader and the B+-tree page codec.
pub enum Cipher {
    None,
    Xor {
        expanded_key: Box<[u8; XOR_KEY_LEN]>,
    },
    Aes256Gcm {
        cipher: Box<Aes256Gcm>,
        /// Monotonic counter forming the low 32 bits of every IV. Must be
        /// persisted (e.g. in the manifest) and restored on reopen so IVs
        /// never repeat across process restarts with the same clock.
        counter: AtomicU32,
    },
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cipher::None => write!(f, "Cipher::None"),
            Cipher::Xor { .. } => write!(f, "Cipher::Xor"),
            Cipher::Aes256Gcm { .. } => write!(f, "Cipher::Aes256Gcm"),
        }
    }
}

impl Cipher {
    /// Constructs the identity cipher.
    #[must_use]
    pub fn none() -> Self {
        Cipher::None
    }

    /// Constructs the XOR obfuscator from a raw key, cyclically expanded to
    /// 512 bytes once up front.
    #[must_use]
    pub fn xor(key: &[u8]) -> Self {
        let mut expanded = Box::new([0u8; XOR_KEY_LEN]);
        if !key.is_empty() {
            for (i, b) in expanded.iter_mut().enumerate() {
                *b = key[i % key.len()];
            }
        }
        Cipher::Xor {
            expanded_key: expanded,
        }
    }

    /// Constructs AES-256-GCM, deriving the key from `passphrase` via
    /// §4.2's iterated SHA-256 scheme. `initial_counter` should be restored
    /// from persisted state (the manifest) when reopening a database; use
    /// `0` for a freshly created one.
    #[must_use]
    pub fn aes256(passphrase: &str, initial_counter: u32) -> Self {
        let key_bytes = derive_key(passphrase);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Cipher::Aes256Gcm {
            cipher: Box::new(Aes256Gcm::new(key)),
            counter: AtomicU32::new(initial_counter),
        }
    }

    /// Returns the next IV counter value that will be consumed by
    /// `encrypt`, for persistence alongside the WAL head. Returns `0` for
    /// ciphers that do not track a counter.
    #[must_use]
    pub fn counter(&self) -> u32 {
        match self {
            Cipher::Aes256Gcm { counter, .. } => counter.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Encrypts `plaintext` into a self-contained frame.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Cipher::None => Ok(plaintext.to_vec()),
            Cipher::Xor { expanded_key } => Ok(xor_with(plaintext, expanded_key)),
            Cipher::Aes256Gcm { cipher, counter } => {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                let iv = build_iv(count);
                let nonce = Nonce::from_slice(&iv);
                let ciphertext = cipher
                    .encrypt(nonce, plaintext)
                    .map_err(|_| CryptoError::AuthError)?;
                let mut out = Vec::with_capacity(iv.len() + ciphertext.len());
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    /// Decrypts a frame produced by `encrypt`.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Cipher::None => Ok(frame.to_vec()),
            Cipher::Xor { expanded_key } => Ok(xor_with(frame, expanded_key)),
            Cipher::Aes256Gcm { cipher, .. } => {
                if frame.len() < 12 + 16 {
                    return Err(CryptoError::ShortInput);
                }
                let (iv, ciphertext) = frame.split_at(12);
                let nonce = Nonce::from_slice(iv);
                cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| CryptoError::AuthError)
            }
        }
    }
}

fn xor_with(data: &[u8], key: &[u8; XOR_KEY_LEN]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % XOR_KEY_LEN])
        .collect()
}

fn build_iv(counter: u32) -> [u8; 12] {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut iv = [0u8; 12];
    iv[0..8].copy_from_slice(&timestamp_ms.to_le_bytes());
    iv[8..12].copy_from_slice(&counter.to_le_bytes());
    iv
}

fn derive_key(passphrase: &str) -> [u8; 32] {
    let mut digest: [u8; 32] = {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        hasher.update(CONST_SALT);
        hasher.finalize().into()
    };
    for _ in 1..KEY_DERIVATION_ROUNDS {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        digest = hasher.finalize().into();
    }
    digest
}

#[cfg(test)]
mod tests;
