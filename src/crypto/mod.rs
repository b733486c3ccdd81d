//! Crypto module
//!
//! AEAD encryption service with Additional Authenticated Data, the
//! aggregate key store, and the keyring manager that resolves keys for
//! events and issues keyring-update envelopes.

pub mod keyring;
pub mod keystore;

pub use keyring::KeyringManager;
pub use keystore::{KeyStore, SqliteKeyStore, StoredKey};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// AEAD nonce length (prepended to every ciphertext frame)
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length
pub const TAG_LEN: usize = 16;

/// Smallest possible frame: nonce + tag around an empty plaintext
pub const MIN_FRAME_LEN: usize = NONCE_LEN + TAG_LEN;

/// Largest payload accepted in either direction
pub const MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

/// A 256-bit symmetric key. Debug output never shows key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short identifier safe for logs: first 8 hex chars of SHA-256(key).
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hex::encode(hasher.finalize())[..8].to_string()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey({})", self.fingerprint())
    }
}

/// Errors from the crypto subsystem
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// No aggregate key available for decryption
    #[error("No key available for aggregate {aggregate_id}")]
    MissingKey { aggregate_id: String },

    /// Ciphertext failed AEAD authentication (wrong key or wrong AAD)
    #[error("AEAD authentication failed")]
    AeadAuthenticationFailed,

    /// Frame too short to contain nonce + tag
    #[error("Ciphertext too short: {len} bytes (AEAD overhead is {} bytes)", MIN_FRAME_LEN)]
    TooShort { len: usize },

    /// Payload exceeds the configured maximum size
    #[error("Payload exceeds maximum size: {len} bytes (limit {})", MAX_PAYLOAD_LEN)]
    ExceedsMaxSize { len: usize },

    /// Malformed key material
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Key store failure
    #[error("Key store failure: {0}")]
    Store(String),
}

impl CryptoError {
    /// True when a purge-and-rebuild recovery is appropriate
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, CryptoError::AeadAuthenticationFailed)
    }
}

/// AEAD encrypt/decrypt with Additional Authenticated Data.
///
/// The AAD string must be byte-identical on both sides; the builders in
/// `codec::aad` are the only source of those strings.
pub trait CryptoService: Send + Sync {
    fn generate_key(&self) -> SecretKey;

    fn encrypt(&self, plaintext: &[u8], key: &SecretKey, aad: &str) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8], key: &SecretKey, aad: &str)
        -> Result<Vec<u8>, CryptoError>;
}

/// ChaCha20-Poly1305 implementation of [`CryptoService`].
///
/// Frame layout: `nonce (12) || ciphertext+tag`.
#[derive(Debug, Default, Clone)]
pub struct ChaChaBoxCrypto;

impl ChaChaBoxCrypto {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoService for ChaChaBoxCrypto {
    fn generate_key(&self) -> SecretKey {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        SecretKey(bytes)
    }

    fn encrypt(&self, plaintext: &[u8], key: &SecretKey, aad: &str) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_PAYLOAD_LEN {
            return Err(CryptoError::ExceedsMaxSize {
                len: plaintext.len(),
            });
        }

        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::AeadAuthenticationFailed)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        key: &SecretKey,
        aad: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < MIN_FRAME_LEN {
            return Err(CryptoError::TooShort {
                len: ciphertext.len(),
            });
        }
        if ciphertext.len() > MAX_PAYLOAD_LEN + MIN_FRAME_LEN {
            return Err(CryptoError::ExceedsMaxSize {
                len: ciphertext.len(),
            });
        }

        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::AeadAuthenticationFailed)
    }
}
