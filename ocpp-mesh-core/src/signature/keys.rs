//! Key handles and the key lookup capability
//!
//! The policy engine never holds key material. It asks a [`KeyProvider`] for
//! candidate keys, public keys and signatures; the provider may be local
//! memory, an HSM or a remote signing service.

use std::collections::HashMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, VerifyingKey};
use futures_util::future::{self, BoxFuture};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use super::engine::SignatureError;
use super::policy::Direction;

/// Algorithm tag for Ed25519 signatures
pub const ED25519: &str = "ed25519";

/// Identifier of a signing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Reference to a key the provider can sign with
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SigningKey {
    pub key_id: KeyId,
    pub algorithm: String,
}

impl SigningKey {
    pub fn ed25519(key_id: impl Into<KeyId>) -> Self {
        Self {
            key_id: key_id.into(),
            algorithm: ED25519.to_string(),
        }
    }
}

/// What is about to be signed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningContext<'a> {
    pub action: &'a str,
    pub direction: Direction,
}

/// Key lookup and signing capability
pub trait KeyProvider: Send + Sync {
    /// Keys to sign with when the policy entry names none
    fn keys_for(&self, context: &SigningContext<'_>) -> Vec<SigningKey>;

    /// Public half of `key_id`, if known
    fn public_key_for(&self, key_id: &KeyId) -> Option<VerifyingKey>;

    /// Sign `message` with `key`
    fn sign<'a>(
        &'a self,
        key: &'a SigningKey,
        message: &'a [u8],
    ) -> BoxFuture<'a, Result<ed25519_dalek::Signature, SignatureError>>;
}

/// Ed25519 keys held in process memory
///
/// Secret keys are offered for every signing context; public keys of peers
/// can be added without the matching secret.
#[derive(Default)]
pub struct InMemoryKeyStore {
    secrets: RwLock<HashMap<KeyId, ed25519_dalek::SigningKey>>,
    public: RwLock<HashMap<KeyId, VerifyingKey>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh key pair under `key_id`
    pub fn generate(&self, key_id: impl Into<KeyId>) -> VerifyingKey {
        let secret = ed25519_dalek::SigningKey::generate(&mut OsRng);
        self.insert_secret(key_id.into(), secret)
    }

    /// Derive a key pair from a 32-byte seed
    pub fn insert_seed(&self, key_id: impl Into<KeyId>, seed: &[u8; 32]) -> VerifyingKey {
        self.insert_secret(key_id.into(), ed25519_dalek::SigningKey::from_bytes(seed))
    }

    /// Derive a key pair from a base64 encoded 32-byte seed
    pub fn insert_seed_base64(
        &self,
        key_id: impl Into<KeyId>,
        seed_b64: &str,
    ) -> Result<VerifyingKey, SignatureError> {
        let bytes = BASE64
            .decode(seed_b64.trim())
            .map_err(|e| SignatureError::Malformed(format!("invalid seed base64: {}", e)))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SignatureError::Malformed(format!("seed must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(self.insert_seed(key_id, &seed))
    }

    /// Trust a peer's public key
    pub fn insert_public_key(&self, key_id: impl Into<KeyId>, key: VerifyingKey) {
        self.public.write().insert(key_id.into(), key);
    }

    /// Trust a peer's base64 encoded 32-byte public key
    pub fn insert_public_key_base64(&self, key_id: impl Into<KeyId>, key_b64: &str) -> Result<(), SignatureError> {
        let bytes = BASE64
            .decode(key_b64.trim())
            .map_err(|e| SignatureError::Malformed(format!("invalid public key base64: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SignatureError::Malformed(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::Malformed(format!("invalid public key: {}", e)))?;
        self.insert_public_key(key_id, key);
        Ok(())
    }

    fn insert_secret(&self, key_id: KeyId, secret: ed25519_dalek::SigningKey) -> VerifyingKey {
        let verifying = secret.verifying_key();
        self.public.write().insert(key_id.clone(), verifying);
        self.secrets.write().insert(key_id, secret);
        verifying
    }
}

impl fmt::Debug for InMemoryKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secrets: Vec<KeyId> = self.secrets.read().keys().cloned().collect();
        secrets.sort();
        f.debug_struct("InMemoryKeyStore")
            .field("secrets", &secrets)
            .field("public", &self.public.read().len())
            .finish()
    }
}

impl KeyProvider for InMemoryKeyStore {
    fn keys_for(&self, _context: &SigningContext<'_>) -> Vec<SigningKey> {
        let mut ids: Vec<KeyId> = self.secrets.read().keys().cloned().collect();
        ids.sort();
        ids.into_iter().map(SigningKey::ed25519).collect()
    }

    fn public_key_for(&self, key_id: &KeyId) -> Option<VerifyingKey> {
        self.public.read().get(key_id).copied()
    }

    fn sign<'a>(
        &'a self,
        key: &'a SigningKey,
        message: &'a [u8],
    ) -> BoxFuture<'a, Result<ed25519_dalek::Signature, SignatureError>> {
        let result = if key.algorithm != ED25519 {
            Err(SignatureError::UnsupportedAlgorithm(key.algorithm.clone()))
        } else {
            match self.secrets.read().get(&key.key_id) {
                Some(secret) => Ok(secret.sign(message)),
                None => Err(SignatureError::UnknownKey(key.key_id.clone())),
            }
        };
        Box::pin(future::ready(result))
    }
}
