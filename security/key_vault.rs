//! Key wrapping
//!
//! Data-encryption keys are wrapped under a key-encrypting key before they
//! touch storage. Two implementations of one capability interface, selected
//! at construction time: [`ExternalWrapper`] delegates to a configured vault
//! transport, [`LocalFallbackWrapper`] wraps under the rotating key service.
//! Fallback output is tagged so monitoring can detect degraded posture.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::encryption::{EncryptedEnvelope, NONCE_LEN};
use crate::error::{Result, SecurityError};
use crate::key_rotation::RotatingKeyService;

/// Where a wrapped key was wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapOrigin {
    /// Wrapped by the external key vault.
    External,
    /// Wrapped locally because no vault was configured or reachable.
    /// Audited as degraded posture.
    LocalFallback,
}

/// A data-encryption key encrypted under a key-encrypting key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Reference to the wrapping key (vault key ref or period label).
    pub key_ref: String,
    /// Which wrapper produced this blob.
    pub origin: WrapOrigin,
    /// Opaque wrapped bytes.
    pub blob: Vec<u8>,
}

/// Capability interface for wrapping and unwrapping DEKs.
pub trait KeyWrapper: Send + Sync {
    /// Wrap a data-encryption key.
    fn wrap(&self, dek: &[u8]) -> Result<WrappedKey>;

    /// Unwrap a previously wrapped key. A wrong key reference fails, never
    /// silently succeeds with the wrong key.
    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Vec<u8>>;

    /// Origin tag this wrapper produces.
    fn origin(&self) -> WrapOrigin;
}

/// Transport to an external key-management backend. The real KMS client is a
/// collaborator supplied by the embedding process; [`InMemoryVault`] ships
/// for development and tests.
pub trait VaultTransport: Send + Sync {
    /// Wrap `dek` under the KEK named by `key_ref`.
    fn wrap(&self, key_ref: &str, dek: &[u8]) -> Result<Vec<u8>>;

    /// Unwrap a blob under the KEK named by `key_ref`.
    fn unwrap(&self, key_ref: &str, blob: &[u8]) -> Result<Vec<u8>>;
}

/// Wrapper backed by an external vault transport.
pub struct ExternalWrapper {
    transport: Arc<dyn VaultTransport>,
    key_ref: String,
}

impl ExternalWrapper {
    /// Create a wrapper that wraps under the vault KEK named by `key_ref`.
    pub fn new(transport: Arc<dyn VaultTransport>, key_ref: String) -> Self {
        Self { transport, key_ref }
    }
}

impl KeyWrapper for ExternalWrapper {
    fn wrap(&self, dek: &[u8]) -> Result<WrappedKey> {
        let blob = self.transport.wrap(&self.key_ref, dek)?;
        Ok(WrappedKey {
            key_ref: self.key_ref.clone(),
            origin: WrapOrigin::External,
            blob,
        })
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Vec<u8>> {
        if wrapped.origin != WrapOrigin::External {
            return Err(SecurityError::DecryptionFailure);
        }
        self.transport.unwrap(&wrapped.key_ref, &wrapped.blob)
    }

    fn origin(&self) -> WrapOrigin {
        WrapOrigin::External
    }
}

/// Wrapper that seals DEKs under the current rotating period key. Used when
/// no external vault is configured or the vault is unreachable.
pub struct LocalFallbackWrapper {
    keys: Arc<RotatingKeyService>,
}

impl LocalFallbackWrapper {
    /// Create a fallback wrapper over the rotating key service.
    pub fn new(keys: Arc<RotatingKeyService>) -> Self {
        warn!("key wrapping is running in local fallback mode");
        Self { keys }
    }
}

impl KeyWrapper for LocalFallbackWrapper {
    fn wrap(&self, dek: &[u8]) -> Result<WrappedKey> {
        let envelope = self.keys.seal(dek)?;
        let key_ref = envelope.period_label.clone();
        Ok(WrappedKey {
            key_ref,
            origin: WrapOrigin::LocalFallback,
            blob: envelope.to_bytes()?,
        })
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Vec<u8>> {
        if wrapped.origin != WrapOrigin::LocalFallback {
            return Err(SecurityError::DecryptionFailure);
        }
        let envelope = EncryptedEnvelope::from_bytes(&wrapped.blob)?;
        if envelope.period_label != wrapped.key_ref {
            return Err(SecurityError::DecryptionFailure);
        }
        self.keys.open(&envelope)
    }

    fn origin(&self) -> WrapOrigin {
        WrapOrigin::LocalFallback
    }
}

/// In-memory vault transport for development and tests. Holds KEKs by
/// reference and wraps with AES-256-GCM, nonce prefixed to the blob.
pub struct InMemoryVault {
    keks: std::sync::RwLock<HashMap<String, [u8; 32]>>,
    available: std::sync::atomic::AtomicBool,
}

impl InMemoryVault {
    /// Empty vault.
    pub fn new() -> Self {
        Self {
            keks: std::sync::RwLock::new(HashMap::new()),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Install a KEK under a reference.
    pub fn install_kek(&self, key_ref: &str, kek: [u8; 32]) {
        self.keks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key_ref.to_string(), kek);
    }

    /// Simulate the vault going down (tests, drills).
    pub fn set_available(&self, available: bool) {
        self.available
            .store(available, std::sync::atomic::Ordering::SeqCst);
    }

    fn kek(&self, key_ref: &str) -> Result<[u8; 32]> {
        if !self.available.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SecurityError::KeyVaultUnavailable(
                "vault transport is down".to_string(),
            ));
        }
        self.keks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key_ref)
            .copied()
            .ok_or(SecurityError::DecryptionFailure)
    }
}

impl Default for InMemoryVault {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultTransport for InMemoryVault {
    fn wrap(&self, key_ref: &str, dek: &[u8]) -> Result<Vec<u8>> {
        let kek = self.kek(key_ref)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, dek)
            .map_err(|_| SecurityError::Internal("KEK wrap failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn unwrap(&self, key_ref: &str, blob: &[u8]) -> Result<Vec<u8>> {
        let kek = self.kek(key_ref)?;
        if blob.len() < NONCE_LEN {
            return Err(SecurityError::DecryptionFailure);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);

        cipher
            .decrypt(nonce, &blob[NONCE_LEN..])
            .map_err(|_| SecurityError::DecryptionFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_rotation::{MasterSecret, RotationPeriod};

    fn rotating_keys() -> Arc<RotatingKeyService> {
        Arc::new(RotatingKeyService::new(
            MasterSecret::new([3u8; 32]),
            RotationPeriod::Daily,
        ))
    }

    #[test]
    fn test_external_wrap_round_trip() {
        let vault = Arc::new(InMemoryVault::new());
        vault.install_kek("kek-1", [5u8; 32]);
        let wrapper = ExternalWrapper::new(vault, "kek-1".to_string());

        let dek = [11u8; 32];
        let wrapped = wrapper.wrap(&dek).unwrap();
        assert_eq!(wrapped.origin, WrapOrigin::External);
        assert_eq!(wrapped.key_ref, "kek-1");
        assert_eq!(wrapper.unwrap(&wrapped).unwrap(), dek);
    }

    #[test]
    fn test_wrong_key_ref_fails() {
        let vault = Arc::new(InMemoryVault::new());
        vault.install_kek("kek-1", [5u8; 32]);
        let wrapper = ExternalWrapper::new(vault, "kek-1".to_string());

        let mut wrapped = wrapper.wrap(&[11u8; 32]).unwrap();
        wrapped.key_ref = "kek-other".to_string();
        assert!(wrapper.unwrap(&wrapped).is_err());
    }

    #[test]
    fn test_unreachable_vault_surfaces_unavailable() {
        let vault = Arc::new(InMemoryVault::new());
        vault.install_kek("kek-1", [5u8; 32]);
        vault.set_available(false);
        let wrapper = ExternalWrapper::new(vault, "kek-1".to_string());

        assert!(matches!(
            wrapper.wrap(&[11u8; 32]),
            Err(SecurityError::KeyVaultUnavailable(_))
        ));
    }

    #[test]
    fn test_fallback_wrap_is_tagged_for_audit() {
        let wrapper = LocalFallbackWrapper::new(rotating_keys());
        let wrapped = wrapper.wrap(&[13u8; 32]).unwrap();
        assert_eq!(wrapped.origin, WrapOrigin::LocalFallback);
        assert_eq!(wrapper.unwrap(&wrapped).unwrap(), [13u8; 32]);
    }

    #[test]
    fn test_fallback_rejects_mismatched_key_ref() {
        let wrapper = LocalFallbackWrapper::new(rotating_keys());
        let mut wrapped = wrapper.wrap(&[13u8; 32]).unwrap();
        wrapped.key_ref = "1999-01-01".to_string();
        assert!(matches!(
            wrapper.unwrap(&wrapped),
            Err(SecurityError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_origin_mismatch_fails() {
        let vault = Arc::new(InMemoryVault::new());
        vault.install_kek("kek-1", [5u8; 32]);
        let external = ExternalWrapper::new(vault, "kek-1".to_string());
        let fallback = LocalFallbackWrapper::new(rotating_keys());

        let wrapped = fallback.wrap(&[13u8; 32]).unwrap();
        assert!(external.unwrap(&wrapped).is_err());
    }
}
