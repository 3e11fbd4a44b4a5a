//! Authenticated encryption primitive
//!
//! AES-256-GCM with a fresh random nonce per call. The envelope format is
//! versioned and carries the key-period label; version and label are bound
//! into the ciphertext as associated data, so tampering with either fails
//! decryption the same way a flipped ciphertext bit does.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SecurityError};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// An encrypted payload with everything needed to decrypt it except the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Format version.
    pub version: u8,
    /// Key-period label the payload was sealed under. Empty for keys that
    /// do not rotate.
    pub period_label: String,
    /// Random per-call nonce.
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the GCM authentication tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Compact byte serialization.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode an envelope; truncated or malformed input fails closed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: EncryptedEnvelope = bincode::deserialize(bytes)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(SecurityError::DecryptionFailure);
        }
        Ok(envelope)
    }
}

/// Stateless AEAD service over 32-byte keys.
#[derive(Debug)]
pub struct EncryptionService;

impl EncryptionService {
    /// Encrypt a plaintext under `key`. Identical inputs produce different
    /// envelopes because the nonce is drawn fresh every call.
    pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<EncryptedEnvelope> {
        Self::encrypt_labeled(plaintext, key, "")
    }

    /// Encrypt with an explicit key-period label bound as associated data.
    pub fn encrypt_labeled(
        plaintext: &[u8],
        key: &[u8; 32],
        period_label: &str,
    ) -> Result<EncryptedEnvelope> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let aad = associated_data(ENVELOPE_VERSION, period_label);
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|_| SecurityError::Internal("AEAD encryption failed".to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&nonce);

        Ok(EncryptedEnvelope {
            version: ENVELOPE_VERSION,
            period_label: period_label.to_string(),
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Decrypt an envelope. Any bit flip in the ciphertext, tag, nonce,
    /// version or label fails closed with [`SecurityError::DecryptionFailure`].
    pub fn decrypt(envelope: &EncryptedEnvelope, key: &[u8; 32]) -> Result<Vec<u8>> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(SecurityError::DecryptionFailure);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Nonce::from_slice(&envelope.nonce);
        let aad = associated_data(envelope.version, &envelope.period_label);

        cipher
            .decrypt(nonce, Payload { msg: &envelope.ciphertext, aad: &aad })
            .map_err(|_| SecurityError::DecryptionFailure)
    }
}

fn associated_data(version: u8, period_label: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + period_label.len());
    aad.push(version);
    aad.extend_from_slice(period_label.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; 32] = [42u8; 32];

    #[test]
    fn test_round_trip() {
        let envelope = EncryptionService::encrypt(b"tenant PII field", &KEY).unwrap();
        let plaintext = EncryptionService::decrypt(&envelope, &KEY).unwrap();
        assert_eq!(plaintext, b"tenant PII field");
    }

    #[test]
    fn test_encryption_is_non_deterministic() {
        let a = EncryptionService::encrypt(b"same plaintext", &KEY).unwrap();
        let b = EncryptionService::encrypt(b"same plaintext", &KEY).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_bit_flip_in_ciphertext_fails_closed() {
        let mut envelope = EncryptionService::encrypt(b"payload", &KEY).unwrap();
        for i in 0..envelope.ciphertext.len() {
            envelope.ciphertext[i] ^= 0x01;
            assert!(matches!(
                EncryptionService::decrypt(&envelope, &KEY),
                Err(SecurityError::DecryptionFailure)
            ));
            envelope.ciphertext[i] ^= 0x01;
        }
        // Untouched envelope still decrypts.
        assert!(EncryptionService::decrypt(&envelope, &KEY).is_ok());
    }

    #[test]
    fn test_label_tampering_fails_closed() {
        let mut envelope =
            EncryptionService::encrypt_labeled(b"payload", &KEY, "2026-08-07").unwrap();
        envelope.period_label = "2026-08-08".to_string();
        assert!(matches!(
            EncryptionService::decrypt(&envelope, &KEY),
            Err(SecurityError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let envelope = EncryptionService::encrypt(b"payload", &KEY).unwrap();
        let other_key = [7u8; 32];
        assert!(EncryptionService::decrypt(&envelope, &other_key).is_err());
    }

    #[test]
    fn test_byte_serialization_round_trip() {
        let envelope = EncryptionService::encrypt_labeled(b"payload", &KEY, "p1").unwrap();
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(EncryptedEnvelope::from_bytes(&bytes).unwrap(), envelope);

        // Truncation fails closed.
        assert!(EncryptedEnvelope::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..512)) {
            let envelope = EncryptionService::encrypt(&plaintext, &KEY).unwrap();
            prop_assert_eq!(EncryptionService::decrypt(&envelope, &KEY).unwrap(), plaintext);
        }
    }
}
