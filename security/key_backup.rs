//! Key backup and disaster recovery
//!
//! Splits a root key into custodian shares so it can be reconstructed after
//! total loss of the deployment. Recovery requires ALL shares (XOR
//! combination) — there is no partial-compromise tolerance; a k-of-n
//! (Shamir) scheme would replace [`split_key`] if that tolerance is needed.
//! Every share carries a checksum so a corrupted byte is detected before
//! reconstruction is attempted.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SecurityError};

/// One custodian's share of a split key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    /// 1-based share index.
    pub index: u8,
    /// Total shares in the set.
    pub total: u8,
    /// Share bytes, same length as the original key.
    pub bytes: Vec<u8>,
    /// SHA-256 checksum over index, total and bytes.
    pub checksum: String,
    /// Label of the custodian holding this share.
    pub custodian: String,
}

impl KeyShare {
    fn compute_checksum(index: u8, total: u8, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update([index, total]);
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

/// A complete share set plus provenance, for the administrative recovery
/// flow. Serialized with bincode and handed out hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryKit {
    /// When the kit was generated.
    pub created_at: DateTime<Utc>,
    /// All shares. Distribute to distinct custodians before discarding.
    pub shares: Vec<KeyShare>,
}

impl RecoveryKit {
    /// Hex-encoded byte serialization.
    pub fn to_hex(&self) -> Result<String> {
        Ok(hex::encode(bincode::serialize(self)?))
    }

    /// Decode a kit produced by [`to_hex`](Self::to_hex).
    pub fn from_hex(raw: &str) -> Result<Self> {
        let bytes =
            hex::decode(raw).map_err(|e| SecurityError::Serialization(e.to_string()))?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// Split `key` into `n` shares, all of which are required to reconstruct it.
pub fn split_key(key: &[u8], n: u8) -> Result<Vec<KeyShare>> {
    if n < 2 {
        return Err(SecurityError::ValidationFailure(
            "key splitting requires at least 2 shares".to_string(),
        ));
    }
    if key.is_empty() {
        return Err(SecurityError::ValidationFailure(
            "cannot split an empty key".to_string(),
        ));
    }

    let mut shares = Vec::with_capacity(n as usize);
    let mut running = key.to_vec();

    for index in 1..n {
        let mut bytes = vec![0u8; key.len()];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        for (r, b) in running.iter_mut().zip(bytes.iter()) {
            *r ^= b;
        }
        shares.push(make_share(index, n, bytes));
    }

    // Last share is the XOR residue so the full set recombines to the key.
    shares.push(make_share(n, n, running));
    Ok(shares)
}

fn make_share(index: u8, total: u8, bytes: Vec<u8>) -> KeyShare {
    let checksum = KeyShare::compute_checksum(index, total, &bytes);
    KeyShare {
        index,
        total,
        bytes,
        checksum,
        custodian: format!("custodian-{}", index),
    }
}

/// Verify a share's checksum. Called before any reconstruction so a single
/// corrupted byte is caught up front.
pub fn verify_share(share: &KeyShare) -> Result<()> {
    let expected = KeyShare::compute_checksum(share.index, share.total, &share.bytes);
    if expected != share.checksum {
        return Err(SecurityError::ShareChecksumMismatch { index: share.index });
    }
    Ok(())
}

/// Reconstruct the original key from the full share set.
pub fn recover_key(shares: &[KeyShare]) -> Result<Vec<u8>> {
    let total = shares
        .first()
        .map(|s| s.total)
        .ok_or_else(|| SecurityError::ValidationFailure("no shares provided".to_string()))?;

    if shares.len() != total as usize {
        return Err(SecurityError::ValidationFailure(format!(
            "recovery requires all {} shares, got {}",
            total,
            shares.len()
        )));
    }

    let key_len = shares[0].bytes.len();
    let mut seen = std::collections::HashSet::new();

    for share in shares {
        verify_share(share)?;
        if share.total != total || share.bytes.len() != key_len {
            return Err(SecurityError::ValidationFailure(
                "shares are not from the same split".to_string(),
            ));
        }
        if !seen.insert(share.index) || share.index == 0 || share.index > total {
            return Err(SecurityError::ValidationFailure(format!(
                "invalid or duplicate share index {}",
                share.index
            )));
        }
    }

    let mut key = vec![0u8; key_len];
    for share in shares {
        for (k, b) in key.iter_mut().zip(share.bytes.iter()) {
            *k ^= b;
        }
    }
    Ok(key)
}

/// Build a recovery kit for a root key.
pub fn generate_recovery_kit(key: &[u8], n: u8) -> Result<RecoveryKit> {
    Ok(RecoveryKit {
        created_at: Utc::now(),
        shares: split_key(key, n)?,
    })
}
