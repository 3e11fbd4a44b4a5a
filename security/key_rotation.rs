//! Time-sliced key derivation
//!
//! Period keys are derived on demand from the process master secret with
//! HKDF-SHA256 and never stored. Distinct period labels yield independent
//! keys, so a leaked derived key only compromises one period's data. The
//! master secret rotates only via redeploy or the recovery procedure.

use chrono::{DateTime, Datelike, Utc};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::encryption::{EncryptedEnvelope, EncryptionService};
use crate::error::{Result, SecurityError};

/// Domain separator for period-key derivation.
const PERIOD_KEY_DOMAIN: &[u8] = b"atrium-security/period-key/v1";

/// Domain separator for purpose-scoped static keys (token signing, wrapping).
const PURPOSE_KEY_DOMAIN: &[u8] = b"atrium-security/purpose-key/v1";

/// Process-wide master secret. Loaded once at startup, never persisted in
/// plaintext; zeroed on drop.
pub struct MasterSecret([u8; 32]);

impl MasterSecret {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for MasterSecret {
    fn drop(&mut self) {
        self.0 = [0u8; 32];
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret(redacted)")
    }
}

/// Granularity of key-period rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPeriod {
    /// A new key every hour.
    Hourly,
    /// A new key every UTC day.
    Daily,
    /// A new key every ISO week.
    Weekly,
}

impl RotationPeriod {
    /// Label for the period containing `at`.
    pub fn label_for(&self, at: DateTime<Utc>) -> String {
        match self {
            RotationPeriod::Hourly => at.format("%Y-%m-%dT%H").to_string(),
            RotationPeriod::Daily => at.format("%Y-%m-%d").to_string(),
            RotationPeriod::Weekly => {
                let week = at.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }
}

/// Derives period and purpose keys from the master secret.
pub struct RotatingKeyService {
    master: MasterSecret,
    period: RotationPeriod,
}

impl RotatingKeyService {
    /// Create a service over the process master secret.
    pub fn new(master: MasterSecret, period: RotationPeriod) -> Self {
        Self { master, period }
    }

    /// Label of the current period.
    pub fn current_label(&self) -> String {
        self.period.label_for(Utc::now())
    }

    /// Derive the key for an arbitrary period label. One-way: no label's key
    /// is computable from another's.
    pub fn derive_for_label(&self, label: &str) -> Result<[u8; 32]> {
        expand(self.master.bytes(), PERIOD_KEY_DOMAIN, label.as_bytes())
    }

    /// Derive a static key scoped to a named purpose (e.g. token signing).
    /// Purpose keys do not rotate with the period.
    pub fn derive_for_purpose(&self, purpose: &str) -> Result<[u8; 32]> {
        expand(self.master.bytes(), PURPOSE_KEY_DOMAIN, purpose.as_bytes())
    }

    /// Encrypt under the current period's key, stamping the envelope with
    /// the period label so it stays decryptable after rollover.
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        let label = self.current_label();
        let key = self.derive_for_label(&label)?;
        EncryptionService::encrypt_labeled(plaintext, &key, &label)
    }

    /// Decrypt an envelope sealed by [`seal`](Self::seal), re-deriving the
    /// key from the envelope's own period label.
    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        let key = self.derive_for_label(&envelope.period_label)?;
        EncryptionService::decrypt(envelope, &key)
    }
}

impl std::fmt::Debug for RotatingKeyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingKeyService")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

fn expand(ikm: &[u8; 32], salt: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| SecurityError::Internal(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service() -> RotatingKeyService {
        RotatingKeyService::new(MasterSecret::new([9u8; 32]), RotationPeriod::Daily)
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let svc = service();
        let a = svc.derive_for_label("2026-08-07").unwrap();
        let b = svc.derive_for_label("2026-08-07").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_periods_yield_distinct_keys() {
        let svc = service();
        let a = svc.derive_for_label("2026-08-07").unwrap();
        let b = svc.derive_for_label("2026-08-08").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_purpose_keys_are_domain_separated() {
        let svc = service();
        let period = svc.derive_for_label("token-signing").unwrap();
        let purpose = svc.derive_for_purpose("token-signing").unwrap();
        assert_ne!(period, purpose);
    }

    #[test]
    fn test_period_labels() {
        let at = Utc.with_ymd_and_hms(2026, 8, 7, 14, 30, 0).unwrap();
        assert_eq!(RotationPeriod::Hourly.label_for(at), "2026-08-07T14");
        assert_eq!(RotationPeriod::Daily.label_for(at), "2026-08-07");
        assert_eq!(RotationPeriod::Weekly.label_for(at), "2026-W32");
    }

    #[test]
    fn test_seal_open_round_trip() {
        let svc = service();
        let envelope = svc.seal(b"rotating secret").unwrap();
        assert_eq!(envelope.period_label, svc.current_label());
        assert_eq!(svc.open(&envelope).unwrap(), b"rotating secret");
    }

    #[test]
    fn test_open_uses_envelope_label_not_current_period() {
        let svc = service();
        let old_label = "2020-01-01";
        let key = svc.derive_for_label(old_label).unwrap();
        let envelope =
            crate::encryption::EncryptionService::encrypt_labeled(b"old data", &key, old_label)
                .unwrap();
        assert_eq!(svc.open(&envelope).unwrap(), b"old data");
    }

    #[test]
    fn test_different_masters_disagree() {
        let a = RotatingKeyService::new(MasterSecret::new([1u8; 32]), RotationPeriod::Daily);
        let b = RotatingKeyService::new(MasterSecret::new([2u8; 32]), RotationPeriod::Daily);
        assert_ne!(
            a.derive_for_label("2026-08-07").unwrap(),
            b.derive_for_label("2026-08-07").unwrap()
        );
    }
}
