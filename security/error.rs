//! Security error taxonomy
//!
//! One error enum shared by every guard and service so that the middleware
//! contract can terminate a request with a structured `{error, code}` body.
//! Guard failures map to the narrowest safe variant: authentication problems
//! collapse into [`SecurityError::AuthenticationFailure`] unless the caller
//! is allowed to distinguish them (expired vs revoked vs fingerprint).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SecurityError>;

/// Errors produced by the security core.
#[derive(Error, Debug)]
pub enum SecurityError {
    /// Generic authentication failure. Deliberately carries no detail so a
    /// caller cannot distinguish "unknown user" from "wrong password".
    #[error("authentication failed")]
    AuthenticationFailure,

    /// Token is past its expiry.
    #[error("token expired")]
    TokenExpired,

    /// Token was revoked (logout or rotation-on-refresh).
    #[error("token revoked")]
    TokenRevoked,

    /// Token fingerprint does not match the presenting device context.
    #[error("token fingerprint mismatch")]
    FingerprintMismatch,

    /// Input failed validation.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// A rate-limit tier rejected the request.
    #[error("rate limit exceeded")]
    RateLimitExceeded {
        /// Suggested wait before retrying.
        retry_after: std::time::Duration,
    },

    /// Double-submit CSRF tokens were absent or did not match.
    #[error("CSRF token mismatch")]
    CsrfMismatch,

    /// Outbound destination rejected by the SSRF allowlist.
    #[error("SSRF blocked: {0}")]
    SsrfBlocked(String),

    /// Authenticated decryption failed. Never partial plaintext.
    #[error("decryption failed")]
    DecryptionFailure,

    /// A key share failed its checksum before reconstruction.
    #[error("share checksum mismatch at index {index}")]
    ShareChecksumMismatch {
        /// Index of the corrupted share.
        index: u8,
    },

    /// External key vault could not be reached. Callers fall back to local
    /// wrapping rather than failing the request.
    #[error("key vault unavailable: {0}")]
    KeyVaultUnavailable(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying IO failure (event sink, alert channel).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SecurityError {
    /// Stable wire code for the `{error, code}` middleware contract.
    pub fn code(&self) -> &'static str {
        match self {
            SecurityError::AuthenticationFailure => "authentication_failure",
            SecurityError::TokenExpired => "token_expired",
            SecurityError::TokenRevoked => "token_revoked",
            SecurityError::FingerprintMismatch => "fingerprint_mismatch",
            SecurityError::ValidationFailure(_) => "validation_failure",
            SecurityError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            SecurityError::CsrfMismatch => "csrf_mismatch",
            SecurityError::SsrfBlocked(_) => "ssrf_blocked",
            SecurityError::DecryptionFailure => "decryption_failure",
            SecurityError::ShareChecksumMismatch { .. } => "share_checksum_mismatch",
            SecurityError::KeyVaultUnavailable(_) => "key_vault_unavailable",
            SecurityError::Config(_) => "configuration_error",
            SecurityError::Io(_) => "io_error",
            SecurityError::Serialization(_) => "serialization_error",
            SecurityError::Internal(_) => "internal_error",
        }
    }

    /// Structured body for terminating a request at the middleware layer.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        })
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self {
        SecurityError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for SecurityError {
    fn from(err: bincode::Error) -> Self {
        SecurityError::Serialization(err.to_string())
    }
}
