//! Session tokens
//!
//! HS256 token pairs bound to user, role, tenant and a device fingerprint
//! derived from stable request attributes (never the raw IP). Verification
//! fails with distinct error kinds — expired, revoked, fingerprint mismatch —
//! so callers can react precisely. Refresh rotates the token: the presented
//! refresh token is revoked and role/tenant are re-resolved from the
//! principal directory.
//!
//! The revocation set is process-local; multi-instance deployments must
//! externalize it behind the same interface into a shared store.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::error::{Result, SecurityError};
use crate::request_guard::RequestContext;

/// Which half of a token pair a token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Short-lived access token.
    Access,
    /// Long-lived refresh token, rotated on use.
    Refresh,
}

/// Claims embedded in every token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Username.
    pub sub: String,
    /// Role at issuance (re-resolved on refresh).
    pub role: String,
    /// Tenant the session belongs to.
    pub tenant: String,
    /// Device fingerprint the token is bound to.
    pub fpr: String,
    /// Token id, used by the revocation set.
    pub jti: Uuid,
    /// Access or refresh.
    pub typ: TokenKind,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// An access/refresh token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    /// Short-lived access token.
    pub access_token: String,
    /// Refresh token, revoked when used.
    pub refresh_token: String,
}

/// A resolved platform user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Username.
    pub username: String,
    /// Current role.
    pub role: String,
    /// Current tenant.
    pub tenant: String,
}

/// User store collaborator. The platform's real directory implements this;
/// [`StaticDirectory`] ships for development and tests.
pub trait PrincipalDirectory: Send + Sync {
    /// Verify credentials and return the principal on success.
    fn authenticate(&self, username: &str, password: &str) -> Option<Principal>;

    /// Look up a principal's current role and tenant.
    fn lookup(&self, username: &str) -> Option<Principal>;
}

/// In-memory directory (development and tests only).
pub struct StaticDirectory {
    users: std::sync::RwLock<HashMap<String, (String, Principal)>>,
}

impl StaticDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self {
            users: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register a user.
    pub fn add_user(&self, username: &str, password: &str, role: &str, tenant: &str) {
        let principal = Principal {
            username: username.to_string(),
            role: role.to_string(),
            tenant: tenant.to_string(),
        };
        self.users
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_string(), (password.to_string(), principal));
    }

    /// Change a user's role (exercised by refresh re-resolution tests).
    pub fn set_role(&self, username: &str, role: &str) {
        if let Some((_, principal)) = self
            .users
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(username)
        {
            principal.role = role.to_string();
        }
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PrincipalDirectory for StaticDirectory {
    fn authenticate(&self, username: &str, password: &str) -> Option<Principal> {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        let (stored, principal) = users.get(username)?;
        if stored == password {
            Some(principal.clone())
        } else {
            None
        }
    }

    fn lookup(&self, username: &str) -> Option<Principal> {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        users.get(username).map(|(_, p)| p.clone())
    }
}

/// Derive the device fingerprint from stable request attributes. The source
/// IP is deliberately excluded: mobile clients hop networks constantly and
/// binding to IP would log users out on every hop.
pub fn device_fingerprint(ctx: &RequestContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ctx.header("user-agent").unwrap_or_default());
    hasher.update(b"\n");
    hasher.update(ctx.header("accept-language").unwrap_or_default());
    hasher.update(b"\n");
    hasher.update(ctx.header("sec-ch-ua-platform").unwrap_or_default());
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Revoked token ids. Entries expire with the token's natural lifetime so
/// the set cannot grow without bound.
pub struct RevocationSet {
    entries: RwLock<HashMap<Uuid, i64>>,
}

impl RevocationSet {
    /// Empty set.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Revoke a token id until its natural expiry.
    pub async fn revoke(&self, jti: Uuid, expires_at: i64) {
        self.entries.write().await.insert(jti, expires_at);
    }

    /// Whether a token id is currently revoked.
    pub async fn is_revoked(&self, jti: &Uuid) -> bool {
        self.entries.read().await.contains_key(jti)
    }

    /// Drop entries whose tokens have expired anyway. Returns the number
    /// removed.
    pub async fn prune(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, exp| *exp > now);
        before - entries.len()
    }

    /// Current entry count.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the set is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for RevocationSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Issues, verifies, refreshes and revokes token pairs.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
    revocations: RevocationSet,
}

impl TokenService {
    /// Create a service over a 32-byte signing key (derived from the master
    /// secret, never the master secret itself).
    pub fn new(signing_key: &[u8; 32], config: &TokenConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(signing_key),
            decoding: DecodingKey::from_secret(signing_key),
            validation,
            access_ttl: Duration::seconds(config.access_ttl_secs),
            refresh_ttl: Duration::seconds(config.refresh_ttl_secs),
            revocations: RevocationSet::new(),
        }
    }

    /// Issue an access/refresh pair bound to the presenting device context.
    pub fn issue_pair(&self, principal: &Principal, ctx: &RequestContext) -> Result<TokenPair> {
        let fpr = device_fingerprint(ctx);
        let access = self.issue(principal, &fpr, TokenKind::Access, self.access_ttl)?;
        let refresh = self.issue(principal, &fpr, TokenKind::Refresh, self.refresh_ttl)?;

        info!(user = %principal.username, tenant = %principal.tenant, "token pair issued");
        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
        })
    }

    fn issue(
        &self,
        principal: &Principal,
        fpr: &str,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: principal.username.clone(),
            role: principal.role.clone(),
            tenant: principal.tenant.clone(),
            fpr: fpr.to_string(),
            jti: Uuid::new_v4(),
            typ: kind,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| SecurityError::Internal(format!("token encoding failed: {}", e)))
    }

    /// Verify a token against the presenting context. Error kinds are
    /// distinct: expired, revoked and fingerprint mismatch each surface as
    /// themselves; everything else collapses into a generic failure.
    pub async fn verify(
        &self,
        token: &str,
        ctx: &RequestContext,
        expected: TokenKind,
    ) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => SecurityError::TokenExpired,
                _ => SecurityError::AuthenticationFailure,
            }
        })?;
        let claims = data.claims;

        if claims.typ != expected {
            return Err(SecurityError::AuthenticationFailure);
        }

        if self.revocations.is_revoked(&claims.jti).await {
            return Err(SecurityError::TokenRevoked);
        }

        if claims.fpr != device_fingerprint(ctx) {
            return Err(SecurityError::FingerprintMismatch);
        }

        Ok(claims)
    }

    /// Rotate a refresh token: the presented token is revoked, the user's
    /// current role and tenant are re-resolved, and a fresh pair is issued.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        ctx: &RequestContext,
        directory: &dyn PrincipalDirectory,
    ) -> Result<TokenPair> {
        let claims = self.verify(refresh_token, ctx, TokenKind::Refresh).await?;

        self.revocations.revoke(claims.jti, claims.exp).await;

        let principal = directory
            .lookup(&claims.sub)
            .ok_or(SecurityError::AuthenticationFailure)?;

        self.issue_pair(&principal, ctx)
    }

    /// Revoke a token (logout). The entry expires with the token itself.
    pub async fn revoke(&self, claims: &Claims) {
        self.revocations.revoke(claims.jti, claims.exp).await;
        info!(user = %claims.sub, "token revoked");
    }

    /// The revocation set, for pruning and externalization.
    pub fn revocations(&self) -> &RevocationSet {
        &self.revocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));

    fn browser_ctx() -> RequestContext {
        RequestContext::new("GET", "/api/widgets", IP)
            .with_header("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")
            .with_header("accept-language", "en-GB,en;q=0.9")
    }

    fn principal() -> Principal {
        Principal {
            username: "ada".to_string(),
            role: "admin".to_string(),
            tenant: "acme".to_string(),
        }
    }

    fn service() -> TokenService {
        TokenService::new(&[17u8; 32], &TokenConfig::default())
    }

    #[tokio::test]
    async fn test_issue_and_verify() {
        let svc = service();
        let ctx = browser_ctx();
        let pair = svc.issue_pair(&principal(), &ctx).unwrap();

        let claims = svc
            .verify(&pair.access_token, &ctx, TokenKind::Access)
            .await
            .unwrap();
        assert_eq!(claims.sub, "ada");
        assert_eq!(claims.tenant, "acme");
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch() {
        let svc = service();
        let pair = svc.issue_pair(&principal(), &browser_ctx()).unwrap();

        let other_device = RequestContext::new("GET", "/api/widgets", IP)
            .with_header("user-agent", "curl/8.5.0")
            .with_header("accept-language", "ru-RU");

        assert!(matches!(
            svc.verify(&pair.access_token, &other_device, TokenKind::Access).await,
            Err(SecurityError::FingerprintMismatch)
        ));
    }

    #[tokio::test]
    async fn test_fingerprint_ignores_source_ip() {
        let svc = service();
        let pair = svc.issue_pair(&principal(), &browser_ctx()).unwrap();

        let roamed = RequestContext::new("GET", "/api/widgets", "198.51.100.7".parse().unwrap())
            .with_header("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")
            .with_header("accept-language", "en-GB,en;q=0.9");

        assert!(svc.verify(&pair.access_token, &roamed, TokenKind::Access).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_token() {
        let config = TokenConfig { access_ttl_secs: -10, refresh_ttl_secs: 3600 };
        let svc = TokenService::new(&[17u8; 32], &config);
        let ctx = browser_ctx();
        let pair = svc.issue_pair(&principal(), &ctx).unwrap();

        assert!(matches!(
            svc.verify(&pair.access_token, &ctx, TokenKind::Access).await,
            Err(SecurityError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_revoked_token_always_fails() {
        let svc = service();
        let ctx = browser_ctx();
        let pair = svc.issue_pair(&principal(), &ctx).unwrap();

        let claims = svc
            .verify(&pair.access_token, &ctx, TokenKind::Access)
            .await
            .unwrap();
        svc.revoke(&claims).await;

        assert!(matches!(
            svc.verify(&pair.access_token, &ctx, TokenKind::Access).await,
            Err(SecurityError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn test_access_token_rejected_as_refresh() {
        let svc = service();
        let ctx = browser_ctx();
        let pair = svc.issue_pair(&principal(), &ctx).unwrap();

        assert!(matches!(
            svc.verify(&pair.access_token, &ctx, TokenKind::Refresh).await,
            Err(SecurityError::AuthenticationFailure)
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_revokes_old() {
        let svc = service();
        let ctx = browser_ctx();
        let directory = StaticDirectory::new();
        directory.add_user("ada", "pw", "admin", "acme");

        let pair = svc.issue_pair(&principal(), &ctx).unwrap();
        let rotated = svc.refresh(&pair.refresh_token, &ctx, &directory).await.unwrap();

        // Old refresh token is now revoked; the new pair verifies.
        assert!(matches!(
            svc.verify(&pair.refresh_token, &ctx, TokenKind::Refresh).await,
            Err(SecurityError::TokenRevoked)
        ));
        assert!(svc
            .verify(&rotated.access_token, &ctx, TokenKind::Access)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_refresh_re_resolves_role() {
        let svc = service();
        let ctx = browser_ctx();
        let directory = StaticDirectory::new();
        directory.add_user("ada", "pw", "admin", "acme");

        let pair = svc.issue_pair(&principal(), &ctx).unwrap();
        directory.set_role("ada", "viewer");

        let rotated = svc.refresh(&pair.refresh_token, &ctx, &directory).await.unwrap();
        let claims = svc
            .verify(&rotated.access_token, &ctx, TokenKind::Access)
            .await
            .unwrap();
        assert_eq!(claims.role, "viewer");
    }

    #[tokio::test]
    async fn test_garbage_token_is_generic_failure() {
        let svc = service();
        assert!(matches!(
            svc.verify("not-a-jwt", &browser_ctx(), TokenKind::Access).await,
            Err(SecurityError::AuthenticationFailure)
        ));
    }

    #[tokio::test]
    async fn test_revocation_set_prunes_expired_entries() {
        let set = RevocationSet::new();
        let past = Utc::now().timestamp() - 100;
        let future = Utc::now().timestamp() + 100;

        set.revoke(Uuid::new_v4(), past).await;
        let live = Uuid::new_v4();
        set.revoke(live, future).await;

        assert_eq!(set.prune().await, 1);
        assert!(set.is_revoked(&live).await);
        assert_eq!(set.len().await, 1);
    }
}
