//! Security configuration
//!
//! Every service in the crate is constructed from one [`SecurityConfig`]
//! supplied at process start. Optional sections (vault, traps, geo) degrade
//! to fallback/no-op when absent; mandatory secrets abort startup in
//! production mode when missing or left at an insecure default.
//!
//! The master secret is only ever read from the environment, never from a
//! config file on disk.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, SecurityError};
use crate::event_log::Severity;
use crate::key_rotation::RotationPeriod;

/// Environment variable holding the hex-encoded 32-byte master secret.
pub const MASTER_SECRET_ENV: &str = "SECURITY_MASTER_SECRET";

/// Development-only master secret, refused in production mode.
const DEV_MASTER_SECRET: &str =
    "6465762d6f6e6c792d6d61737465722d7365637265742d646f2d6e6f742d7573";

/// Known insecure placeholder values for the master secret.
const INSECURE_SECRETS: &[&str] = &[
    "",
    "change-me",
    "changeme",
    "secret",
    "0000000000000000000000000000000000000000000000000000000000000000",
    DEV_MASTER_SECRET,
];

/// A honeypot credential pair. No legitimate flow ever uses one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoneypotCredential {
    /// Trap username.
    pub username: String,
    /// Trap password.
    pub password: String,
}

/// External key-vault connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Vault endpoint (operator-configured, outside the SSRF threat model).
    pub endpoint: String,
    /// Access token for the vault.
    pub token: String,
    /// Key-encrypting-key reference used for wrapping.
    pub key_ref: String,
}

/// One rate-limit tier: a request count over a window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimit {
    /// Requests allowed inside the window. The request at this count is
    /// allowed; the next one is denied.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl TierLimit {
    /// Window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Per-tier rate-limit parameters plus the universal burst cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitTiers {
    /// Strict, IP-keyed tier for authentication endpoints.
    pub auth: TierLimit,
    /// Generous, principal-keyed tier for authenticated API traffic.
    pub api: TierLimit,
    /// Very permissive tier for public ingestion.
    pub ingest: TierLimit,
    /// Universal sub-second burst cap applied before any tier.
    pub burst: TierLimit,
}

impl Default for RateLimitTiers {
    fn default() -> Self {
        Self {
            auth: TierLimit { max_requests: 10, window_ms: 60_000 },
            api: TierLimit { max_requests: 600, window_ms: 60_000 },
            ingest: TierLimit { max_requests: 5_000, window_ms: 60_000 },
            burst: TierLimit { max_requests: 20, window_ms: 500 },
        }
    }
}

/// Token lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Access-token lifetime in seconds.
    pub access_ttl_secs: i64,
    /// Refresh-token lifetime in seconds.
    pub refresh_ttl_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: 900,
            refresh_ttl_secs: 14 * 24 * 3600,
        }
    }
}

/// Key-rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Period granularity for derived keys.
    pub period: RotationPeriod,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self { period: RotationPeriod::Daily }
    }
}

/// Security-event log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Append-only sink path.
    pub path: PathBuf,
    /// Buffer size that forces a flush.
    pub buffer_capacity: usize,
    /// Timer flush interval in seconds.
    pub flush_interval_secs: u64,
    /// Minimum severity to record.
    pub min_severity: Severity,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/security-events.log"),
            buffer_capacity: 256,
            flush_interval_secs: 5,
            min_severity: Severity::Info,
        }
    }
}

/// Alert dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Per-event-type alerts allowed per minute; the alert at this count is
    /// delivered, the next one is suppressed.
    pub max_per_type_per_minute: u32,
    /// Minimum severity that produces an alert.
    pub min_severity: Severity,
    /// Depth of the async dispatch queue.
    pub queue_depth: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_per_type_per_minute: 5,
            min_severity: Severity::Warning,
            queue_depth: 1024,
        }
    }
}

/// Geo-anomaly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Implied travel speed above this flags impossible travel.
    pub max_speed_kmh: f64,
    /// Distances below this never flag, regardless of elapsed time.
    pub min_distance_km: f64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self { max_speed_kmh: 900.0, min_distance_km: 50.0 }
    }
}

/// Scheduled red-team harness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedTeamConfig {
    /// Whether the scheduled harness runs at all.
    pub enabled: bool,
    /// Interval between runs in seconds.
    pub interval_secs: u64,
}

impl Default for RedTeamConfig {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 3600 }
    }
}

/// Top-level configuration for the security core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Production mode: insecure defaults abort startup.
    pub production: bool,
    /// Hex-encoded master secret. Only set via environment, never persisted.
    #[serde(skip)]
    master_secret_hex: Option<String>,
    /// Optional external key vault.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultConfig>,
    /// Hosts outbound requests may target.
    pub ssrf_allowed_hosts: Vec<String>,
    /// Base domain whose subdomains name tenants (e.g. `atrium.example`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_base_domain: Option<String>,
    /// Honeypot credential pairs.
    pub honeypot_credentials: Vec<HoneypotCredential>,
    /// Canary sentinel values.
    pub canary_values: Vec<String>,
    /// Decoy key identifiers.
    pub decoy_key_ids: Vec<String>,
    /// Region codes considered high risk for first-ever logins.
    pub high_risk_regions: Vec<String>,
    /// Rate-limit tiers.
    pub rate_limits: RateLimitTiers,
    /// Token lifetimes.
    pub token: TokenConfig,
    /// Key-rotation period.
    pub rotation: RotationConfig,
    /// Event-log buffering and sink.
    pub event_log: EventLogConfig,
    /// Alert dispatch.
    pub alerts: AlertConfig,
    /// Geo-anomaly thresholds.
    pub geo: GeoConfig,
    /// Red-team schedule.
    pub red_team: RedTeamConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            production: false,
            master_secret_hex: None,
            vault: None,
            ssrf_allowed_hosts: Vec::new(),
            tenant_base_domain: None,
            honeypot_credentials: Vec::new(),
            canary_values: Vec::new(),
            decoy_key_ids: Vec::new(),
            high_risk_regions: Vec::new(),
            rate_limits: RateLimitTiers::default(),
            token: TokenConfig::default(),
            rotation: RotationConfig::default(),
            event_log: EventLogConfig::default(),
            alerts: AlertConfig::default(),
            geo: GeoConfig::default(),
            red_team: RedTeamConfig::default(),
        }
    }
}

impl SecurityConfig {
    /// Build from environment variables only.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file, then overlay environment variables.
    ///
    /// The master secret is never read from the file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: SecurityConfig =
            toml::from_str(&raw).map_err(|e| SecurityError::Config(e.to_string()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables onto the current values.
    fn apply_env(&mut self) {
        if let Ok(v) = env::var("SECURITY_PRODUCTION") {
            self.production = matches!(v.as_str(), "1" | "true" | "yes");
        }

        match env::var(MASTER_SECRET_ENV) {
            Ok(secret) => self.master_secret_hex = Some(secret),
            Err(_) if !self.production && self.master_secret_hex.is_none() => {
                warn!("{} not set, using development master secret", MASTER_SECRET_ENV);
                self.master_secret_hex = Some(DEV_MASTER_SECRET.to_string());
            }
            Err(_) => {}
        }

        if let (Ok(endpoint), Ok(token), Ok(key_ref)) = (
            env::var("SECURITY_VAULT_ENDPOINT"),
            env::var("SECURITY_VAULT_TOKEN"),
            env::var("SECURITY_VAULT_KEY_REF"),
        ) {
            self.vault = Some(VaultConfig { endpoint, token, key_ref });
        }

        if let Ok(hosts) = env::var("SECURITY_SSRF_ALLOWED_HOSTS") {
            self.ssrf_allowed_hosts = split_list(&hosts);
        }

        if let Ok(pairs) = env::var("SECURITY_HONEYPOT_CREDENTIALS") {
            self.honeypot_credentials = pairs
                .split(',')
                .filter_map(|p| {
                    let (user, pass) = p.split_once(':')?;
                    Some(HoneypotCredential {
                        username: user.to_string(),
                        password: pass.to_string(),
                    })
                })
                .collect();
        }

        if let Ok(values) = env::var("SECURITY_CANARY_VALUES") {
            self.canary_values = split_list(&values);
        }

        if let Ok(ids) = env::var("SECURITY_DECOY_KEY_IDS") {
            self.decoy_key_ids = split_list(&ids);
        }

        if let Ok(regions) = env::var("SECURITY_HIGH_RISK_REGIONS") {
            self.high_risk_regions = split_list(&regions);
        }

        if let Ok(path) = env::var("SECURITY_EVENT_LOG_PATH") {
            self.event_log.path = PathBuf::from(path);
        }
    }

    /// Set the master secret directly (tests, embedded deployments).
    pub fn set_master_secret(&mut self, hex_secret: &str) {
        self.master_secret_hex = Some(hex_secret.to_string());
    }

    /// Decode the master secret into key bytes.
    pub fn master_key(&self) -> Result<[u8; 32]> {
        let hex_secret = self
            .master_secret_hex
            .as_deref()
            .ok_or_else(|| SecurityError::Config("master secret is not set".to_string()))?;

        let bytes = hex::decode(hex_secret)
            .map_err(|e| SecurityError::Config(format!("invalid master secret hex: {}", e)))?;

        if bytes.len() != 32 {
            return Err(SecurityError::Config(
                "master secret must be 32 bytes".to_string(),
            ));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    }

    /// Validate the configuration, enforcing production-mode hardening.
    pub fn validate(&self) -> Result<()> {
        if self.production {
            let secret = self.master_secret_hex.as_deref().ok_or_else(|| {
                SecurityError::Config(format!(
                    "production mode requires {} to be set",
                    MASTER_SECRET_ENV
                ))
            })?;

            if INSECURE_SECRETS.contains(&secret) {
                return Err(SecurityError::Config(
                    "master secret is set to an insecure default".to_string(),
                ));
            }

            self.master_key()?;
        } else if self.master_secret_hex.is_some() {
            // Even in development a present secret must decode.
            self.master_key()?;
        }

        for tier in [
            &self.rate_limits.auth,
            &self.rate_limits.api,
            &self.rate_limits.ingest,
            &self.rate_limits.burst,
        ] {
            if tier.max_requests == 0 || tier.window_ms == 0 {
                return Err(SecurityError::Config(
                    "rate-limit tiers require non-zero request count and window".to_string(),
                ));
            }
        }

        if self.token.access_ttl_secs <= 0 || self.token.refresh_ttl_secs <= 0 {
            return Err(SecurityError::Config(
                "token lifetimes must be positive".to_string(),
            ));
        }

        if self.event_log.buffer_capacity == 0 {
            return Err(SecurityError::Config(
                "event-log buffer capacity must be non-zero".to_string(),
            ));
        }

        if self.geo.max_speed_kmh <= 0.0 {
            return Err(SecurityError::Config(
                "geo max speed must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
