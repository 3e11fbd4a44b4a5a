//! Security core for the Atrium platform
//!
//! Defense-in-depth services protecting the administrative control plane
//! and the public ingestion endpoints:
//! - AES-256-GCM envelope encryption with rotating period keys
//! - Key wrapping (external vault or tagged local fallback) and
//!   split-share disaster recovery
//! - Fingerprinted session tokens with rotation-on-refresh and revocation
//! - CSRF, SSRF and markup-sanitization guards, tenant resolution
//! - Tiered rate limiting with a universal burst cap
//! - Active deception: honeypot credentials, canary values, decoy secrets
//! - Intrusion classification, impossible-travel detection
//! - Buffered, deduplicated, tamper-evident security-event log
//! - Queued multi-channel alerting with per-event-type rate limits
//! - A composition root and a scheduled red-team self-test harness
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    SecurityController                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ burst → CSRF → canary → tenant → auth → detectors            │
//! ├──────────────┬──────────────────┬────────────────────────────┤
//! │ Encryption   │ Sessions         │ Detection                  │
//! │ PeriodKeys   │ RateLimiter      │ Deception                  │
//! │ KeyVault     │ Request guards   │ Geo anomalies              │
//! │ KeyBackup    │ Sanitizer        │ EventLog → Alerts          │
//! └──────────────┴──────────────────┴────────────────────────────┘
//! ```
//!
//! Route handlers, business persistence and outbound integrations are
//! external collaborators: they consume [`SecurityController::guard_request`]
//! and the trait seams ([`session::PrincipalDirectory`],
//! [`key_vault::VaultTransport`], [`geo::GeoResolver`],
//! [`event_log::EventSink`], [`alerting::AlertChannel`]).
//!
//! # Usage
//!
//! ```rust,no_run
//! use security::{SecurityConfig, SecurityController};
//! use security::request_guard::RequestContext;
//!
//! # async fn example() -> security::Result<()> {
//! let config = SecurityConfig::from_env()?;
//! let controller = SecurityController::builder(config).build()?;
//! controller.start().await;
//!
//! let ctx = RequestContext::new("GET", "/api/widgets", "203.0.113.7".parse().unwrap())
//!     .with_header("user-agent", "Mozilla/5.0")
//!     .with_header("x-atrium-tenant", "acme");
//!
//! match controller.guard_request(&ctx).await {
//!     Ok(_outcome) => { /* hand off to the route handler */ }
//!     Err(e) => { let _body = e.to_wire(); /* terminate the request */ }
//! }
//!
//! controller.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod alerting;
pub mod config;
pub mod controller;
pub mod deception;
pub mod encryption;
pub mod error;
pub mod event_log;
pub mod geo;
pub mod intrusion;
pub mod key_backup;
pub mod key_rotation;
pub mod key_vault;
pub mod rate_limiter;
pub mod red_team;
pub mod request_guard;
pub mod sanitizer;
pub mod session;

// Re-exports for convenience
pub use config::SecurityConfig;
pub use controller::{GuardOutcome, Heartbeat, SecurityController};
pub use encryption::{EncryptedEnvelope, EncryptionService};
pub use error::{Result, SecurityError};
pub use event_log::{SecurityEvent, SecurityEventLog, SecurityEventType, Severity};
pub use intrusion::{IntrusionAssessment, IntrusionDetector, IntrusionReason};
pub use key_rotation::{RotatingKeyService, RotationPeriod};
pub use rate_limiter::{RateLimitResult, RateTier, TieredRateLimiter};
pub use red_team::{RedTeamHarness, RedTeamReport};
pub use session::{Claims, TokenPair, TokenService};
