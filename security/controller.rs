//! Composition root
//!
//! Builds every security service from one [`SecurityConfig`], runs the guard
//! pipeline for inbound requests, and owns the background tasks (event
//! flush, alert worker, rate-limiter cleanup, scheduled red team). Guards
//! run sequentially: burst cap, CSRF, canary scan, tenant resolution, token
//! verification, then the classify-only detectors. Detector findings log
//! and alert but never terminate the request — blocking is the embedding
//! application's policy decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alerting::{AlertChannel, AlertDispatcher, AlertWorker, TracingChannel};
use crate::config::SecurityConfig;
use crate::deception::DeceptionLayer;
use crate::error::{Result, SecurityError};
use crate::event_log::{
    EventSink, FileSink, SecurityEvent, SecurityEventLog, SecurityEventType,
};
use crate::geo::{GeoAnomalyDetector, GeoResolver, NullGeoResolver};
use crate::intrusion::{IntrusionAssessment, IntrusionDetector};
use crate::key_backup::{generate_recovery_kit, RecoveryKit};
use crate::key_rotation::{MasterSecret, RotatingKeyService};
use crate::key_vault::{
    ExternalWrapper, KeyWrapper, LocalFallbackWrapper, VaultTransport, WrapOrigin, WrappedKey,
};
use crate::rate_limiter::{RateLimitResult, RateTier, TieredRateLimiter};
use crate::red_team::{RedTeamHarness, RedTeamReport};
use crate::request_guard::{CsrfGuard, RequestContext, SsrfClearance, SsrfGuard, TenantResolver};
use crate::sanitizer::MarkupSanitizer;
use crate::session::{
    device_fingerprint, Claims, PrincipalDirectory, StaticDirectory, TokenKind, TokenPair,
    TokenService,
};

/// Result of a request passing the guard pipeline.
#[derive(Debug)]
pub struct GuardOutcome {
    /// Joins the request-received and request-outcome events.
    pub correlation_id: Uuid,
    /// The single tenant this request belongs to.
    pub tenant: String,
    /// Verified claims, when a bearer token was presented.
    pub claims: Option<Claims>,
    /// Classify-only intrusion assessment.
    pub assessment: IntrusionAssessment,
}

/// Liveness snapshot, distinct from ordinary traffic.
#[derive(Debug, Serialize)]
pub struct Heartbeat {
    /// Always "ok" when the controller can answer at all.
    pub status: &'static str,
    /// Seconds since construction.
    pub uptime_secs: u64,
    /// Events waiting in the buffer.
    pub buffered_events: usize,
    /// Alerts suppressed by rate limiting or queue pressure.
    pub suppressed_alerts: u64,
    /// True when key wrapping runs on the local fallback.
    pub degraded_key_wrapping: bool,
    /// Crate version.
    pub version: &'static str,
}

/// Builder for [`SecurityController`]. External collaborators (directory,
/// GeoIP, vault transport, alert transports, event persistence) plug in
/// here; anything not supplied degrades to the in-process default.
pub struct SecurityControllerBuilder {
    config: SecurityConfig,
    directory: Option<Arc<dyn PrincipalDirectory>>,
    geo_resolver: Option<Arc<dyn GeoResolver>>,
    event_sink: Option<Arc<dyn EventSink>>,
    alert_channels: Vec<Box<dyn AlertChannel>>,
    vault_transport: Option<Arc<dyn VaultTransport>>,
}

impl SecurityControllerBuilder {
    /// Supply the principal directory.
    pub fn directory(mut self, directory: Arc<dyn PrincipalDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Supply the GeoIP resolver.
    pub fn geo_resolver(mut self, resolver: Arc<dyn GeoResolver>) -> Self {
        self.geo_resolver = Some(resolver);
        self
    }

    /// Supply the event sink.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Add an alert channel.
    pub fn alert_channel(mut self, channel: Box<dyn AlertChannel>) -> Self {
        self.alert_channels.push(channel);
        self
    }

    /// Supply the external vault transport.
    pub fn vault_transport(mut self, transport: Arc<dyn VaultTransport>) -> Self {
        self.vault_transport = Some(transport);
        self
    }

    /// Construct the controller. Fails fast on invalid configuration.
    pub fn build(self) -> Result<Arc<SecurityController>> {
        let config = self.config;
        config.validate()?;

        let master = config.master_key()?;
        let rotating_keys = Arc::new(RotatingKeyService::new(
            MasterSecret::new(master),
            config.rotation.period,
        ));

        let signing_key = rotating_keys.derive_for_purpose("session-token-signing")?;
        let tokens = TokenService::new(&signing_key, &config.token);

        let fallback_wrapper = Arc::new(LocalFallbackWrapper::new(rotating_keys.clone()));
        let (key_wrapper, vault_degraded): (Arc<dyn KeyWrapper>, bool) =
            match (&config.vault, self.vault_transport) {
                (Some(vault), Some(transport)) => (
                    Arc::new(ExternalWrapper::new(transport, vault.key_ref.clone())),
                    false,
                ),
                (Some(_), None) => {
                    warn!("vault configured but no transport supplied, wrapping locally");
                    (fallback_wrapper.clone(), true)
                }
                (None, _) => (fallback_wrapper.clone(), false),
            };

        let sink: Arc<dyn EventSink> = match self.event_sink {
            Some(sink) => sink,
            None => Arc::new(FileSink::new(&config.event_log.path)?),
        };
        let events = Arc::new(SecurityEventLog::new(config.event_log.clone(), sink));

        let mut channels = self.alert_channels;
        if channels.is_empty() {
            channels.push(Box::new(TracingChannel));
        }
        let (alerts, alert_worker) = AlertDispatcher::new(&config.alerts, channels);

        let deception = DeceptionLayer::new(
            config.honeypot_credentials.clone(),
            config.canary_values.clone(),
            &config.decoy_key_ids,
        );

        let geo = GeoAnomalyDetector::new(
            config.geo.clone(),
            self.geo_resolver.unwrap_or_else(|| Arc::new(NullGeoResolver)),
            config.high_risk_regions.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(SecurityController {
            csrf: CsrfGuard::new(),
            ssrf: SsrfGuard::new(&config.ssrf_allowed_hosts),
            tenants: TenantResolver::new(config.tenant_base_domain.clone()),
            sanitizer: MarkupSanitizer::new(),
            rate_limiter: Arc::new(TieredRateLimiter::new(config.rate_limits.clone())),
            intrusion: IntrusionDetector::new(),
            directory: self
                .directory
                .unwrap_or_else(|| Arc::new(StaticDirectory::new())),
            rotating_keys,
            tokens,
            key_wrapper,
            fallback_wrapper,
            vault_degraded,
            deception,
            geo,
            events,
            alerts,
            alert_worker: Mutex::new(Some(alert_worker)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started_at: std::time::Instant::now(),
            config,
        }))
    }
}

/// The security core, fully wired.
pub struct SecurityController {
    config: SecurityConfig,
    /// Period-key derivation.
    pub rotating_keys: Arc<RotatingKeyService>,
    /// Session tokens and revocation.
    pub tokens: TokenService,
    key_wrapper: Arc<dyn KeyWrapper>,
    fallback_wrapper: Arc<LocalFallbackWrapper>,
    vault_degraded: bool,
    directory: Arc<dyn PrincipalDirectory>,
    /// CSRF double-submit guard.
    pub csrf: CsrfGuard,
    /// Outbound destination guard.
    pub ssrf: SsrfGuard,
    /// Tenant resolution.
    pub tenants: TenantResolver,
    /// Markup whitelist sanitizer.
    pub sanitizer: MarkupSanitizer,
    /// Tiered rate limiting.
    pub rate_limiter: Arc<TieredRateLimiter>,
    /// Honeypots, canaries, decoys.
    pub deception: DeceptionLayer,
    /// Signature classifier.
    pub intrusion: IntrusionDetector,
    /// Impossible-travel detection.
    pub geo: GeoAnomalyDetector,
    /// Buffered security-event log.
    pub events: Arc<SecurityEventLog>,
    /// Alert submission.
    pub alerts: AlertDispatcher,
    alert_worker: Mutex<Option<AlertWorker>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: std::time::Instant,
}

impl SecurityController {
    /// The configuration this controller was built from.
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Start building a controller from configuration.
    pub fn builder(config: SecurityConfig) -> SecurityControllerBuilder {
        SecurityControllerBuilder {
            config,
            directory: None,
            geo_resolver: None,
            event_sink: None,
            alert_channels: Vec::new(),
            vault_transport: None,
        }
    }

    /// Record an event and submit it for alerting.
    pub async fn emit(&self, event: SecurityEvent) {
        self.alerts.dispatch(&event);
        self.events.record(event).await;
    }

    /// Spawn the background tasks: event flush, alert worker, rate-limiter
    /// cleanup and (when enabled) the scheduled red team.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        tasks.push(
            self.events
                .clone()
                .start_flush_task(self.shutdown_tx.subscribe()),
        );

        if let Some(worker) = self.alert_worker.lock().await.take() {
            tasks.push(tokio::spawn(worker.run(self.shutdown_tx.subscribe())));
        }

        tasks.push(self.rate_limiter.clone().start_cleanup_task(
            Duration::from_secs(300),
            Duration::from_secs(3600),
            self.shutdown_tx.subscribe(),
        ));

        if self.config.red_team.enabled {
            let controller = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = Duration::from_secs(self.config.red_team.interval_secs.max(1));
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = RedTeamHarness::run(&controller).await;
                            controller.report_red_team(&report).await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        if self.vault_degraded {
            self.emit(
                SecurityEvent::new(SecurityEventType::KeyVaultDegraded)
                    .with_payload(json!({"reason": "vault transport unavailable at startup"})),
            )
            .await;
        }

        info!("security controller started");
    }

    /// Orderly shutdown: flush buffers, drain the alert queue, stop timers.
    pub async fn shutdown(&self) {
        self.emit(SecurityEvent::new(SecurityEventType::Shutdown)).await;
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let _ = self.events.flush().await;
        info!("security controller stopped");
    }

    /// Liveness heartbeat.
    pub async fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            status: "ok",
            uptime_secs: self.started_at.elapsed().as_secs(),
            buffered_events: self.events.pending().await,
            suppressed_alerts: self.alerts.suppressed(),
            degraded_key_wrapping: self.key_wrapper.origin() == WrapOrigin::LocalFallback,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Run the guard pipeline for a request. Always emits a correlated
    /// request-received / request-outcome pair, even when a guard
    /// terminates the request.
    pub async fn guard_request(&self, ctx: &RequestContext) -> Result<GuardOutcome> {
        let correlation_id = Uuid::new_v4();

        self.events
            .record(
                SecurityEvent::new(SecurityEventType::RequestReceived)
                    .with_source_ip(ctx.source_ip)
                    .with_correlation(correlation_id)
                    .with_payload(json!({"method": ctx.method, "path": ctx.path})),
            )
            .await;

        let result = self.run_guards(ctx, correlation_id).await;

        let outcome = match &result {
            Ok(outcome) => json!({"allowed": true, "tenant": outcome.tenant}),
            Err(e) => json!({"allowed": false, "code": e.code()}),
        };
        self.events
            .record(
                SecurityEvent::new(SecurityEventType::RequestOutcome)
                    .with_source_ip(ctx.source_ip)
                    .with_correlation(correlation_id)
                    .with_payload(outcome),
            )
            .await;

        result
    }

    async fn run_guards(
        &self,
        ctx: &RequestContext,
        correlation_id: Uuid,
    ) -> Result<GuardOutcome> {
        // Universal sub-second burst cap, before anything else.
        if let RateLimitResult::Denied { retry_after } =
            self.rate_limiter.check_burst(ctx.source_ip).await
        {
            self.emit(
                SecurityEvent::new(SecurityEventType::RateLimitExceeded)
                    .with_source_ip(ctx.source_ip)
                    .with_correlation(correlation_id)
                    .with_payload(json!({"tier": "burst"})),
            )
            .await;
            return Err(SecurityError::RateLimitExceeded { retry_after });
        }

        if let Err(e) = self.csrf.check(ctx) {
            self.emit(
                SecurityEvent::new(SecurityEventType::CsrfRejected)
                    .with_source_ip(ctx.source_ip)
                    .with_correlation(correlation_id)
                    .with_payload(json!({"path": ctx.path})),
            )
            .await;
            return Err(e);
        }

        // Canary scan over the body: exfiltration-shaped payloads carrying a
        // sentinel fire here. Detection only, never a rejection.
        for trigger in self.deception.scan_payload(&ctx.body, ctx).await {
            self.emit(
                SecurityEvent::new(SecurityEventType::CanaryTriggered)
                    .with_source_ip(ctx.source_ip)
                    .with_correlation(correlation_id)
                    .with_payload(serde_json::to_value(&trigger)?),
            )
            .await;
        }

        // Tenant resolution from host/header; cross-checked against claims
        // after verification.
        let pre_auth_tenant = self.tenants.resolve(ctx, None);

        let claims = match bearer_token(ctx) {
            Some(token) => match self.tokens.verify(token, ctx, TokenKind::Access).await {
                Ok(claims) => Some(claims),
                Err(e) => {
                    self.emit(
                        SecurityEvent::new(SecurityEventType::AuthenticationFailed)
                            .with_source_ip(ctx.source_ip)
                            .with_fingerprint(&device_fingerprint(ctx))
                            .with_correlation(correlation_id)
                            .with_payload(json!({"code": e.code()})),
                    )
                    .await;
                    return Err(e);
                }
            },
            None => None,
        };

        let tenant = match (&claims, pre_auth_tenant) {
            (Some(claims), Ok(tenant)) => {
                if !claims.tenant.eq_ignore_ascii_case(&tenant) {
                    return Err(SecurityError::ValidationFailure(
                        "token tenant does not match request tenant".to_string(),
                    ));
                }
                tenant
            }
            (Some(claims), Err(_)) => claims.tenant.to_lowercase(),
            (None, resolved) => resolved?,
        };

        // Tier budget: strict for auth endpoints, permissive for ingestion,
        // principal-keyed for everything else.
        let (tier, key) = if ctx.path.starts_with("/auth") {
            (RateTier::Auth, ctx.source_ip.to_string())
        } else if ctx.path.starts_with("/ingest") {
            (RateTier::Ingest, ctx.source_ip.to_string())
        } else {
            let key = claims
                .as_ref()
                .map(|c| c.sub.clone())
                .unwrap_or_else(|| ctx.source_ip.to_string());
            (RateTier::Api, key)
        };

        if let RateLimitResult::Denied { retry_after } = self.rate_limiter.check(tier, &key).await {
            self.emit(
                SecurityEvent::new(SecurityEventType::RateLimitExceeded)
                    .with_source_ip(ctx.source_ip)
                    .with_correlation(correlation_id)
                    .with_payload(json!({"tier": format!("{:?}", tier), "key": key})),
            )
            .await;
            return Err(SecurityError::RateLimitExceeded { retry_after });
        }

        // Classify-only detectors: log and alert, never block here.
        let assessment = self.intrusion.assess(ctx);
        if assessment.is_suspicious() {
            self.emit(
                SecurityEvent::new(SecurityEventType::IntrusionDetected)
                    .with_source_ip(ctx.source_ip)
                    .with_fingerprint(&device_fingerprint(ctx))
                    .with_correlation(correlation_id)
                    .with_payload(serde_json::to_value(&assessment)?),
            )
            .await;
        }

        Ok(GuardOutcome {
            correlation_id,
            tenant,
            claims,
            assessment,
        })
    }

    /// Authenticate a login attempt. Honeypot credentials always fail with
    /// the generic error and fire a critical trigger; a successful login is
    /// checked for geo anomalies (which log, not block).
    pub async fn authenticate_login(
        &self,
        username: &str,
        password: &str,
        ctx: &RequestContext,
    ) -> Result<TokenPair> {
        if let RateLimitResult::Denied { retry_after } = self
            .rate_limiter
            .check(RateTier::Auth, &ctx.source_ip.to_string())
            .await
        {
            self.emit(
                SecurityEvent::new(SecurityEventType::RateLimitExceeded)
                    .with_source_ip(ctx.source_ip)
                    .with_payload(json!({"tier": "Auth"})),
            )
            .await;
            return Err(SecurityError::RateLimitExceeded { retry_after });
        }

        if let Some(trigger) = self.deception.check_credentials(username, password, ctx).await {
            self.emit(
                SecurityEvent::new(SecurityEventType::HoneypotTriggered)
                    .with_source_ip(ctx.source_ip)
                    .with_fingerprint(&device_fingerprint(ctx))
                    .with_payload(serde_json::to_value(&trigger)?),
            )
            .await;
            // Indistinguishable from a wrong password.
            return Err(SecurityError::AuthenticationFailure);
        }

        let principal = match self.directory.authenticate(username, password) {
            Some(principal) => principal,
            None => {
                self.emit(
                    SecurityEvent::new(SecurityEventType::AuthenticationFailed)
                        .with_source_ip(ctx.source_ip)
                        .with_fingerprint(&device_fingerprint(ctx))
                        .with_payload(json!({"username": username})),
                )
                .await;
                return Err(SecurityError::AuthenticationFailure);
            }
        };

        if let Some(finding) = self
            .geo
            .observe_login(&principal.username, ctx.source_ip, Utc::now())
            .await
        {
            self.emit(
                SecurityEvent::new(SecurityEventType::GeoAnomaly)
                    .with_source_ip(ctx.source_ip)
                    .with_payload(serde_json::to_value(&finding)?),
            )
            .await;
        }

        let pair = self.tokens.issue_pair(&principal, ctx)?;
        self.emit(
            SecurityEvent::new(SecurityEventType::AuthenticationSucceeded)
                .with_source_ip(ctx.source_ip)
                .with_payload(json!({"username": principal.username, "tenant": principal.tenant})),
        )
        .await;

        Ok(pair)
    }

    /// Rotate a refresh token, re-resolving role and tenant.
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
        ctx: &RequestContext,
    ) -> Result<TokenPair> {
        let pair = self
            .tokens
            .refresh(refresh_token, ctx, self.directory.as_ref())
            .await?;

        self.events
            .record(
                SecurityEvent::new(SecurityEventType::TokenRefreshed)
                    .with_source_ip(ctx.source_ip),
            )
            .await;
        Ok(pair)
    }

    /// Log out: revoke the presented access token.
    pub async fn logout(&self, access_token: &str, ctx: &RequestContext) -> Result<()> {
        let claims = self.tokens.verify(access_token, ctx, TokenKind::Access).await?;
        self.tokens.revoke(&claims).await;

        self.emit(
            SecurityEvent::new(SecurityEventType::TokenRevoked)
                .with_source_ip(ctx.source_ip)
                .with_payload(json!({"username": claims.sub})),
        )
        .await;
        Ok(())
    }

    /// Authorize an outbound destination through the SSRF guard, logging
    /// blocked attempts.
    pub async fn authorize_egress(&self, url: &str, ctx: &RequestContext) -> Result<SsrfClearance> {
        match self.ssrf.check_url(url) {
            Ok(clearance) => Ok(clearance),
            Err(e) => {
                self.emit(
                    SecurityEvent::new(SecurityEventType::SsrfBlocked)
                        .with_source_ip(ctx.source_ip)
                        .with_payload(json!({"url": url, "reason": e.to_string()})),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Intercept a secret lookup. Decoy ids return their fake payload (and
    /// silently log); `None` means the key is real and the caller proceeds
    /// to the actual store.
    pub async fn decoy_intercept(&self, key_id: &str, ctx: &RequestContext) -> Option<Vec<u8>> {
        let payload = self.deception.open_or_decoy(key_id, ctx).await?;

        self.emit(
            SecurityEvent::new(SecurityEventType::DecoyKeyAccessed)
                .with_source_ip(ctx.source_ip)
                .with_payload(json!({"key_id": key_id, "path": ctx.path})),
        )
        .await;
        Some(payload)
    }

    /// Encrypt a sensitive field under the current period key.
    pub fn encrypt_field(&self, plaintext: &[u8]) -> Result<crate::encryption::EncryptedEnvelope> {
        self.rotating_keys.seal(plaintext)
    }

    /// Decrypt a sealed field, whichever period it was sealed in.
    pub fn decrypt_field(&self, envelope: &crate::encryption::EncryptedEnvelope) -> Result<Vec<u8>> {
        self.rotating_keys.open(envelope)
    }

    /// Wrap a data-encryption key. An unreachable vault degrades to the
    /// local fallback (tagged for audit) instead of failing the request.
    pub async fn wrap_key(&self, dek: &[u8]) -> Result<WrappedKey> {
        match self.key_wrapper.wrap(dek) {
            Ok(wrapped) => Ok(wrapped),
            Err(SecurityError::KeyVaultUnavailable(reason)) => {
                self.emit(
                    SecurityEvent::new(SecurityEventType::KeyVaultDegraded)
                        .with_payload(json!({"reason": reason})),
                )
                .await;
                self.fallback_wrapper.wrap(dek)
            }
            Err(e) => Err(e),
        }
    }

    /// Unwrap a wrapped key via whichever wrapper produced it.
    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<Vec<u8>> {
        match wrapped.origin {
            WrapOrigin::External => self.key_wrapper.unwrap(wrapped),
            WrapOrigin::LocalFallback => self.fallback_wrapper.unwrap(wrapped),
        }
    }

    /// Generate a disaster-recovery kit for the master secret.
    pub async fn generate_recovery_kit(&self, shares: u8) -> Result<RecoveryKit> {
        let master = self.config.master_key()?;
        let kit = generate_recovery_kit(&master, shares)?;

        self.emit(
            SecurityEvent::new(SecurityEventType::RecoveryKitGenerated)
                .with_payload(json!({"shares": shares})),
        )
        .await;
        Ok(kit)
    }

    /// Run the red-team harness once, recording any regressions.
    pub async fn run_red_team(self: &Arc<Self>) -> RedTeamReport {
        let report = RedTeamHarness::run(self).await;
        self.report_red_team(&report).await;
        report
    }

    async fn report_red_team(&self, report: &RedTeamReport) {
        for check in report.failures() {
            self.emit(
                SecurityEvent::new(SecurityEventType::RedTeamFailure)
                    .with_payload(json!({"check": check.name, "detail": check.detail})),
            )
            .await;
        }
        info!(
            "red team run: {}/{} checks passed",
            report.passed_count(),
            report.checks.len()
        );
    }
}

fn bearer_token(ctx: &RequestContext) -> Option<&str> {
    ctx.header("authorization")?.strip_prefix("Bearer ")
}
