//! End-to-end tests driving the composed security controller the way the
//! platform's middleware chain does: login, guarded API traffic, refresh
//! rotation, logout, and an attack sequence that must leave a complete,
//! verifiable event trail.

use std::net::IpAddr;
use std::sync::Arc;

use security::alerting::MemoryChannel;
use security::config::{HoneypotCredential, SecurityConfig};
use security::event_log::{MemorySink, SecurityEventType};
use security::geo::StaticGeoResolver;
use security::request_guard::RequestContext;
use security::session::StaticDirectory;
use security::{SecurityController, SecurityError};

const LONDON_IP: &str = "81.2.69.142";
const NEW_YORK_IP: &str = "72.229.28.185";

fn test_config() -> SecurityConfig {
    let mut config = SecurityConfig::default();
    config.set_master_secret(&hex_key(77));
    config.honeypot_credentials = vec![HoneypotCredential {
        username: "root-backup".to_string(),
        password: "Service2018$".to_string(),
    }];
    config.canary_values = vec!["CANARY-TOKEN-91c2".to_string()];
    config.decoy_key_ids = vec!["decoy-sendgrid".to_string()];
    config.red_team.enabled = false;
    config
}

fn hex_key(byte: u8) -> String {
    hex::encode([byte; 32])
}

fn geo_resolver() -> StaticGeoResolver {
    let mut resolver = StaticGeoResolver::new();
    resolver.insert(LONDON_IP.parse().unwrap(), 51.5074, -0.1278, "GB");
    resolver.insert(NEW_YORK_IP.parse().unwrap(), 40.7128, -74.0060, "US");
    resolver
}

fn build_controller(
    config: SecurityConfig,
) -> (Arc<SecurityController>, Arc<MemorySink>, MemoryChannel) {
    let sink = Arc::new(MemorySink::new());
    let channel = MemoryChannel::new();

    let directory = Arc::new(StaticDirectory::new());
    directory.add_user("ada", "correct-horse", "admin", "acme");
    directory.add_user("grace", "battery-staple", "viewer", "acme");

    let controller = SecurityController::builder(config)
        .directory(directory)
        .geo_resolver(Arc::new(geo_resolver()))
        .event_sink(sink.clone())
        .alert_channel(Box::new(channel.clone()))
        .build()
        .unwrap();
    (controller, sink, channel)
}

fn browser(path: &str, ip: &str) -> RequestContext {
    RequestContext::new("GET", path, ip.parse::<IpAddr>().unwrap())
        .with_header("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0")
        .with_header("accept-language", "en-GB,en;q=0.9")
        .with_header("x-atrium-tenant", "acme")
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let (controller, _sink, _channel) = build_controller(test_config());
    controller.start().await;

    // Login from London.
    let login_ctx = browser("/auth/login", LONDON_IP);
    let pair = controller
        .authenticate_login("ada", "correct-horse", &login_ctx)
        .await
        .unwrap();

    // Guarded API traffic with the access token.
    let api_ctx = browser("/api/projects", LONDON_IP)
        .with_header("authorization", &format!("Bearer {}", pair.access_token));
    let outcome = controller.guard_request(&api_ctx).await.unwrap();
    assert_eq!(outcome.tenant, "acme");
    assert_eq!(outcome.claims.as_ref().unwrap().role, "admin");
    assert!(!outcome.assessment.is_suspicious());

    // Refresh rotates the pair; the old refresh token dies.
    let rotated = controller
        .refresh_session(&pair.refresh_token, &login_ctx)
        .await
        .unwrap();
    assert!(matches!(
        controller.refresh_session(&pair.refresh_token, &login_ctx).await,
        Err(SecurityError::TokenRevoked)
    ));

    // Logout revokes the new access token.
    controller.logout(&rotated.access_token, &login_ctx).await.unwrap();
    let after_logout = browser("/api/projects", LONDON_IP)
        .with_header("authorization", &format!("Bearer {}", rotated.access_token));
    assert!(matches!(
        controller.guard_request(&after_logout).await,
        Err(SecurityError::TokenRevoked)
    ));

    controller.shutdown().await;
    assert_eq!(controller.events.pending().await, 0);
}

#[tokio::test]
async fn test_wrong_password_is_generic() {
    let (controller, _sink, _channel) = build_controller(test_config());

    let err = controller
        .authenticate_login("ada", "wrong-password", &browser("/auth/login", LONDON_IP))
        .await
        .unwrap_err();
    assert!(matches!(err, SecurityError::AuthenticationFailure));

    let unknown = controller
        .authenticate_login("nobody", "whatever", &browser("/auth/login", LONDON_IP))
        .await
        .unwrap_err();
    // Unknown user and wrong password are indistinguishable.
    assert_eq!(err.code(), unknown.code());
}

#[tokio::test]
async fn test_stolen_token_replay_from_other_device() {
    let (controller, _sink, _channel) = build_controller(test_config());

    let pair = controller
        .authenticate_login("ada", "correct-horse", &browser("/auth/login", LONDON_IP))
        .await
        .unwrap();

    // Same token, different device context.
    let attacker_ctx = RequestContext::new("GET", "/api/projects", NEW_YORK_IP.parse().unwrap())
        .with_header("user-agent", "python-requests/2.31")
        .with_header("accept-language", "en-US")
        .with_header("x-atrium-tenant", "acme")
        .with_header("authorization", &format!("Bearer {}", pair.access_token));

    assert!(matches!(
        controller.guard_request(&attacker_ctx).await,
        Err(SecurityError::FingerprintMismatch)
    ));
}

#[tokio::test]
async fn test_attack_sequence_leaves_verifiable_trail() {
    let (controller, sink, channel) = build_controller(test_config());
    controller.start().await;

    // Honeypot login attempt.
    let attack_login = RequestContext::new("POST", "/auth/login", "198.51.100.66".parse().unwrap())
        .with_header("user-agent", "curl/8.5.0");
    assert!(controller
        .authenticate_login("root-backup", "Service2018$", &attack_login)
        .await
        .is_err());

    // Exfiltration-shaped payload carrying a canary marker.
    let exfil = RequestContext::new("GET", "/ingest/collect", "198.51.100.66".parse().unwrap())
        .with_header("user-agent", "curl/8.5.0")
        .with_header("x-atrium-tenant", "acme")
        .with_body(r#"{"dump": "CANARY-TOKEN-91c2"}"#);
    controller.guard_request(&exfil).await.unwrap();

    // Decoy secret probe: looks like success to the attacker.
    let probe = RequestContext::new("GET", "/api/secrets/decoy-sendgrid", "198.51.100.66".parse().unwrap())
        .with_header("user-agent", "curl/8.5.0");
    assert!(controller.decoy_intercept("decoy-sendgrid", &probe).await.is_some());

    controller.shutdown().await;

    let events = sink.events();
    for expected in [
        SecurityEventType::HoneypotTriggered,
        SecurityEventType::CanaryTriggered,
        SecurityEventType::DecoyKeyAccessed,
    ] {
        assert!(
            events.iter().any(|e| e.event_type == expected),
            "missing {:?} in event trail",
            expected
        );
    }

    // The critical trap events reached the alert channel too.
    assert!(channel
        .delivered()
        .iter()
        .any(|e| e.event_type == SecurityEventType::HoneypotTriggered));
}

#[tokio::test]
async fn test_geo_anomaly_logged_but_login_succeeds() {
    let (controller, sink, _channel) = build_controller(test_config());

    let london = browser("/auth/login", LONDON_IP);
    controller
        .authenticate_login("grace", "battery-staple", &london)
        .await
        .unwrap();

    // Second login from across the Atlantic moments later: flagged, not
    // blocked.
    let new_york = browser("/auth/login", NEW_YORK_IP);
    controller
        .authenticate_login("grace", "battery-staple", &new_york)
        .await
        .unwrap();

    controller.events.flush().await.unwrap();
    assert!(sink
        .events()
        .iter()
        .any(|e| e.event_type == SecurityEventType::GeoAnomaly));
}

#[tokio::test]
async fn test_scheduled_red_team_reports_clean() {
    let mut config = test_config();
    config.red_team.enabled = true;
    config.red_team.interval_secs = 3600;
    let (controller, sink, _channel) = build_controller(config);

    controller.start().await;
    // Give the startup red-team run a moment to complete.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    controller.shutdown().await;

    assert!(!sink
        .events()
        .iter()
        .any(|e| e.event_type == SecurityEventType::RedTeamFailure));
}

#[tokio::test]
async fn test_ingest_tier_outlasts_auth_tier() {
    let mut config = test_config();
    config.rate_limits.auth.max_requests = 2;
    config.rate_limits.ingest.max_requests = 50;
    config.rate_limits.burst.max_requests = 1000;
    let (controller, _sink, _channel) = build_controller(config);

    let ip = "203.0.113.200";
    for _ in 0..2 {
        let err = controller
            .authenticate_login("ada", "bad-guess", &browser("/auth/login", ip))
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::AuthenticationFailure));
    }
    // Third guess trips the strict auth tier.
    assert!(matches!(
        controller
            .authenticate_login("ada", "bad-guess", &browser("/auth/login", ip))
            .await,
        Err(SecurityError::RateLimitExceeded { .. })
    ));

    // The permissive ingest tier still accepts traffic from the same IP.
    let ingest = browser("/ingest/collect", ip);
    assert!(controller.guard_request(&ingest).await.is_ok());
}
