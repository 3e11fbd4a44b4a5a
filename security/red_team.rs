//! Scheduled red-team harness
//!
//! Issues synthetic attacks against the live guards — injection bodies,
//! traversal paths, scanner user agents, honeypot credentials, CSRF
//! mismatches, decoy probes, envelope tampering — and records pass/fail per
//! check. A failing check means a defense regressed; the controller turns
//! failures into critical events. Checks are stateless, so overlapping
//! scheduled runs cannot corrupt each other.
//!
//! The harness drives guard components directly rather than the alerting
//! login path, so a healthy run does not page anyone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

use crate::controller::SecurityController;
use crate::error::SecurityError;
use crate::intrusion::IntrusionReason;
use crate::request_guard::RequestContext;

/// Source address the synthetic attacks claim to come from (TEST-NET-1).
const RED_TEAM_IP: &str = "192.0.2.99";

/// One synthetic attack and whether the defense held.
#[derive(Debug, Clone, Serialize)]
pub struct RedTeamCheck {
    /// Check name.
    pub name: &'static str,
    /// True when the defense behaved as required.
    pub passed: bool,
    /// What happened.
    pub detail: String,
}

/// Results of one harness run.
#[derive(Debug, Clone, Serialize)]
pub struct RedTeamReport {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Every check, in execution order.
    pub checks: Vec<RedTeamCheck>,
}

impl RedTeamReport {
    /// Checks whose defense regressed.
    pub fn failures(&self) -> Vec<&RedTeamCheck> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    /// Number of passing checks.
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// Whether every defense held.
    pub fn passed_all(&self) -> bool {
        self.failures().is_empty()
    }
}

/// The harness itself. Stateless; every run builds its own attack contexts.
pub struct RedTeamHarness;

impl RedTeamHarness {
    /// Attack the live guards once.
    pub async fn run(controller: &SecurityController) -> RedTeamReport {
        let source: IpAddr = RED_TEAM_IP.parse().expect("static test-net address");
        let mut checks = Vec::new();

        // Injection signatures must classify.
        let sqli_ctx = RequestContext::new("POST", "/api/search", source)
            .with_header("user-agent", "Mozilla/5.0")
            .with_body("username=' OR '1'='1");
        let assessment = controller.intrusion.assess(&sqli_ctx);
        checks.push(check(
            "sql-injection-classified",
            assessment.reasons().contains(&IntrusionReason::SqlInjection),
            format!("score {}", assessment.score),
        ));

        let traversal_ctx = RequestContext::new("GET", "/files/../../etc/passwd", source)
            .with_header("user-agent", "Mozilla/5.0");
        let assessment = controller.intrusion.assess(&traversal_ctx);
        checks.push(check(
            "path-traversal-classified",
            assessment.reasons().contains(&IntrusionReason::PathTraversal),
            format!("score {}", assessment.score),
        ));

        let scanner_ctx = RequestContext::new("GET", "/", source)
            .with_header("user-agent", "sqlmap/1.7.2#stable");
        let assessment = controller.intrusion.assess(&scanner_ctx);
        checks.push(check(
            "scanner-ua-classified",
            assessment
                .reasons()
                .contains(&IntrusionReason::ScannerUserAgent),
            format!("score {}", assessment.score),
        ));

        // Clean traffic must stay clean, or the classifier is crying wolf.
        let clean_ctx = RequestContext::new("GET", "/api/widgets?page=2", source)
            .with_header("user-agent", "Mozilla/5.0 (X11; Linux x86_64)")
            .with_body(r#"{"name": "quarterly report"}"#);
        let assessment = controller.intrusion.assess(&clean_ctx);
        checks.push(check(
            "clean-request-not-flagged",
            !assessment.is_suspicious(),
            format!("score {}", assessment.score),
        ));

        // Honeypot credentials must trip the trap.
        let login_ctx = RequestContext::new("POST", "/auth/login", source)
            .with_header("user-agent", "Mozilla/5.0");
        match controller.config().honeypot_credentials.first() {
            Some(trap) => {
                let trigger = controller
                    .deception
                    .check_credentials(&trap.username, &trap.password, &login_ctx)
                    .await;
                checks.push(check(
                    "honeypot-credential-trips",
                    trigger.is_some(),
                    format!("username {}", trap.username),
                ));
            }
            None => checks.push(check(
                "honeypot-credential-trips",
                true,
                "no honeypot credentials configured".to_string(),
            )),
        }

        // Canary markers must be spotted in a payload.
        match controller.config().canary_values.first() {
            Some(marker) => {
                let payload = format!("{{\"export\": \"{}\"}}", marker);
                let triggers = controller.deception.scan_payload(&payload, &login_ctx).await;
                checks.push(check(
                    "canary-marker-detected",
                    !triggers.is_empty(),
                    format!("{} trigger(s)", triggers.len()),
                ));
            }
            None => checks.push(check(
                "canary-marker-detected",
                true,
                "no canary values configured".to_string(),
            )),
        }

        // Decoy keys must answer like real ones.
        match controller.config().decoy_key_ids.first() {
            Some(key_id) => {
                let first = controller.deception.open_or_decoy(key_id, &login_ctx).await;
                let second = controller.deception.open_or_decoy(key_id, &login_ctx).await;
                let passed = match (&first, &second) {
                    (Some(a), Some(b)) => !a.is_empty() && a == b,
                    _ => false,
                };
                checks.push(check(
                    "decoy-key-answers-plausibly",
                    passed,
                    format!("key {}", key_id),
                ));
            }
            None => checks.push(check(
                "decoy-key-answers-plausibly",
                true,
                "no decoy keys configured".to_string(),
            )),
        }

        // Mismatched double-submit tokens must be rejected.
        let csrf_ctx = RequestContext::new("POST", "/settings", source)
            .with_cookie(&controller.csrf.cookie_name, "legitimate-token")
            .with_header(&controller.csrf.header_name, "forged-token");
        checks.push(check(
            "csrf-mismatch-rejected",
            matches!(
                controller.csrf.check(&csrf_ctx),
                Err(SecurityError::CsrfMismatch)
            ),
            "double-submit mismatch".to_string(),
        ));

        // A tampered envelope must fail closed.
        let tamper_result = controller
            .rotating_keys
            .seal(b"red-team probe")
            .map(|mut envelope| {
                let last = envelope.ciphertext.len() - 1;
                envelope.ciphertext[last] ^= 0x01;
                controller.rotating_keys.open(&envelope)
            });
        let passed = matches!(
            tamper_result,
            Ok(Err(SecurityError::DecryptionFailure))
        );
        checks.push(check(
            "tampered-envelope-fails-closed",
            passed,
            "single bit flip".to_string(),
        ));

        RedTeamReport {
            started_at: Utc::now(),
            checks,
        }
    }
}

fn check(name: &'static str, passed: bool, detail: String) -> RedTeamCheck {
    RedTeamCheck { name, passed, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HoneypotCredential, SecurityConfig};
    use crate::event_log::MemorySink;
    use std::sync::Arc;

    fn controller() -> Arc<SecurityController> {
        let mut config = SecurityConfig::default();
        config.set_master_secret(&hex::encode([33u8; 32]));
        config.honeypot_credentials = vec![HoneypotCredential {
            username: "svc-backup".to_string(),
            password: "Winter2020!".to_string(),
        }];
        config.canary_values = vec!["CANARY-d41d".to_string()];
        config.decoy_key_ids = vec!["decoy-aws-key".to_string()];
        config.red_team.enabled = false;

        SecurityController::builder(config)
            .event_sink(Arc::new(MemorySink::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthy_controller_passes_all_checks() {
        let controller = controller();
        let report = RedTeamHarness::run(&controller).await;

        assert!(report.passed_all(), "failures: {:?}", report.failures());
        assert_eq!(report.passed_count(), report.checks.len());
    }

    #[tokio::test]
    async fn test_unconfigured_traps_are_not_failures() {
        let mut config = SecurityConfig::default();
        config.set_master_secret(&hex::encode([33u8; 32]));
        config.red_team.enabled = false;

        let controller = SecurityController::builder(config)
            .event_sink(Arc::new(MemorySink::new()))
            .build()
            .unwrap();

        let report = RedTeamHarness::run(&controller).await;
        assert!(report.passed_all());
    }

    #[tokio::test]
    async fn test_overlapping_runs_tolerated() {
        let controller = controller();
        let (a, b) = tokio::join!(
            RedTeamHarness::run(&controller),
            RedTeamHarness::run(&controller)
        );
        assert!(a.passed_all());
        assert!(b.passed_all());
    }

    #[tokio::test]
    async fn test_run_via_controller_emits_nothing_when_healthy() {
        let sink = Arc::new(MemorySink::new());
        let mut config = SecurityConfig::default();
        config.set_master_secret(&hex::encode([33u8; 32]));
        config.red_team.enabled = false;

        let controller = SecurityController::builder(config)
            .event_sink(sink.clone())
            .build()
            .unwrap();

        let report = controller.run_red_team().await;
        assert!(report.passed_all());

        controller.events.flush().await.unwrap();
        assert!(!sink
            .events()
            .iter()
            .any(|e| e.event_type == crate::event_log::SecurityEventType::RedTeamFailure));
    }
}
