//! Intrusion detection
//!
//! Independent, additive signature detectors over method, path, body and
//! headers. This module only classifies — blocking is the caller's policy
//! decision. Findings carry the matched evidence so the event log holds
//! enough to investigate without replaying traffic.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::request_guard::RequestContext;

/// Why a request was classified as hostile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntrusionReason {
    /// SQL injection signature.
    SqlInjection,
    /// Markup/script injection signature.
    CrossSiteScripting,
    /// Directory traversal sequence.
    PathTraversal,
    /// Known scanner or attack-tool user agent.
    ScannerUserAgent,
}

impl IntrusionReason {
    fn weight(&self) -> u32 {
        match self {
            IntrusionReason::SqlInjection => 40,
            IntrusionReason::CrossSiteScripting => 30,
            IntrusionReason::PathTraversal => 30,
            IntrusionReason::ScannerUserAgent => 20,
        }
    }
}

/// Where in the request a signature matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingLocation {
    /// Path including query string.
    Path,
    /// Request body.
    Body,
    /// A header, by name.
    Header(String),
}

/// One detector hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrusionFinding {
    /// Classification.
    pub reason: IntrusionReason,
    /// Where the signature matched.
    pub location: FindingLocation,
    /// The matched snippet.
    pub evidence: String,
}

/// All findings for one request, with an additive score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrusionAssessment {
    /// Individual detector hits.
    pub findings: Vec<IntrusionFinding>,
    /// Sum of per-reason weights.
    pub score: u32,
}

impl IntrusionAssessment {
    /// Whether anything matched.
    pub fn is_suspicious(&self) -> bool {
        !self.findings.is_empty()
    }

    /// Distinct reasons across all findings.
    pub fn reasons(&self) -> Vec<IntrusionReason> {
        let mut reasons: Vec<IntrusionReason> =
            self.findings.iter().map(|f| f.reason).collect();
        reasons.sort_by_key(|r| *r as u32);
        reasons.dedup();
        reasons
    }
}

/// Signature-based intrusion classifier.
pub struct IntrusionDetector {
    sql_patterns: Vec<Regex>,
    xss_patterns: Vec<Regex>,
    traversal_patterns: Vec<Regex>,
    scanner_pattern: Regex,
}

impl IntrusionDetector {
    /// Detector with the built-in signature sets.
    pub fn new() -> Self {
        let sql_patterns = vec![
            Regex::new(r"(?i)'\s*(or|and)\s*'").unwrap(),
            Regex::new(r#"(?i)\b(union\s+(all\s+)?select|select\s+.{1,80}\s+from|insert\s+into|delete\s+from|drop\s+table|truncate\s+table)\b"#).unwrap(),
            Regex::new(r"(?i)\b(xp_|sp_)\w+").unwrap(),
            Regex::new(r"(?i)'\s*;\s*--").unwrap(),
        ];

        let xss_patterns = vec![
            Regex::new(r"(?i)(<script|<iframe|<object|<embed|javascript:|onerror\s*=|onload\s*=)")
                .unwrap(),
        ];

        let traversal_patterns = vec![
            Regex::new(r"\.\./|\.\.\\").unwrap(),
            Regex::new(r"(?i)(%2e%2e|\.\.)(%2f|%5c)").unwrap(),
            Regex::new(r"(?i)/etc/(passwd|shadow)|c:\\windows\\").unwrap(),
        ];

        let scanner_pattern = Regex::new(
            r"(?i)(sqlmap|nikto|nmap|masscan|zgrab|dirbuster|gobuster|wfuzz|ffuf|acunetix|nessus|metasploit|hydra)",
        )
        .unwrap();

        Self {
            sql_patterns,
            xss_patterns,
            traversal_patterns,
            scanner_pattern,
        }
    }

    /// Classify a request. Never blocks, never errors.
    pub fn assess(&self, ctx: &RequestContext) -> IntrusionAssessment {
        let mut findings = Vec::new();

        for (location, text) in [
            (FindingLocation::Path, ctx.path.as_str()),
            (FindingLocation::Body, ctx.body.as_str()),
        ] {
            scan(&self.sql_patterns, IntrusionReason::SqlInjection, &location, text, &mut findings);
            scan(
                &self.xss_patterns,
                IntrusionReason::CrossSiteScripting,
                &location,
                text,
                &mut findings,
            );
            scan(
                &self.traversal_patterns,
                IntrusionReason::PathTraversal,
                &location,
                text,
                &mut findings,
            );
        }

        if let Some(ua) = ctx.header("user-agent") {
            if let Some(m) = self.scanner_pattern.find(ua) {
                findings.push(IntrusionFinding {
                    reason: IntrusionReason::ScannerUserAgent,
                    location: FindingLocation::Header("user-agent".to_string()),
                    evidence: truncate(m.as_str()),
                });
            }
        }

        let score = findings.iter().map(|f| f.reason.weight()).sum();
        IntrusionAssessment { findings, score }
    }
}

impl Default for IntrusionDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn scan(
    patterns: &[Regex],
    reason: IntrusionReason,
    location: &FindingLocation,
    text: &str,
    findings: &mut Vec<IntrusionFinding>,
) {
    if text.is_empty() {
        return;
    }
    // One finding per reason per location; additive across locations.
    for pattern in patterns {
        if let Some(m) = pattern.find(text) {
            findings.push(IntrusionFinding {
                reason,
                location: location.clone(),
                evidence: truncate(m.as_str()),
            });
            return;
        }
    }
}

fn truncate(evidence: &str) -> String {
    const MAX: usize = 80;
    if evidence.len() <= MAX {
        evidence.to_string()
    } else {
        let mut end = MAX;
        while !evidence.is_char_boundary(end) {
            end -= 1;
        }
        evidence[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    const IP: &str = "203.0.113.66";

    fn ctx(path: &str, body: &str, ua: &str) -> RequestContext {
        RequestContext::new("POST", path, IP.parse::<IpAddr>().unwrap())
            .with_header("user-agent", ua)
            .with_body(body)
    }

    #[test]
    fn test_classic_sql_injection_is_classified() {
        let detector = IntrusionDetector::new();
        let assessment = detector.assess(&ctx(
            "/api/search",
            "username=' OR '1'='1",
            "Mozilla/5.0",
        ));

        assert!(assessment.is_suspicious());
        assert!(assessment.reasons().contains(&IntrusionReason::SqlInjection));
    }

    #[test]
    fn test_reason_serializes_as_screaming_snake() {
        let json = serde_json::to_string(&IntrusionReason::SqlInjection).unwrap();
        assert_eq!(json, "\"SQL_INJECTION\"");
    }

    #[test]
    fn test_normal_browser_request_is_clean() {
        let detector = IntrusionDetector::new();
        let assessment = detector.assess(&ctx(
            "/api/widgets?page=2&sort=name",
            r#"{"name": "Quarterly report", "tags": ["finance", "2026"]}"#,
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36",
        ));

        assert!(!assessment.is_suspicious());
        assert_eq!(assessment.score, 0);
    }

    #[test]
    fn test_path_traversal_plain_and_encoded() {
        let detector = IntrusionDetector::new();

        let plain = detector.assess(&ctx("/files/../../etc/passwd", "", "Mozilla/5.0"));
        assert!(plain.reasons().contains(&IntrusionReason::PathTraversal));

        let encoded = detector.assess(&ctx("/files/%2e%2e%2fsecrets", "", "Mozilla/5.0"));
        assert!(encoded.reasons().contains(&IntrusionReason::PathTraversal));
    }

    #[test]
    fn test_scanner_user_agent() {
        let detector = IntrusionDetector::new();
        let assessment = detector.assess(&ctx("/", "", "sqlmap/1.7.2#stable"));

        assert!(assessment.reasons().contains(&IntrusionReason::ScannerUserAgent));
        assert!(matches!(
            assessment.findings[0].location,
            FindingLocation::Header(_)
        ));
    }

    #[test]
    fn test_xss_in_body() {
        let detector = IntrusionDetector::new();
        let assessment = detector.assess(&ctx(
            "/api/comments",
            r#"{"text": "<script>document.location='//evil'</script>"}"#,
            "Mozilla/5.0",
        ));

        assert!(assessment.reasons().contains(&IntrusionReason::CrossSiteScripting));
    }

    #[test]
    fn test_scores_are_additive_across_detectors() {
        let detector = IntrusionDetector::new();
        let assessment = detector.assess(&ctx(
            "/files/../../etc/passwd",
            "q=' OR '1'='1",
            "nikto/2.5.0",
        ));

        let reasons = assessment.reasons();
        assert!(reasons.contains(&IntrusionReason::SqlInjection));
        assert!(reasons.contains(&IntrusionReason::PathTraversal));
        assert!(reasons.contains(&IntrusionReason::ScannerUserAgent));
        assert_eq!(assessment.score, 40 + 30 + 20);
    }
}
