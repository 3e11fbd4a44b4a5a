//! Deception layer
//!
//! Stateless pattern matchers over a static trap list plus an append-only
//! trigger log. Honeypot credentials always fail the login and fire a
//! critical trigger; canary values fire whenever they reappear in a payload;
//! decoy keys return a deterministic fake secret so the probe cannot tell it
//! found a trap. Matching semantics are deliberately literal: exact and
//! case-sensitive for credentials and key ids, case-sensitive substring for
//! canaries.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::HoneypotCredential;
use crate::request_guard::RequestContext;

/// What a trap gets to inspect.
#[derive(Debug, Clone, Copy)]
pub enum Observation<'a> {
    /// A credential pair presented at login.
    Credentials {
        /// Presented username.
        username: &'a str,
        /// Presented password.
        password: &'a str,
    },
    /// An inbound or outbound payload body.
    Payload(&'a str),
}

/// Which trap fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "trap")]
pub enum TrapKind {
    /// A honeypot credential pair was used.
    Honeypot {
        /// The trap username that matched.
        username: String,
    },
    /// A canary marker reappeared.
    Canary {
        /// The marker that matched.
        marker: String,
    },
    /// A decoy key was opened.
    DecoyKey {
        /// The decoy key id.
        key_id: String,
    },
}

/// Immutable evidence record created on trap match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapTrigger {
    /// Trigger id.
    pub id: Uuid,
    /// Which trap fired.
    pub kind: TrapKind,
    /// Source of the triggering request.
    pub source_ip: IpAddr,
    /// Full evidence for the incident record.
    pub evidence: serde_json::Value,
    /// When the trap fired.
    pub timestamp: DateTime<Utc>,
}

/// A registered trap. New trap types plug in here without touching call
/// sites.
pub trait Trap: Send + Sync {
    /// Trap name for logging.
    fn name(&self) -> &'static str;

    /// Check one observation; one trigger per match occurrence.
    fn check(&self, observation: &Observation<'_>, ctx: &RequestContext) -> Vec<TrapTrigger>;
}

/// Credential honeypot: exact, case-sensitive match on both fields.
pub struct HoneypotTrap {
    credentials: Vec<HoneypotCredential>,
}

impl HoneypotTrap {
    /// Trap over the configured credential list.
    pub fn new(credentials: Vec<HoneypotCredential>) -> Self {
        Self { credentials }
    }
}

impl Trap for HoneypotTrap {
    fn name(&self) -> &'static str {
        "honeypot"
    }

    fn check(&self, observation: &Observation<'_>, ctx: &RequestContext) -> Vec<TrapTrigger> {
        let (username, password) = match observation {
            Observation::Credentials { username, password } => (*username, *password),
            _ => return Vec::new(),
        };

        let matched = self
            .credentials
            .iter()
            .any(|c| c.username == username && c.password == password);
        if !matched {
            return Vec::new();
        }

        vec![TrapTrigger {
            id: Uuid::new_v4(),
            kind: TrapKind::Honeypot {
                username: username.to_string(),
            },
            source_ip: ctx.source_ip,
            evidence: serde_json::json!({
                "username": username,
                "path": ctx.path,
                "user_agent": ctx.header("user-agent"),
            }),
            timestamp: Utc::now(),
        }]
    }
}

/// Canary sentinel values: case-sensitive substring scan, one trigger per
/// occurrence.
pub struct CanaryTrap {
    markers: Vec<String>,
}

impl CanaryTrap {
    /// Trap over the configured marker list.
    pub fn new(markers: Vec<String>) -> Self {
        Self { markers }
    }
}

impl Trap for CanaryTrap {
    fn name(&self) -> &'static str {
        "canary"
    }

    fn check(&self, observation: &Observation<'_>, ctx: &RequestContext) -> Vec<TrapTrigger> {
        let payload = match observation {
            Observation::Payload(payload) => *payload,
            _ => return Vec::new(),
        };

        let mut triggers = Vec::new();
        for marker in &self.markers {
            if marker.is_empty() {
                continue;
            }
            for (offset, _) in payload.match_indices(marker.as_str()) {
                triggers.push(TrapTrigger {
                    id: Uuid::new_v4(),
                    kind: TrapKind::Canary {
                        marker: marker.clone(),
                    },
                    source_ip: ctx.source_ip,
                    evidence: serde_json::json!({
                        "marker": marker,
                        "offset": offset,
                        "path": ctx.path,
                    }),
                    timestamp: Utc::now(),
                });
            }
        }
        triggers
    }
}

/// Decoy keys: plausible but non-functional secrets. Opening one returns a
/// deterministic fake payload — never an error that would reveal the trap.
pub struct DecoyKeyStore {
    key_ids: HashSet<String>,
}

impl DecoyKeyStore {
    /// Store over the configured decoy key ids.
    pub fn new(key_ids: &[String]) -> Self {
        Self {
            key_ids: key_ids.iter().cloned().collect(),
        }
    }

    /// Exact-match decoy check.
    pub fn is_decoy(&self, key_id: &str) -> bool {
        self.key_ids.contains(key_id)
    }

    /// The fake secret for a decoy id. Deterministic so repeated probes see
    /// a stable value, shaped like a live API key.
    pub fn decoy_payload(&self, key_id: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"atrium-security/decoy/v1");
        hasher.update(key_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("ak_live_{}", &digest[..40]).into_bytes()
    }
}

/// All traps plus the append-only trigger log.
pub struct DeceptionLayer {
    traps: Vec<Box<dyn Trap>>,
    decoys: DecoyKeyStore,
    triggers: RwLock<Vec<TrapTrigger>>,
}

impl DeceptionLayer {
    /// Layer with the standard honeypot and canary traps registered.
    pub fn new(
        honeypots: Vec<HoneypotCredential>,
        canaries: Vec<String>,
        decoy_key_ids: &[String],
    ) -> Self {
        let traps: Vec<Box<dyn Trap>> = vec![
            Box::new(HoneypotTrap::new(honeypots)),
            Box::new(CanaryTrap::new(canaries)),
        ];
        Self {
            traps,
            decoys: DecoyKeyStore::new(decoy_key_ids),
            triggers: RwLock::new(Vec::new()),
        }
    }

    /// Register an additional trap type.
    pub fn register(&mut self, trap: Box<dyn Trap>) {
        self.traps.push(trap);
    }

    /// Run all traps over an observation, recording any triggers.
    pub async fn observe(
        &self,
        observation: Observation<'_>,
        ctx: &RequestContext,
    ) -> Vec<TrapTrigger> {
        let mut fired = Vec::new();
        for trap in &self.traps {
            fired.extend(trap.check(&observation, ctx));
        }

        if !fired.is_empty() {
            self.triggers.write().await.extend(fired.iter().cloned());
        }
        fired
    }

    /// Check a login attempt against the honeypot list.
    pub async fn check_credentials(
        &self,
        username: &str,
        password: &str,
        ctx: &RequestContext,
    ) -> Option<TrapTrigger> {
        self.observe(Observation::Credentials { username, password }, ctx)
            .await
            .into_iter()
            .next()
    }

    /// Scan a payload for canary markers.
    pub async fn scan_payload(&self, payload: &str, ctx: &RequestContext) -> Vec<TrapTrigger> {
        self.observe(Observation::Payload(payload), ctx).await
    }

    /// If `key_id` is a decoy, return its fake payload and silently record
    /// the probe. `None` means the key is real and the caller proceeds to
    /// the actual store.
    pub async fn open_or_decoy(&self, key_id: &str, ctx: &RequestContext) -> Option<Vec<u8>> {
        if !self.decoys.is_decoy(key_id) {
            return None;
        }

        let trigger = TrapTrigger {
            id: Uuid::new_v4(),
            kind: TrapKind::DecoyKey {
                key_id: key_id.to_string(),
            },
            source_ip: ctx.source_ip,
            evidence: serde_json::json!({
                "key_id": key_id,
                "path": ctx.path,
            }),
            timestamp: Utc::now(),
        };
        self.triggers.write().await.push(trigger);

        Some(self.decoys.decoy_payload(key_id))
    }

    /// Snapshot of the append-only trigger log.
    pub async fn triggers(&self) -> Vec<TrapTrigger> {
        self.triggers.read().await.clone()
    }
}
