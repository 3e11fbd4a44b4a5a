//! Tiered rate limiting
//!
//! Three tiers with very different budgets: strict and IP-keyed for
//! authentication, generous and principal-keyed for authenticated API
//! traffic, very permissive for public ingestion. A universal sub-second
//! burst bucket runs before any tier so no source can machine-gun the
//! process regardless of tier budget.
//!
//! Counters are process-local; multi-instance deployments must externalize
//! them behind the same interface into a shared store.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RateLimitTiers;

/// Rate-limit tiers, keyed differently per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateTier {
    /// Authentication endpoints, keyed by source IP.
    Auth,
    /// Authenticated API traffic, keyed by principal.
    Api,
    /// Public ingestion, keyed by source IP.
    Ingest,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request allowed.
    Allowed,
    /// Request denied.
    Denied {
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
}

/// Token bucket used for the sub-second burst cap.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, tokens: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn time_until_ready(&self, required: f64) -> Duration {
        if self.tokens >= required {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((required - self.tokens) / self.refill_rate)
        }
    }
}

/// Sliding window over request timestamps. The request at the window's
/// maximum is allowed; the next one is denied.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    timestamps: Vec<Instant>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindow {
    pub(crate) fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Vec::with_capacity(max_requests.min(1024)),
            max_requests,
            window,
        }
    }

    pub(crate) fn try_add(&mut self) -> bool {
        let now = Instant::now();
        let cutoff = now - self.window;
        self.timestamps.retain(|&ts| ts > cutoff);

        if self.timestamps.len() < self.max_requests {
            self.timestamps.push(now);
            true
        } else {
            false
        }
    }

    pub(crate) fn time_until_ready(&self) -> Duration {
        if self.timestamps.len() < self.max_requests {
            Duration::ZERO
        } else {
            let oldest = self.timestamps[0];
            (oldest + self.window).saturating_duration_since(Instant::now())
        }
    }
}

#[derive(Debug)]
struct TierEntry {
    window: SlidingWindow,
    last_access: Instant,
}

#[derive(Debug)]
struct BurstEntry {
    bucket: TokenBucket,
    last_access: Instant,
}

/// Multi-tier rate limiter plus universal burst cap.
pub struct TieredRateLimiter {
    tiers: RateLimitTiers,
    windows: RwLock<HashMap<(RateTier, String), TierEntry>>,
    bursts: RwLock<HashMap<IpAddr, BurstEntry>>,
}

impl TieredRateLimiter {
    /// Limiter over the configured tier budgets.
    pub fn new(tiers: RateLimitTiers) -> Self {
        Self {
            tiers,
            windows: RwLock::new(HashMap::new()),
            bursts: RwLock::new(HashMap::new()),
        }
    }

    /// Universal sub-second burst check, keyed by source address. Runs
    /// before any tier.
    pub async fn check_burst(&self, source: IpAddr) -> RateLimitResult {
        let limit = self.tiers.burst;
        let mut bursts = self.bursts.write().await;
        let entry = bursts.entry(source).or_insert_with(|| BurstEntry {
            bucket: TokenBucket::new(
                limit.max_requests as f64,
                limit.max_requests as f64 / limit.window().as_secs_f64(),
            ),
            last_access: Instant::now(),
        });
        entry.last_access = Instant::now();

        if entry.bucket.try_consume(1.0) {
            RateLimitResult::Allowed
        } else {
            let retry_after = entry.bucket.time_until_ready(1.0);
            warn!(%source, "burst cap exceeded");
            RateLimitResult::Denied { retry_after }
        }
    }

    /// Check a tier for a key (IP string or principal, per tier).
    pub async fn check(&self, tier: RateTier, key: &str) -> RateLimitResult {
        let limit = match tier {
            RateTier::Auth => self.tiers.auth,
            RateTier::Api => self.tiers.api,
            RateTier::Ingest => self.tiers.ingest,
        };

        let mut windows = self.windows.write().await;
        let entry = windows
            .entry((tier, key.to_string()))
            .or_insert_with(|| TierEntry {
                window: SlidingWindow::new(limit.max_requests as usize, limit.window()),
                last_access: Instant::now(),
            });
        entry.last_access = Instant::now();

        if entry.window.try_add() {
            RateLimitResult::Allowed
        } else {
            let retry_after = entry.window.time_until_ready();
            warn!(?tier, key, "rate limit exceeded");
            RateLimitResult::Denied { retry_after }
        }
    }

    /// Drop entries idle longer than `max_age`.
    pub async fn cleanup(&self, max_age: Duration) {
        let cutoff = Instant::now() - max_age;

        let mut windows = self.windows.write().await;
        windows.retain(|_, entry| entry.last_access > cutoff);

        let mut bursts = self.bursts.write().await;
        bursts.retain(|_, entry| entry.last_access > cutoff);

        info!(
            "rate limiter cleanup: {} tier keys, {} burst sources",
            windows.len(),
            bursts.len()
        );
    }

    /// Spawn the periodic cleanup task. Exits on shutdown.
    pub fn start_cleanup_task(
        self: Arc<Self>,
        interval: Duration,
        max_age: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.cleanup(max_age).await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
