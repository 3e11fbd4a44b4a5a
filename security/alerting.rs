//! Alert dispatch
//!
//! Events worth a human's attention enter an async queue consumed by a
//! worker task, so detection never blocks on a slow channel. Severity comes
//! from a fixed per-event-type mapping, and each event type is rate-limited
//! independently so a sustained attack cannot flood the channels.
//!
//! Channel transports (webhook, mail, pager) are operator-configured
//! collaborators implementing [`AlertChannel`]; their endpoints sit outside
//! the SSRF allowlist threat model by design.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::config::AlertConfig;
use crate::error::Result;
use crate::event_log::{SecurityEvent, SecurityEventType, Severity};
use crate::rate_limiter::SlidingWindow;

/// Fixed severity classification per event type.
pub fn severity_for(event_type: SecurityEventType) -> Severity {
    use SecurityEventType::*;
    match event_type {
        HoneypotTriggered | CanaryTriggered | RedTeamFailure => Severity::Critical,
        DecoyKeyAccessed | GeoAnomaly | KeyVaultDegraded => Severity::Error,
        AuthenticationFailed | TokenRevoked | CsrfRejected | SsrfBlocked
        | RateLimitExceeded | IntrusionDetected | RecoveryKitGenerated => Severity::Warning,
        RequestReceived | RequestOutcome | AuthenticationSucceeded | TokenIssued
        | TokenRefreshed | Heartbeat | Shutdown => Severity::Info,
    }
}

/// A notification destination.
pub trait AlertChannel: Send + Sync {
    /// Channel name for logging.
    fn name(&self) -> &str;

    /// Deliver one alert. Failures are logged, not retried here.
    fn deliver(&self, event: &SecurityEvent) -> Result<()>;
}

/// Channel that emits alerts into the tracing output.
pub struct TracingChannel;

impl AlertChannel for TracingChannel {
    fn name(&self) -> &str {
        "tracing"
    }

    fn deliver(&self, event: &SecurityEvent) -> Result<()> {
        match event.severity {
            Severity::Critical | Severity::Error => {
                error!(event_type = ?event.event_type, payload = %event.payload, "security alert")
            }
            _ => warn!(event_type = ?event.event_type, payload = %event.payload, "security alert"),
        }
        Ok(())
    }
}

/// Channel that appends alerts to a JSON-lines file.
pub struct FileChannel {
    path: std::path::PathBuf,
}

impl FileChannel {
    /// Channel writing to `path`.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path: path.to_path_buf() })
    }
}

impl AlertChannel for FileChannel {
    fn name(&self) -> &str {
        "file"
    }

    fn deliver(&self, event: &SecurityEvent) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// In-memory channel for tests and embedded consumers.
#[derive(Clone)]
pub struct MemoryChannel {
    delivered: Arc<std::sync::Mutex<Vec<SecurityEvent>>>,
}

impl MemoryChannel {
    /// Empty channel.
    pub fn new() -> Self {
        Self {
            delivered: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Alerts delivered so far.
    pub fn delivered(&self) -> Vec<SecurityEvent> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of delivered alerts.
    pub fn len(&self) -> usize {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing was delivered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    fn deliver(&self, event: &SecurityEvent) -> Result<()> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Producer half: non-blocking event submission.
pub struct AlertDispatcher {
    tx: mpsc::Sender<SecurityEvent>,
    min_severity: Severity,
    suppressed: Arc<AtomicU64>,
}

impl AlertDispatcher {
    /// Build the dispatcher and its worker. The caller spawns
    /// [`AlertWorker::run`] on the runtime.
    pub fn new(
        config: &AlertConfig,
        channels: Vec<Box<dyn AlertChannel>>,
    ) -> (Self, AlertWorker) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let suppressed = Arc::new(AtomicU64::new(0));

        let dispatcher = Self {
            tx,
            min_severity: config.min_severity,
            suppressed: suppressed.clone(),
        };
        let worker = AlertWorker {
            rx,
            channels,
            per_type: HashMap::new(),
            max_per_type: config.max_per_type_per_minute,
            suppressed,
        };
        (dispatcher, worker)
    }

    /// Submit an event for alerting. Never blocks: a full queue counts the
    /// alert as suppressed (backpressure over loss of the response path).
    pub fn dispatch(&self, event: &SecurityEvent) -> bool {
        if event.severity < self.min_severity {
            return false;
        }

        match self.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = ?event.event_type, "alert queue full, alert suppressed");
                false
            }
        }
    }

    /// Alerts suppressed by rate limiting or queue pressure.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

/// Consumer half: delivers queued alerts to every channel.
pub struct AlertWorker {
    rx: mpsc::Receiver<SecurityEvent>,
    channels: Vec<Box<dyn AlertChannel>>,
    per_type: HashMap<SecurityEventType, SlidingWindow>,
    max_per_type: u32,
    suppressed: Arc<AtomicU64>,
}

impl AlertWorker {
    /// Run until shutdown, then drain whatever is still queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        while let Ok(event) = self.rx.try_recv() {
                            self.handle(event);
                        }
                        break;
                    }
                }
            }
        }
    }

    fn handle(&mut self, event: SecurityEvent) {
        let max_per_type = self.max_per_type as usize;
        let window = self
            .per_type
            .entry(event.event_type)
            .or_insert_with(|| SlidingWindow::new(max_per_type, Duration::from_secs(60)));

        if !window.try_add() {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(event_type = ?event.event_type, "alert rate limit hit, suppressed");
            return;
        }

        for channel in &self.channels {
            if let Err(e) = channel.deliver(&event) {
                warn!(channel = channel.name(), "alert delivery failed: {}", e);
            }
        }
    }
}
