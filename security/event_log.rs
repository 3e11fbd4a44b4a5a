//! Security-event log
//!
//! Every guard and detector produces [`SecurityEvent`]s; this module buffers
//! them in memory, deduplicates by a stable per-event fingerprint, and
//! flushes on a timer or when the buffer fills. A failed flush re-queues the
//! batch rather than dropping it. The file sink is append-only JSON lines
//! with a SHA-256 hash chain so tampering is detectable after the fact.
//!
//! Request-received and request-outcome are separate events joined by a
//! correlation id, so an aborted request still leaves a complete record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::EventLogConfig;
use crate::error::{Result, SecurityError};

/// Event severity, ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine traffic.
    Info,
    /// Worth attention.
    Warning,
    /// A defense rejected something.
    Error,
    /// Active compromise indicators.
    Critical,
}

/// Everything the security core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    /// A request entered the guard pipeline.
    RequestReceived,
    /// The guard pipeline finished for a request.
    RequestOutcome,
    /// A login or token check failed.
    AuthenticationFailed,
    /// A login succeeded.
    AuthenticationSucceeded,
    /// A token pair was issued.
    TokenIssued,
    /// A refresh token was rotated.
    TokenRefreshed,
    /// A token was revoked.
    TokenRevoked,
    /// Double-submit CSRF check failed.
    CsrfRejected,
    /// An outbound destination was blocked.
    SsrfBlocked,
    /// A rate-limit tier or the burst cap rejected a request.
    RateLimitExceeded,
    /// A honeypot credential pair was used.
    HoneypotTriggered,
    /// A canary value reappeared in a payload.
    CanaryTriggered,
    /// A decoy key was looked up.
    DecoyKeyAccessed,
    /// Intrusion signatures matched a request.
    IntrusionDetected,
    /// Impossible travel or high-risk-region login.
    GeoAnomaly,
    /// Key wrapping degraded to the local fallback.
    KeyVaultDegraded,
    /// A recovery kit was generated.
    RecoveryKitGenerated,
    /// The red-team harness found a defense regression.
    RedTeamFailure,
    /// Liveness heartbeat.
    Heartbeat,
    /// Orderly shutdown.
    Shutdown,
}

/// The common currency produced by every guard and detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Unique event id.
    pub id: Uuid,
    /// What happened.
    pub event_type: SecurityEventType,
    /// Fixed severity for the event type.
    pub severity: Severity,
    /// Source address, when the event has one.
    pub source_ip: Option<IpAddr>,
    /// Device fingerprint, when known.
    pub fingerprint: Option<String>,
    /// Joins request-received with request-outcome.
    pub correlation_id: Option<Uuid>,
    /// Structured evidence.
    pub payload: serde_json::Value,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// New event with the fixed severity for its type.
    pub fn new(event_type: SecurityEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity: crate::alerting::severity_for(event_type),
            source_ip: None,
            fingerprint: None,
            correlation_id: None,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attach the source address.
    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Attach the device fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: &str) -> Self {
        self.fingerprint = Some(fingerprint.to_string());
        self
    }

    /// Attach the correlation id.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach structured evidence.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Stable fingerprint for deduplication: type, source, correlation and
    /// payload, but not id or timestamp, so repeats of the same fact
    /// collapse. Correlated events stay distinct per request — a request's
    /// received/outcome trail is never thinned by dedup.
    pub fn dedup_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", self.event_type));
        if let Some(ip) = &self.source_ip {
            hasher.update(ip.to_string());
        }
        if let Some(correlation_id) = &self.correlation_id {
            hasher.update(correlation_id.as_bytes());
        }
        hasher.update(self.payload.to_string());
        hex::encode(hasher.finalize())
    }
}

/// Destination for flushed event batches. The platform's storage layer owns
/// the real persistence; [`FileSink`] and [`MemorySink`] ship in-process.
pub trait EventSink: Send + Sync {
    /// Append a batch atomically enough that a failure can be retried.
    fn append(&self, batch: &[SecurityEvent]) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct ChainedRecord {
    previous_hash: String,
    hash: String,
    event: SecurityEvent,
}

impl ChainedRecord {
    fn compute_hash(previous_hash: &str, event: &SecurityEvent) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(previous_hash.as_bytes());
        hasher.update(serde_json::to_string(event)?.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Append-only JSON-lines sink with a SHA-256 hash chain.
pub struct FileSink {
    path: PathBuf,
    state: std::sync::Mutex<FileSinkState>,
}

struct FileSinkState {
    file: File,
    last_hash: String,
}

impl FileSink {
    /// Open (or create) the sink file and recover the chain tail.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let last_hash = Self::read_last_hash(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            state: std::sync::Mutex::new(FileSinkState { file, last_hash }),
        })
    }

    fn read_last_hash(path: &Path) -> Result<String> {
        if !path.exists() {
            return Ok(String::new());
        }

        let reader = BufReader::new(File::open(path)?);
        match reader.lines().last() {
            Some(line) => {
                let record: ChainedRecord = serde_json::from_str(&line?)?;
                Ok(record.hash)
            }
            None => Ok(String::new()),
        }
    }

    /// Walk the chain from the start and verify every link.
    pub fn verify_integrity(&self) -> Result<bool> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut previous_hash = String::new();

        for (i, line) in reader.lines().enumerate() {
            let record: ChainedRecord = serde_json::from_str(&line?)?;

            if record.previous_hash != previous_hash {
                return Err(SecurityError::Internal(format!(
                    "event log hash chain broken at line {}",
                    i + 1
                )));
            }
            if record.hash != ChainedRecord::compute_hash(&record.previous_hash, &record.event)? {
                return Err(SecurityError::Internal(format!(
                    "event log record tampered at line {}",
                    i + 1
                )));
            }

            previous_hash = record.hash;
        }

        Ok(true)
    }
}

impl EventSink for FileSink {
    fn append(&self, batch: &[SecurityEvent]) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut out = String::new();
        let mut last_hash = state.last_hash.clone();
        for event in batch {
            let hash = ChainedRecord::compute_hash(&last_hash, event)?;
            let record = ChainedRecord {
                previous_hash: last_hash,
                hash: hash.clone(),
                event: event.clone(),
            };
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
            last_hash = hash;
        }

        state.file.write_all(out.as_bytes())?;
        state.file.flush()?;
        state.last_hash = last_hash;
        Ok(())
    }
}

/// In-memory sink for tests and embedded consumers, with a failure switch
/// to exercise the re-queue path.
pub struct MemorySink {
    events: std::sync::Mutex<Vec<SecurityEvent>>,
    fail: AtomicBool,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Make subsequent appends fail (or succeed again).
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of everything appended so far.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of appended events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemorySink {
    fn append(&self, batch: &[SecurityEvent]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SecurityError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sink unavailable",
            )));
        }
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(batch);
        Ok(())
    }
}

/// Buffered, deduplicating event log.
pub struct SecurityEventLog {
    config: EventLogConfig,
    sink: Arc<dyn EventSink>,
    buffer: Mutex<Vec<SecurityEvent>>,
    seen: Mutex<HashSet<String>>,
    duplicates_dropped: AtomicU64,
}

impl SecurityEventLog {
    /// Log over a sink.
    pub fn new(config: EventLogConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            buffer: Mutex::new(Vec::new()),
            seen: Mutex::new(HashSet::new()),
            duplicates_dropped: AtomicU64::new(0),
        }
    }

    /// Record an event. Returns false when it was filtered by severity or
    /// deduplicated. Triggers a flush when the buffer is full; a flush
    /// failure keeps the events buffered.
    pub async fn record(&self, event: SecurityEvent) -> bool {
        if event.severity < self.config.min_severity {
            return false;
        }

        let fingerprint = event.dedup_fingerprint();
        {
            let mut seen = self.seen.lock().await;
            if !seen.insert(fingerprint) {
                self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(event);
            buffer.len() >= self.config.buffer_capacity
        };

        if should_flush {
            if let Err(e) = self.flush().await {
                warn!("event flush failed, batch re-queued: {}", e);
            }
        }
        true
    }

    /// Flush the buffer to the sink. On failure the batch goes back to the
    /// front of the buffer, in order.
    pub async fn flush(&self) -> Result<usize> {
        let batch: Vec<SecurityEvent> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };

        if batch.is_empty() {
            return Ok(0);
        }

        match self.sink.append(&batch) {
            Ok(()) => {
                self.seen.lock().await.clear();
                Ok(batch.len())
            }
            Err(e) => {
                let mut buffer = self.buffer.lock().await;
                let flushed_len = batch.len();
                let mut requeued = batch;
                requeued.extend(buffer.drain(..));
                *buffer = requeued;
                error!("event sink append failed ({} events held)", flushed_len);
                Err(e)
            }
        }
    }

    /// Events currently buffered.
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Duplicates dropped since startup.
    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped.load(Ordering::Relaxed)
    }

    /// Spawn the timer flush task. Flushes once more on shutdown.
    pub fn start_flush_task(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval = std::time::Duration::from_secs(self.config.flush_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush().await {
                            warn!("scheduled event flush failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let _ = self.flush().await;
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn config(capacity: usize) -> EventLogConfig {
        EventLogConfig {
            path: PathBuf::from("/dev/null"),
            buffer_capacity: capacity,
            flush_interval_secs: 3600,
            min_severity: Severity::Info,
        }
    }

    fn intrusion_event() -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::IntrusionDetected)
            .with_source_ip("203.0.113.5".parse().unwrap())
            .with_payload(json!({"reason": "SQL_INJECTION"}))
    }

    #[tokio::test]
    async fn test_identical_events_deduplicate() {
        let sink = Arc::new(MemorySink::new());
        let log = SecurityEventLog::new(config(100), sink.clone());

        assert!(log.record(intrusion_event()).await);
        assert!(!log.record(intrusion_event()).await);

        assert_eq!(log.pending().await, 1);
        assert_eq!(log.duplicates_dropped(), 1);
    }

    #[tokio::test]
    async fn test_flush_delivers_and_resets_window() {
        let sink = Arc::new(MemorySink::new());
        let log = SecurityEventLog::new(config(100), sink.clone());

        log.record(intrusion_event()).await;
        assert_eq!(log.flush().await.unwrap(), 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(log.pending().await, 0);

        // Same fact after a flush is a new buffer window.
        assert!(log.record(intrusion_event()).await);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues() {
        let sink = Arc::new(MemorySink::new());
        let log = SecurityEventLog::new(config(100), sink.clone());

        log.record(intrusion_event()).await;
        sink.set_fail(true);
        assert!(log.flush().await.is_err());
        assert_eq!(log.pending().await, 1);
        assert!(sink.is_empty());

        sink.set_fail(false);
        assert_eq!(log.flush().await.unwrap(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_full_triggers_flush() {
        let sink = Arc::new(MemorySink::new());
        let log = SecurityEventLog::new(config(2), sink.clone());

        log.record(SecurityEvent::new(SecurityEventType::RequestReceived)).await;
        log.record(SecurityEvent::new(SecurityEventType::RequestOutcome)).await;

        assert_eq!(log.pending().await, 0);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_min_severity_filter() {
        let sink = Arc::new(MemorySink::new());
        let mut cfg = config(100);
        cfg.min_severity = Severity::Critical;
        let log = SecurityEventLog::new(cfg, sink);

        assert!(!log.record(SecurityEvent::new(SecurityEventType::RequestReceived)).await);
        assert!(log.record(SecurityEvent::new(SecurityEventType::HoneypotTriggered)).await);
    }

    #[tokio::test]
    async fn test_file_sink_chain_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        let sink = FileSink::new(&path).unwrap();

        let events: Vec<SecurityEvent> = (0..4)
            .map(|i| {
                SecurityEvent::new(SecurityEventType::RequestReceived)
                    .with_payload(json!({"seq": i}))
            })
            .collect();
        sink.append(&events).unwrap();

        assert!(sink.verify_integrity().unwrap());

        // Chain survives reopening (append picks up the old tail).
        let reopened = FileSink::new(&path).unwrap();
        reopened
            .append(&[SecurityEvent::new(SecurityEventType::Heartbeat)])
            .unwrap();
        assert!(reopened.verify_integrity().unwrap());
    }

    #[tokio::test]
    async fn test_file_sink_detects_tampering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        let sink = FileSink::new(&path).unwrap();

        let event = SecurityEvent::new(SecurityEventType::HoneypotTriggered)
            .with_payload(json!({"username": "alpha"}));
        sink.append(&[event]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replace("alpha", "omega")).unwrap();

        assert!(sink.verify_integrity().is_err());
    }

    #[test]
    fn test_dedup_fingerprint_ignores_id_and_time() {
        let a = intrusion_event();
        let b = intrusion_event();
        assert_ne!(a.id, b.id);
        assert_eq!(a.dedup_fingerprint(), b.dedup_fingerprint());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }
}
