//! Operator and user notifications
//!
//! Components never talk to alerting back-ends directly. They hold an
//! [`EventSink`] and emit [`Notification`]s and audit records through it;
//! [`NotificationManager`] fans notifications out to pluggable
//! [`NotificationSink`]s and a broadcast stream, and owns the
//! [`AuditLog`].

use crate::audit::{AuditEvent, AuditLog, AuditOperation, AuditOutcome};
use crate::types::ResponseTier;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Worth watching
    Advisory,
    /// Degraded service
    Warning,
    /// Needs attention soon
    Critical,
    /// Needs attention now
    Emergency,
}

impl Severity {
    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Advisory => "advisory",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Emergency => "emergency",
        }
    }
}

impl From<ResponseTier> for Severity {
    fn from(tier: ResponseTier) -> Self {
        match tier {
            ResponseTier::Normal => Severity::Info,
            ResponseTier::Caution => Severity::Advisory,
            ResponseTier::Warning => Severity::Warning,
            ResponseTier::Critical => Severity::Critical,
            ResponseTier::Emergency => Severity::Emergency,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert delivered to operators and users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// How urgent
    pub severity: Severity,
    /// Short headline
    pub title: String,
    /// Human-readable body
    pub message: String,
    /// Suggested operator action
    pub action: Option<String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Structured context
    pub context: BTreeMap<String, serde_json::Value>,
}

impl Notification {
    /// Create a notification
    #[must_use]
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            action: None,
            timestamp: Utc::now(),
            context: BTreeMap::new(),
        }
    }

    /// With suggested action
    #[inline]
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// With one context entry
    #[inline]
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Sink delivery failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("sink {sink} failed: {reason}")]
pub struct SinkError {
    /// Sink name
    pub sink: String,
    /// Failure detail
    pub reason: String,
}

/// Destination for notifications (console, log, email, webhook, ...)
pub trait NotificationSink: Send + Sync {
    /// Sink name for diagnostics
    fn name(&self) -> &str;

    /// Deliver one notification
    fn deliver(&self, notification: &Notification) -> Result<(), SinkError>;
}

/// Writes one line per notification to stderr
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    min_severity: Severity,
}

impl ConsoleSink {
    /// Print notifications at or above `min_severity`
    #[inline]
    #[must_use]
    pub fn new(min_severity: Severity) -> Self {
        Self { min_severity }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new(Severity::Advisory)
    }
}

impl NotificationSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn deliver(&self, n: &Notification) -> Result<(), SinkError> {
        if n.severity < self.min_severity {
            return Ok(());
        }
        let mut line = format!(
            "[{}] {} {}: {}",
            n.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            n.severity.as_str().to_uppercase(),
            n.title,
            n.message
        );
        if let Some(action) = &n.action {
            line.push_str(&format!(" (action: {action})"));
        }
        writeln!(std::io::stderr(), "{line}").map_err(|e| SinkError {
            sink: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Emits notifications as structured `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn deliver(&self, n: &Notification) -> Result<(), SinkError> {
        let context = serde_json::to_string(&n.context).unwrap_or_default();
        let action = n.action.as_deref().unwrap_or("");
        match n.severity {
            Severity::Info | Severity::Advisory => tracing::info!(
                target: "warden::notify",
                severity = n.severity.as_str(),
                title = %n.title,
                action,
                context = %context,
                "{}",
                n.message
            ),
            Severity::Warning => tracing::warn!(
                target: "warden::notify",
                severity = n.severity.as_str(),
                title = %n.title,
                action,
                context = %context,
                "{}",
                n.message
            ),
            Severity::Critical | Severity::Emergency => tracing::error!(
                target: "warden::notify",
                severity = n.severity.as_str(),
                title = %n.title,
                action,
                context = %context,
                "{}",
                n.message
            ),
        }
        Ok(())
    }
}

/// Keeps notifications in memory, for polling UIs and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    received: Mutex<Vec<Notification>>,
}

impl MemorySink {
    /// Empty sink
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far
    #[must_use]
    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }

    /// Received notifications at exactly `severity`
    #[must_use]
    pub fn with_severity(&self, severity: Severity) -> Vec<Notification> {
        self.received
            .lock()
            .iter()
            .filter(|n| n.severity == severity)
            .cloned()
            .collect()
    }
}

impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn deliver(&self, n: &Notification) -> Result<(), SinkError> {
        self.received.lock().push(n.clone());
        Ok(())
    }
}

/// Interface components emit through
pub trait EventSink: Send + Sync {
    /// Send a notification
    fn notify(&self, notification: Notification);

    /// Record an audit event
    fn audit(&self, operation: AuditOperation, outcome: AuditOutcome, detail: serde_json::Value);
}

/// Delivery statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifyStats {
    /// Notifications accepted
    pub sent: u64,
    /// Individual sink failures
    pub sink_failures: u64,
}

/// Fan-out of notifications plus the audit log
pub struct NotificationManager {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
    stream: broadcast::Sender<Notification>,
    audit: AuditLog,
    sent: AtomicU64,
    sink_failures: AtomicU64,
}

impl NotificationManager {
    /// Manager with no sinks
    #[must_use]
    pub fn new(audit_capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(256);
        Self {
            sinks: RwLock::new(Vec::new()),
            stream,
            audit: AuditLog::with_capacity(audit_capacity),
            sent: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        }
    }

    /// Manager with the console and tracing sinks
    #[must_use]
    pub fn with_default_sinks(audit_capacity: usize) -> Self {
        let manager = Self::new(audit_capacity);
        manager.add_sink(Arc::new(ConsoleSink::default()));
        manager.add_sink(Arc::new(TracingSink));
        manager
    }

    /// Register a sink
    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().push(sink);
    }

    /// Live notification stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.stream.subscribe()
    }

    /// The audit log
    #[inline]
    #[must_use]
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Delivery statistics
    #[must_use]
    pub fn stats(&self) -> NotifyStats {
        NotifyStats {
            sent: self.sent.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }

    /// Append to the audit log and return the stored event
    pub fn record(
        &self,
        operation: AuditOperation,
        outcome: AuditOutcome,
        detail: serde_json::Value,
    ) -> AuditEvent {
        self.audit.append(operation, outcome, detail)
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl std::fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager")
            .field("sinks", &self.sinks.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl EventSink for NotificationManager {
    fn notify(&self, notification: Notification) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            if let Err(e) = sink.deliver(&notification) {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sink = sink.name(), error = %e, "notification delivery failed");
            }
        }
        // No subscribers is fine.
        let _ = self.stream.send(notification);
    }

    fn audit(&self, operation: AuditOperation, outcome: AuditOutcome, detail: serde_json::Value) {
        self.audit.append(operation, outcome, detail);
    }
}
