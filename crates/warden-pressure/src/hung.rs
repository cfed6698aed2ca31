//! Hung-operation monitor
//!
//! Keeps the registry of in-flight operations and, on every sweep, stops
//! the ones that outlived their class budget. Strategies are tried in
//! order and the first success wins:
//! 1. cooperative cancel
//! 2. forced termination
//! 3. connection reset
//!
//! An operation that survives all three stays registered and flagged and
//! is retried on the next sweep. Callers holding an [`OperationTicket`]
//! observe a stopped operation as cancelled.

use crate::controller::OperationCanceller;
use crate::sampler::ActiveOperationSource;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::{
    ConnectionId, EngineSlot, EventSink, MaintenanceLock, Notification, OperationClass,
    OperationId, Severity, TimeoutConfig, TrackedOperation, WardenError,
};

/// Ways of stopping an operation, in escalation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStrategy {
    /// Engine-native cancel
    Cancel,
    /// Forced termination
    ForceTerminate,
    /// Reset of the owning connection
    ResetConnection,
}

impl StopStrategy {
    /// Escalation order
    pub const ALL: [StopStrategy; 3] = [
        StopStrategy::Cancel,
        StopStrategy::ForceTerminate,
        StopStrategy::ResetConnection,
    ];

    /// Stable name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            StopStrategy::Cancel => "cancel",
            StopStrategy::ForceTerminate => "force_terminate",
            StopStrategy::ResetConnection => "reset_connection",
        }
    }
}

/// One strategy attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
    /// Strategy tried
    pub strategy: StopStrategy,
    /// Whether it worked
    pub success: bool,
    /// Engine error when it did not
    pub error: Option<String>,
}

/// What happened to one overdue operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HungOutcome {
    /// The operation
    pub operation: TrackedOperation,
    /// Age when handled
    pub age: Duration,
    /// Attempts in order
    pub attempts: Vec<StrategyAttempt>,
    /// Strategy that stopped it, if any
    pub resolved_by: Option<StopStrategy>,
}

impl HungOutcome {
    /// Error describing an operation that could not be stopped
    #[must_use]
    pub fn to_error(&self) -> Option<WardenError> {
        if self.resolved_by.is_some() {
            return None;
        }
        Some(WardenError::OperationHung {
            id: self.operation.id.clone(),
            age_secs: self.age.as_secs(),
        })
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Sweep did not run because recovery held the engine
    pub skipped: bool,
    /// Operations registered when the sweep started
    pub checked: usize,
    /// Overdue operations handled
    pub outcomes: Vec<HungOutcome>,
}

impl SweepReport {
    /// Operations still flagged after the sweep
    #[must_use]
    pub fn unresolved(&self) -> usize {
        self.outcomes.iter().filter(|o| o.resolved_by.is_none()).count()
    }
}

/// Monitor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    /// Operations registered
    pub registered: u64,
    /// Operations completed normally
    pub completed: u64,
    /// Overdue operations stopped
    pub stopped: u64,
    /// Sweeps in which an operation could not be stopped
    pub failed_stops: u64,
}

/// Handle returned to the caller of a tracked operation
#[derive(Debug)]
pub struct OperationTicket {
    id: OperationId,
    class: OperationClass,
    cancelled: watch::Receiver<bool>,
}

impl OperationTicket {
    /// Operation identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    /// Budget class
    #[inline]
    #[must_use]
    pub fn class(&self) -> OperationClass {
        self.class
    }

    /// Whether the monitor stopped this operation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the monitor stops this operation; pends forever otherwise
    pub async fn cancelled(&mut self) {
        loop {
            if *self.cancelled.borrow_and_update() {
                return;
            }
            if self.cancelled.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug)]
struct Entry {
    operation: TrackedOperation,
    cancel: watch::Sender<bool>,
    flagged: bool,
}

/// Registry and sweeper of in-flight operations
pub struct HungOperationMonitor {
    engine: EngineSlot,
    timeouts: TimeoutConfig,
    events: Arc<dyn EventSink>,
    maintenance: MaintenanceLock,
    registry: DashMap<OperationId, Entry>,
    registered: AtomicU64,
    completed: AtomicU64,
    stopped: AtomicU64,
    failed_stops: AtomicU64,
}

impl HungOperationMonitor {
    /// Monitor with the given class budgets
    #[must_use]
    pub fn new(engine: EngineSlot, timeouts: TimeoutConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            engine,
            timeouts,
            events,
            maintenance: MaintenanceLock::new(),
            registry: DashMap::new(),
            registered: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
            failed_stops: AtomicU64::new(0),
        }
    }

    /// Share a maintenance lock
    #[inline]
    #[must_use]
    pub fn with_maintenance(mut self, maintenance: MaintenanceLock) -> Self {
        self.maintenance = maintenance;
        self
    }

    /// Track a new operation started now
    pub fn register(&self, class: OperationClass, connection: ConnectionId) -> OperationTicket {
        let id = OperationId::generate();
        // A fresh ULID cannot collide with a registered one.
        self.insert(TrackedOperation {
            id,
            class,
            start_time: Utc::now(),
            connection_id: connection,
        })
    }

    /// Track an operation with a caller-chosen id and start time
    pub fn begin(&self, operation: TrackedOperation) -> Result<OperationTicket, WardenError> {
        if self.registry.contains_key(&operation.id) {
            return Err(WardenError::OperationAlreadyActive(operation.id));
        }
        Ok(self.insert(operation))
    }

    fn insert(&self, operation: TrackedOperation) -> OperationTicket {
        let (cancel, cancelled) = watch::channel(false);
        let ticket = OperationTicket {
            id: operation.id.clone(),
            class: operation.class,
            cancelled,
        };
        tracing::debug!(operation_id = %operation.id, class = operation.class.as_str(), "operation registered");
        self.registry.insert(
            operation.id.clone(),
            Entry {
                operation,
                cancel,
                flagged: false,
            },
        );
        self.registered.fetch_add(1, Ordering::Relaxed);
        ticket
    }

    /// Remove a finished operation
    pub fn complete(&self, id: &OperationId) -> Option<TrackedOperation> {
        let (_, entry) = self.registry.remove(id)?;
        self.completed.fetch_add(1, Ordering::Relaxed);
        Some(entry.operation)
    }

    /// Operations in flight
    #[must_use]
    pub fn active(&self) -> Vec<TrackedOperation> {
        self.registry.iter().map(|e| e.operation.clone()).collect()
    }

    /// Operations that survived every strategy
    #[must_use]
    pub fn flagged(&self) -> Vec<TrackedOperation> {
        self.registry
            .iter()
            .filter(|e| e.flagged)
            .map(|e| e.operation.clone())
            .collect()
    }

    /// Number of operations in flight
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether nothing is in flight
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            registered: self.registered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
            failed_stops: self.failed_stops.load(Ordering::Relaxed),
        }
    }

    /// Sweep against the wall clock
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the time were `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let Some(_shared) = self.maintenance.try_shared() else {
            tracing::debug!("engine under maintenance, skipping hung-operation sweep");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        };
        let checked = self.registry.len();
        let overdue: Vec<TrackedOperation> = self
            .registry
            .iter()
            .filter(|e| e.operation.age(now) > self.timeouts.budget(e.operation.class))
            .map(|e| e.operation.clone())
            .collect();

        let mut outcomes = Vec::with_capacity(overdue.len());
        for operation in overdue {
            outcomes.push(self.stop(operation, now).await);
        }
        SweepReport {
            skipped: false,
            checked,
            outcomes,
        }
    }

    async fn stop(&self, operation: TrackedOperation, now: DateTime<Utc>) -> HungOutcome {
        let age = operation.age(now);
        let engine = self.engine.current();
        let mut attempts = Vec::with_capacity(StopStrategy::ALL.len());
        let mut resolved_by = None;

        for strategy in StopStrategy::ALL {
            let result = match strategy {
                StopStrategy::Cancel => engine.cancel(&operation.id).await,
                StopStrategy::ForceTerminate => engine.force_terminate(&operation.id).await,
                StopStrategy::ResetConnection => engine.reset_connection(operation.connection_id).await,
            };
            match result {
                Ok(()) => {
                    tracing::info!(
                        operation_id = %operation.id,
                        strategy = strategy.as_str(),
                        age_secs = age.as_secs(),
                        "hung operation stopped"
                    );
                    attempts.push(StrategyAttempt {
                        strategy,
                        success: true,
                        error: None,
                    });
                    resolved_by = Some(strategy);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        operation_id = %operation.id,
                        strategy = strategy.as_str(),
                        error = %e,
                        "stop strategy failed"
                    );
                    attempts.push(StrategyAttempt {
                        strategy,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let outcome = HungOutcome {
            operation,
            age,
            attempts,
            resolved_by,
        };
        self.settle(&outcome);
        outcome
    }

    fn settle(&self, outcome: &HungOutcome) {
        let op = &outcome.operation;
        let detail = json!({
            "operationId": op.id,
            "class": op.class,
            "connection": op.connection_id.to_string(),
            "ageSecs": outcome.age.as_secs(),
            "attempts": &outcome.attempts,
        });

        if let Some(strategy) = outcome.resolved_by {
            if let Some((_, entry)) = self.registry.remove(&op.id) {
                let _ = entry.cancel.send(true);
            }
            self.stopped.fetch_add(1, Ordering::Relaxed);
            self.events.audit(AuditOperation::HungOperation, AuditOutcome::Success, detail);
            self.events.notify(
                Notification::new(
                    Severity::Warning,
                    "Hung operation stopped",
                    format!(
                        "{} operation {} ran {}s and was stopped by {}",
                        op.class,
                        op.id,
                        outcome.age.as_secs(),
                        strategy.as_str()
                    ),
                )
                .with_context("operationId", op.id.as_str()),
            );
        } else {
            if let Some(mut entry) = self.registry.get_mut(&op.id) {
                entry.flagged = true;
            }
            self.failed_stops.fetch_add(1, Ordering::Relaxed);
            self.events.audit(AuditOperation::HungOperation, AuditOutcome::Failure, detail);
            self.events.notify(
                Notification::new(
                    Severity::Critical,
                    "Hung operation could not be stopped",
                    format!(
                        "{} operation {} has run {}s; cancel, terminate and connection reset all failed",
                        op.class,
                        op.id,
                        outcome.age.as_secs()
                    ),
                )
                .with_action("Retrying on the next sweep; inspect the engine if this persists")
                .with_context("operationId", op.id.as_str()),
            );
        }
    }
}

impl ActiveOperationSource for HungOperationMonitor {
    fn active_count(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait::async_trait]
impl OperationCanceller for HungOperationMonitor {
    async fn cancel_older_than(&self, age: Duration) -> usize {
        let now = Utc::now();
        let old: Vec<TrackedOperation> = self
            .registry
            .iter()
            .filter(|e| e.operation.age(now) > age)
            .map(|e| e.operation.clone())
            .collect();
        let mut stopped = 0;
        for operation in old {
            if self.stop(operation, now).await.resolved_by.is_some() {
                stopped += 1;
            }
        }
        stopped
    }
}

impl std::fmt::Debug for HungOperationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HungOperationMonitor")
            .field("active", &self.registry.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
