//! Response controller
//!
//! Owns the [`ControllerState`] of one engine instance and drives the
//! tier-specific remediations:
//! - CAUTION: faster sampling, shorter cleanup interval, advisory notice
//! - WARNING: cooperative cleanup, 30% fewer connections, result capping
//! - CRITICAL: aggressive cleanup, half the connections, FIFO queueing,
//!   memory limit down 20%
//! - EMERGENCY: the relief protocol, verified by a re-sample after a
//!   settle delay
//!
//! Settings are diffed against what is already applied, so a tier can be
//! re-entered any number of times without compounding its changes. Every
//! individual step is best-effort: failures are logged and skipped.

use crate::policy::EscalationPolicy;
use crate::queue::QueryQueue;
use crate::remediation::{OriginalLimits, RemediationPlan};
use crate::sampler::ResourceSampler;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::sql;
use warden_core::{
    Admission, EngineSlot, EventSink, MaintenanceLock, Notification, PressureSample,
    RemediationConfig, ResponseTier, Severity, WardenConfig,
};

/// Cancels operations that have been running too long
#[async_trait::async_trait]
pub trait OperationCanceller: Send + Sync {
    /// Stop every operation older than `age`; returns how many were stopped
    async fn cancel_older_than(&self, age: Duration) -> usize;
}

/// Settings currently applied to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Applied {
    connection_limit: u32,
    memory_limit_bytes: u64,
    result_cap: Option<u64>,
    queueing: bool,
    rejecting: bool,
    spill: bool,
    sampling_speedup: u32,
    cleanup_interval: Duration,
}

impl Applied {
    fn from_plan(plan: &RemediationPlan) -> Self {
        Self {
            connection_limit: plan.connection_limit,
            memory_limit_bytes: plan.memory_limit_bytes,
            result_cap: plan.result_cap,
            queueing: plan.queueing,
            rejecting: plan.rejecting,
            spill: plan.spill,
            sampling_speedup: plan.sampling_speedup,
            cleanup_interval: plan.cleanup_interval,
        }
    }
}

/// Mutable controller state, one per engine instance
#[derive(Debug)]
pub struct ControllerState {
    /// Tier in force
    pub current_tier: ResponseTier,
    /// Time of the last tier change
    pub last_escalation: Option<DateTime<Utc>>,
    /// Limits to restore at NORMAL
    pub original: OriginalLimits,
    applied: Applied,
    relief_failed: bool,
    last_relief: Option<ReliefReport>,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// Tier in force
    pub tier: ResponseTier,
    /// Time of the last tier change
    pub last_escalation: Option<DateTime<Utc>>,
    /// Connection limit applied to the engine
    pub connection_limit: u32,
    /// Memory limit applied to the engine
    pub memory_limit_bytes: u64,
    /// Row cap on SELECT-style queries
    pub result_cap: Option<u64>,
    /// FIFO queueing active
    pub queueing: bool,
    /// New connections refused
    pub rejecting: bool,
    /// Spill settings active
    pub spill: bool,
    /// Last emergency relief did not bring usage under the ceiling
    pub relief_failed: bool,
    /// Routine cleanup interval
    pub cleanup_interval: Duration,
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Scratch tables dropped
    pub dropped_tables: Vec<String>,
    /// Statements that ran successfully
    pub statements_run: usize,
    /// Failed steps with their errors
    pub failures: Vec<String>,
}

impl CleanupReport {
    /// Whether every step succeeded
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One step of the relief protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliefStep {
    /// Step name
    pub name: &'static str,
    /// Whether it succeeded
    pub success: bool,
    /// Outcome detail
    pub detail: String,
}

/// Emergency relief outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReliefReport {
    /// Steps in execution order
    pub steps: Vec<ReliefStep>,
    /// Usage that triggered relief
    pub usage_before: f64,
    /// Usage after the settle delay
    pub usage_after: f64,
    /// Post-relief sample was a replay
    pub stale_after: bool,
    /// Usage fell under the safety ceiling
    pub success: bool,
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Engine is under maintenance; nothing was sampled
    Skipped,
    /// Tier unchanged
    Unchanged {
        /// Tier in force
        tier: ResponseTier,
        /// Sample evaluated
        sample: PressureSample,
    },
    /// Tier changed
    Transitioned {
        /// Previous tier
        from: ResponseTier,
        /// New tier
        to: ResponseTier,
        /// Sample evaluated
        sample: PressureSample,
        /// Present when EMERGENCY was entered
        relief: Option<ReliefReport>,
    },
}

impl TickOutcome {
    /// Tier after the evaluation, if one ran
    #[must_use]
    pub fn tier(&self) -> Option<ResponseTier> {
        match self {
            TickOutcome::Skipped => None,
            TickOutcome::Unchanged { tier, .. } => Some(*tier),
            TickOutcome::Transitioned { to, .. } => Some(*to),
        }
    }

    /// Relief report, if relief ran
    #[must_use]
    pub fn relief(&self) -> Option<&ReliefReport> {
        match self {
            TickOutcome::Transitioned { relief, .. } => relief.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Knob {
    Sampling,
    Connections,
    ResultCap,
    Memory,
    Queue,
    Admission,
    Spill,
}

const KNOBS: [Knob; 7] = [
    Knob::Sampling,
    Knob::Connections,
    Knob::ResultCap,
    Knob::Memory,
    Knob::Queue,
    Knob::Admission,
    Knob::Spill,
];

/// Tiered remediation driver
pub struct ResponseController {
    engine: EngineSlot,
    sampler: Arc<ResourceSampler>,
    policy: EscalationPolicy,
    config: RemediationConfig,
    events: Arc<dyn EventSink>,
    admission: Arc<Admission>,
    maintenance: MaintenanceLock,
    queue: Arc<QueryQueue>,
    canceller: RwLock<Option<Arc<dyn OperationCanceller>>>,
    state: Mutex<ControllerState>,
    tier: AtomicU8,
    status: RwLock<ControllerStatus>,
}

impl ResponseController {
    /// Controller at NORMAL with the configured limits as originals
    #[must_use]
    pub fn new(
        config: &WardenConfig,
        engine: EngineSlot,
        sampler: Arc<ResourceSampler>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let original = OriginalLimits::from_config(config);
        let plan = RemediationPlan::for_tier(ResponseTier::Normal, &original, &config.remediation);
        let applied = Applied::from_plan(&plan);
        let status = ControllerStatus {
            tier: ResponseTier::Normal,
            last_escalation: None,
            connection_limit: applied.connection_limit,
            memory_limit_bytes: applied.memory_limit_bytes,
            result_cap: None,
            queueing: false,
            rejecting: false,
            spill: false,
            relief_failed: false,
            cleanup_interval: applied.cleanup_interval,
        };
        Self {
            engine,
            sampler,
            policy: EscalationPolicy::from_config(config),
            config: config.remediation.clone(),
            events,
            admission: Arc::new(Admission::new()),
            maintenance: MaintenanceLock::new(),
            queue: Arc::new(QueryQueue::new(config.remediation.queue_delay())),
            canceller: RwLock::new(None),
            state: Mutex::new(ControllerState {
                current_tier: ResponseTier::Normal,
                last_escalation: None,
                original,
                applied,
                relief_failed: false,
                last_relief: None,
            }),
            tier: AtomicU8::new(ResponseTier::Normal.value()),
            status: RwLock::new(status),
        }
    }

    /// Share an admission gate
    #[inline]
    #[must_use]
    pub fn with_admission(mut self, admission: Arc<Admission>) -> Self {
        self.admission = admission;
        self
    }

    /// Share a maintenance lock
    #[inline]
    #[must_use]
    pub fn with_maintenance(mut self, maintenance: MaintenanceLock) -> Self {
        self.maintenance = maintenance;
        self
    }

    /// Share a query queue
    #[inline]
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<QueryQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Install the canceller used by emergency relief
    pub fn set_canceller(&self, canceller: Arc<dyn OperationCanceller>) {
        *self.canceller.write() = Some(canceller);
    }

    /// Tier in force, lock-free
    #[inline]
    #[must_use]
    pub fn current_tier(&self) -> ResponseTier {
        ResponseTier::from_value(self.tier.load(Ordering::Acquire))
    }

    /// Status snapshot
    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        self.status.read().clone()
    }

    /// The FIFO queue
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &Arc<QueryQueue> {
        &self.queue
    }

    /// The admission gate
    #[inline]
    #[must_use]
    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    /// Most recent relief report
    pub async fn last_relief(&self) -> Option<ReliefReport> {
        self.state.lock().await.last_relief.clone()
    }

    /// Sample and evaluate once; skipped while recovery holds the engine
    pub async fn tick(&self) -> TickOutcome {
        let Some(_shared) = self.maintenance.try_shared() else {
            tracing::debug!("engine under maintenance, skipping pressure tick");
            return TickOutcome::Skipped;
        };
        let sample = self.sampler.sample().await;
        self.observe(sample).await
    }

    /// Evaluate a sample taken elsewhere
    pub async fn observe(&self, sample: PressureSample) -> TickOutcome {
        let mut state = self.state.lock().await;
        let now = sample.timestamp;
        let current = state.current_tier;
        let target = self.policy.evaluate(&sample, current, state.last_escalation, now);

        if target == current {
            self.apply_plan(&mut state, target, false).await;
            self.publish(&state);
            return TickOutcome::Unchanged {
                tier: current,
                sample,
            };
        }

        let relief = self.transition(&mut state, target, &sample, now).await;
        TickOutcome::Transitioned {
            from: current,
            to: target,
            sample,
            relief,
        }
    }

    async fn transition(
        &self,
        state: &mut ControllerState,
        to: ResponseTier,
        sample: &PressureSample,
        now: DateTime<Utc>,
    ) -> Option<ReliefReport> {
        let from = state.current_tier;
        let usage = sample.usage_percent();
        state.current_tier = to;
        state.last_escalation = Some(now);
        self.tier.store(to.value(), Ordering::Release);

        tracing::info!(
            from = from.as_str(),
            to = to.as_str(),
            usage_percent = usage,
            stale = sample.stale,
            "tier transition"
        );
        self.events.audit(
            AuditOperation::TierTransition,
            AuditOutcome::Success,
            json!({
                "from": from,
                "to": to,
                "usagePercent": usage,
                "stale": sample.stale,
            }),
        );
        self.events.notify(transition_notice(from, to, usage));

        let escalating = to > from;
        if to < ResponseTier::Emergency {
            state.relief_failed = false;
        }

        let relief = if to == ResponseTier::Emergency {
            if from < ResponseTier::Warning {
                self.cleanup_pass(false).await;
            }
            Some(self.relieve(state, usage).await)
        } else {
            self.apply_plan(state, to, !escalating).await;
            if escalating && to >= ResponseTier::Warning && from < ResponseTier::Warning {
                self.cleanup_pass(false).await;
            }
            if escalating && to >= ResponseTier::Critical && from < ResponseTier::Critical {
                self.cleanup_pass(true).await;
            }
            None
        };
        self.publish(state);
        relief
    }

    /// Emergency relief protocol; runs every step regardless of failures
    async fn relieve(&self, state: &mut ControllerState, usage_before: f64) -> ReliefReport {
        let plan = RemediationPlan::for_tier(ResponseTier::Emergency, &state.original, &self.config);
        let mut steps = Vec::with_capacity(6);

        let canceller = self.canceller.read().clone();
        steps.push(match canceller {
            Some(c) => {
                let n = c
                    .cancel_older_than(Duration::from_millis(self.config.long_running_ms))
                    .await;
                ReliefStep {
                    name: "cancel_long_running",
                    success: true,
                    detail: format!("{n} operations stopped"),
                }
            }
            None => ReliefStep {
                name: "cancel_long_running",
                success: true,
                detail: "no operation tracker attached".into(),
            },
        });

        let cleanup = self.cleanup_pass(true).await;
        steps.push(ReliefStep {
            name: "aggressive_cleanup",
            success: cleanup.is_clean(),
            detail: if cleanup.is_clean() {
                format!("dropped {} tables", cleanup.dropped_tables.len())
            } else {
                cleanup.failures.join("; ")
            },
        });

        steps.push(self.knob_step("reduce_memory", state, &plan, Knob::Memory).await);

        let connections = self.apply_knob(state, &plan, Knob::Connections).await;
        let admission = self.apply_knob(state, &plan, Knob::Admission).await;
        steps.push(match connections.and(admission) {
            Ok(_) => ReliefStep {
                name: "reject_connections",
                success: true,
                detail: "new connections refused".into(),
            },
            Err(e) => ReliefStep {
                name: "reject_connections",
                success: false,
                detail: e,
            },
        });

        steps.push(self.knob_step("enable_spill", state, &plan, Knob::Spill).await);

        self.events.notify(
            Notification::new(
                Severity::Emergency,
                "Emergency memory relief",
                format!("memory at {usage_before:.1}%, running emergency relief"),
            )
            .with_action("Reduce workload or add memory; new connections are refused")
            .with_context("usagePercent", usage_before),
        );
        steps.push(ReliefStep {
            name: "notify_operators",
            success: true,
            detail: "emergency notification sent".into(),
        });

        // Remaining knobs (queueing, result cap, sampling).
        self.apply_plan(state, ResponseTier::Emergency, false).await;

        tokio::time::sleep(self.config.relief_settle_delay()).await;
        let after = self.sampler.sample().await;
        let usage_after = after.usage_percent();
        let success = usage_after < self.config.relief_safety_ceiling_percent;

        let report = ReliefReport {
            steps,
            usage_before,
            usage_after,
            stale_after: after.stale,
            success,
        };

        self.events.audit(
            AuditOperation::EmergencyRelief,
            AuditOutcome::from_success(success),
            json!({
                "usageBefore": usage_before,
                "usageAfter": usage_after,
                "steps": &report.steps,
            }),
        );
        if success {
            tracing::info!(usage_before, usage_after, "emergency relief succeeded");
        } else {
            tracing::error!(usage_before, usage_after, "emergency relief failed");
            self.events.notify(
                Notification::new(
                    Severity::Emergency,
                    "Emergency relief failed",
                    format!(
                        "memory still at {usage_after:.1}% after relief (ceiling {:.0}%)",
                        self.config.relief_safety_ceiling_percent
                    ),
                )
                .with_action("Consider cloud fallback or restarting the engine"),
            );
        }
        state.relief_failed = !success;
        state.last_relief = Some(report.clone());
        report
    }

    async fn knob_step(
        &self,
        name: &'static str,
        state: &mut ControllerState,
        plan: &RemediationPlan,
        knob: Knob,
    ) -> ReliefStep {
        match self.apply_knob(state, plan, knob).await {
            Ok(changed) => ReliefStep {
                name,
                success: true,
                detail: if changed { "applied" } else { "already in force" }.into(),
            },
            Err(detail) => ReliefStep {
                name,
                success: false,
                detail,
            },
        }
    }

    /// Bring every setting in line with `tier`'s plan; reverse order when
    /// restoring
    async fn apply_plan(&self, state: &mut ControllerState, tier: ResponseTier, restoring: bool) {
        let plan = RemediationPlan::for_tier(tier, &state.original, &self.config);
        let knobs: Vec<Knob> = if restoring {
            KNOBS.iter().rev().copied().collect()
        } else {
            KNOBS.to_vec()
        };
        for knob in knobs {
            if let Err(e) = self.apply_knob(state, &plan, knob).await {
                tracing::warn!(tier = tier.as_str(), knob = ?knob, error = %e, "remediation step failed");
            }
        }
    }

    /// Apply one setting if it differs; `Ok(true)` when something changed
    async fn apply_knob(
        &self,
        state: &mut ControllerState,
        plan: &RemediationPlan,
        knob: Knob,
    ) -> Result<bool, String> {
        let applied = &mut state.applied;
        match knob {
            Knob::Sampling => {
                if applied.sampling_speedup == plan.sampling_speedup
                    && applied.cleanup_interval == plan.cleanup_interval
                {
                    return Ok(false);
                }
                self.sampler.set_speedup(plan.sampling_speedup);
                applied.sampling_speedup = plan.sampling_speedup;
                applied.cleanup_interval = plan.cleanup_interval;
            }
            Knob::Connections => {
                if applied.connection_limit == plan.connection_limit {
                    return Ok(false);
                }
                self.engine
                    .current()
                    .set_max_connections(plan.connection_limit)
                    .await
                    .map_err(|e| format!("set max connections: {e}"))?;
                tracing::info!(
                    from = applied.connection_limit,
                    to = plan.connection_limit,
                    "connection limit changed"
                );
                applied.connection_limit = plan.connection_limit;
            }
            Knob::ResultCap => {
                if applied.result_cap == plan.result_cap {
                    return Ok(false);
                }
                applied.result_cap = plan.result_cap;
            }
            Knob::Memory => {
                if applied.memory_limit_bytes == plan.memory_limit_bytes {
                    return Ok(false);
                }
                self.engine
                    .current()
                    .set_memory_limit(plan.memory_limit_bytes)
                    .await
                    .map_err(|e| format!("set memory limit: {e}"))?;
                tracing::info!(
                    from = applied.memory_limit_bytes,
                    to = plan.memory_limit_bytes,
                    "memory limit changed"
                );
                applied.memory_limit_bytes = plan.memory_limit_bytes;
            }
            Knob::Queue => {
                if applied.queueing == plan.queueing {
                    return Ok(false);
                }
                self.queue.set_enabled(plan.queueing);
                applied.queueing = plan.queueing;
            }
            Knob::Admission => {
                if applied.rejecting == plan.rejecting {
                    return Ok(false);
                }
                self.admission.set_rejecting(plan.rejecting);
                applied.rejecting = plan.rejecting;
            }
            Knob::Spill => {
                if applied.spill == plan.spill {
                    return Ok(false);
                }
                let statements = if plan.spill {
                    &self.config.spill_statements
                } else {
                    &self.config.spill_reset_statements
                };
                // Marked applied even on failure so the statements are not
                // replayed every tick.
                applied.spill = plan.spill;
                let failures = self.run_statements(statements).await;
                if !failures.is_empty() {
                    return Err(failures.join("; "));
                }
            }
        }
        Ok(true)
    }

    /// Routine cleanup at the current interval; skipped under maintenance
    pub async fn routine_cleanup(&self) -> Option<CleanupReport> {
        let _shared = self.maintenance.try_shared()?;
        let aggressive = self.current_tier() >= ResponseTier::Critical;
        Some(self.cleanup_pass(aggressive).await)
    }

    /// Interval the routine cleanup loop should wait
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        self.status.read().cleanup_interval
    }

    /// Drop scratch tables, then run the cooperative or aggressive statements
    pub async fn cleanup_pass(&self, aggressive: bool) -> CleanupReport {
        let engine = self.engine.current();
        let mut report = CleanupReport::default();

        match engine.list_tables().await {
            Ok(tables) => {
                for table in tables
                    .into_iter()
                    .filter(|t| t.temporary || self.config.is_temp_table(&t.name))
                {
                    let stmt = format!("DROP TABLE IF EXISTS {}", sql::quote_ident(&table.name));
                    match engine.execute(&stmt).await {
                        Ok(_) => report.dropped_tables.push(table.name),
                        Err(e) => report.failures.push(format!("drop {}: {e}", table.name)),
                    }
                }
            }
            Err(e) => report.failures.push(format!("list tables: {e}")),
        }

        let statements = if aggressive {
            &self.config.aggressive_cleanup
        } else {
            &self.config.cooperative_cleanup
        };
        let failures = self.run_statements(statements).await;
        report.statements_run = statements.len() - failures.len();
        report.failures.extend(failures);

        if report.is_clean() {
            tracing::debug!(aggressive, dropped = report.dropped_tables.len(), "cleanup pass finished");
        } else {
            tracing::warn!(aggressive, failures = ?report.failures, "cleanup pass had failures");
        }
        report
    }

    async fn run_statements(&self, statements: &[String]) -> Vec<String> {
        let engine = self.engine.current();
        let mut failures = Vec::new();
        for stmt in statements {
            if let Err(e) = engine.execute(stmt).await {
                failures.push(format!("{stmt}: {e}"));
            }
        }
        failures
    }

    /// Append `LIMIT <cap>` to uncapped SELECT-style queries while capping
    /// is active
    #[must_use]
    pub fn apply_result_cap(&self, query: &str) -> String {
        let Some(cap) = self.status.read().result_cap else {
            return query.to_string();
        };
        if !sql::is_select_like(query) || limit_clause().is_match(query) {
            return query.to_string();
        }
        let trimmed = query.trim_end().trim_end_matches(';').trim_end();
        format!("{trimmed} LIMIT {cap}")
    }

    fn publish(&self, state: &ControllerState) {
        let a = &state.applied;
        *self.status.write() = ControllerStatus {
            tier: state.current_tier,
            last_escalation: state.last_escalation,
            connection_limit: a.connection_limit,
            memory_limit_bytes: a.memory_limit_bytes,
            result_cap: a.result_cap,
            queueing: a.queueing,
            rejecting: a.rejecting,
            spill: a.spill,
            relief_failed: state.relief_failed,
            cleanup_interval: a.cleanup_interval,
        };
    }
}

impl std::fmt::Debug for ResponseController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseController")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn limit_clause() -> &'static Regex {
    static LIMIT: OnceLock<Regex> = OnceLock::new();
    LIMIT.get_or_init(|| Regex::new(r"(?i)\blimit\s+\d+").expect("constant pattern"))
}

fn transition_notice(from: ResponseTier, to: ResponseTier, usage: f64) -> Notification {
    if to < from {
        return Notification::new(
            Severity::Info,
            "Memory pressure easing",
            format!("memory at {usage:.1}%, stepping down from {from} to {to}"),
        )
        .with_context("tier", to.as_str());
    }
    let (title, action) = match to {
        ResponseTier::Normal => ("Memory pressure normal", None),
        ResponseTier::Caution => ("Memory pressure rising", Some("Watch workload growth")),
        ResponseTier::Warning => (
            "High memory pressure",
            Some("Connections reduced and large results capped"),
        ),
        ResponseTier::Critical => (
            "Critical memory pressure",
            Some("Queries are queued; consider stopping heavy jobs"),
        ),
        ResponseTier::Emergency => ("Memory emergency", Some("Emergency relief in progress")),
    };
    let mut n = Notification::new(
        Severity::from(to),
        title,
        format!("memory at {usage:.1}%, tier {from} -> {to}"),
    )
    .with_context("tier", to.as_str());
    if let Some(action) = action {
        n = n.with_action(action);
    }
    n
}
