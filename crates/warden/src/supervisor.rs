//! Supervisor facade
//!
//! [`Warden`] builds every component from one [`WardenConfig`] around a
//! single engine instance and shares the cross-cutting pieces between them:
//! - one [`EngineSlot`], so fallback re-routing is a single swap
//! - one [`Admission`] gate (pressure rejection and fallback pause)
//! - one [`MaintenanceLock`], held exclusively by crash recovery
//!
//! [`Warden::start`] spawns the periodic loops; [`Warden::execute`] is the
//! protected query path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warden_core::{
    Admission, ConnectionId, EngineAdapter, EngineSlot, MaintenanceLock, MemoryProbe,
    NotificationManager, OperationClass, ProcessMemoryProbe, QueryResult, WardenConfig,
    WardenError, WardenResult,
};
use warden_pressure::{
    ControllerStatus, HungOperationMonitor, ResourceSampler, ResponseController, SweepReport,
    TickOutcome,
};
use warden_recovery::{
    BackendConnector, CloudFallbackManager, CrashRecoveryManager, FallbackSession,
    FallbackTrigger, OperationRollbackManager, OperationStats, RecoveryReport, TriggerInputs,
};

/// Assembles a [`Warden`]
pub struct WardenBuilder {
    config: WardenConfig,
    engine: Arc<dyn EngineAdapter>,
    probe: Option<Arc<dyn MemoryProbe>>,
    connector: Option<Arc<dyn BackendConnector>>,
    events: Option<Arc<NotificationManager>>,
    checkpoint_dir: Option<PathBuf>,
}

impl WardenBuilder {
    /// Builder supervising `engine`
    #[must_use]
    pub fn new(config: WardenConfig, engine: Arc<dyn EngineAdapter>) -> Self {
        Self {
            config,
            engine,
            probe: None,
            connector: None,
            events: None,
            checkpoint_dir: None,
        }
    }

    /// Memory probe; defaults to the process resident set
    #[inline]
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Connector for the alternate backend; without one fallback stays off
    #[inline]
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn BackendConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Notification manager; defaults to console and tracing sinks
    #[inline]
    #[must_use]
    pub fn with_events(mut self, events: Arc<NotificationManager>) -> Self {
        self.events = Some(events);
        self
    }

    /// Directory where operation checkpoints are persisted
    #[inline]
    #[must_use]
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Validate the configuration and wire the components
    pub fn build(self) -> WardenResult<Arc<Warden>> {
        self.config.validate()?;
        let config = self.config;
        let engine = EngineSlot::new(self.engine);
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(NotificationManager::with_default_sinks(config.audit.capacity)));
        let admission = Arc::new(Admission::new());
        let maintenance = MaintenanceLock::new();

        let monitor = Arc::new(
            HungOperationMonitor::new(engine.clone(), config.timeouts.clone(), events.clone())
                .with_maintenance(maintenance.clone()),
        );

        let probe = self.probe.unwrap_or_else(|| Arc::new(ProcessMemoryProbe) as Arc<dyn MemoryProbe>);
        let sampler = Arc::new(ResourceSampler::new(
            probe,
            config.memory_limit_bytes,
            config.sample_interval(),
        ));
        sampler.set_operation_source(monitor.clone());

        let controller = Arc::new(
            ResponseController::new(&config, engine.clone(), sampler.clone(), events.clone())
                .with_admission(admission.clone())
                .with_maintenance(maintenance.clone()),
        );
        controller.set_canceller(monitor.clone());

        let recovery = Arc::new(
            CrashRecoveryManager::new(&config, engine.clone(), events.clone())
                .with_maintenance(maintenance.clone()),
        );

        let fallback = match self.connector {
            Some(connector) if config.cloud_fallback.enabled() => {
                let manager = CloudFallbackManager::new(
                    &config.cloud_fallback,
                    engine.clone(),
                    connector,
                    events.clone(),
                )
                .with_admission(admission.clone());
                manager.set_operation_source(monitor.clone());
                Some(Arc::new(manager))
            }
            Some(_) => {
                tracing::info!("backend connector supplied but no fallback provider configured");
                None
            }
            None => None,
        };

        let mut rollback = OperationRollbackManager::new(engine.clone(), events.clone());
        if let Some(dir) = self.checkpoint_dir {
            rollback = rollback.with_store_dir(dir);
        }

        tracing::info!(
            memory_limit_bytes = config.memory_limit_bytes,
            max_connections = config.max_connections,
            fallback = fallback.is_some(),
            "warden assembled"
        );

        Ok(Arc::new(Warden {
            trigger: FallbackTrigger::from_config(&config.cloud_fallback),
            stats: Arc::new(OperationStats::new(config.cloud_fallback.latency_window)),
            config,
            engine,
            events,
            admission,
            maintenance,
            sampler,
            controller,
            monitor,
            recovery,
            fallback,
            rollback: Arc::new(rollback),
            next_connection: AtomicU32::new(1),
        }))
    }
}

impl std::fmt::Debug for WardenBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenBuilder")
            .field("engine", &self.engine.name())
            .field("probe", &self.probe.is_some())
            .field("connector", &self.connector.is_some())
            .field("checkpoint_dir", &self.checkpoint_dir)
            .finish_non_exhaustive()
    }
}

/// Pressure control and recovery around one engine instance
pub struct Warden {
    config: WardenConfig,
    engine: EngineSlot,
    events: Arc<NotificationManager>,
    admission: Arc<Admission>,
    maintenance: MaintenanceLock,
    sampler: Arc<ResourceSampler>,
    controller: Arc<ResponseController>,
    monitor: Arc<HungOperationMonitor>,
    recovery: Arc<CrashRecoveryManager>,
    fallback: Option<Arc<CloudFallbackManager>>,
    trigger: FallbackTrigger,
    stats: Arc<OperationStats>,
    rollback: Arc<OperationRollbackManager>,
    next_connection: AtomicU32,
}

impl Warden {
    /// Start a builder
    #[must_use]
    pub fn builder(config: WardenConfig, engine: Arc<dyn EngineAdapter>) -> WardenBuilder {
        WardenBuilder::new(config, engine)
    }

    /// Effective configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// The shared engine slot
    #[inline]
    #[must_use]
    pub fn engine(&self) -> &EngineSlot {
        &self.engine
    }

    /// Notifications and audit log
    #[inline]
    #[must_use]
    pub fn events(&self) -> &Arc<NotificationManager> {
        &self.events
    }

    /// Shared admission gate
    #[inline]
    #[must_use]
    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    /// Pressure sampler
    #[inline]
    #[must_use]
    pub fn sampler(&self) -> &Arc<ResourceSampler> {
        &self.sampler
    }

    /// Tier controller
    #[inline]
    #[must_use]
    pub fn controller(&self) -> &Arc<ResponseController> {
        &self.controller
    }

    /// In-flight operation registry
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &Arc<HungOperationMonitor> {
        &self.monitor
    }

    /// Crash recovery
    #[inline]
    #[must_use]
    pub fn recovery(&self) -> &Arc<CrashRecoveryManager> {
        &self.recovery
    }

    /// Cloud fallback, when a provider and connector are configured
    #[inline]
    #[must_use]
    pub fn fallback(&self) -> Option<&Arc<CloudFallbackManager>> {
        self.fallback.as_ref()
    }

    /// Checkpointed operation rollback
    #[inline]
    #[must_use]
    pub fn rollback(&self) -> &Arc<OperationRollbackManager> {
        &self.rollback
    }

    /// Protected-execution statistics
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &Arc<OperationStats> {
        &self.stats
    }

    /// Controller status snapshot
    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        self.controller.status()
    }

    /// Run `query` under admission, maintenance, queueing and hang supervision.
    ///
    /// A query stopped by the hung-operation monitor resolves to
    /// [`WardenError::Cancelled`].
    pub async fn execute(&self, query: &str, class: OperationClass) -> WardenResult<QueryResult> {
        self.admission.check()?;
        let _shared = self.maintenance.shared().await;
        let _permit = self.controller.queue().enter().await;

        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let mut ticket = self.monitor.register(class, connection);
        let id = ticket.id().clone();
        let query = self.controller.apply_result_cap(query);
        let engine = self.engine.current();

        let started = Instant::now();
        let outcome = tokio::select! {
            result = engine.execute(&query) => result.map_err(WardenError::from),
            () = ticket.cancelled() => Err(WardenError::Cancelled),
        };
        let latency = started.elapsed();
        self.monitor.complete(&id);

        match &outcome {
            Ok(_) => self.stats.record_success(latency),
            Err(e) => {
                tracing::debug!(operation_id = %id, error = %e, "protected operation failed");
                self.stats.record_failure(latency);
            }
        }
        self.spawn_fallback_check(self.operation_inputs());
        outcome
    }

    /// One pressure tick; a failed emergency relief is handed to the fallback trigger
    pub async fn tick(&self) -> TickOutcome {
        let outcome = self.controller.tick().await;
        if let Some(relief) = outcome.relief() {
            if !relief.success {
                let inputs = TriggerInputs {
                    usage_after_relief: Some(relief.usage_after),
                    ..self.operation_inputs()
                };
                self.consider_fallback(inputs).await;
            }
        }
        outcome
    }

    /// One hung-operation sweep
    pub async fn sweep(&self) -> SweepReport {
        self.monitor.sweep().await
    }

    /// Probe the engine, recover when it is down, and fall back when recovery is exhausted
    pub async fn health_check(&self) -> Option<RecoveryReport> {
        let report = self.recovery.check_and_recover().await?;
        if !report.success {
            let detail = report
                .to_error()
                .map_or_else(|| "recovery exhausted".to_string(), |e| e.to_string());
            let inputs = TriggerInputs {
                engine_unavailable: Some(detail),
                ..self.operation_inputs()
            };
            self.consider_fallback(inputs).await;
        }
        Some(report)
    }

    /// Activate fallback when the trigger fires; returns the session that is active afterwards
    pub async fn consider_fallback(&self, inputs: TriggerInputs) -> Option<FallbackSession> {
        let reason = self.trigger.evaluate(&inputs)?;
        let Some(fallback) = &self.fallback else {
            tracing::warn!(%reason, "fallback trigger fired without a configured backend");
            return None;
        };
        if fallback.is_active() {
            return fallback.session().await;
        }
        if fallback.activation_failed() {
            tracing::debug!(%reason, "fallback previously failed, not retrying");
            return None;
        }
        match fallback.activate(reason).await {
            Ok(session) => {
                self.stats.reset();
                Some(session)
            }
            Err(e) => {
                tracing::error!(error = %e, "fallback activation failed");
                None
            }
        }
    }

    fn operation_inputs(&self) -> TriggerInputs {
        TriggerInputs {
            average_latency: self.stats.sustained_average(),
            consecutive_failures: self.stats.consecutive_failures(),
            ..TriggerInputs::default()
        }
    }

    fn spawn_fallback_check(&self, inputs: TriggerInputs) {
        let Some(fallback) = &self.fallback else {
            return;
        };
        if fallback.is_active() || fallback.activation_failed() {
            return;
        }
        let Some(reason) = self.trigger.evaluate(&inputs) else {
            return;
        };
        let fallback = fallback.clone();
        let stats = self.stats.clone();
        // Activation drains in-flight work, so it must not run on the caller's path.
        tokio::spawn(async move {
            match fallback.activate(reason).await {
                Ok(_) => stats.reset(),
                Err(e) => tracing::error!(error = %e, "fallback activation failed"),
            }
        });
    }

    /// Spawn the periodic loops
    pub fn start(self: &Arc<Self>) -> WardenHandle {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(4);

        let sampler = self.sampler.clone();
        let warden = self.clone();
        tasks.push(spawn_loop("pressure", rx.clone(), move || sampler.interval(), move || {
            let warden = warden.clone();
            async move {
                warden.tick().await;
            }
        }));

        let period = self.config.hung_operation_sweep();
        let warden = self.clone();
        tasks.push(spawn_loop("hung_sweep", rx.clone(), move || period, move || {
            let warden = warden.clone();
            async move {
                warden.sweep().await;
            }
        }));

        let period = self.config.recovery.health_check_interval();
        let warden = self.clone();
        tasks.push(spawn_loop("health", rx.clone(), move || period, move || {
            let warden = warden.clone();
            async move {
                warden.health_check().await;
            }
        }));

        let controller = self.controller.clone();
        let cleaner = self.controller.clone();
        tasks.push(spawn_loop("cleanup", rx, move || controller.cleanup_interval(), move || {
            let controller = cleaner.clone();
            async move {
                controller.routine_cleanup().await;
            }
        }));

        tracing::info!("warden loops started");
        WardenHandle { shutdown, tasks }
    }
}

impl std::fmt::Debug for Warden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warden")
            .field("engine", &self.engine.current().name())
            .field("tier", &self.controller.current_tier())
            .field("active_operations", &self.monitor.len())
            .field("fallback", &self.fallback.as_ref().map(|f| f.is_active()))
            .finish_non_exhaustive()
    }
}

fn spawn_loop<P, W, F>(
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
    period: P,
    work: W,
) -> JoinHandle<()>
where
    P: Fn() -> Duration + Send + 'static,
    W: Fn() -> F + Send + 'static,
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                () = tokio::time::sleep(period()) => {}
            }
            work().await;
        }
        tracing::debug!(task = name, "loop stopped");
    })
}

/// Running loops; dropping the handle also stops them
#[derive(Debug)]
pub struct WardenHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WardenHandle {
    /// Signal every loop and wait for them to finish their current iteration
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "warden loop ended abnormally");
            }
        }
        tracing::info!("warden loops stopped");
    }
}
