//! Ingestion orchestrator: per-integration sync task supervision.
//!
//! The orchestrator owns one background task per actively ingesting
//! integration. Each task loops over ingestion cycles:
//!
//! ```text
//! read checkpoint ─▶ fetch since last_sync_time ─▶ deduplicate
//!        ▲                                              │
//!        │                                          normalize
//!   sleep(interval)                                     │
//!        │                                     ContextProcessor
//!        └── record success + advance checkpoint ◀──────┘
//! ```
//!
//! A failed cycle leaves the checkpoint untouched, marks the integration
//! `error` and ends the integration's task, whichever caller ran the cycle.
//! Cycles never run against an integration that is not `active`; only
//! [`IngestionOrchestrator::reset_integration`] makes it eligible again. Stopping cancels the task's token; the task
//! notices before its next fetch, normalize, batch or sleep and exits
//! without advancing the checkpoint.
//!
//! Task handles live in a `RwLock<HashMap<..>>` keyed by integration ID.
//! Health queries and duplicate-start checks take the read lock; start and
//! stop take the write lock. Cycles for one integration are serialized by a
//! per-integration mutex, so a manual [`run_ingestion_cycle`] never races the
//! background task on the same checkpoint.
//!
//! [`run_ingestion_cycle`]: IngestionOrchestrator::run_ingestion_cycle

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use context_ingest_core::dedup::{deduplicate, DedupOutcome};
use context_ingest_core::health::{
    derive_state, HealthCounts, IntegrationState, IntegrationStatus, OverallStatus, SyncStatus,
};
use context_ingest_core::models::SyncCheckpoint;
use context_ingest_core::store::{ProjectIntegration, Store};

use crate::config::IngestionConfig;
use crate::connector::{Connector, ConnectorRegistry};
use crate::processor::ContextProcessor;

/// Lifecycle of one integration's background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Starting,
    Running,
    /// Cancelled by a stop or shutdown.
    Stopped,
    /// Ended by a failed cycle; terminal until the integration is reset.
    Error,
}

struct IngestionHandle {
    project_id: String,
    state: watch::Receiver<TaskState>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl IngestionHandle {
    fn is_live(&self) -> bool {
        !self.join.is_finished()
            && matches!(*self.state.borrow(), TaskState::Starting | TaskState::Running)
    }
}

/// Outcome of [`IngestionOrchestrator::start_project_ingestion`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    pub started: Vec<String>,
    pub already_running: Vec<String>,
    /// `(integration_id, reason)` for integrations that could not start.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    /// Cancelled mid-cycle; nothing was persisted.
    Cancelled,
    /// The integration is not `active`; nothing was fetched.
    Halted,
}

/// Counters for one ingestion cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub integration_id: String,
    pub fetched: usize,
    pub duplicates: usize,
    pub processed: usize,
    pub entities: usize,
    pub relationships: usize,
    pub errors: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(integration_id: &str) -> Self {
        Self {
            integration_id: integration_id.to_string(),
            fetched: 0,
            duplicates: 0,
            processed: 0,
            entities: 0,
            relationships: 0,
            errors: 0,
            outcome: CycleOutcome::Completed,
        }
    }

    fn cancelled(mut self) -> Self {
        self.outcome = CycleOutcome::Cancelled;
        self
    }

    fn halted(mut self) -> Self {
        self.outcome = CycleOutcome::Halted;
        self
    }
}

/// Health detail for one integration.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationHealth {
    pub integration_id: String,
    pub platform: String,
    pub display_name: String,
    pub status: IntegrationStatus,
    pub state: IntegrationState,
    pub last_sync_status: Option<SyncStatus>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub events_processed: u64,
    /// State of the background task, if one was started in this process.
    pub task: Option<TaskState>,
}

/// Project-level health summary.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionHealth {
    pub project_id: String,
    pub total_integrations: usize,
    pub active_integrations: usize,
    pub failed_integrations: usize,
    pub running_ingestions: usize,
    pub overall_status: OverallStatus,
    pub integrations: Vec<IntegrationHealth>,
    pub checked_at: DateTime<Utc>,
}

struct Inner {
    store: Arc<dyn Store>,
    connectors: ConnectorRegistry,
    processor: ContextProcessor,
    config: IngestionConfig,
    tasks: RwLock<HashMap<String, IngestionHandle>>,
    cycle_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    root: CancellationToken,
}

/// Supervisor for per-integration ingestion tasks.
///
/// Cheap to clone; clones share the same task set.
#[derive(Clone)]
pub struct IngestionOrchestrator {
    inner: Arc<Inner>,
}

impl IngestionOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        connectors: ConnectorRegistry,
        processor: ContextProcessor,
        config: IngestionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                connectors,
                processor,
                config,
                tasks: RwLock::new(HashMap::new()),
                cycle_locks: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Start a background task for every active integration of a project.
    ///
    /// Returns once the tasks are scheduled. Fails only when the project
    /// cannot be loaded; per-integration failures are recorded on the
    /// integration and listed in the report.
    pub async fn start_project_ingestion(&self, project_id: &str) -> Result<StartReport> {
        let inner = &self.inner;
        inner
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| anyhow!("Project not found: {}", project_id))?;
        let integrations = inner.store.list_integrations(project_id).await?;

        let mut report = StartReport::default();
        for integration in integrations {
            if integration.status != IntegrationStatus::Active {
                continue;
            }
            if self.is_running(&integration.id).await {
                report.already_running.push(integration.id);
                continue;
            }

            match inner.prepare(&integration).await {
                Ok(connector) => {
                    if self.spawn_task(&integration, connector).await {
                        report.started.push(integration.id);
                    } else {
                        report.already_running.push(integration.id);
                    }
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    tracing::warn!(
                        integration_id = %integration.id,
                        platform = %integration.platform,
                        error = %message,
                        "integration failed to start"
                    );
                    inner.mark_start_failure(integration.clone(), &message).await;
                    report.failed.push((integration.id, message));
                }
            }
        }

        tracing::info!(
            project_id,
            started = report.started.len(),
            already_running = report.already_running.len(),
            failed = report.failed.len(),
            "project ingestion started"
        );
        Ok(report)
    }

    /// Insert and spawn a task unless a live one exists. Returns whether a
    /// task was spawned.
    async fn spawn_task(
        &self,
        integration: &ProjectIntegration,
        connector: Arc<dyn Connector>,
    ) -> bool {
        let mut tasks = self.inner.tasks.write().await;
        if tasks.get(&integration.id).is_some_and(|h| h.is_live()) {
            return false;
        }

        let token = self.inner.root.child_token();
        let (state_tx, state_rx) = watch::channel(TaskState::Starting);
        let join = tokio::spawn(ingestion_loop(
            self.inner.clone(),
            integration.id.clone(),
            connector,
            token.clone(),
            state_tx,
        ));
        tasks.insert(
            integration.id.clone(),
            IngestionHandle {
                project_id: integration.project_id.clone(),
                state: state_rx,
                token,
                join,
            },
        );
        true
    }

    /// Whether a live task exists for the integration.
    pub async fn is_running(&self, integration_id: &str) -> bool {
        self.inner
            .tasks
            .read()
            .await
            .get(integration_id)
            .is_some_and(|h| h.is_live())
    }

    /// IDs of integrations with a live task, sorted.
    pub async fn running_ingestions(&self) -> Vec<String> {
        let tasks = self.inner.tasks.read().await;
        let mut ids: Vec<String> = tasks
            .iter()
            .filter(|(_, h)| h.is_live())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Cancel every task of a project and wait for them to exit. Returns how
    /// many tasks were stopped.
    pub async fn stop_project_ingestion(&self, project_id: &str) -> Result<usize> {
        let handles: Vec<(String, IngestionHandle)> = {
            let mut tasks = self.inner.tasks.write().await;
            let ids: Vec<String> = tasks
                .iter()
                .filter(|(_, h)| h.project_id == project_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| tasks.remove(&id).map(|h| (id, h)))
                .collect()
        };

        let stopped = handles.iter().filter(|(_, h)| h.is_live()).count();
        for (_, handle) in &handles {
            handle.token.cancel();
        }
        for (id, handle) in handles {
            join_task(&id, handle.join).await;
        }
        tracing::info!(project_id, stopped, "project ingestion stopped");
        Ok(stopped)
    }

    /// Cancel one integration's task and wait for it to exit. Returns
    /// `false` when no live task existed.
    pub async fn stop_integration(&self, integration_id: &str) -> Result<bool> {
        let handle = self.inner.tasks.write().await.remove(integration_id);
        let Some(handle) = handle else {
            return Ok(false);
        };
        let was_live = handle.is_live();
        handle.token.cancel();
        join_task(integration_id, handle.join).await;
        Ok(was_live)
    }

    /// Cancel every task and wait for all of them.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        let handles: Vec<(String, IngestionHandle)> =
            self.inner.tasks.write().await.drain().collect();
        for (id, handle) in handles {
            join_task(&id, handle.join).await;
        }
        tracing::info!("orchestrator shut down");
    }

    /// Run one ingestion cycle in the caller's task.
    ///
    /// On failure the integration is marked errored with the message, its
    /// background task (if any) is stopped and the error is returned; the
    /// checkpoint is unchanged. An integration that is not `active` yields
    /// a [`CycleOutcome::Halted`] report without fetching.
    pub async fn run_ingestion_cycle(&self, integration_id: &str) -> Result<CycleReport> {
        let token = self.inner.root.child_token();
        self.inner.run_cycle(integration_id, &token).await
    }

    pub async fn get_ingestion_health(&self, project_id: &str) -> Result<IngestionHealth> {
        let inner = &self.inner;
        inner
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| anyhow!("Project not found: {}", project_id))?;
        let integrations = inner.store.list_integrations(project_id).await?;

        let tasks = inner.tasks.read().await;
        let counts = HealthCounts::tally(
            integrations
                .iter()
                .map(|i| (i.status, i.last_sync_status)),
        );
        let running = tasks
            .values()
            .filter(|h| h.project_id == project_id && h.is_live())
            .count();

        let details = integrations
            .into_iter()
            .map(|i| IntegrationHealth {
                state: derive_state(i.status, i.last_sync_status),
                task: tasks.get(&i.id).map(|h| *h.state.borrow()),
                events_processed: i.sync_checkpoint.total_events_processed,
                integration_id: i.id,
                platform: i.platform,
                display_name: i.display_name,
                status: i.status,
                last_sync_status: i.last_sync_status,
                last_sync_at: i.last_sync_at,
                error_message: i.error_message,
            })
            .collect();

        Ok(IngestionHealth {
            project_id: project_id.to_string(),
            total_integrations: counts.total,
            active_integrations: counts.active,
            failed_integrations: counts.failed,
            running_ingestions: running,
            overall_status: counts.overall(),
            integrations: details,
            checked_at: Utc::now(),
        })
    }

    pub async fn get_sync_checkpoint(&self, integration_id: &str) -> Result<SyncCheckpoint> {
        self.inner
            .store
            .get_checkpoint(integration_id)
            .await?
            .ok_or_else(|| anyhow!("Integration not found: {}", integration_id))
    }

    /// Replace the checkpoint wholesale. Callers merge before calling.
    pub async fn update_sync_checkpoint(
        &self,
        integration_id: &str,
        checkpoint: &SyncCheckpoint,
    ) -> Result<()> {
        let lock = self.inner.cycle_lock(integration_id).await;
        let _guard = lock.lock().await;
        self.inner
            .store
            .replace_checkpoint(integration_id, checkpoint)
            .await
    }

    /// Return an errored integration to `active` and clear its error.
    pub async fn reset_integration(&self, integration_id: &str) -> Result<ProjectIntegration> {
        let mut integration = self
            .inner
            .store
            .get_integration(integration_id)
            .await?
            .ok_or_else(|| anyhow!("Integration not found: {}", integration_id))?;

        integration.status = IntegrationStatus::Active;
        integration.last_sync_status = None;
        integration.error_message = None;
        integration.updated_at = Utc::now();
        self.inner.store.update_integration(&integration).await?;

        let mut tasks = self.inner.tasks.write().await;
        if tasks.get(integration_id).is_some_and(|h| !h.is_live()) {
            tasks.remove(integration_id);
        }
        tracing::info!(integration_id, "integration reset");
        Ok(integration)
    }
}

async fn join_task(integration_id: &str, join: JoinHandle<()>) {
    if let Err(e) = join.await {
        tracing::warn!(integration_id, error = %e, "ingestion task ended abnormally");
    }
}

/// Body of one integration's background task.
async fn ingestion_loop(
    inner: Arc<Inner>,
    integration_id: String,
    connector: Arc<dyn Connector>,
    token: CancellationToken,
    state: watch::Sender<TaskState>,
) {
    state.send_replace(TaskState::Running);
    tracing::info!(integration_id = %integration_id, "ingestion task running");

    loop {
        match inner.run_cycle(&integration_id, &token).await {
            Ok(report) if report.outcome != CycleOutcome::Completed => break,
            Ok(report) => tracing::info!(
                integration_id = %integration_id,
                fetched = report.fetched,
                duplicates = report.duplicates,
                processed = report.processed,
                entities = report.entities,
                errors = report.errors,
                "ingestion cycle completed"
            ),
            Err(_) => {
                // run_cycle already recorded the failure.
                state.send_replace(TaskState::Error);
                return;
            }
        }

        let delay = inner.next_delay(&integration_id, connector.as_ref()).await;
        tracing::debug!(integration_id = %integration_id, delay_secs = delay.as_secs(), "next sync scheduled");
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let exit = inner.exit_state(&integration_id).await;
    state.send_replace(exit);
    tracing::info!(integration_id = %integration_id, state = ?exit, "ingestion task stopped");
}

impl Inner {
    async fn cycle_lock(&self, integration_id: &str) -> Arc<Mutex<()>> {
        self.cycle_locks
            .lock()
            .await
            .entry(integration_id.to_string())
            .or_default()
            .clone()
    }

    fn connector_for(&self, integration: &ProjectIntegration) -> Result<Arc<dyn Connector>> {
        self.connectors.get(&integration.platform).ok_or_else(|| {
            anyhow!(
                "No connector registered for platform '{}'",
                integration.platform
            )
        })
    }

    /// Resolve and authenticate the integration's connector.
    async fn prepare(&self, integration: &ProjectIntegration) -> Result<Arc<dyn Connector>> {
        let connector = self.connector_for(integration)?;
        let auth = tokio::time::timeout(
            self.config.connector_timeout(),
            connector.authenticate(&integration.config),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "authentication timed out after {}s",
                self.config.connector_timeout_secs
            )
        })??;

        if !auth.authenticated {
            bail!(
                "authentication failed: {}",
                auth.message.as_deref().unwrap_or("no reason given")
            );
        }
        Ok(connector)
    }

    /// Cancel the integration's live background task, if any.
    async fn halt_task(&self, integration_id: &str) {
        if let Some(handle) = self.tasks.read().await.get(integration_id) {
            if handle.is_live() {
                handle.token.cancel();
            }
        }
    }

    /// `Error` when the integration was marked errored underneath the
    /// task, `Stopped` otherwise.
    async fn exit_state(&self, integration_id: &str) -> TaskState {
        match self.store.get_integration(integration_id).await {
            Ok(Some(i)) if i.status == IntegrationStatus::Error => TaskState::Error,
            _ => TaskState::Stopped,
        }
    }

    async fn mark_start_failure(&self, mut integration: ProjectIntegration, message: &str) {
        integration.status = IntegrationStatus::Error;
        integration.error_message = Some(message.to_string());
        integration.updated_at = Utc::now();
        if let Err(e) = self.store.update_integration(&integration).await {
            tracing::error!(
                integration_id = %integration.id,
                error = %format!("{:#}", e),
                "failed to record start failure"
            );
        }
    }

    /// Interval before the next cycle: the integration's own setting, else
    /// the connector's recommendation, never below the configured minimum.
    async fn next_delay(&self, integration_id: &str, connector: &dyn Connector) -> Duration {
        let base = match self.store.get_integration(integration_id).await {
            Ok(Some(integration)) => match integration.sync_interval_secs {
                Some(secs) => Duration::from_secs(secs),
                None => connector.schedule_sync(integration.last_sync_at),
            },
            _ => Duration::from_secs(self.config.sync_interval_secs),
        };
        base.max(Duration::from_secs(self.config.min_sync_interval_secs))
    }

    /// Await `fut` with the connector timeout; `None` when cancelled first.
    async fn guarded<T>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<Option<T>> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            r = tokio::time::timeout(self.config.connector_timeout(), fut) => match r {
                Ok(value) => value.map(Some),
                Err(_) => bail!(
                    "{} timed out after {}s",
                    what,
                    self.config.connector_timeout_secs
                ),
            },
        }
    }

    async fn run_cycle(&self, integration_id: &str, cancel: &CancellationToken) -> Result<CycleReport> {
        let lock = self.cycle_lock(integration_id).await;
        let _guard = lock.lock().await;

        match self.cycle(integration_id, cancel).await {
            Ok(report) => Ok(report),
            Err(_) if cancel.is_cancelled() => {
                tracing::info!(integration_id, "ingestion cycle cancelled");
                Ok(CycleReport::new(integration_id).cancelled())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(integration_id, error = %message, "ingestion cycle failed");
                if let Err(record_err) = self
                    .store
                    .record_sync_failure(integration_id, Utc::now(), &message)
                    .await
                {
                    tracing::error!(
                        integration_id,
                        error = %format!("{:#}", record_err),
                        "failed to record sync failure"
                    );
                }
                self.halt_task(integration_id).await;
                Err(e)
            }
        }
    }

    async fn cycle(&self, integration_id: &str, cancel: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::new(integration_id);

        let integration = self
            .store
            .get_integration(integration_id)
            .await?
            .ok_or_else(|| anyhow!("Integration not found: {}", integration_id))?;
        if integration.status != IntegrationStatus::Active {
            tracing::info!(
                integration_id,
                status = %integration.status,
                "integration not active; cycle skipped"
            );
            return Ok(report.halted());
        }
        let connector = self.connector_for(&integration)?;
        let checkpoint = integration.sync_checkpoint.clone();

        if cancel.is_cancelled() {
            return Ok(report.cancelled());
        }
        let fetch = connector.fetch_events(
            &integration,
            checkpoint.last_sync_time,
            self.config.fetch_limit,
        );
        let Some(raw) = self.guarded("fetch_events", cancel, fetch).await? else {
            return Ok(report.cancelled());
        };
        report.fetched = raw.len();

        let DedupOutcome { fresh, duplicates } = deduplicate(&checkpoint, raw);
        report.duplicates = duplicates;
        let fresh_ids: Vec<String> = fresh.iter().map(|e| e.platform_id.clone()).collect();
        let latest_event = fresh.iter().map(|e| e.occurred_at).max();
        tracing::debug!(
            integration_id,
            platform = %integration.platform,
            fetched = report.fetched,
            fresh = fresh_ids.len(),
            "fetched events"
        );

        let result = if fresh.is_empty() {
            None
        } else {
            if cancel.is_cancelled() {
                return Ok(report.cancelled());
            }
            let Some(events) = self
                .guarded("normalize", cancel, connector.normalize(fresh))
                .await?
            else {
                return Ok(report.cancelled());
            };
            Some(self.processor.process_events_until(&events, cancel).await?)
        };

        if cancel.is_cancelled() {
            return Ok(report.cancelled());
        }

        let now = Utc::now();
        if let Some(result) = &result {
            self.store
                .save_processing_result(&integration.project_id, integration_id, result)
                .await?;
            report.processed = result.processed_events;
            report.entities = result.entity_count();
            report.relationships = result.relationships.len();
            report.errors = result.errors.len();
        }

        let next = checkpoint.advance(
            now,
            report.processed as u64,
            latest_event,
            fresh_ids,
            self.config.dedup_window,
        );
        self.store
            .record_sync_success(integration_id, now, &next)
            .await?;
        Ok(report)
    }
}
