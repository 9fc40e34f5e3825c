use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use context_ingest::config::IngestionConfig;
use context_ingest::connector::{AuthResult, Connector, ConnectorRegistry, PlatformInfo};
use context_ingest::extraction::HeuristicExtractor;
use context_ingest::orchestrator::{CycleOutcome, IngestionOrchestrator, TaskState};
use context_ingest::processor::{ContextProcessor, ProcessorConfig};
use context_ingest_core::health::{IntegrationStatus, OverallStatus, SyncStatus};
use context_ingest_core::models::{EventType, Metadata, NormalizedEvent, RawEvent, SyncCheckpoint};
use context_ingest_core::store::memory::InMemoryStore;
use context_ingest_core::store::{ProjectIntegration, ProjectWorkspace, Store};

/// Connector that redelivers a fixed event list on every fetch, ignoring
/// `since`, so deduplication is the only thing preventing reprocessing.
struct Scripted {
    platform: &'static str,
    events: Vec<RawEvent>,
    fail_fetch: AtomicBool,
    deny_auth: bool,
    fetch_delay: Duration,
    fetch_calls: AtomicUsize,
}

impl Scripted {
    fn new(platform: &'static str, ids: &[&str]) -> Self {
        let events = ids
            .iter()
            .enumerate()
            .map(|(n, id)| RawEvent {
                platform_id: id.to_string(),
                platform: platform.to_string(),
                occurred_at: Utc.timestamp_opt(1_714_000_000 + n as i64 * 60, 0).unwrap(),
                payload: serde_json::json!({
                    "author": if n % 2 == 0 { "alice" } else { "bob" },
                    "body": format!("We decided to ship {} #rollout", id),
                    "files": ["src/lib.rs"],
                }),
            })
            .collect();
        Self {
            platform,
            events,
            fail_fetch: AtomicBool::new(false),
            deny_auth: false,
            fetch_delay: Duration::ZERO,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }
}

#[async_trait]
impl Connector for Scripted {
    fn describe(&self) -> PlatformInfo {
        PlatformInfo {
            name: self.platform.to_string(),
            display_name: self.platform.to_string(),
            version: "test".to_string(),
        }
    }

    async fn authenticate(&self, _config: &Metadata) -> Result<AuthResult> {
        if self.deny_auth {
            Ok(AuthResult::denied("token revoked"))
        } else {
            Ok(AuthResult::granted("bot"))
        }
    }

    async fn fetch_events(
        &self,
        _integration: &ProjectIntegration,
        _since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawEvent>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            bail!("rate limited by {}", self.platform);
        }
        Ok(self.events.iter().take(limit).cloned().collect())
    }

    async fn normalize(&self, events: Vec<RawEvent>) -> Result<Vec<NormalizedEvent>> {
        Ok(events
            .into_iter()
            .map(|raw| NormalizedEvent {
                event_type: EventType::Commit,
                timestamp: raw.occurred_at,
                author: raw.payload["author"].as_str().unwrap_or("").to_string(),
                content: raw.payload["body"].as_str().unwrap_or("").to_string(),
                file_refs: vec!["src/lib.rs".to_string()],
                feature_refs: vec![],
                thread_id: None,
                metadata: Metadata::new(),
                platform: raw.platform,
                platform_id: raw.platform_id,
            })
            .collect())
    }

    fn schedule_sync(&self, _last_sync: Option<DateTime<Utc>>) -> Duration {
        Duration::from_secs(3600)
    }
}

fn test_config() -> IngestionConfig {
    IngestionConfig {
        connector_timeout_secs: 60,
        ..IngestionConfig::default()
    }
}

fn orchestrator(
    store: Arc<InMemoryStore>,
    connectors: Vec<Arc<Scripted>>,
    config: IngestionConfig,
) -> IngestionOrchestrator {
    let mut registry = ConnectorRegistry::new();
    for connector in connectors {
        registry.register(connector).unwrap();
    }
    let processor = ContextProcessor::new(
        Arc::new(HeuristicExtractor::new()),
        ProcessorConfig {
            batch_size: 2,
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        },
    );
    IngestionOrchestrator::new(store, registry, processor, config)
}

async fn project_with(store: &InMemoryStore, platforms: &[&str]) -> (String, Vec<String>) {
    let project = ProjectWorkspace::new("payments", None);
    store.create_project(&project).await.unwrap();
    let mut ids = Vec::new();
    for platform in platforms {
        let integration = ProjectIntegration::new(&project.id, *platform, *platform, Metadata::new());
        store.create_integration(&integration).await.unwrap();
        ids.push(integration.id);
    }
    (project.id, ids)
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn checkpoint_update_is_a_full_replace() {
    let store = Arc::new(InMemoryStore::new());
    let (_, ids) = project_with(&store, &["github"]).await;
    let orch = orchestrator(store.clone(), vec![], test_config());

    let first = SyncCheckpoint {
        total_events_processed: 100,
        processed_event_ids: vec!["a".to_string()],
        ..Default::default()
    };
    orch.update_sync_checkpoint(&ids[0], &first).await.unwrap();

    let second = SyncCheckpoint {
        total_events_processed: 150,
        ..Default::default()
    };
    orch.update_sync_checkpoint(&ids[0], &second).await.unwrap();

    let loaded = orch.get_sync_checkpoint(&ids[0]).await.unwrap();
    assert_eq!(loaded.total_events_processed, 150);
    assert!(loaded.processed_event_ids.is_empty());
}

#[tokio::test]
async fn one_failed_integration_degrades_health() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github", "slack"]).await;

    for (id, outcome) in ids.iter().zip([SyncStatus::Success, SyncStatus::Error]) {
        let mut integration = store.get_integration(id).await.unwrap().unwrap();
        integration.last_sync_status = Some(outcome);
        store.update_integration(&integration).await.unwrap();
    }

    let orch = orchestrator(store.clone(), vec![], test_config());
    let health = orch.get_ingestion_health(&project_id).await.unwrap();
    assert_eq!(health.active_integrations, 2);
    assert_eq!(health.failed_integrations, 1);
    assert_eq!(health.overall_status, OverallStatus::Degraded);
    assert_eq!(health.running_ingestions, 0);
}

#[tokio::test]
async fn empty_project_is_healthy() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, _) = project_with(&store, &[]).await;
    let orch = orchestrator(store, vec![], test_config());

    let health = orch.get_ingestion_health(&project_id).await.unwrap();
    assert_eq!(health.total_integrations, 0);
    assert_eq!(health.overall_status, OverallStatus::Healthy);
}

#[tokio::test]
async fn redelivered_events_are_processed_once() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github"]).await;
    let connector = Arc::new(Scripted::new("github", &["c-1", "c-2", "c-3"]));
    let orch = orchestrator(store.clone(), vec![connector], test_config());

    let first = orch.run_ingestion_cycle(&ids[0]).await.unwrap();
    assert_eq!(first.outcome, CycleOutcome::Completed);
    assert_eq!(first.fetched, 3);
    assert_eq!(first.processed, 3);
    assert!(first.entities > 0);

    let second = orch.run_ingestion_cycle(&ids[0]).await.unwrap();
    assert_eq!(second.fetched, 3);
    assert_eq!(second.duplicates, 3);
    assert_eq!(second.processed, 0);

    let checkpoint = orch.get_sync_checkpoint(&ids[0]).await.unwrap();
    assert_eq!(checkpoint.total_events_processed, 3);
    assert_eq!(checkpoint.processed_event_ids, vec!["c-1", "c-2", "c-3"]);
    assert!(checkpoint.last_sync_time.is_some());

    let counts = store.entity_counts(&project_id).await.unwrap();
    assert_eq!(counts.decisions, 3);
    assert_eq!(counts.contributors, 2);
}

#[tokio::test]
async fn only_unseen_events_survive_the_checkpoint() {
    let store = Arc::new(InMemoryStore::new());
    let (_, ids) = project_with(&store, &["github"]).await;
    let connector = Arc::new(Scripted::new("github", &["event-1", "event-2", "event-3"]));
    let orch = orchestrator(store.clone(), vec![connector], test_config());

    let seeded = SyncCheckpoint {
        total_events_processed: 2,
        processed_event_ids: vec!["event-1".to_string(), "event-2".to_string()],
        ..Default::default()
    };
    orch.update_sync_checkpoint(&ids[0], &seeded).await.unwrap();

    let report = orch.run_ingestion_cycle(&ids[0]).await.unwrap();
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.processed, 1);

    let checkpoint = orch.get_sync_checkpoint(&ids[0]).await.unwrap();
    assert_eq!(checkpoint.total_events_processed, 3);
    assert_eq!(
        checkpoint.processed_event_ids,
        vec!["event-1", "event-2", "event-3"]
    );
}

#[tokio::test]
async fn dedup_window_keeps_newest_ids() {
    let store = Arc::new(InMemoryStore::new());
    let (_, ids) = project_with(&store, &["github"]).await;
    let connector = Arc::new(Scripted::new("github", &["a", "b", "c", "d"]));
    let config = IngestionConfig {
        dedup_window: 3,
        ..test_config()
    };
    let orch = orchestrator(store, vec![connector], config);

    orch.run_ingestion_cycle(&ids[0]).await.unwrap();
    let checkpoint = orch.get_sync_checkpoint(&ids[0]).await.unwrap();
    assert_eq!(checkpoint.processed_event_ids, vec!["b", "c", "d"]);
    assert_eq!(checkpoint.total_events_processed, 4);
}

#[tokio::test]
async fn connector_failure_is_isolated_to_its_integration() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github", "slack"]).await;
    let github = Arc::new(Scripted::new("github", &["c-1"]));
    let slack = Arc::new(Scripted::new("slack", &["m-1"]));
    slack.fail_fetch.store(true, Ordering::SeqCst);
    let orch = orchestrator(store.clone(), vec![github, slack], test_config());

    assert!(orch.run_ingestion_cycle(&ids[0]).await.is_ok());
    let err = orch.run_ingestion_cycle(&ids[1]).await.unwrap_err();
    assert!(err.to_string().contains("rate limited"));

    let slack_state = store.get_integration(&ids[1]).await.unwrap().unwrap();
    assert_eq!(slack_state.status, IntegrationStatus::Error);
    assert_eq!(slack_state.last_sync_status, Some(SyncStatus::Error));
    assert!(slack_state
        .error_message
        .as_deref()
        .unwrap_or("")
        .contains("rate limited"));
    assert_eq!(slack_state.sync_checkpoint, SyncCheckpoint::default());

    let github_state = store.get_integration(&ids[0]).await.unwrap().unwrap();
    assert_eq!(github_state.last_sync_status, Some(SyncStatus::Success));
    assert_eq!(github_state.sync_checkpoint.total_events_processed, 1);

    let health = orch.get_ingestion_health(&project_id).await.unwrap();
    assert_eq!(health.failed_integrations, 1);
    assert_eq!(health.overall_status, OverallStatus::Degraded);
}

#[tokio::test]
async fn slow_fetch_times_out_without_advancing() {
    let store = Arc::new(InMemoryStore::new());
    let (_, ids) = project_with(&store, &["github"]).await;
    let connector = Arc::new(Scripted::new("github", &["c-1"]).slow(Duration::from_secs(5)));
    let config = IngestionConfig {
        connector_timeout_secs: 1,
        ..test_config()
    };
    let orch = orchestrator(store.clone(), vec![connector], config);

    let err = orch.run_ingestion_cycle(&ids[0]).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    let checkpoint = orch.get_sync_checkpoint(&ids[0]).await.unwrap();
    assert_eq!(checkpoint, SyncCheckpoint::default());
}

#[tokio::test]
async fn start_is_idempotent_and_stop_ends_tasks() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github"]).await;
    let connector = Arc::new(Scripted::new("github", &["c-1", "c-2"]));
    let orch = orchestrator(store.clone(), vec![connector], test_config());

    let first = orch.start_project_ingestion(&project_id).await.unwrap();
    assert_eq!(first.started, ids);
    let second = orch.start_project_ingestion(&project_id).await.unwrap();
    assert!(second.started.is_empty());
    assert_eq!(second.already_running, ids);
    assert_eq!(orch.running_ingestions().await, ids);

    // The background task runs its first cycle right away.
    let probe = orch.clone();
    let id = ids[0].clone();
    wait_for(|| {
        let probe = probe.clone();
        let id = id.clone();
        async move {
            probe
                .get_sync_checkpoint(&id)
                .await
                .map(|c| c.total_events_processed == 2)
                .unwrap_or(false)
        }
    })
    .await;

    let health = orch.get_ingestion_health(&project_id).await.unwrap();
    assert_eq!(health.running_ingestions, 1);

    assert_eq!(orch.stop_project_ingestion(&project_id).await.unwrap(), 1);
    assert!(!orch.is_running(&ids[0]).await);
    assert!(orch.running_ingestions().await.is_empty());
}

#[tokio::test]
async fn concurrent_starts_spawn_one_task() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github"]).await;
    let connector = Arc::new(Scripted::new("github", &["c-1"]));
    let orch = orchestrator(store, vec![connector], test_config());

    let (a, b) = tokio::join!(
        orch.start_project_ingestion(&project_id),
        orch.start_project_ingestion(&project_id)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.started.len() + b.started.len(), 1);
    assert_eq!(a.already_running.len() + b.already_running.len(), 1);
    assert_eq!(orch.running_ingestions().await, ids);

    orch.shutdown().await;
}

#[tokio::test]
async fn failed_manual_cycle_ends_the_background_task() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github"]).await;
    let connector = Arc::new(Scripted::new("github", &["c-1"]));
    let orch = orchestrator(store.clone(), vec![connector.clone()], test_config());

    orch.start_project_ingestion(&project_id).await.unwrap();
    let probe = orch.clone();
    let id = ids[0].clone();
    wait_for(|| {
        let probe = probe.clone();
        let id = id.clone();
        async move {
            probe
                .get_sync_checkpoint(&id)
                .await
                .map(|c| c.total_events_processed == 1)
                .unwrap_or(false)
        }
    })
    .await;

    connector.fail_fetch.store(true, Ordering::SeqCst);
    assert!(orch.run_ingestion_cycle(&ids[0]).await.is_err());
    connector.fail_fetch.store(false, Ordering::SeqCst);

    let probe = orch.clone();
    let id = ids[0].clone();
    wait_for(|| {
        let probe = probe.clone();
        let id = id.clone();
        async move { !probe.is_running(&id).await }
    })
    .await;

    let health = orch.get_ingestion_health(&project_id).await.unwrap();
    assert_eq!(health.running_ingestions, 0);
    assert_eq!(health.integrations[0].task, Some(TaskState::Error));

    // Terminal until reset: later cycles do not fetch or record success.
    let calls = connector.fetch_calls.load(Ordering::SeqCst);
    let report = orch.run_ingestion_cycle(&ids[0]).await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Halted);
    assert_eq!(connector.fetch_calls.load(Ordering::SeqCst), calls);

    let integration = store.get_integration(&ids[0]).await.unwrap().unwrap();
    assert_eq!(integration.status, IntegrationStatus::Error);
    assert_eq!(integration.last_sync_status, Some(SyncStatus::Error));
    assert_eq!(integration.sync_checkpoint.total_events_processed, 1);
}

#[tokio::test]
async fn deactivated_integration_stops_its_task() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github"]).await;
    let mut integration = store.get_integration(&ids[0]).await.unwrap().unwrap();
    integration.sync_interval_secs = Some(0);
    store.update_integration(&integration).await.unwrap();

    let connector = Arc::new(Scripted::new("github", &["c-1"]).slow(Duration::from_millis(20)));
    let config = IngestionConfig {
        min_sync_interval_secs: 0,
        ..test_config()
    };
    let orch = orchestrator(store.clone(), vec![connector.clone()], config);

    orch.start_project_ingestion(&project_id).await.unwrap();
    let calls = connector.clone();
    wait_for(|| {
        let calls = calls.clone();
        async move { calls.fetch_calls.load(Ordering::SeqCst) >= 2 }
    })
    .await;

    let mut integration = store.get_integration(&ids[0]).await.unwrap().unwrap();
    integration.status = IntegrationStatus::Inactive;
    store.update_integration(&integration).await.unwrap();

    let probe = orch.clone();
    let id = ids[0].clone();
    wait_for(|| {
        let probe = probe.clone();
        let id = id.clone();
        async move { !probe.is_running(&id).await }
    })
    .await;

    let health = orch.get_ingestion_health(&project_id).await.unwrap();
    assert_eq!(health.running_ingestions, 0);
    assert_eq!(health.integrations[0].task, Some(TaskState::Stopped));

    let settled = connector.fetch_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.fetch_calls.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn stop_interrupts_an_in_flight_fetch() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github"]).await;
    let connector = Arc::new(Scripted::new("github", &["c-1"]).slow(Duration::from_secs(30)));
    let orch = orchestrator(store.clone(), vec![connector.clone()], test_config());

    orch.start_project_ingestion(&project_id).await.unwrap();
    let calls = connector.clone();
    wait_for(|| {
        let calls = calls.clone();
        async move { calls.fetch_calls.load(Ordering::SeqCst) >= 1 }
    })
    .await;

    let stopped = tokio::time::timeout(Duration::from_secs(2), orch.stop_integration(&ids[0]))
        .await
        .expect("stop should not wait for the fetch")
        .unwrap();
    assert!(stopped);

    let integration = store.get_integration(&ids[0]).await.unwrap().unwrap();
    assert_eq!(integration.status, IntegrationStatus::Active);
    assert_eq!(integration.sync_checkpoint, SyncCheckpoint::default());
    assert!(integration.last_sync_status.is_none());
}

#[tokio::test]
async fn start_failures_are_recorded_not_propagated() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["github", "jira"]).await;
    let mut github = Scripted::new("github", &["c-1"]);
    github.deny_auth = true;
    let orch = orchestrator(store.clone(), vec![Arc::new(github)], test_config());

    let report = orch.start_project_ingestion(&project_id).await.unwrap();
    assert!(report.started.is_empty());
    assert_eq!(report.failed.len(), 2);
    let reason = |id: &str| {
        report
            .failed
            .iter()
            .find(|(failed, _)| failed == id)
            .map(|(_, reason)| reason.clone())
            .unwrap_or_default()
    };
    assert!(reason(&ids[0]).contains("token revoked"));
    assert!(reason(&ids[1]).contains("No connector registered"));

    for id in &ids {
        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert_eq!(integration.status, IntegrationStatus::Error);
        assert!(integration.error_message.is_some());
    }

    let health = orch.get_ingestion_health(&project_id).await.unwrap();
    assert_eq!(health.overall_status, OverallStatus::Down);
}

#[tokio::test]
async fn missing_project_fails_to_start() {
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(store, vec![], test_config());
    assert!(orch.start_project_ingestion("nope").await.is_err());
    assert!(orch.get_ingestion_health("nope").await.is_err());
}

#[tokio::test]
async fn reset_reactivates_an_errored_integration() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, ids) = project_with(&store, &["slack"]).await;
    let slack = Arc::new(Scripted::new("slack", &["m-1"]));
    slack.fail_fetch.store(true, Ordering::SeqCst);
    let orch = orchestrator(store.clone(), vec![slack.clone()], test_config());

    assert!(orch.run_ingestion_cycle(&ids[0]).await.is_err());
    // Errored integrations are skipped at start.
    let report = orch.start_project_ingestion(&project_id).await.unwrap();
    assert!(report.started.is_empty());

    let reset = orch.reset_integration(&ids[0]).await.unwrap();
    assert_eq!(reset.status, IntegrationStatus::Active);
    assert!(reset.error_message.is_none());

    slack.fail_fetch.store(false, Ordering::SeqCst);
    let report = orch.run_ingestion_cycle(&ids[0]).await.unwrap();
    assert_eq!(report.processed, 1);

    let health = orch.get_ingestion_health(&project_id).await.unwrap();
    assert_eq!(health.overall_status, OverallStatus::Healthy);
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let store = Arc::new(InMemoryStore::new());
    let (project_id, _) = project_with(&store, &["github", "slack"]).await;
    let orch = orchestrator(
        store,
        vec![
            Arc::new(Scripted::new("github", &["c-1"])),
            Arc::new(Scripted::new("slack", &["m-1"])),
        ],
        test_config(),
    );

    let report = orch.start_project_ingestion(&project_id).await.unwrap();
    assert_eq!(report.started.len(), 2);
    tokio::time::timeout(Duration::from_secs(5), orch.shutdown())
        .await
        .unwrap();
    assert!(orch.running_ingestions().await.is_empty());
}
