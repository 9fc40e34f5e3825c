//! Storage abstraction for Context Ingest.
//!
//! The [`Store`] trait covers everything the orchestrator needs to persist:
//! projects, their platform integrations and data sources, per-integration
//! sync checkpoints, and the knowledge extracted by the context processor.
//! Backends are pluggable: [`memory::InMemoryStore`] here, and the SQLite
//! store in the `context-ingest` crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes, and
//! each method must be atomic with respect to the record it touches.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::{IntegrationStatus, SyncStatus};
use crate::knowledge::ProcessingResult;
use crate::models::{Metadata, SyncCheckpoint};

/// A project grouping several platform integrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectWorkspace {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectWorkspace {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One platform connection belonging to a project.
///
/// `sync_checkpoint` is owned by the orchestrator and only changes through
/// [`Store::replace_checkpoint`] or [`Store::record_sync_success`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectIntegration {
    pub id: String,
    pub project_id: String,
    /// Platform name; selects the connector.
    pub platform: String,
    pub display_name: String,
    pub status: IntegrationStatus,
    /// Connector-specific settings passed to `authenticate` and `fetch_events`.
    pub config: Metadata,
    pub sync_checkpoint: SyncCheckpoint,
    /// Overrides the connector's recommended interval when set.
    pub sync_interval_secs: Option<u64>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<SyncStatus>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectIntegration {
    /// A fresh, active integration with an empty checkpoint.
    pub fn new(
        project_id: impl Into<String>,
        platform: impl Into<String>,
        display_name: impl Into<String>,
        config: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            platform: platform.into(),
            display_name: display_name.into(),
            status: IntegrationStatus::Active,
            config,
            sync_checkpoint: SyncCheckpoint::default(),
            sync_interval_secs: None,
            last_sync_at: None,
            last_sync_status: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A repository, channel or board tracked through an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDataSource {
    pub id: String,
    pub project_id: String,
    pub integration_id: String,
    /// e.g. `repository`, `channel`.
    pub source_type: String,
    /// Identifier on the platform side.
    pub external_id: String,
    pub name: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl ProjectDataSource {
    pub fn new(
        integration: &ProjectIntegration,
        source_type: impl Into<String>,
        external_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: integration.project_id.clone(),
            integration_id: integration.id.clone(),
            source_type: source_type.into(),
            external_id: external_id.into(),
            name: name.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }
}

/// Stored knowledge per project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub decisions: usize,
    pub discussions: usize,
    pub features: usize,
    pub file_contexts: usize,
    pub contributors: usize,
    pub relationships: usize,
    pub errors: usize,
}

impl EntityCounts {
    /// Entities only; relationships and errors are not counted.
    pub fn entities(&self) -> usize {
        self.decisions + self.discussions + self.features + self.file_contexts + self.contributors
    }
}

/// Abstract storage backend for Context Ingest.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_project`](Store::create_project) | Insert a project |
/// | [`delete_project`](Store::delete_project) | Remove a project and everything under it |
/// | [`update_integration`](Store::update_integration) | Save integration fields, checkpoint excluded |
/// | [`replace_checkpoint`](Store::replace_checkpoint) | Full replace of a sync checkpoint |
/// | [`record_sync_success`](Store::record_sync_success) | Checkpoint + success status in one write |
/// | [`record_sync_failure`](Store::record_sync_failure) | Mark an integration errored |
/// | [`save_processing_result`](Store::save_processing_result) | Upsert extracted knowledge |
/// | [`entity_counts`](Store::entity_counts) | Count stored knowledge for a project |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_project(&self, project: &ProjectWorkspace) -> Result<()>;

    async fn get_project(&self, id: &str) -> Result<Option<ProjectWorkspace>>;

    async fn list_projects(&self) -> Result<Vec<ProjectWorkspace>>;

    /// Returns `false` when no such project existed.
    async fn delete_project(&self, id: &str) -> Result<bool>;

    /// Fails when the owning project does not exist.
    async fn create_integration(&self, integration: &ProjectIntegration) -> Result<()>;

    async fn get_integration(&self, id: &str) -> Result<Option<ProjectIntegration>>;

    /// All integrations of a project, oldest first.
    async fn list_integrations(&self, project_id: &str) -> Result<Vec<ProjectIntegration>>;

    /// Persist every field except `sync_checkpoint`, which keeps its stored
    /// value. Fails when the integration does not exist.
    async fn update_integration(&self, integration: &ProjectIntegration) -> Result<()>;

    async fn delete_integration(&self, id: &str) -> Result<bool>;

    /// `None` when the integration does not exist.
    async fn get_checkpoint(&self, integration_id: &str) -> Result<Option<SyncCheckpoint>>;

    async fn replace_checkpoint(
        &self,
        integration_id: &str,
        checkpoint: &SyncCheckpoint,
    ) -> Result<()>;

    /// Store the advanced checkpoint, set `last_sync_at`, mark the last sync
    /// successful and clear any error message.
    async fn record_sync_success(
        &self,
        integration_id: &str,
        synced_at: DateTime<Utc>,
        checkpoint: &SyncCheckpoint,
    ) -> Result<()>;

    /// Set `status = error`, `last_sync_status = error` and the message.
    /// The checkpoint is left untouched.
    async fn record_sync_failure(
        &self,
        integration_id: &str,
        failed_at: DateTime<Utc>,
        message: &str,
    ) -> Result<()>;

    async fn create_data_source(&self, source: &ProjectDataSource) -> Result<()>;

    async fn list_data_sources(&self, project_id: &str) -> Result<Vec<ProjectDataSource>>;

    async fn delete_data_source(&self, id: &str) -> Result<bool>;

    /// Upsert entities and relationships by ID and record the errors.
    ///
    /// Errors are keyed by `(integration_id, event_id, error)`: saving the
    /// same result twice, as a retried cycle does when its checkpoint write
    /// failed, keeps the first occurrence only.
    async fn save_processing_result(
        &self,
        project_id: &str,
        integration_id: &str,
        result: &ProcessingResult,
    ) -> Result<()>;

    async fn entity_counts(&self, project_id: &str) -> Result<EntityCounts>;
}
