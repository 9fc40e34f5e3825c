//! In-memory [`Store`] implementation for tests and embedding.
//!
//! Everything lives in one `HashMap`-based state behind `std::sync::RwLock`.
//! A poisoned lock surfaces as an error rather than a panic.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::health::{IntegrationStatus, SyncStatus};
use crate::knowledge::{
    Contributor, DecisionRecord, DiscussionSummary, FeatureContext, FileContextHistory,
    ProcessingError, ProcessingResult, Relationship,
};
use crate::models::SyncCheckpoint;

use super::{EntityCounts, ProjectDataSource, ProjectIntegration, ProjectWorkspace, Store};

#[derive(Default)]
struct Knowledge {
    decisions: HashMap<String, DecisionRecord>,
    discussions: HashMap<String, DiscussionSummary>,
    features: HashMap<String, FeatureContext>,
    file_contexts: HashMap<String, FileContextHistory>,
    contributors: HashMap<String, Contributor>,
    relationships: HashMap<String, Relationship>,
    errors: Vec<(String, ProcessingError)>,
}

#[derive(Default)]
struct State {
    projects: HashMap<String, ProjectWorkspace>,
    integrations: HashMap<String, ProjectIntegration>,
    data_sources: HashMap<String, ProjectDataSource>,
    knowledge: HashMap<String, Knowledge>,
}

impl State {
    fn integration_mut(&mut self, id: &str) -> Result<&mut ProjectIntegration> {
        self.integrations
            .get_mut(id)
            .ok_or_else(|| anyhow!("Integration not found: {}", id))
    }
}

/// In-memory store for tests and single-process embedding.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn upsert_all<T: Clone>(
    target: &mut HashMap<String, T>,
    items: &[T],
    id: impl Fn(&T) -> &str,
) {
    for item in items {
        target.insert(id(item).to_string(), item.clone());
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_project(&self, project: &ProjectWorkspace) -> Result<()> {
        let mut state = self.write()?;
        if state.projects.contains_key(&project.id) {
            bail!("Project already exists: {}", project.id);
        }
        state.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<ProjectWorkspace>> {
        Ok(self.read()?.projects.get(id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<ProjectWorkspace>> {
        let mut projects: Vec<_> = self.read()?.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn delete_project(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        if state.projects.remove(id).is_none() {
            return Ok(false);
        }
        state.integrations.retain(|_, i| i.project_id != id);
        state.data_sources.retain(|_, s| s.project_id != id);
        state.knowledge.remove(id);
        Ok(true)
    }

    async fn create_integration(&self, integration: &ProjectIntegration) -> Result<()> {
        let mut state = self.write()?;
        if !state.projects.contains_key(&integration.project_id) {
            bail!("Project not found: {}", integration.project_id);
        }
        if state.integrations.contains_key(&integration.id) {
            bail!("Integration already exists: {}", integration.id);
        }
        state
            .integrations
            .insert(integration.id.clone(), integration.clone());
        Ok(())
    }

    async fn get_integration(&self, id: &str) -> Result<Option<ProjectIntegration>> {
        Ok(self.read()?.integrations.get(id).cloned())
    }

    async fn list_integrations(&self, project_id: &str) -> Result<Vec<ProjectIntegration>> {
        let mut integrations: Vec<_> = self
            .read()?
            .integrations
            .values()
            .filter(|i| i.project_id == project_id)
            .cloned()
            .collect();
        integrations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(integrations)
    }

    async fn update_integration(&self, integration: &ProjectIntegration) -> Result<()> {
        let mut state = self.write()?;
        let stored = state.integration_mut(&integration.id)?;
        let checkpoint = std::mem::take(&mut stored.sync_checkpoint);
        *stored = integration.clone();
        stored.sync_checkpoint = checkpoint;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_integration(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        if state.integrations.remove(id).is_none() {
            return Ok(false);
        }
        state.data_sources.retain(|_, s| s.integration_id != id);
        Ok(true)
    }

    async fn get_checkpoint(&self, integration_id: &str) -> Result<Option<SyncCheckpoint>> {
        Ok(self
            .read()?
            .integrations
            .get(integration_id)
            .map(|i| i.sync_checkpoint.clone()))
    }

    async fn replace_checkpoint(
        &self,
        integration_id: &str,
        checkpoint: &SyncCheckpoint,
    ) -> Result<()> {
        let mut state = self.write()?;
        let stored = state.integration_mut(integration_id)?;
        stored.sync_checkpoint = checkpoint.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn record_sync_success(
        &self,
        integration_id: &str,
        synced_at: DateTime<Utc>,
        checkpoint: &SyncCheckpoint,
    ) -> Result<()> {
        let mut state = self.write()?;
        let stored = state.integration_mut(integration_id)?;
        stored.sync_checkpoint = checkpoint.clone();
        stored.last_sync_at = Some(synced_at);
        stored.last_sync_status = Some(SyncStatus::Success);
        stored.error_message = None;
        stored.updated_at = synced_at;
        Ok(())
    }

    async fn record_sync_failure(
        &self,
        integration_id: &str,
        failed_at: DateTime<Utc>,
        message: &str,
    ) -> Result<()> {
        let mut state = self.write()?;
        let stored = state.integration_mut(integration_id)?;
        stored.status = IntegrationStatus::Error;
        stored.last_sync_status = Some(SyncStatus::Error);
        stored.error_message = Some(message.to_string());
        stored.updated_at = failed_at;
        Ok(())
    }

    async fn create_data_source(&self, source: &ProjectDataSource) -> Result<()> {
        let mut state = self.write()?;
        match state.integrations.get(&source.integration_id) {
            Some(i) if i.project_id == source.project_id => {}
            Some(_) => bail!(
                "Integration {} does not belong to project {}",
                source.integration_id,
                source.project_id
            ),
            None => bail!("Integration not found: {}", source.integration_id),
        }
        state.data_sources.insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn list_data_sources(&self, project_id: &str) -> Result<Vec<ProjectDataSource>> {
        let mut sources: Vec<_> = self
            .read()?
            .data_sources
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sources)
    }

    async fn delete_data_source(&self, id: &str) -> Result<bool> {
        Ok(self.write()?.data_sources.remove(id).is_some())
    }

    async fn save_processing_result(
        &self,
        project_id: &str,
        integration_id: &str,
        result: &ProcessingResult,
    ) -> Result<()> {
        let mut state = self.write()?;
        if !state.projects.contains_key(project_id) {
            bail!("Project not found: {}", project_id);
        }
        let knowledge = state.knowledge.entry(project_id.to_string()).or_default();
        upsert_all(&mut knowledge.decisions, &result.decisions, |d| d.id.as_str());
        upsert_all(&mut knowledge.discussions, &result.discussions, |d| d.id.as_str());
        upsert_all(&mut knowledge.features, &result.features, |f| f.id.as_str());
        upsert_all(&mut knowledge.file_contexts, &result.file_contexts, |f| f.id.as_str());
        upsert_all(&mut knowledge.contributors, &result.contributors, |c| c.id.as_str());
        upsert_all(&mut knowledge.relationships, &result.relationships, |r| r.id.as_str());
        for error in &result.errors {
            let seen = knowledge.errors.iter().any(|(id, e)| {
                id == integration_id && e.event_id == error.event_id && e.error == error.error
            });
            if !seen {
                knowledge.errors.push((integration_id.to_string(), error.clone()));
            }
        }
        Ok(())
    }

    async fn entity_counts(&self, project_id: &str) -> Result<EntityCounts> {
        let state = self.read()?;
        Ok(state
            .knowledge
            .get(project_id)
            .map(|k| EntityCounts {
                decisions: k.decisions.len(),
                discussions: k.discussions.len(),
                features: k.features.len(),
                file_contexts: k.file_contexts.len(),
                contributors: k.contributors.len(),
                relationships: k.relationships.len(),
                errors: k.errors.len(),
            })
            .unwrap_or_default())
    }
}
