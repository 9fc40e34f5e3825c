//! SQLite-backed [`Store`] used by the CLI.
//!
//! Timestamps on records are stored as Unix seconds like the rest of the
//! schema; checkpoints and extracted entities are stored as JSON so their
//! full precision and any extra checkpoint keys survive a round trip.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use context_ingest_core::knowledge::ProcessingResult;
use context_ingest_core::models::{Metadata, SyncCheckpoint};
use context_ingest_core::store::{
    EntityCounts, ProjectDataSource, ProjectIntegration, ProjectWorkspace, Store,
};

use crate::config::Config;
use crate::{db, migrate};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the configured database and apply migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| anyhow!("Invalid timestamp in database: {}", ts))
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    serde_json::from_str(text).with_context(|| format!("Corrupt {} JSON in database", what))
}

fn row_to_project(row: &SqliteRow) -> Result<ProjectWorkspace> {
    Ok(ProjectWorkspace {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: from_ts(row.try_get("created_at")?)?,
        updated_at: from_ts(row.try_get("updated_at")?)?,
    })
}

fn row_to_integration(row: &SqliteRow) -> Result<ProjectIntegration> {
    let status: String = row.try_get("status")?;
    let last_sync_status: Option<String> = row.try_get("last_sync_status")?;
    let config_json: String = row.try_get("config_json")?;
    let checkpoint_json: String = row.try_get("checkpoint_json")?;
    let sync_interval_secs: Option<i64> = row.try_get("sync_interval_secs")?;
    let last_sync_at: Option<i64> = row.try_get("last_sync_at")?;

    Ok(ProjectIntegration {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        platform: row.try_get("platform")?,
        display_name: row.try_get("display_name")?,
        status: status.parse()?,
        config: parse_json(&config_json, "integration config")?,
        sync_checkpoint: parse_json(&checkpoint_json, "sync checkpoint")?,
        sync_interval_secs: sync_interval_secs.map(|s| s.max(0) as u64),
        last_sync_at: last_sync_at.map(from_ts).transpose()?,
        last_sync_status: last_sync_status.map(|s| s.parse()).transpose()?,
        error_message: row.try_get("error_message")?,
        created_at: from_ts(row.try_get("created_at")?)?,
        updated_at: from_ts(row.try_get("updated_at")?)?,
    })
}

fn row_to_data_source(row: &SqliteRow) -> Result<ProjectDataSource> {
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(ProjectDataSource {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        integration_id: row.try_get("integration_id")?,
        source_type: row.try_get("source_type")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        metadata: parse_json::<Metadata>(&metadata_json, "data source metadata")?,
        created_at: from_ts(row.try_get("created_at")?)?,
    })
}

/// Key columns of one stored entity.
struct EntityRow<'a> {
    table: &'static str,
    id: &'a str,
    platform: &'a str,
    label: &'a str,
}

async fn upsert_entity<T: Serialize>(
    conn: &mut SqliteConnection,
    project_id: &str,
    integration_id: &str,
    row: EntityRow<'_>,
    entity: &T,
    now: i64,
) -> Result<()> {
    let data_json = serde_json::to_string(entity)?;
    sqlx::query(&format!(
        r#"
        INSERT INTO {} (id, project_id, integration_id, platform, label, data_json, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, id) DO UPDATE SET
            integration_id = excluded.integration_id,
            platform = excluded.platform,
            label = excluded.label,
            data_json = excluded.data_json,
            updated_at = excluded.updated_at
        "#,
        row.table
    ))
    .bind(row.id)
    .bind(project_id)
    .bind(integration_id)
    .bind(row.platform)
    .bind(row.label)
    .bind(&data_json)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn count(pool: &SqlitePool, table: &str, project_id: &str) -> Result<usize> {
    let n: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE project_id = ?",
        table
    ))
    .bind(project_id)
    .fetch_one(pool)
    .await?;
    Ok(n.max(0) as usize)
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_project(&self, project: &ProjectWorkspace) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(to_ts(project.created_at))
        .bind(to_ts(project.updated_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create project {}", project.id))?;
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<ProjectWorkspace>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_project).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<ProjectWorkspace>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_project).collect()
    }

    async fn delete_project(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_integration(&self, integration: &ProjectIntegration) -> Result<()> {
        if self.get_project(&integration.project_id).await?.is_none() {
            bail!("Project not found: {}", integration.project_id);
        }
        sqlx::query(
            r#"
            INSERT INTO integrations (id, project_id, platform, display_name, status, config_json,
                checkpoint_json, sync_interval_secs, last_sync_at, last_sync_status, error_message,
                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&integration.id)
        .bind(&integration.project_id)
        .bind(&integration.platform)
        .bind(&integration.display_name)
        .bind(integration.status.as_str())
        .bind(serde_json::to_string(&integration.config)?)
        .bind(serde_json::to_string(&integration.sync_checkpoint)?)
        .bind(integration.sync_interval_secs.map(|s| s as i64))
        .bind(integration.last_sync_at.map(to_ts))
        .bind(integration.last_sync_status.map(|s| s.as_str()))
        .bind(&integration.error_message)
        .bind(to_ts(integration.created_at))
        .bind(to_ts(integration.updated_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create integration {}", integration.id))?;
        Ok(())
    }

    async fn get_integration(&self, id: &str) -> Result<Option<ProjectIntegration>> {
        let row = sqlx::query("SELECT * FROM integrations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_integration).transpose()
    }

    async fn list_integrations(&self, project_id: &str) -> Result<Vec<ProjectIntegration>> {
        let rows =
            sqlx::query("SELECT * FROM integrations WHERE project_id = ? ORDER BY created_at, id")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_integration).collect()
    }

    async fn update_integration(&self, integration: &ProjectIntegration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE integrations SET
                platform = ?, display_name = ?, status = ?, config_json = ?,
                sync_interval_secs = ?, last_sync_at = ?, last_sync_status = ?,
                error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&integration.platform)
        .bind(&integration.display_name)
        .bind(integration.status.as_str())
        .bind(serde_json::to_string(&integration.config)?)
        .bind(integration.sync_interval_secs.map(|s| s as i64))
        .bind(integration.last_sync_at.map(to_ts))
        .bind(integration.last_sync_status.map(|s| s.as_str()))
        .bind(&integration.error_message)
        .bind(to_ts(Utc::now()))
        .bind(&integration.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("Integration not found: {}", integration.id);
        }
        Ok(())
    }

    async fn delete_integration(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM integrations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_checkpoint(&self, integration_id: &str) -> Result<Option<SyncCheckpoint>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT checkpoint_json FROM integrations WHERE id = ?")
                .bind(integration_id)
                .fetch_optional(&self.pool)
                .await?;
        json.map(|j| parse_json(&j, "sync checkpoint")).transpose()
    }

    async fn replace_checkpoint(
        &self,
        integration_id: &str,
        checkpoint: &SyncCheckpoint,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE integrations SET checkpoint_json = ?, updated_at = ? WHERE id = ?")
                .bind(serde_json::to_string(checkpoint)?)
                .bind(to_ts(Utc::now()))
                .bind(integration_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            bail!("Integration not found: {}", integration_id);
        }
        Ok(())
    }

    async fn record_sync_success(
        &self,
        integration_id: &str,
        synced_at: DateTime<Utc>,
        checkpoint: &SyncCheckpoint,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE integrations SET
                checkpoint_json = ?, last_sync_at = ?, last_sync_status = 'success',
                error_message = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(checkpoint)?)
        .bind(to_ts(synced_at))
        .bind(to_ts(synced_at))
        .bind(integration_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("Integration not found: {}", integration_id);
        }
        Ok(())
    }

    async fn record_sync_failure(
        &self,
        integration_id: &str,
        failed_at: DateTime<Utc>,
        message: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE integrations SET
                status = 'error', last_sync_status = 'error', error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(message)
        .bind(to_ts(failed_at))
        .bind(integration_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("Integration not found: {}", integration_id);
        }
        Ok(())
    }

    async fn create_data_source(&self, source: &ProjectDataSource) -> Result<()> {
        match self.get_integration(&source.integration_id).await? {
            Some(i) if i.project_id == source.project_id => {}
            Some(_) => bail!(
                "Integration {} does not belong to project {}",
                source.integration_id,
                source.project_id
            ),
            None => bail!("Integration not found: {}", source.integration_id),
        }
        sqlx::query(
            r#"
            INSERT INTO data_sources (id, project_id, integration_id, source_type, external_id,
                name, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(&source.project_id)
        .bind(&source.integration_id)
        .bind(&source.source_type)
        .bind(&source.external_id)
        .bind(&source.name)
        .bind(serde_json::to_string(&source.metadata)?)
        .bind(to_ts(source.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_data_sources(&self, project_id: &str) -> Result<Vec<ProjectDataSource>> {
        let rows =
            sqlx::query("SELECT * FROM data_sources WHERE project_id = ? ORDER BY created_at, id")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_data_source).collect()
    }

    async fn delete_data_source(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM data_sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_processing_result(
        &self,
        project_id: &str,
        integration_id: &str,
        result: &ProcessingResult,
    ) -> Result<()> {
        let now = to_ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        for d in &result.decisions {
            let row = EntityRow {
                table: "decisions",
                id: &d.id,
                platform: &d.platform,
                label: &d.title,
            };
            upsert_entity(&mut tx, project_id, integration_id, row, d, now).await?;
        }
        for d in &result.discussions {
            let row = EntityRow {
                table: "discussions",
                id: &d.id,
                platform: &d.platform,
                label: d.thread_id.as_deref().unwrap_or(""),
            };
            upsert_entity(&mut tx, project_id, integration_id, row, d, now).await?;
        }
        for f in &result.features {
            let row = EntityRow {
                table: "features",
                id: &f.id,
                platform: &f.platform,
                label: &f.name,
            };
            upsert_entity(&mut tx, project_id, integration_id, row, f, now).await?;
        }
        for f in &result.file_contexts {
            let row = EntityRow {
                table: "file_contexts",
                id: &f.id,
                platform: &f.platform,
                label: &f.file_path,
            };
            upsert_entity(&mut tx, project_id, integration_id, row, f, now).await?;
        }
        for c in &result.contributors {
            let row = EntityRow {
                table: "contributors",
                id: &c.id,
                platform: &c.platform,
                label: &c.name,
            };
            upsert_entity(&mut tx, project_id, integration_id, row, c, now).await?;
        }

        for rel in &result.relationships {
            sqlx::query(
                r#"
                INSERT INTO relationships (id, project_id, integration_id, relationship_type,
                    source_key, target_key, strength, data_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(project_id, id) DO UPDATE SET
                    integration_id = excluded.integration_id,
                    strength = excluded.strength,
                    data_json = excluded.data_json
                "#,
            )
            .bind(&rel.id)
            .bind(project_id)
            .bind(integration_id)
            .bind(rel.relationship_type.as_str())
            .bind(rel.source.key())
            .bind(rel.target.key())
            .bind(rel.strength)
            .bind(serde_json::to_string(rel)?)
            .bind(to_ts(rel.created_at))
            .execute(&mut *tx)
            .await?;
        }

        for err in &result.errors {
            sqlx::query(
                r#"
                INSERT INTO processing_errors (project_id, integration_id, event_id, platform,
                    error, retryable, occurred_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(integration_id, event_id, error) DO NOTHING
                "#,
            )
            .bind(project_id)
            .bind(integration_id)
            .bind(&err.event_id)
            .bind(&err.platform)
            .bind(&err.error)
            .bind(err.retryable)
            .bind(to_ts(err.timestamp))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn entity_counts(&self, project_id: &str) -> Result<EntityCounts> {
        Ok(EntityCounts {
            decisions: count(&self.pool, "decisions", project_id).await?,
            discussions: count(&self.pool, "discussions", project_id).await?,
            features: count(&self.pool, "features", project_id).await?,
            file_contexts: count(&self.pool, "file_contexts", project_id).await?,
            contributors: count(&self.pool, "contributors", project_id).await?,
            relationships: count(&self.pool, "relationships", project_id).await?,
            errors: count(&self.pool, "processing_errors", project_id).await?,
        })
    }
}
