use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Knowledge tables share one shape: the entity serialized as JSON plus the
/// columns needed to list and filter it.
const ENTITY_TABLES: [&str; 5] = [
    "decisions",
    "discussions",
    "features",
    "file_contexts",
    "contributors",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create projects table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create integrations table; the sync checkpoint is an open JSON mapping
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS integrations (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            display_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            config_json TEXT NOT NULL DEFAULT '{}',
            checkpoint_json TEXT NOT NULL DEFAULT '{}',
            sync_interval_secs INTEGER,
            last_sync_at INTEGER,
            last_sync_status TEXT,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create data sources table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_sources (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            integration_id TEXT NOT NULL,
            source_type TEXT NOT NULL,
            external_id TEXT NOT NULL,
            name TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (integration_id) REFERENCES integrations(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    for table in ENTITY_TABLES {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                integration_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                label TEXT NOT NULL,
                data_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (project_id, id),
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            )
            "#
        ))
        .execute(pool)
        .await?;
    }

    // Create relationships table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            integration_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            source_key TEXT NOT NULL,
            target_key TEXT NOT NULL,
            strength REAL NOT NULL,
            data_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (project_id, id),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create processing errors table (one row per integration, event and error)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            integration_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            error TEXT NOT NULL,
            retryable INTEGER NOT NULL,
            occurred_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_integrations_project ON integrations(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_data_sources_project ON data_sources(project_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(project_id, source_key)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processing_errors_integration ON processing_errors(integration_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_processing_errors_key ON processing_errors(integration_id, event_id, error)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
