//! # Context Ingest CLI (`ctx-ingest`)
//!
//! Operator interface for Context Ingest: database setup, project and
//! integration management, one-off syncs, long-running ingestion, health
//! and checkpoint inspection.
//!
//! ## Usage
//!
//! ```bash
//! ctx-ingest --config ./config/ctx-ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctx-ingest init` | Create the SQLite database and run schema migrations |
//! | `ctx-ingest connectors` | List configured connectors |
//! | `ctx-ingest project create\|list` | Manage projects |
//! | `ctx-ingest integration add\|list\|reset` | Manage platform integrations |
//! | `ctx-ingest source add\|list` | Manage tracked repositories and channels |
//! | `ctx-ingest sync <integration>` | Run one ingestion cycle |
//! | `ctx-ingest run <project>` | Ingest continuously until Ctrl-C |
//! | `ctx-ingest health <project>` | Show ingestion health |
//! | `ctx-ingest checkpoint get\|set` | Inspect or replace a sync checkpoint |
//! | `ctx-ingest process <file>` | Run the processor over a JSON Lines file |

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use context_ingest::config::{self, Config};
use context_ingest::connector::ConnectorRegistry;
use context_ingest::extraction::create_extractor;
use context_ingest::orchestrator::IngestionOrchestrator;
use context_ingest::processor::{ContextProcessor, ProcessorConfig};
use context_ingest::sqlite_store::SqliteStore;
use context_ingest::{migrate, status};
use context_ingest_core::models::{Metadata, MetadataValue, NormalizedEvent, SyncCheckpoint};
use context_ingest_core::store::{ProjectDataSource, ProjectIntegration, ProjectWorkspace, Store};

/// Context Ingest CLI: multi-platform activity ingestion and knowledge
/// extraction.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ctx-ingest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ctx-ingest",
    about = "Context Ingest: multi-platform activity ingestion and knowledge extraction",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ctx-ingest.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// List the connectors built from the config file.
    Connectors,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Manage platform integrations of a project.
    Integration {
        #[command(subcommand)]
        action: IntegrationAction,
    },

    /// Manage data sources (repositories, channels) of an integration.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Run a single ingestion cycle for one integration.
    Sync {
        /// Integration ID.
        integration: String,
    },

    /// Start background ingestion for every active integration of a
    /// project and keep running until Ctrl-C.
    Run {
        /// Project ID.
        project: String,
    },

    /// Show ingestion health for a project.
    Health {
        /// Project ID.
        project: String,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or replace an integration's sync checkpoint.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Run the context processor over a JSON Lines file of normalized
    /// events and print the result as JSON. Nothing is stored.
    Process {
        /// File with one normalized event per line.
        file: PathBuf,

        /// Override `processing.batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project and print its ID.
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List projects.
    List,
}

#[derive(Subcommand)]
enum IntegrationAction {
    /// Add an integration to a project and print its ID.
    Add {
        /// Project ID.
        project: String,
        /// Platform name; must match a configured connector.
        platform: String,
        #[arg(long)]
        name: Option<String>,
        /// Fixed sync interval in seconds, overriding the connector.
        #[arg(long)]
        interval: Option<u64>,
        /// Connector settings as `key=value` pairs.
        #[arg(long = "set", value_parser = parse_key_val)]
        settings: Vec<(String, String)>,
    },
    /// List a project's integrations.
    List {
        /// Project ID.
        project: String,
    },
    /// Clear an integration's error state and mark it active.
    Reset {
        /// Integration ID.
        integration: String,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Track a repository or channel through an integration.
    Add {
        /// Integration ID.
        integration: String,
        /// Kind of source, e.g. `repository` or `channel`.
        source_type: String,
        /// Identifier on the platform side.
        external_id: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// List a project's data sources.
    List {
        /// Project ID.
        project: String,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the checkpoint as JSON.
    Get { integration: String },
    /// Replace the checkpoint with the given JSON object.
    Set { integration: String, json: String },
}

/// Parse a `key=value` pair for `--set` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_orchestrator(cfg: &Config, store: Arc<dyn Store>) -> Result<IngestionOrchestrator> {
    let connectors = ConnectorRegistry::from_config(cfg)?;
    let extractor = create_extractor(&cfg.extraction)?;
    let processor = ContextProcessor::new(extractor, ProcessorConfig::from_config(&cfg.processing));
    Ok(IngestionOrchestrator::new(
        store,
        connectors,
        processor,
        cfg.ingestion.clone(),
    ))
}

fn read_events(path: &Path) -> Result<Vec<NormalizedEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read events file: {}", path.display()))?;
    let mut events = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<NormalizedEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!(line = n + 1, error = %e, "skipping malformed event"),
        }
    }
    Ok(events)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Connectors => {
            let registry = ConnectorRegistry::from_config(&cfg)?;
            status::list_connectors(&registry);
        }
        Commands::Process { file, batch_size } => {
            let events = read_events(&file)?;
            let mut processor_cfg = ProcessorConfig::from_config(&cfg.processing);
            if let Some(size) = batch_size {
                processor_cfg.batch_size = size;
            }
            let processor = ContextProcessor::new(create_extractor(&cfg.extraction)?, processor_cfg);
            let result = processor.process_events(&events).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        command => {
            let sqlite = Arc::new(SqliteStore::open(&cfg).await?);
            let store: Arc<dyn Store> = sqlite.clone();
            let outcome = run_store_command(command, &cfg, store).await;
            sqlite.close().await;
            outcome?;
        }
    }

    Ok(())
}

async fn run_store_command(command: Commands, cfg: &Config, store: Arc<dyn Store>) -> Result<()> {
    match command {
        Commands::Project { action } => match action {
            ProjectAction::Create { name, description } => {
                let project = ProjectWorkspace::new(name, description);
                store.create_project(&project).await?;
                println!("{}", project.id);
            }
            ProjectAction::List => {
                status::print_projects(&store.list_projects().await?);
            }
        },
        Commands::Integration { action } => match action {
            IntegrationAction::Add {
                project,
                platform,
                name,
                interval,
                settings,
            } => {
                let config: Metadata = settings
                    .into_iter()
                    .map(|(k, v)| (k, MetadataValue::String(v)))
                    .collect();
                let display_name = name.unwrap_or_else(|| platform.clone());
                let mut integration = ProjectIntegration::new(project, platform, display_name, config);
                integration.sync_interval_secs = interval;
                store.create_integration(&integration).await?;
                println!("{}", integration.id);
            }
            IntegrationAction::List { project } => {
                status::print_integrations(&store.list_integrations(&project).await?);
            }
            IntegrationAction::Reset { integration } => {
                let orchestrator = build_orchestrator(cfg, store)?;
                let reset = orchestrator.reset_integration(&integration).await?;
                println!("Integration {} is {}.", reset.id, reset.status);
            }
        },
        Commands::Source { action } => match action {
            SourceAction::Add {
                integration,
                source_type,
                external_id,
                name,
            } => {
                let owner = store
                    .get_integration(&integration)
                    .await?
                    .ok_or_else(|| anyhow!("Integration not found: {}", integration))?;
                let name = name.unwrap_or_else(|| external_id.clone());
                let source = ProjectDataSource::new(&owner, source_type, external_id, name);
                store.create_data_source(&source).await?;
                println!("{}", source.id);
            }
            SourceAction::List { project } => {
                status::print_data_sources(&store.list_data_sources(&project).await?);
            }
        },
        Commands::Sync { integration } => {
            let orchestrator = build_orchestrator(cfg, store)?;
            let report = orchestrator.run_ingestion_cycle(&integration).await?;
            status::print_cycle_report(&report);
        }
        Commands::Run { project } => {
            let orchestrator = build_orchestrator(cfg, store.clone())?;
            let report = orchestrator.start_project_ingestion(&project).await?;
            status::print_start_report(&report);
            if report.started.is_empty() && report.already_running.is_empty() {
                return Ok(());
            }
            println!("Ingesting; press Ctrl-C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            orchestrator.shutdown().await;
            status::print_entity_counts(&store.entity_counts(&project).await?);
        }
        Commands::Health { project, json } => {
            let orchestrator = build_orchestrator(cfg, store)?;
            let health = orchestrator.get_ingestion_health(&project).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                status::print_health(&health);
            }
        }
        Commands::Checkpoint { action } => {
            let orchestrator = build_orchestrator(cfg, store)?;
            match action {
                CheckpointAction::Get { integration } => {
                    let checkpoint = orchestrator.get_sync_checkpoint(&integration).await?;
                    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                }
                CheckpointAction::Set { integration, json } => {
                    let checkpoint: SyncCheckpoint =
                        serde_json::from_str(&json).context("Checkpoint must be a JSON object")?;
                    orchestrator
                        .update_sync_checkpoint(&integration, &checkpoint)
                        .await?;
                    println!("Checkpoint for {} replaced.", integration);
                }
            }
        }
        Commands::Init | Commands::Connectors | Commands::Process { .. } => {}
    }
    Ok(())
}
