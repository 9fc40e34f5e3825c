//! # Context Ingest
//!
//! Multi-platform activity ingestion and knowledge extraction.
//!
//! Context Ingest polls collaboration platforms (source-control hosts, chat
//! workspaces) through connectors, deduplicates what they deliver against a
//! per-integration checkpoint, and turns the surviving events into
//! structured knowledge: decisions, discussion summaries, features, file
//! histories, contributors and the relationships between them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ Connectors  │──▶│ Orchestrator │──▶│ ContextProcessor │──▶│  Store   │
//! │ export/...  │   │ tasks+dedup  │   │ batch+retry      │   │ SQLite   │
//! └─────────────┘   └──────┬───────┘   └──────────────────┘   └──────────┘
//!                          │
//!                          ▼
//!                   IngestionHealth
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ctx-ingest init
//! ctx-ingest project create "payments"
//! ctx-ingest integration add <project-id> github
//! ctx-ingest sync <integration-id>
//! ctx-ingest health <project-id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`connector`] | Connector trait and registry |
//! | [`connector_export`] | JSON Lines export-replay connector |
//! | [`extraction`] | Knowledge extraction providers |
//! | [`processor`] | Batched, retrying context processor |
//! | [`orchestrator`] | Per-integration ingestion task supervision |
//! | [`sqlite_store`] | SQLite implementation of the store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`status`] | CLI report printing |
//!
//! Shared data types, deduplication, aggregation and the store trait live in
//! the `context-ingest-core` crate.

pub mod config;
pub mod connector;
pub mod connector_export;
pub mod db;
pub mod extraction;
pub mod migrate;
pub mod orchestrator;
pub mod processor;
pub mod sqlite_store;
pub mod status;
