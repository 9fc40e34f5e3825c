//! # Context Ingest Core
//!
//! Runtime-agnostic logic for Context Ingest: event and knowledge models,
//! checkpoint deduplication, cross-batch result aggregation, relationship
//! synthesis, integration health classification, and the store abstraction.
//!
//! This crate contains no tokio, sqlx, network or filesystem I/O. The
//! orchestrator, context processor, connectors and SQLite store live in the
//! `context-ingest` crate and build on the types defined here.

pub mod aggregate;
pub mod dedup;
pub mod health;
pub mod knowledge;
pub mod models;
pub mod relationships;
pub mod store;
