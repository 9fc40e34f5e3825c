//! Knowledge extraction capability.
//!
//! Defines the [`KnowledgeExtractor`] trait consumed by the context
//! processor and two implementations:
//! - **[`HeuristicExtractor`]**: rule-based, offline and deterministic.
//! - **[`OpenAIExtractor`]**: calls the OpenAI chat-completions API.
//!
//! # Provider Selection
//!
//! Use [`create_extractor`] to instantiate the extractor named by the
//! configuration:
//!
//! ```rust
//! # use context_ingest::config::ExtractionConfig;
//! # use context_ingest::extraction::create_extractor;
//! let config = ExtractionConfig::default(); // provider = "heuristic"
//! let extractor = create_extractor(&config).unwrap();
//! assert_eq!(extractor.name(), "heuristic");
//! ```
//!
//! The processor treats the four operations as independent units: each is
//! retried on its own, and a failure in one never discards the output of
//! another.

pub mod heuristic;
pub mod openai;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use context_ingest_core::knowledge::{
    DecisionRecord, DiscussionSummary, FeatureContext, FileContextHistory,
};
use context_ingest_core::models::NormalizedEvent;

use crate::config::ExtractionConfig;

pub use heuristic::HeuristicExtractor;
pub use openai::OpenAIExtractor;

/// Turns a slice of normalized events into knowledge entities.
///
/// Every operation receives one batch (or, for discussions, one thread
/// within a batch) and may fail; failures are retried by the caller.
#[async_trait]
pub trait KnowledgeExtractor: Send + Sync {
    /// Provider identifier, e.g. `"heuristic"`.
    fn name(&self) -> &str;

    async fn extract_decisions(&self, events: &[NormalizedEvent]) -> Result<Vec<DecisionRecord>>;

    /// Summarize one conversation; `None` when there is nothing to summarize.
    async fn summarize_discussion(
        &self,
        events: &[NormalizedEvent],
    ) -> Result<Option<DiscussionSummary>>;

    async fn identify_features(&self, events: &[NormalizedEvent]) -> Result<Vec<FeatureContext>>;

    async fn analyze_file_context(
        &self,
        events: &[NormalizedEvent],
    ) -> Result<Vec<FileContextHistory>>;
}

/// Create the [`KnowledgeExtractor`] named by `config.provider`.
///
/// # Supported Providers
///
/// | Config Value | Extractor |
/// |-------------|-----------|
/// | `"heuristic"` | [`HeuristicExtractor`] |
/// | `"openai"` | [`OpenAIExtractor`] |
pub fn create_extractor(config: &ExtractionConfig) -> Result<Arc<dyn KnowledgeExtractor>> {
    match config.provider.as_str() {
        "heuristic" => Ok(Arc::new(HeuristicExtractor::new())),
        "openai" => Ok(Arc::new(OpenAIExtractor::new(config)?)),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

/// Truncate to at most `max` characters, never splitting a character.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Replace control characters other than newline and tab with spaces.
pub(crate) fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' {
                ' '
            } else {
                c
            }
        })
        .collect()
}
