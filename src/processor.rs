//! Context processor: batched, fault-tolerant knowledge extraction.
//!
//! Events are split into contiguous batches of at most `batch_size`. For
//! each batch the four extraction capabilities run one after another:
//!
//! ```text
//! events ──chunks(batch_size)──▶ batch
//!                                 ├─ extract_decisions      ─┐
//!                                 ├─ summarize_discussion*   │ retried
//!                                 ├─ identify_features       │ independently
//!                                 └─ analyze_file_context   ─┘
//!                                          │
//!                              ResultAggregator (merge by key)
//!                                          │
//!                         contributors + relationships ▶ ProcessingResult
//! ```
//!
//! `*` one call per conversation (platform, thread) within the batch.
//!
//! A capability that still fails after `max_retries` retries contributes a
//! non-retryable [`ProcessingError`] for each event in the batch and
//! processing moves on. Each attempt is bounded by `timeout`; a timeout
//! counts as a failed attempt. The call itself only fails on
//! misconfiguration or cancellation.

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use context_ingest_core::aggregate::ResultAggregator;
use context_ingest_core::knowledge::{ProcessingError, ProcessingResult};
use context_ingest_core::models::NormalizedEvent;

use crate::config::ProcessingConfig;
use crate::extraction::KnowledgeExtractor;

/// Batching and retry policy for [`ContextProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    /// Retries after the first attempt; `0` means a single attempt.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Bound on a single capability attempt.
    pub timeout: Duration,
}

impl ProcessorConfig {
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

pub struct ContextProcessor {
    extractor: Arc<dyn KnowledgeExtractor>,
    config: ProcessorConfig,
}

/// Events of one batch that form a single conversation.
fn conversations(batch: &[NormalizedEvent]) -> Vec<Vec<NormalizedEvent>> {
    let mut keys: Vec<(String, String)> = Vec::new();
    let mut groups: Vec<Vec<NormalizedEvent>> = Vec::new();

    for event in batch {
        if !event.event_type.is_conversational() && event.thread_id.is_none() {
            continue;
        }
        let key = (
            event.platform.clone(),
            event.thread_id.clone().unwrap_or_default(),
        );
        match keys.iter().position(|k| *k == key) {
            Some(idx) => groups[idx].push(event.clone()),
            None => {
                keys.push(key);
                groups.push(vec![event.clone()]);
            }
        }
    }
    groups
}

impl ContextProcessor {
    pub fn new(extractor: Arc<dyn KnowledgeExtractor>, config: ProcessorConfig) -> Self {
        Self { extractor, config }
    }

    /// Process `events` to completion.
    pub async fn process_events(&self, events: &[NormalizedEvent]) -> Result<ProcessingResult> {
        self.process_events_until(events, &CancellationToken::new())
            .await
    }

    /// Process `events`, stopping before the next batch or retry once
    /// `cancel` fires. A cancelled call returns an error and no result.
    pub async fn process_events_until(
        &self,
        events: &[NormalizedEvent],
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult> {
        if self.config.batch_size == 0 {
            bail!("processing.batch_size must be > 0");
        }

        let mut aggregator = ResultAggregator::new();
        for (batch_no, batch) in events.chunks(self.config.batch_size).enumerate() {
            if cancel.is_cancelled() {
                bail!("processing cancelled before batch {}", batch_no + 1);
            }
            tracing::debug!(batch = batch_no + 1, events = batch.len(), "processing batch");
            self.process_batch(batch_no + 1, batch, &mut aggregator, cancel)
                .await?;
        }

        let result = aggregator.finish(events, Utc::now());
        tracing::info!(
            extractor = self.extractor.name(),
            events = result.processed_events,
            entities = result.entity_count(),
            relationships = result.relationships.len(),
            errors = result.errors.len(),
            "processing finished"
        );
        Ok(result)
    }

    async fn process_batch(
        &self,
        batch_no: usize,
        batch: &[NormalizedEvent],
        aggregator: &mut ResultAggregator,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let x: &dyn KnowledgeExtractor = self.extractor.as_ref();

        match self
            .with_retry("extract_decisions", batch_no, cancel, move || {
                x.extract_decisions(batch)
            })
            .await
        {
            Ok(decisions) => aggregator.add_decisions(decisions),
            Err(e) => self.record_failure(aggregator, batch, "extract_decisions", &e, cancel)?,
        }

        for thread in conversations(batch) {
            let thread = thread.as_slice();
            match self
                .with_retry("summarize_discussion", batch_no, cancel, move || {
                    x.summarize_discussion(thread)
                })
                .await
            {
                Ok(Some(summary)) => aggregator.add_discussion(summary),
                Ok(None) => {}
                Err(e) => {
                    self.record_failure(aggregator, thread, "summarize_discussion", &e, cancel)?
                }
            }
        }

        match self
            .with_retry("identify_features", batch_no, cancel, move || {
                x.identify_features(batch)
            })
            .await
        {
            Ok(features) => aggregator.add_features(features),
            Err(e) => self.record_failure(aggregator, batch, "identify_features", &e, cancel)?,
        }

        match self
            .with_retry("analyze_file_context", batch_no, cancel, move || {
                x.analyze_file_context(batch)
            })
            .await
        {
            Ok(files) => aggregator.add_file_contexts(files),
            Err(e) => self.record_failure(aggregator, batch, "analyze_file_context", &e, cancel)?,
        }

        Ok(())
    }

    /// Run `op` up to `max_retries + 1` times with a fixed delay between
    /// attempts. Returns the last error once attempts run out.
    async fn with_retry<T, F, Fut>(
        &self,
        capability: &str,
        batch_no: usize,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_retries + 1;
        let mut last_err = anyhow!("{} was not attempted", capability);

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = cancel.cancelled() => bail!("processing cancelled"),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => bail!("processing cancelled"),
                r = tokio::time::timeout(self.config.timeout, op()) => r,
            };
            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_err = e,
                Err(_) => {
                    last_err = anyhow!(
                        "{} timed out after {}ms",
                        capability,
                        self.config.timeout.as_millis()
                    )
                }
            }
            tracing::warn!(
                capability,
                batch = batch_no,
                attempt,
                error = %format!("{:#}", last_err),
                "extraction attempt failed"
            );
        }

        Err(last_err)
    }

    /// Turn an exhausted capability into per-event errors. Cancellation is
    /// propagated instead of recorded.
    fn record_failure(
        &self,
        aggregator: &mut ResultAggregator,
        events: &[NormalizedEvent],
        capability: &str,
        error: &anyhow::Error,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            bail!("processing cancelled during {}", capability);
        }
        let now = Utc::now();
        let message = format!("{}: {:#}", capability, error);
        for event in events {
            aggregator.add_error(ProcessingError {
                event_id: event.platform_id.clone(),
                platform: event.platform.clone(),
                error: message.clone(),
                timestamp: now,
                retryable: false,
            });
        }
        Ok(())
    }
}
