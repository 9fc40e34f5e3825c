//! OpenAI-backed extractor.
//!
//! Sends each batch to `POST /v1/chat/completions` with a JSON-object
//! response format, then maps the model's answer onto knowledge entities.
//! Identifiers, timestamps, platforms and participants are always derived
//! locally from the batch; the model only contributes text and the
//! event IDs each entity is grounded on.
//!
//! There is no internal retry loop. HTTP 429, 5xx and network errors are
//! returned to the processor, which retries the whole operation.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use context_ingest_core::knowledge::{
    clamp_strength, entity_id, DecisionRecord, DiscussionSummary, EntityKind, FeatureContext,
    FileContextHistory,
};
use context_ingest_core::models::{clean_inline, NormalizedEvent};

use super::{sanitize, truncate_chars, KnowledgeExtractor};
use crate::config::ExtractionConfig;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const EVENT_CONTENT_CHARS: usize = 2000;

/// Extractor using the OpenAI chat-completions API.
///
/// Requires `extraction.model` in config and the `OPENAI_API_KEY`
/// environment variable. `OPENAI_BASE_URL` overrides the endpoint.
pub struct OpenAIExtractor {
    client: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAIExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("extraction.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            api_key,
            base_url,
        })
    }

    async fn complete<T: for<'de> Deserialize<'de>>(
        &self,
        instructions: &str,
        events: &[NormalizedEvent],
    ) -> Result<T> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": instructions },
                { "role": "user", "content": render_events(events) },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing message content"))?;
        serde_json::from_str(content).context("OpenAI response was not the requested JSON shape")
    }
}

fn render_events(events: &[NormalizedEvent]) -> String {
    let items: Vec<serde_json::Value> = events
        .iter()
        .map(|e| {
            serde_json::json!({
                "id": e.platform_id,
                "type": e.event_type.as_str(),
                "author": clean_inline(&e.author),
                "timestamp": e.timestamp.to_rfc3339(),
                "files": e.file_refs,
                "features": e.feature_refs,
                "content": truncate_chars(&sanitize(&e.content), EVENT_CONTENT_CHARS),
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

/// Keep only the referenced events that are actually in the batch. An
/// entity with no valid grounding is dropped.
fn grounded<'a>(
    by_id: &HashMap<&str, &'a NormalizedEvent>,
    ids: &[String],
) -> Vec<&'a NormalizedEvent> {
    let mut out: Vec<&NormalizedEvent> = Vec::new();
    for id in ids {
        if let Some(event) = by_id.get(id.as_str()) {
            if !out.iter().any(|e| e.platform_id == event.platform_id) {
                out.push(event);
            }
        }
    }
    out
}

fn index(events: &[NormalizedEvent]) -> HashMap<&str, &NormalizedEvent> {
    events.iter().map(|e| (e.platform_id.as_str(), e)).collect()
}

#[derive(Debug, Deserialize)]
struct DecisionsReply {
    #[serde(default)]
    decisions: Vec<DecisionItem>,
}

#[derive(Debug, Deserialize)]
struct DecisionItem {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    source_event_ids: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DiscussionReply {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    key_points: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FeaturesReply {
    #[serde(default)]
    features: Vec<FeatureItem>,
}

#[derive(Debug, Deserialize)]
struct FeatureItem {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    source_event_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FilesReply {
    #[serde(default)]
    files: Vec<FileItem>,
}

#[derive(Debug, Deserialize)]
struct FileItem {
    path: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    source_event_ids: Vec<String>,
}

const DECISIONS_PROMPT: &str = "You read engineering activity events (JSON array). \
Identify decisions the team made. Reply with JSON: {\"decisions\": [{\"title\": str, \
\"description\": str, \"rationale\": str|null, \"source_event_ids\": [str], \
\"confidence\": number between 0 and 1}]}. Use only ids from the input.";

const DISCUSSION_PROMPT: &str = "You read one conversation thread (JSON array of events). \
Summarize it. Reply with JSON: {\"summary\": str|null, \"key_points\": [str]}. \
Use null when there is nothing worth summarizing.";

const FEATURES_PROMPT: &str = "You read engineering activity events (JSON array). \
Identify product features or components being worked on. Reply with JSON: \
{\"features\": [{\"name\": str, \"description\": str, \"source_event_ids\": [str]}]}. \
Use only ids from the input.";

const FILES_PROMPT: &str = "You read engineering activity events (JSON array). \
For each file path mentioned in the events' files lists, describe how it changed. \
Reply with JSON: {\"files\": [{\"path\": str, \"summary\": str, \"source_event_ids\": [str]}]}.";

fn unique_authors<'a>(events: impl IntoIterator<Item = &'a NormalizedEvent>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for event in events {
        let author = clean_inline(&event.author);
        if !author.is_empty() && !out.contains(&author) {
            out.push(author);
        }
    }
    out
}

#[async_trait]
impl KnowledgeExtractor for OpenAIExtractor {
    fn name(&self) -> &str {
        "openai"
    }

    async fn extract_decisions(&self, events: &[NormalizedEvent]) -> Result<Vec<DecisionRecord>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let reply: DecisionsReply = self.complete(DECISIONS_PROMPT, events).await?;
        let by_id = index(events);

        let mut decisions = Vec::new();
        for item in reply.decisions {
            let sources = grounded(&by_id, &item.source_event_ids);
            let Some(first) = sources.first() else {
                continue;
            };
            let title = truncate_chars(&clean_inline(&item.title), 120);
            if title.is_empty() {
                continue;
            }
            decisions.push(DecisionRecord {
                id: entity_id(
                    EntityKind::Decision,
                    &[&first.platform, &first.platform_id, &title],
                ),
                title,
                description: truncate_chars(&sanitize(&item.description), 2000),
                rationale: item
                    .rationale
                    .map(|r| clean_inline(&r))
                    .filter(|r| !r.is_empty()),
                author: clean_inline(&first.author),
                platform: first.platform.clone(),
                source_event_ids: sources.iter().map(|e| e.platform_id.clone()).collect(),
                file_refs: sources.iter().flat_map(|e| e.file_refs.clone()).collect(),
                feature_refs: sources.iter().flat_map(|e| e.feature_refs.clone()).collect(),
                confidence: clamp_strength(item.confidence.unwrap_or(0.5)),
                decided_at: sources.iter().map(|e| e.timestamp).max().unwrap_or(first.timestamp),
            });
        }
        Ok(decisions)
    }

    async fn summarize_discussion(
        &self,
        events: &[NormalizedEvent],
    ) -> Result<Option<DiscussionSummary>> {
        let Some(first) = events.first() else {
            return Ok(None);
        };
        let reply: DiscussionReply = self.complete(DISCUSSION_PROMPT, events).await?;
        let Some(summary) = reply.summary.map(|s| clean_inline(&s)).filter(|s| !s.is_empty())
        else {
            return Ok(None);
        };

        let thread_id = first
            .thread_id
            .clone()
            .filter(|t| events.iter().all(|e| e.thread_id.as_ref() == Some(t)));
        Ok(Some(DiscussionSummary {
            id: entity_id(
                EntityKind::Discussion,
                &[&first.platform, thread_id.as_deref().unwrap_or("")],
            ),
            platform: first.platform.clone(),
            thread_id,
            summary,
            key_points: reply
                .key_points
                .iter()
                .map(|p| clean_inline(p))
                .filter(|p| !p.is_empty())
                .collect(),
            participants: unique_authors(events),
            source_event_ids: events.iter().map(|e| e.platform_id.clone()).collect(),
            started_at: events.iter().map(|e| e.timestamp).min().unwrap_or(first.timestamp),
            ended_at: events.iter().map(|e| e.timestamp).max().unwrap_or(first.timestamp),
        }))
    }

    async fn identify_features(&self, events: &[NormalizedEvent]) -> Result<Vec<FeatureContext>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let reply: FeaturesReply = self.complete(FEATURES_PROMPT, events).await?;
        let by_id = index(events);

        let mut features = Vec::new();
        for item in reply.features {
            let name = clean_inline(&item.name);
            let sources = grounded(&by_id, &item.source_event_ids);
            let Some(first) = sources.first() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            features.push(FeatureContext {
                id: entity_id(EntityKind::Feature, &[&first.platform, &name.to_lowercase()]),
                name,
                platform: first.platform.clone(),
                description: clean_inline(&item.description),
                file_refs: sources.iter().flat_map(|e| e.file_refs.clone()).collect(),
                contributors: unique_authors(sources.iter().copied()),
                source_event_ids: sources.iter().map(|e| e.platform_id.clone()).collect(),
                first_seen: sources.iter().map(|e| e.timestamp).min().unwrap_or(first.timestamp),
                last_seen: sources.iter().map(|e| e.timestamp).max().unwrap_or(first.timestamp),
            });
        }
        Ok(features)
    }

    async fn analyze_file_context(
        &self,
        events: &[NormalizedEvent],
    ) -> Result<Vec<FileContextHistory>> {
        if events.iter().all(|e| e.file_refs.is_empty()) {
            return Ok(Vec::new());
        }
        let reply: FilesReply = self.complete(FILES_PROMPT, events).await?;
        let by_id = index(events);

        let mut files = Vec::new();
        for item in reply.files {
            let path = item.path.trim().to_string();
            // Only paths the events actually reference.
            let sources: Vec<&NormalizedEvent> = grounded(&by_id, &item.source_event_ids)
                .into_iter()
                .filter(|e| e.file_refs.iter().any(|f| f.trim() == path))
                .collect();
            let Some(first) = sources.first() else {
                continue;
            };
            let summary = clean_inline(&item.summary);
            files.push(FileContextHistory {
                id: entity_id(EntityKind::FileContext, &[&first.platform, &path]),
                platform: first.platform.clone(),
                change_summaries: if summary.is_empty() { Vec::new() } else { vec![summary] },
                authors: unique_authors(sources.iter().copied()),
                feature_refs: sources.iter().flat_map(|e| e.feature_refs.clone()).collect(),
                source_event_ids: sources.iter().map(|e| e.platform_id.clone()).collect(),
                last_modified: sources.iter().map(|e| e.timestamp).max().unwrap_or(first.timestamp),
                file_path: path,
            });
        }
        Ok(files)
    }
}
