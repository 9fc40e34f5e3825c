//! Rule-based extractor.
//!
//! Decisions come from keyword cues ("decided", "we will", "agreed", ...)
//! and merged pull requests. Features come from `feature_refs` and
//! `#hashtags`, file contexts from `file_refs`. Every entity depends only on
//! the events it was built from, so results do not shift with batch size.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use context_ingest_core::knowledge::{
    entity_id, DecisionRecord, DiscussionSummary, EntityKind, FeatureContext, FileContextHistory,
};
use context_ingest_core::models::{clean_inline, EventType, MetadataValue, NormalizedEvent};

use super::{sanitize, truncate_chars, KnowledgeExtractor};

const DECISION_CUES: [&str; 10] = [
    "decided",
    "decision",
    "we will",
    "we'll go with",
    "let's go with",
    "agreed",
    "approved",
    "going forward",
    "settled on",
    "chose",
];

const RATIONALE_CUES: [&str; 3] = ["because ", "so that ", "since "];

const TITLE_CHARS: usize = 120;
const DESCRIPTION_CHARS: usize = 2000;
const RATIONALE_CHARS: usize = 280;
const KEY_POINT_CHARS: usize = 200;
const MAX_KEY_POINTS: usize = 5;

#[derive(Debug, Default, Clone)]
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn title_of(event: &NormalizedEvent) -> String {
    let first_line = event
        .content
        .lines()
        .map(clean_inline)
        .find(|l| !l.is_empty());
    match first_line {
        Some(line) => truncate_chars(&line, TITLE_CHARS),
        None => format!("{} {}", event.event_type, event.platform_id),
    }
}

fn is_merged(event: &NormalizedEvent) -> bool {
    event.event_type == EventType::PullRequest
        && event
            .metadata
            .get("merged")
            .and_then(MetadataValue::as_bool)
            .unwrap_or(false)
}

fn rationale_of(lower: &str, original: &str) -> Option<String> {
    RATIONALE_CUES.iter().find_map(|cue| {
        let start = lower.find(cue)?;
        // Lowercasing can shift byte offsets for non-ASCII text.
        let rest = original.get(start..)?;
        let sentence = rest
            .split(['.', '\n', '!', '?'])
            .next()
            .map(clean_inline)
            .filter(|s| !s.is_empty())?;
        Some(truncate_chars(&sentence, RATIONALE_CHARS))
    })
}

fn decision_from(event: &NormalizedEvent) -> Option<DecisionRecord> {
    let content = sanitize(&event.content);
    let lower = content.to_lowercase();
    let hits = DECISION_CUES.iter().filter(|cue| lower.contains(*cue)).count();
    let merged = is_merged(event);
    if hits == 0 && !merged {
        return None;
    }

    let title = title_of(event);
    let mut confidence = 0.5 + 0.1 * hits.min(4) as f64;
    if merged {
        confidence += 0.2;
    }

    Some(DecisionRecord {
        id: entity_id(
            EntityKind::Decision,
            &[&event.platform, &event.platform_id, &title],
        ),
        rationale: rationale_of(&lower, &content),
        description: truncate_chars(content.trim(), DESCRIPTION_CHARS),
        title,
        author: clean_inline(&event.author),
        platform: event.platform.clone(),
        source_event_ids: vec![event.platform_id.clone()],
        file_refs: event.file_refs.clone(),
        feature_refs: event.feature_refs.clone(),
        confidence: confidence.min(0.95),
        decided_at: event.timestamp,
    })
}

/// `#name` tokens that start with a letter; `#42` issue references are not
/// features.
fn hashtags(content: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for token in content.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')') {
        let Some(tag) = token.strip_prefix('#') else {
            continue;
        };
        let tag = tag.trim_end_matches(['.', ':', ';', '!', '?']);
        let valid = tag.chars().next().is_some_and(|c| c.is_alphabetic())
            && tag
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_');
        if valid && !tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            tags.push(tag.to_string());
        }
    }
    tags
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn key_points(events: &[NormalizedEvent]) -> Vec<String> {
    let mut points = Vec::new();
    for event in events {
        for line in sanitize(&event.content).lines() {
            let line = clean_inline(line);
            let lower = line.to_lowercase();
            let notable = line.ends_with('?') || DECISION_CUES.iter().any(|c| lower.contains(c));
            if notable {
                push_unique(&mut points, &truncate_chars(&line, KEY_POINT_CHARS));
            }
            if points.len() >= MAX_KEY_POINTS {
                return points;
            }
        }
    }
    points
}

#[async_trait]
impl KnowledgeExtractor for HeuristicExtractor {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn extract_decisions(&self, events: &[NormalizedEvent]) -> Result<Vec<DecisionRecord>> {
        Ok(events.iter().filter_map(decision_from).collect())
    }

    async fn summarize_discussion(
        &self,
        events: &[NormalizedEvent],
    ) -> Result<Option<DiscussionSummary>> {
        let Some(first) = events.first() else {
            return Ok(None);
        };

        let mut participants = Vec::new();
        for event in events {
            push_unique(&mut participants, &clean_inline(&event.author));
        }

        let thread_id = first
            .thread_id
            .clone()
            .filter(|t| events.iter().all(|e| e.thread_id.as_ref() == Some(t)));
        let opener = events
            .iter()
            .map(title_of)
            .next()
            .unwrap_or_default();
        let summary = format!(
            "{} {} from {} participant{}: {}",
            events.len(),
            if events.len() == 1 { "message" } else { "messages" },
            participants.len(),
            if participants.len() == 1 { "" } else { "s" },
            opener
        );

        Ok(Some(DiscussionSummary {
            id: entity_id(
                EntityKind::Discussion,
                &[&first.platform, thread_id.as_deref().unwrap_or("")],
            ),
            platform: first.platform.clone(),
            thread_id,
            summary,
            key_points: key_points(events),
            participants,
            source_event_ids: events.iter().map(|e| e.platform_id.clone()).collect(),
            started_at: events.iter().map(|e| e.timestamp).min().unwrap_or(first.timestamp),
            ended_at: events.iter().map(|e| e.timestamp).max().unwrap_or(first.timestamp),
        }))
    }

    async fn identify_features(&self, events: &[NormalizedEvent]) -> Result<Vec<FeatureContext>> {
        let mut features: Vec<FeatureContext> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for event in events {
            let mut names: Vec<String> = event.feature_refs.clone();
            names.extend(hashtags(&event.content));

            for name in names {
                let name = clean_inline(&name);
                if name.is_empty() {
                    continue;
                }
                let key = (event.platform.clone(), name.to_lowercase());
                let idx = match index.get(&key) {
                    Some(&idx) => idx,
                    None => {
                        features.push(FeatureContext {
                            id: entity_id(EntityKind::Feature, &[&key.0, &key.1]),
                            name: name.clone(),
                            platform: event.platform.clone(),
                            description: String::new(),
                            file_refs: Vec::new(),
                            contributors: Vec::new(),
                            source_event_ids: Vec::new(),
                            first_seen: event.timestamp,
                            last_seen: event.timestamp,
                        });
                        index.insert(key, features.len() - 1);
                        features.len() - 1
                    }
                };
                let feature = &mut features[idx];
                for path in &event.file_refs {
                    push_unique(&mut feature.file_refs, path.trim());
                }
                push_unique(&mut feature.contributors, &clean_inline(&event.author));
                push_unique(&mut feature.source_event_ids, &event.platform_id);
                feature.first_seen = feature.first_seen.min(event.timestamp);
                feature.last_seen = feature.last_seen.max(event.timestamp);
            }
        }

        for feature in &mut features {
            feature.description = format!(
                "Referenced by {} event{}",
                feature.source_event_ids.len(),
                if feature.source_event_ids.len() == 1 { "" } else { "s" }
            );
        }
        Ok(features)
    }

    async fn analyze_file_context(
        &self,
        events: &[NormalizedEvent],
    ) -> Result<Vec<FileContextHistory>> {
        let mut files: Vec<FileContextHistory> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for event in events {
            let change = format!("{} {}: {}", event.event_type, event.platform_id, title_of(event));
            for path in &event.file_refs {
                let path = path.trim();
                if path.is_empty() {
                    continue;
                }
                let key = (event.platform.clone(), path.to_string());
                let idx = match index.get(&key) {
                    Some(&idx) => idx,
                    None => {
                        files.push(FileContextHistory {
                            id: entity_id(EntityKind::FileContext, &[&key.0, &key.1]),
                            file_path: path.to_string(),
                            platform: event.platform.clone(),
                            change_summaries: Vec::new(),
                            authors: Vec::new(),
                            feature_refs: Vec::new(),
                            source_event_ids: Vec::new(),
                            last_modified: event.timestamp,
                        });
                        index.insert(key, files.len() - 1);
                        files.len() - 1
                    }
                };
                let file = &mut files[idx];
                push_unique(&mut file.change_summaries, &change);
                push_unique(&mut file.authors, &clean_inline(&event.author));
                for feature in &event.feature_refs {
                    push_unique(&mut file.feature_refs, &clean_inline(feature));
                }
                push_unique(&mut file.source_event_ids, &event.platform_id);
                file.last_modified = file.last_modified.max(event.timestamp);
            }
        }
        Ok(files)
    }
}
