//! Cross-batch aggregation of extraction output.
//!
//! The context processor runs extraction per batch, so the same feature or
//! file can be reported by several batches. [`ResultAggregator`] merges those
//! reports by natural key and assigns canonical IDs, which makes the final
//! entity set independent of where batch boundaries fell.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::knowledge::{
    clamp_strength, entity_id, Contributor, DecisionRecord, DiscussionSummary, EntityKind,
    FeatureContext, FileContextHistory, ProcessingError, ProcessingResult,
};
use crate::models::{clean_inline, NormalizedEvent};
use crate::relationships::synthesize_relationships;

const MAX_KEY_POINTS: usize = 20;
const MAX_CHANGE_SUMMARIES: usize = 50;

/// Accumulates per-batch extraction output into one [`ProcessingResult`].
#[derive(Debug, Default)]
pub struct ResultAggregator {
    decisions: Vec<DecisionRecord>,
    decision_index: HashMap<String, usize>,
    discussions: Vec<DiscussionSummary>,
    discussion_index: HashMap<(String, String), usize>,
    features: Vec<FeatureContext>,
    feature_index: HashMap<(String, String), usize>,
    file_contexts: Vec<FileContextHistory>,
    file_index: HashMap<(String, String), usize>,
    errors: Vec<ProcessingError>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decisions merge by ID; repeated reports only add source events.
    pub fn add_decisions(&mut self, decisions: Vec<DecisionRecord>) {
        for mut decision in decisions {
            decision.confidence = clamp_strength(decision.confidence);
            match self.decision_index.get(&decision.id) {
                Some(&idx) => {
                    let existing = &mut self.decisions[idx];
                    extend_unique(&mut existing.source_event_ids, decision.source_event_ids);
                    extend_unique(&mut existing.file_refs, decision.file_refs);
                    extend_unique(&mut existing.feature_refs, decision.feature_refs);
                    existing.confidence = existing.confidence.max(decision.confidence);
                }
                None => {
                    self.decision_index
                        .insert(decision.id.clone(), self.decisions.len());
                    self.decisions.push(decision);
                }
            }
        }
    }

    /// Discussions merge by `(platform, thread)`; thread-less summaries of
    /// one platform fold into a single rolling summary.
    pub fn add_discussion(&mut self, mut discussion: DiscussionSummary) {
        let thread = discussion.thread_id.clone().unwrap_or_default();
        let key = (discussion.platform.clone(), thread.clone());
        match self.discussion_index.get(&key) {
            Some(&idx) => {
                let existing = &mut self.discussions[idx];
                if existing.summary.trim().is_empty() {
                    existing.summary = discussion.summary;
                }
                extend_unique(&mut existing.key_points, discussion.key_points);
                existing.key_points.truncate(MAX_KEY_POINTS);
                extend_unique(&mut existing.participants, discussion.participants);
                extend_unique(&mut existing.source_event_ids, discussion.source_event_ids);
                existing.started_at = existing.started_at.min(discussion.started_at);
                existing.ended_at = existing.ended_at.max(discussion.ended_at);
            }
            None => {
                discussion.id = entity_id(EntityKind::Discussion, &[&key.0, &thread]);
                discussion.key_points.truncate(MAX_KEY_POINTS);
                self.discussion_index.insert(key, self.discussions.len());
                self.discussions.push(discussion);
            }
        }
    }

    /// Features merge by `(platform, case-folded name)`.
    pub fn add_features(&mut self, features: Vec<FeatureContext>) {
        for mut feature in features {
            let name = clean_inline(&feature.name);
            if name.is_empty() {
                continue;
            }
            let key = (feature.platform.clone(), name.to_lowercase());
            match self.feature_index.get(&key) {
                Some(&idx) => {
                    let existing = &mut self.features[idx];
                    if existing.description.trim().is_empty() {
                        existing.description = feature.description;
                    }
                    extend_unique(&mut existing.file_refs, feature.file_refs);
                    extend_unique(&mut existing.contributors, feature.contributors);
                    extend_unique(&mut existing.source_event_ids, feature.source_event_ids);
                    existing.first_seen = existing.first_seen.min(feature.first_seen);
                    existing.last_seen = existing.last_seen.max(feature.last_seen);
                }
                None => {
                    feature.id = entity_id(EntityKind::Feature, &[&key.0, &key.1]);
                    feature.name = name;
                    self.feature_index.insert(key, self.features.len());
                    self.features.push(feature);
                }
            }
        }
    }

    /// File contexts merge by `(platform, path)`.
    pub fn add_file_contexts(&mut self, files: Vec<FileContextHistory>) {
        for mut file in files {
            let path = file.file_path.trim().to_string();
            if path.is_empty() {
                continue;
            }
            let key = (file.platform.clone(), path.clone());
            match self.file_index.get(&key) {
                Some(&idx) => {
                    let existing = &mut self.file_contexts[idx];
                    extend_unique(&mut existing.change_summaries, file.change_summaries);
                    existing.change_summaries.truncate(MAX_CHANGE_SUMMARIES);
                    extend_unique(&mut existing.authors, file.authors);
                    extend_unique(&mut existing.feature_refs, file.feature_refs);
                    extend_unique(&mut existing.source_event_ids, file.source_event_ids);
                    existing.last_modified = existing.last_modified.max(file.last_modified);
                }
                None => {
                    file.id = entity_id(EntityKind::FileContext, &[&key.0, &path]);
                    file.file_path = path;
                    file.change_summaries.truncate(MAX_CHANGE_SUMMARIES);
                    self.file_index.insert(key, self.file_contexts.len());
                    self.file_contexts.push(file);
                }
            }
        }
    }

    pub fn add_error(&mut self, error: ProcessingError) {
        self.errors.push(error);
    }

    /// Derive contributors from `events`, synthesize relationships, and
    /// produce the final result. `processed_events` is `events.len()`.
    pub fn finish(self, events: &[NormalizedEvent], now: DateTime<Utc>) -> ProcessingResult {
        let mut result = ProcessingResult {
            processed_events: events.len(),
            decisions: self.decisions,
            discussions: self.discussions,
            features: self.features,
            file_contexts: self.file_contexts,
            contributors: contributors_from_events(events),
            relationships: Vec::new(),
            errors: self.errors,
        };
        result.relationships = synthesize_relationships(&result, now);
        result
    }
}

/// One contributor per distinct `(platform, author)`, in first-seen order.
/// Events with a blank author contribute nobody.
pub fn contributors_from_events(events: &[NormalizedEvent]) -> Vec<Contributor> {
    let mut contributors: Vec<Contributor> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for event in events {
        let name = clean_inline(&event.author);
        if name.is_empty() {
            continue;
        }
        let key = (event.platform.clone(), name);
        match index.get(&key) {
            Some(&idx) => {
                let existing = &mut contributors[idx];
                existing.event_count += 1;
                existing.first_seen = existing.first_seen.min(event.timestamp);
                existing.last_seen = existing.last_seen.max(event.timestamp);
            }
            None => {
                contributors.push(Contributor {
                    id: entity_id(EntityKind::Contributor, &[&key.0, &key.1]),
                    name: key.1.clone(),
                    platform: key.0.clone(),
                    event_count: 1,
                    first_seen: event.timestamp,
                    last_seen: event.timestamp,
                });
                index.insert(key, contributors.len() - 1);
            }
        }
    }

    contributors
}

fn extend_unique(target: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}
