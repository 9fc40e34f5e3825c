//! Relationship synthesis over an aggregated [`ProcessingResult`].
//!
//! Runs once, after all batches are merged, so edges only ever point at
//! canonical entity IDs. Counterparts that live on another platform or
//! cannot be found in the result become [`RelationshipEndpoint::CrossPlatform`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::knowledge::{
    DecisionRecord, DiscussionSummary, EntityKind, FeatureContext, FileContextHistory,
    ProcessingResult, Relationship, RelationshipEndpoint, RelationshipType,
};
use crate::models::{clean_inline, Metadata, MetadataValue};

/// Lookup tables from natural keys to entities.
struct Index<'a> {
    contributors: HashMap<(String, String), &'a str>,
    files: HashMap<(String, String), &'a FileContextHistory>,
    files_by_path: HashMap<String, &'a FileContextHistory>,
    features: HashMap<(String, String), &'a FeatureContext>,
    features_by_name: HashMap<String, &'a FeatureContext>,
}

impl<'a> Index<'a> {
    fn build(result: &'a ProcessingResult) -> Self {
        let mut index = Index {
            contributors: HashMap::new(),
            files: HashMap::new(),
            files_by_path: HashMap::new(),
            features: HashMap::new(),
            features_by_name: HashMap::new(),
        };
        for c in &result.contributors {
            index
                .contributors
                .insert((c.platform.clone(), c.name.clone()), c.id.as_str());
        }
        for f in &result.file_contexts {
            index
                .files
                .insert((f.platform.clone(), f.file_path.clone()), f);
            index.files_by_path.entry(f.file_path.clone()).or_insert(f);
        }
        for f in &result.features {
            let name = f.name.to_lowercase();
            index.features.insert((f.platform.clone(), name.clone()), f);
            index.features_by_name.entry(name).or_insert(f);
        }
        index
    }

    fn contributor(&self, platform: &str, name: &str) -> Option<&'a str> {
        self.contributors
            .get(&(platform.to_string(), name.to_string()))
            .copied()
    }

    fn file_endpoint(&self, platform: &str, path: &str) -> RelationshipEndpoint {
        let path = path.trim();
        if let Some(file) = self.files.get(&(platform.to_string(), path.to_string())) {
            return RelationshipEndpoint::local(EntityKind::FileContext, &file.id);
        }
        match self.files_by_path.get(path) {
            Some(other) => RelationshipEndpoint::cross_platform(&other.platform, &other.id),
            None => RelationshipEndpoint::cross_platform(platform, path),
        }
    }

    fn feature_lookup(&self, platform: &str, name: &str) -> Option<&'a FeatureContext> {
        self.features
            .get(&(platform.to_string(), clean_inline(name).to_lowercase()))
            .copied()
    }

    fn feature_endpoint(&self, platform: &str, name: &str) -> RelationshipEndpoint {
        if let Some(feature) = self.feature_lookup(platform, name) {
            return RelationshipEndpoint::local(EntityKind::Feature, &feature.id);
        }
        let folded = clean_inline(name).to_lowercase();
        match self.features_by_name.get(&folded) {
            Some(other) => RelationshipEndpoint::cross_platform(&other.platform, &other.id),
            None => RelationshipEndpoint::cross_platform(platform, clean_inline(name)),
        }
    }
}

/// Build every relationship implied by `result`'s entities.
///
/// Output is deduplicated by relationship ID, keeping the first edge, and
/// ordered by entity order in `result`.
pub fn synthesize_relationships(
    result: &ProcessingResult,
    now: DateTime<Utc>,
) -> Vec<Relationship> {
    let index = Index::build(result);
    let mut edges = Vec::new();

    for decision in &result.decisions {
        decision_edges(decision, result, &index, now, &mut edges);
    }
    for file in &result.file_contexts {
        file_feature_edges(file, result, &index, now, &mut edges);
    }

    let mut seen = HashSet::new();
    edges.retain(|rel: &Relationship| seen.insert(rel.id.clone()));
    edges
}

fn decision_edges(
    decision: &DecisionRecord,
    result: &ProcessingResult,
    index: &Index<'_>,
    now: DateTime<Utc>,
    edges: &mut Vec<Relationship>,
) {
    let source = RelationshipEndpoint::local(EntityKind::Decision, &decision.id);
    let platform = decision.platform.as_str();

    let author = clean_inline(&decision.author);
    if !author.is_empty() {
        let target = match index.contributor(platform, &author) {
            Some(id) => RelationshipEndpoint::local(EntityKind::Contributor, id),
            None => RelationshipEndpoint::cross_platform(platform, &author),
        };
        edges.push(Relationship::new(
            RelationshipType::ContributedBy,
            source.clone(),
            target,
            decision.confidence,
            Metadata::new(),
            now,
        ));
    }

    for path in decision.file_refs.iter().filter(|p| !p.trim().is_empty()) {
        edges.push(Relationship::new(
            RelationshipType::RelatesToFile,
            source.clone(),
            index.file_endpoint(platform, path),
            decision.confidence,
            Metadata::new(),
            now,
        ));
    }

    for name in decision
        .feature_refs
        .iter()
        .filter(|n| !clean_inline(n).is_empty())
    {
        edges.push(Relationship::new(
            RelationshipType::RelatesToFeature,
            source.clone(),
            index.feature_endpoint(platform, name),
            decision.confidence,
            Metadata::new(),
            now,
        ));
    }

    for discussion in &result.discussions {
        let Some((strength, via)) = discussion_link(decision, discussion) else {
            continue;
        };
        let target = if discussion.platform == decision.platform {
            RelationshipEndpoint::local(EntityKind::Discussion, &discussion.id)
        } else {
            RelationshipEndpoint::cross_platform(&discussion.platform, &discussion.id)
        };
        let mut metadata = Metadata::new();
        metadata.insert("matched_on".to_string(), MetadataValue::from(via));
        edges.push(Relationship::new(
            RelationshipType::DiscussedIn,
            source.clone(),
            target,
            strength,
            metadata,
            now,
        ));
    }
}

/// A decision belongs to a discussion when they share a source event on the
/// same platform, or when the discussion thread is one of the decision's
/// source events (a PR thread, say) on any platform.
fn discussion_link(
    decision: &DecisionRecord,
    discussion: &DiscussionSummary,
) -> Option<(f64, &'static str)> {
    let overlap = jaccard(&decision.source_event_ids, &discussion.source_event_ids);
    if discussion.platform == decision.platform && overlap > 0.0 {
        return Some((overlap.max(0.5), "source_event"));
    }
    let thread = discussion.thread_id.as_deref()?;
    if decision.source_event_ids.iter().any(|id| id == thread) {
        return Some((overlap.max(0.5), "thread"));
    }
    None
}

fn file_feature_edges(
    file: &FileContextHistory,
    result: &ProcessingResult,
    index: &Index<'_>,
    now: DateTime<Utc>,
    edges: &mut Vec<Relationship>,
) {
    let source = RelationshipEndpoint::local(EntityKind::FileContext, &file.id);
    let platform = file.platform.as_str();

    for name in file
        .feature_refs
        .iter()
        .filter(|n| !clean_inline(n).is_empty())
    {
        let (target, strength) = match index.feature_lookup(platform, name) {
            Some(feature) => (
                RelationshipEndpoint::local(EntityKind::Feature, &feature.id),
                0.5 + 0.5 * jaccard(&file.source_event_ids, &feature.source_event_ids),
            ),
            None => (index.feature_endpoint(platform, name), 0.5),
        };
        edges.push(Relationship::new(
            RelationshipType::RelatesToFeature,
            source.clone(),
            target,
            strength,
            Metadata::new(),
            now,
        ));
    }

    // Features that list this file without the file listing them back.
    for feature in result
        .features
        .iter()
        .filter(|f| f.platform == file.platform)
        .filter(|f| f.file_refs.iter().any(|p| p.trim() == file.file_path))
    {
        edges.push(Relationship::new(
            RelationshipType::RelatesToFeature,
            source.clone(),
            RelationshipEndpoint::local(EntityKind::Feature, &feature.id),
            0.5 + 0.5 * jaccard(&file.source_event_ids, &feature.source_event_ids),
            Metadata::new(),
            now,
        ));
    }
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::contributors_from_events;
    use crate::knowledge::entity_id;
    use crate::models::{EventType, NormalizedEvent};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn decision(platform: &str, events: &[&str]) -> DecisionRecord {
        DecisionRecord {
            id: entity_id(EntityKind::Decision, &[platform, events[0], "t"]),
            title: "Adopt sqlx".to_string(),
            description: "we decided to adopt sqlx".to_string(),
            rationale: None,
            author: "alice".to_string(),
            platform: platform.to_string(),
            source_event_ids: events.iter().map(|s| s.to_string()).collect(),
            file_refs: vec!["src/db.rs".to_string(), "docs/missing.md".to_string()],
            feature_refs: vec!["storage".to_string()],
            confidence: 0.8,
            decided_at: ts(1),
        }
    }

    fn file(platform: &str, path: &str, features: &[&str], events: &[&str]) -> FileContextHistory {
        FileContextHistory {
            id: entity_id(EntityKind::FileContext, &[platform, path]),
            file_path: path.to_string(),
            platform: platform.to_string(),
            change_summaries: vec![],
            authors: vec![],
            feature_refs: features.iter().map(|s| s.to_string()).collect(),
            source_event_ids: events.iter().map(|s| s.to_string()).collect(),
            last_modified: ts(1),
        }
    }

    fn feature(platform: &str, name: &str, events: &[&str]) -> FeatureContext {
        FeatureContext {
            id: entity_id(EntityKind::Feature, &[platform, &name.to_lowercase()]),
            name: name.to_string(),
            platform: platform.to_string(),
            description: String::new(),
            file_refs: vec![],
            contributors: vec![],
            source_event_ids: events.iter().map(|s| s.to_string()).collect(),
            first_seen: ts(1),
            last_seen: ts(1),
        }
    }

    fn sample() -> ProcessingResult {
        let author_event = NormalizedEvent {
            platform_id: "pr-1".to_string(),
            event_type: EventType::PullRequest,
            timestamp: ts(1),
            author: "alice".to_string(),
            content: String::new(),
            platform: "github".to_string(),
            file_refs: vec![],
            feature_refs: vec![],
            thread_id: None,
            metadata: Metadata::new(),
        };
        ProcessingResult {
            processed_events: 1,
            decisions: vec![decision("github", &["pr-1"])],
            discussions: vec![DiscussionSummary {
                id: entity_id(EntityKind::Discussion, &["slack", "pr-1"]),
                platform: "slack".to_string(),
                thread_id: Some("pr-1".to_string()),
                summary: "talked about sqlx".to_string(),
                key_points: vec![],
                participants: vec![],
                source_event_ids: vec!["m-1".to_string()],
                started_at: ts(1),
                ended_at: ts(2),
            }],
            features: vec![feature("github", "Storage", &["pr-1", "pr-2"])],
            file_contexts: vec![file("github", "src/db.rs", &["storage", "search"], &["pr-1"])],
            contributors: contributors_from_events(&[author_event]),
            relationships: vec![],
            errors: vec![],
        }
    }

    #[test]
    fn local_endpoints_resolve_and_strengths_are_bounded() {
        let mut result = sample();
        result.relationships = synthesize_relationships(&result, ts(5));
        assert!(result.relationships_resolve());
        assert!(result
            .relationships
            .iter()
            .all(|r| (0.0..=1.0).contains(&r.strength)));
    }

    #[test]
    fn unresolved_and_foreign_counterparts_are_cross_platform() {
        let result = sample();
        let rels = synthesize_relationships(&result, ts(5));

        let missing_file = rels
            .iter()
            .find(|r| {
                r.relationship_type == RelationshipType::RelatesToFile
                    && r.target.is_cross_platform()
            })
            .unwrap();
        assert_eq!(
            missing_file.target,
            RelationshipEndpoint::cross_platform("github", "docs/missing.md")
        );

        let discussed = rels
            .iter()
            .find(|r| r.relationship_type == RelationshipType::DiscussedIn)
            .unwrap();
        assert!(discussed.target.is_cross_platform());
        assert_eq!(discussed.strength, 0.5);

        let search = rels
            .iter()
            .find(|r| r.target == RelationshipEndpoint::cross_platform("github", "search"))
            .unwrap();
        assert_eq!(search.strength, 0.5);
    }

    #[test]
    fn file_feature_strength_uses_event_overlap() {
        let result = sample();
        let rels = synthesize_relationships(&result, ts(5));
        let storage = rels
            .iter()
            .find(|r| {
                r.relationship_type == RelationshipType::RelatesToFeature
                    && r.source.key().starts_with("file_context:")
                    && !r.target.is_cross_platform()
            })
            .unwrap();
        // {pr-1} vs {pr-1, pr-2}
        assert!((storage.strength - 0.75).abs() < 1e-9);
    }

    #[test]
    fn duplicate_edges_are_removed() {
        let mut result = sample();
        result.features[0].file_refs = vec!["src/db.rs".to_string()];
        let rels = synthesize_relationships(&result, ts(5));
        let ids: HashSet<&str> = rels.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), rels.len());
    }
}
