//! Knowledge entities extracted from normalized events.
//!
//! A [`ProcessingResult`] bundles everything one context-processor call
//! produced: decisions, discussion summaries, feature contexts, file
//! histories, contributors, the relationships between them, and the
//! recoverable errors encountered along the way.
//!
//! Entity IDs are deterministic (see [`entity_id`]) so that re-processing
//! the same events upserts instead of duplicating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::Metadata;

/// The kinds of entity a relationship endpoint can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Decision,
    Discussion,
    Feature,
    FileContext,
    Contributor,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Decision => "decision",
            EntityKind::Discussion => "discussion",
            EntityKind::Feature => "feature",
            EntityKind::FileContext => "file_context",
            EntityKind::Contributor => "contributor",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            EntityKind::Decision => "dec",
            EntityKind::Discussion => "disc",
            EntityKind::Feature => "feat",
            EntityKind::FileContext => "file",
            EntityKind::Contributor => "contrib",
        }
    }
}

fn short_hash<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..20].to_string()
}

/// Deterministic ID for an entity of `kind` identified by its natural key.
pub fn entity_id(kind: EntityKind, key: &[&str]) -> String {
    let hash = short_hash(std::iter::once(kind.as_str()).chain(key.iter().copied()));
    format!("{}_{}", kind.id_prefix(), hash)
}

/// A decision recorded in a PR, issue or conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub rationale: Option<String>,
    pub author: String,
    pub platform: String,
    pub source_event_ids: Vec<String>,
    #[serde(default)]
    pub file_refs: Vec<String>,
    #[serde(default)]
    pub feature_refs: Vec<String>,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f64,
    pub decided_at: DateTime<Utc>,
}

/// Summary of a conversation (a chat thread or a run of comments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionSummary {
    pub id: String,
    pub platform: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    pub source_event_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// A feature (label, epic, component) and the activity touching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContext {
    pub id: String,
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_refs: Vec<String>,
    #[serde(default)]
    pub contributors: Vec<String>,
    pub source_event_ids: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Change history and context for a single file path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContextHistory {
    pub id: String,
    pub file_path: String,
    pub platform: String,
    #[serde(default)]
    pub change_summaries: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub feature_refs: Vec<String>,
    pub source_event_ids: Vec<String>,
    pub last_modified: DateTime<Utc>,
}

/// A person active on a platform, derived from event authors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub event_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One end of a [`Relationship`].
///
/// `Local` endpoints always resolve to an entity carried by the same
/// [`ProcessingResult`]. `CrossPlatform` marks a counterpart that lives on
/// another platform or could not be resolved within this result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationshipEndpoint {
    Local { entity_type: EntityKind, id: String },
    CrossPlatform { platform: String, reference: String },
}

impl RelationshipEndpoint {
    pub fn local(entity_type: EntityKind, id: impl Into<String>) -> Self {
        RelationshipEndpoint::Local {
            entity_type,
            id: id.into(),
        }
    }

    pub fn cross_platform(platform: impl Into<String>, reference: impl Into<String>) -> Self {
        RelationshipEndpoint::CrossPlatform {
            platform: platform.into(),
            reference: reference.into(),
        }
    }

    pub fn is_cross_platform(&self) -> bool {
        matches!(self, RelationshipEndpoint::CrossPlatform { .. })
    }

    /// Stable textual key, used for relationship IDs and storage columns.
    pub fn key(&self) -> String {
        match self {
            RelationshipEndpoint::Local { entity_type, id } => {
                format!("{}:{}", entity_type.as_str(), id)
            }
            RelationshipEndpoint::CrossPlatform {
                platform,
                reference,
            } => format!("cross_platform:{}:{}", platform, reference),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    ContributedBy,
    RelatesToFile,
    RelatesToFeature,
    DiscussedIn,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::ContributedBy => "contributed_by",
            RelationshipType::RelatesToFile => "relates_to_file",
            RelationshipType::RelatesToFeature => "relates_to_feature",
            RelationshipType::DiscussedIn => "discussed_in",
        }
    }
}

/// Typed, weighted edge between two knowledge entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source: RelationshipEndpoint,
    pub target: RelationshipEndpoint,
    pub relationship_type: RelationshipType,
    /// Always within `[0, 1]`.
    pub strength: f64,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    /// Builds an edge with a deterministic ID and a clamped strength.
    pub fn new(
        relationship_type: RelationshipType,
        source: RelationshipEndpoint,
        target: RelationshipEndpoint,
        strength: f64,
        metadata: Metadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        let source_key = source.key();
        let target_key = target.key();
        let id = format!(
            "rel_{}",
            short_hash([
                relationship_type.as_str(),
                source_key.as_str(),
                target_key.as_str(),
            ])
        );
        Self {
            id,
            source,
            target,
            relationship_type,
            strength: clamp_strength(strength),
            metadata,
            created_at,
        }
    }
}

/// Clamp a score to `[0, 1]`; NaN becomes 0.
pub fn clamp_strength(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// A recoverable failure attached to a [`ProcessingResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub event_id: String,
    pub platform: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

/// Everything produced by one context-processor call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// Always equals the number of input events.
    pub processed_events: usize,
    pub decisions: Vec<DecisionRecord>,
    pub discussions: Vec<DiscussionSummary>,
    pub features: Vec<FeatureContext>,
    pub file_contexts: Vec<FileContextHistory>,
    pub contributors: Vec<Contributor>,
    pub relationships: Vec<Relationship>,
    pub errors: Vec<ProcessingError>,
}

impl ProcessingResult {
    /// Number of knowledge entities, relationships excluded.
    pub fn entity_count(&self) -> usize {
        self.decisions.len()
            + self.discussions.len()
            + self.features.len()
            + self.file_contexts.len()
            + self.contributors.len()
    }

    /// Whether an entity of `kind` with `id` is carried by this result.
    pub fn contains_entity(&self, kind: EntityKind, id: &str) -> bool {
        match kind {
            EntityKind::Decision => self.decisions.iter().any(|d| d.id == id),
            EntityKind::Discussion => self.discussions.iter().any(|d| d.id == id),
            EntityKind::Feature => self.features.iter().any(|f| f.id == id),
            EntityKind::FileContext => self.file_contexts.iter().any(|f| f.id == id),
            EntityKind::Contributor => self.contributors.iter().any(|c| c.id == id),
        }
    }

    /// Whether every `Local` endpoint resolves inside this result.
    pub fn relationships_resolve(&self) -> bool {
        self.relationships.iter().all(|rel| {
            [&rel.source, &rel.target].into_iter().all(|end| match end {
                RelationshipEndpoint::Local { entity_type, id } => {
                    self.contains_entity(*entity_type, id)
                }
                RelationshipEndpoint::CrossPlatform { .. } => true,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_are_deterministic_and_kind_scoped() {
        let a = entity_id(EntityKind::Feature, &["github", "auth"]);
        let b = entity_id(EntityKind::Feature, &["github", "auth"]);
        let c = entity_id(EntityKind::FileContext, &["github", "auth"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("feat_"));
        // Key parts are delimited, so shifting characters changes the ID.
        assert_ne!(
            entity_id(EntityKind::Feature, &["git", "hubauth"]),
            entity_id(EntityKind::Feature, &["github", "auth"])
        );
    }

    #[test]
    fn relationship_strength_is_clamped() {
        let now = Utc::now();
        let src = RelationshipEndpoint::local(EntityKind::Decision, "dec_1");
        let dst = RelationshipEndpoint::cross_platform("slack", "C123");
        let high = Relationship::new(
            RelationshipType::DiscussedIn,
            src.clone(),
            dst.clone(),
            4.2,
            Metadata::new(),
            now,
        );
        let nan = Relationship::new(
            RelationshipType::DiscussedIn,
            src,
            dst,
            f64::NAN,
            Metadata::new(),
            now,
        );
        assert_eq!(high.strength, 1.0);
        assert_eq!(nan.strength, 0.0);
        assert_eq!(high.id, nan.id);
    }

    #[test]
    fn endpoint_serializes_with_kind_tag() {
        let json = serde_json::to_value(RelationshipEndpoint::cross_platform("slack", "x")).unwrap();
        assert_eq!(json["kind"], "cross_platform");
        let json =
            serde_json::to_value(RelationshipEndpoint::local(EntityKind::FileContext, "f")).unwrap();
        assert_eq!(json["kind"], "local");
        assert_eq!(json["entity_type"], "file_context");
    }
}
