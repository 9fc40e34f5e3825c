//! Core data models for platform events and sync progress.
//!
//! These types flow from connectors into the deduplicator and the context
//! processor: [`RawEvent`] is what a connector fetches, [`NormalizedEvent`]
//! is the platform-agnostic form the processor consumes, and
//! [`SyncCheckpoint`] is the per-integration cursor plus dedup window.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Open-ended metadata mapping. Ordered so serialized output is stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A dynamically typed metadata value.
///
/// Replaces untyped `any` maps: connectors may attach arbitrary fields, but
/// every value is one of a closed set of shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<MetadataValue>),
    Map(Metadata),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Number(value as f64)
    }
}

impl From<u64> for MetadataValue {
    fn from(value: u64) -> Self {
        MetadataValue::Number(value as f64)
    }
}

impl From<serde_json::Value> for MetadataValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => MetadataValue::Null,
            serde_json::Value::Bool(b) => MetadataValue::Bool(b),
            serde_json::Value::Number(n) => MetadataValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => MetadataValue::String(s),
            serde_json::Value::Array(items) => {
                MetadataValue::List(items.into_iter().map(MetadataValue::from).collect())
            }
            serde_json::Value::Object(map) => MetadataValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, MetadataValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Kind of platform activity an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PullRequest,
    Issue,
    Commit,
    Message,
    Thread,
    Discussion,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PullRequest => "pull_request",
            EventType::Issue => "issue",
            EventType::Commit => "commit",
            EventType::Message => "message",
            EventType::Thread => "thread",
            EventType::Discussion => "discussion",
        }
    }

    /// Whether events of this type are conversational (chat or threads).
    pub fn is_conversational(&self) -> bool {
        matches!(
            self,
            EventType::Message | EventType::Thread | EventType::Discussion
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    /// Parses canonical names plus the aliases platforms commonly use.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "pull_request" | "pr" | "pull" | "merge_request" | "mr" => Ok(EventType::PullRequest),
            "issue" | "ticket" | "bug" => Ok(EventType::Issue),
            "commit" | "push" => Ok(EventType::Commit),
            "message" | "chat" | "msg" => Ok(EventType::Message),
            "thread" | "reply" => Ok(EventType::Thread),
            "discussion" | "comment" | "review" => Ok(EventType::Discussion),
            other => anyhow::bail!("Unknown event type: '{}'", other),
        }
    }
}

/// A connector-native record, before normalization.
///
/// Deduplication operates on `platform_id`; the payload is opaque to
/// everything except the connector that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub platform_id: String,
    pub platform: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Platform-agnostic representation of an activity item.
///
/// Produced by a connector's `normalize` and never mutated afterwards.
/// `content` may be empty or arbitrarily long; `author` may be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub platform_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub content: String,
    pub platform: String,
    #[serde(default)]
    pub file_refs: Vec<String>,
    #[serde(default)]
    pub feature_refs: Vec<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Per-integration sync cursor and deduplication window.
///
/// Serialized as an open mapping: the well-known keys below plus any extra
/// keys a caller stored, which round-trip untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_events_processed: u64,
    #[serde(default)]
    pub latest_event_timestamp: Option<DateTime<Utc>>,
    /// Platform IDs already processed, oldest first.
    #[serde(default)]
    pub processed_event_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: Metadata,
}

impl SyncCheckpoint {
    /// Set view of the dedup window.
    pub fn processed_set(&self) -> HashSet<&str> {
        self.processed_event_ids.iter().map(String::as_str).collect()
    }

    /// Returns the checkpoint after a successful cycle.
    ///
    /// `total_events_processed` only grows, `latest_event_timestamp` only
    /// moves forward, and `processed_event_ids` keeps the newest `window`
    /// IDs in insertion order.
    pub fn advance<I>(
        &self,
        synced_at: DateTime<Utc>,
        processed: u64,
        latest_event: Option<DateTime<Utc>>,
        new_ids: I,
        window: usize,
    ) -> SyncCheckpoint
    where
        I: IntoIterator<Item = String>,
    {
        let mut next = self.clone();
        next.last_sync_time = Some(synced_at);
        next.total_events_processed = self.total_events_processed.saturating_add(processed);
        next.latest_event_timestamp = match (self.latest_event_timestamp, latest_event) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => old.or(new),
        };

        let mut seen: HashSet<String> = next.processed_event_ids.iter().cloned().collect();
        for id in new_ids {
            if seen.insert(id.clone()) {
                next.processed_event_ids.push(id);
            }
        }
        if next.processed_event_ids.len() > window {
            let overflow = next.processed_event_ids.len() - window;
            next.processed_event_ids.drain(..overflow);
        }
        next
    }
}

/// Collapse a free-text field onto one line: control characters become
/// spaces, whitespace runs collapse, and the ends are trimmed.
pub fn clean_inline(text: &str) -> String {
    text.split(|c: char| c.is_control() || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn clean_inline_strips_control_characters() {
        assert_eq!(clean_inline("  al\u{0}ice\t\n "), "al ice");
        assert_eq!(clean_inline("\u{7}\u{1b}"), "");
        assert_eq!(clean_inline("ship  it"), "ship it");
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn checkpoint_advance_accumulates_and_windows() {
        let cp = SyncCheckpoint {
            total_events_processed: 100,
            latest_event_timestamp: Some(ts(500)),
            processed_event_ids: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        };

        let next = cp.advance(
            ts(1_000),
            3,
            Some(ts(400)),
            vec!["c".to_string(), "d".to_string(), "e".to_string()],
            4,
        );

        assert_eq!(next.total_events_processed, 103);
        assert_eq!(next.last_sync_time, Some(ts(1_000)));
        // Never moves backwards.
        assert_eq!(next.latest_event_timestamp, Some(ts(500)));
        assert_eq!(next.processed_event_ids, vec!["b", "c", "d", "e"]);
    }

    #[test]
    fn checkpoint_preserves_unknown_keys() {
        let json = serde_json::json!({
            "total_events_processed": 7,
            "processed_event_ids": ["x"],
            "cursor": "abc",
            "page": 3
        });
        let cp: SyncCheckpoint = serde_json::from_value(json).unwrap();
        assert_eq!(cp.total_events_processed, 7);
        assert_eq!(cp.extra.get("cursor"), Some(&MetadataValue::from("abc")));

        let back = serde_json::to_value(&cp).unwrap();
        assert_eq!(back["page"], serde_json::json!(3.0));
        assert_eq!(back["cursor"], "abc");
    }

    #[test]
    fn event_type_aliases() {
        assert_eq!("PR".parse::<EventType>().unwrap(), EventType::PullRequest);
        assert_eq!(
            "merge-request".parse::<EventType>().unwrap(),
            EventType::PullRequest
        );
        assert_eq!("chat".parse::<EventType>().unwrap(), EventType::Message);
        assert!("deployment".parse::<EventType>().is_err());
    }

    #[test]
    fn metadata_from_json_keeps_shape() {
        let value = MetadataValue::from(serde_json::json!({
            "labels": ["a", "b"],
            "draft": false,
            "additions": 12
        }));
        let MetadataValue::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(map["draft"], MetadataValue::Bool(false));
        assert_eq!(map["additions"].as_f64(), Some(12.0));
        assert!(matches!(map["labels"], MetadataValue::List(ref l) if l.len() == 2));
    }
}
