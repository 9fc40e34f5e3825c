//! Checkpoint-based deduplication of fetched platform events.
//!
//! Connectors deliver at least once: a fetch may return events that were
//! already processed in an earlier cycle (overlapping `since` windows,
//! redelivery, a cycle retried after a failure). Filtering against the
//! checkpoint's `processed_event_ids` turns that into effectively-once
//! processing.

use std::collections::HashSet;

use crate::models::{RawEvent, SyncCheckpoint};

/// Outcome of a deduplication pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    /// Surviving events in their original order.
    pub fresh: Vec<RawEvent>,
    /// Number of events dropped (already processed or repeated in the batch).
    pub duplicates: usize,
}

/// Drop every event whose platform ID is already recorded in `checkpoint`.
///
/// Order is preserved. A platform ID repeated within `events` survives only
/// at its first occurrence. Applying the filter again with a checkpoint
/// advanced by the surviving IDs yields no events.
pub fn deduplicate(checkpoint: &SyncCheckpoint, events: Vec<RawEvent>) -> DedupOutcome {
    let processed = checkpoint.processed_set();
    let mut seen_in_batch: HashSet<String> = HashSet::new();
    let total = events.len();

    let fresh: Vec<RawEvent> = events
        .into_iter()
        .filter(|event| {
            !processed.contains(event.platform_id.as_str())
                && seen_in_batch.insert(event.platform_id.clone())
        })
        .collect();

    DedupOutcome {
        duplicates: total - fresh.len(),
        fresh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn raw(id: &str) -> RawEvent {
        RawEvent {
            platform_id: id.to_string(),
            platform: "github".to_string(),
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "id": id }),
        }
    }

    fn ids(events: &[RawEvent]) -> Vec<&str> {
        events.iter().map(|e| e.platform_id.as_str()).collect()
    }

    #[test]
    fn drops_already_processed_events() {
        let checkpoint = SyncCheckpoint {
            processed_event_ids: vec!["event-1".into(), "event-2".into()],
            ..Default::default()
        };
        let out = deduplicate(
            &checkpoint,
            vec![raw("event-1"), raw("event-2"), raw("event-3")],
        );
        assert_eq!(ids(&out.fresh), vec!["event-3"]);
        assert_eq!(out.duplicates, 2);
    }

    #[test]
    fn preserves_order_and_drops_in_batch_repeats() {
        let out = deduplicate(
            &SyncCheckpoint::default(),
            vec![raw("c"), raw("a"), raw("c"), raw("b")],
        );
        assert_eq!(ids(&out.fresh), vec!["c", "a", "b"]);
        assert_eq!(out.duplicates, 1);
    }

    #[test]
    fn reapplying_after_advance_yields_nothing() {
        let batch = vec![raw("x"), raw("y"), raw("z")];
        let first = deduplicate(&SyncCheckpoint::default(), batch.clone());
        assert_eq!(first.fresh.len(), 3);

        let advanced = SyncCheckpoint::default().advance(
            Utc::now(),
            first.fresh.len() as u64,
            None,
            first.fresh.iter().map(|e| e.platform_id.clone()),
            100,
        );
        let second = deduplicate(&advanced, batch);
        assert!(second.fresh.is_empty());
        assert_eq!(second.duplicates, 3);
    }

    #[test]
    fn empty_batch() {
        let out = deduplicate(&SyncCheckpoint::default(), Vec::new());
        assert!(out.fresh.is_empty());
        assert_eq!(out.duplicates, 0);
    }
}
