//! Module `history` contains the event-history collaborator interface, the
//! query type, and the deterministic fingerprint used as the index key,
//! plus an in-memory implementation backed by a thread-safe record list.

use std::hash::Hasher;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventData};

/// A single event-history query: key-value selectors identifying the events
/// to match, plus an optional time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHistoryRequest {
    /// Flattened key-value pairs the recorded fingerprint must match.
    pub mask: EventData,
    /// Inclusive lower bound on the record timestamp.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the record timestamp.
    pub to: Option<DateTime<Utc>>,
}

impl EventHistoryRequest {
    /// The index key this request matches against.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        data_fingerprint(&self.mask, None)
    }
}

/// Computes the deterministic fingerprint of `data` restricted to the paths
/// selected by `mask`.
///
/// The payload is flattened to dotted paths, selected paths are sorted
/// lexicographically, and `path:value` pairs are fed to an FNV-1a hasher.
/// The result is independent of map-entry ordering; a missing mask path
/// contributes nothing; an empty or absent mask selects the whole payload.
#[must_use]
pub fn data_fingerprint(data: &EventData, mask: Option<&[String]>) -> u64 {
    let mut flattened = Vec::new();
    flatten("", data, &mut flattened);
    flattened.sort_by(|(a, _), (b, _)| a.cmp(b));

    let selects = |path: &str| match mask {
        Some(mask) if !mask.is_empty() => mask.iter().any(|selector| selector == path),
        _ => true,
    };

    let mut hasher = FnvHasher::default();
    for (path, value) in flattened {
        if !selects(&path) {
            continue;
        }

        hasher.write(path.as_bytes());
        hasher.write(b":");
        hasher.write(value.as_bytes());
        hasher.write(b";");
    }

    hasher.finish()
}

fn flatten(prefix: &str, data: &EventData, out: &mut Vec<(String, String)>) {
    for (key, value) in data {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match value {
            serde_json::Value::Object(nested) => flatten(&path, nested, out),
            scalar => out.push((path, scalar.to_string())),
        }
    }
}

/// The collaborator persisting event fingerprints and answering queries
/// against them. The hub records an event here whenever its `mask` is set.
#[async_trait]
pub trait EventHistory: Send + Sync {
    /// Records the fingerprint of `event`. Returns whether the record was
    /// accepted.
    async fn record_event(&self, event: &Event) -> bool;

    /// Counts recorded events matching `requests`.
    ///
    /// With `enforce_order` unset, the result is the total number of matches
    /// across all requests. With it set, each request must match after the
    /// previous request's newest match; the result is `1` when the whole
    /// chain matched and `0` otherwise. Implementations return `-1` when the
    /// underlying store failed.
    async fn get_events(&self, requests: &[EventHistoryRequest], enforce_order: bool) -> i64;
}

#[derive(Debug, Clone, Copy)]
struct HistoryRecord {
    fingerprint: u64,
    timestamp: DateTime<Utc>,
}

/// In-memory [`EventHistory`] implementation, backed by a thread-safe
/// record list.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventHistory {
    records: Arc<RwLock<Vec<HistoryRecord>>>,
}

impl InMemoryEventHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn matches_in(&self, request: &EventHistoryRequest, not_before: Option<DateTime<Utc>>) -> Vec<DateTime<Utc>> {
        let fingerprint = request.fingerprint();
        let from = match (request.from, not_before) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        self.records
            .read()
            .iter()
            .filter(|record| record.fingerprint == fingerprint)
            .filter(|record| from.map_or(true, |from| record.timestamp >= from))
            .filter(|record| request.to.map_or(true, |to| record.timestamp <= to))
            .map(|record| record.timestamp)
            .collect()
    }
}

#[async_trait]
impl EventHistory for InMemoryEventHistory {
    async fn record_event(&self, event: &Event) -> bool {
        let Some(data) = event.data.as_ref() else {
            return false;
        };

        self.records.write().push(HistoryRecord {
            fingerprint: data_fingerprint(data, event.mask.as_deref()),
            timestamp: event.timestamp,
        });

        true
    }

    async fn get_events(&self, requests: &[EventHistoryRequest], enforce_order: bool) -> i64 {
        if enforce_order {
            let mut not_before = None;

            for request in requests {
                let matches = self.matches_in(request, not_before);
                let Some(newest) = matches.into_iter().max() else {
                    return 0;
                };
                not_before = Some(newest);
            }

            return 1;
        }

        requests
            .iter()
            .map(|request| self.matches_in(request, None).len() as i64)
            .sum()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn data(pairs: &[(&str, serde_json::Value)]) -> EventData {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn fingerprint_ignores_entry_order() {
        let forward = data(&[("a", json!(1)), ("b", json!({"c": "x", "d": "y"}))]);
        let backward = data(&[("b", json!({"d": "y", "c": "x"})), ("a", json!(1))]);

        assert_eq!(
            data_fingerprint(&forward, None),
            data_fingerprint(&backward, None)
        );
    }

    #[test]
    fn fingerprint_respects_the_mask() {
        let payload = data(&[("a", json!(1)), ("b", json!({"c": "x"})), ("z", json!(9))]);

        let masked = data_fingerprint(&payload, Some(&["a".to_owned(), "b.c".to_owned()]));
        let full = data_fingerprint(&payload, None);
        let missing = data_fingerprint(
            &payload,
            Some(&["a".to_owned(), "b.c".to_owned(), "nope".to_owned()]),
        );

        assert_ne!(masked, full);
        // A selector that matches nothing contributes nothing.
        assert_eq!(masked, missing);
    }

    #[test]
    fn fingerprint_distinguishes_values() {
        let one = data(&[("a", json!(1))]);
        let two = data(&[("a", json!(2))]);

        assert_ne!(data_fingerprint(&one, None), data_fingerprint(&two, None));
    }

    #[tokio::test]
    async fn counts_matches_within_the_time_range() {
        let history = InMemoryEventHistory::new();

        let event = Event::new("e", "com.test.type", "com.test.source")
            .with_data(data(&[("k", json!("v"))]))
            .with_mask(vec!["k".to_owned()]);
        assert!(history.record_event(&event).await);
        assert!(history.record_event(&event).await);

        let request = EventHistoryRequest {
            mask: data(&[("k", json!("v"))]),
            from: None,
            to: None,
        };
        assert_eq!(history.get_events(&[request.clone()], false).await, 2);

        let before = EventHistoryRequest {
            to: Some(event.timestamp - chrono::Duration::seconds(1)),
            ..request
        };
        assert_eq!(history.get_events(&[before], false).await, 0);
    }

    #[tokio::test]
    async fn ordered_queries_require_the_whole_chain() {
        let history = InMemoryEventHistory::new();

        let first = Event::new("first", "com.test.type", "com.test.source")
            .with_data(data(&[("step", json!(1))]));
        let mut second = Event::new("second", "com.test.type", "com.test.source")
            .with_data(data(&[("step", json!(2))]));
        second.timestamp = first.timestamp + chrono::Duration::seconds(1);
        history.record_event(&first).await;
        history.record_event(&second).await;

        let step = |n: i64| EventHistoryRequest {
            mask: data(&[("step", json!(n))]),
            from: None,
            to: None,
        };

        assert_eq!(history.get_events(&[step(1), step(2)], true).await, 1);
        assert_eq!(history.get_events(&[step(2), step(1)], true).await, 0);
        assert_eq!(history.get_events(&[step(1), step(3)], true).await, 0);
    }

    #[tokio::test]
    async fn events_without_data_are_not_recorded() {
        let history = InMemoryEventHistory::new();
        let bare = Event::new("bare", "com.test.type", "com.test.source");

        assert!(!history.record_event(&bare).await);
        let any = EventHistoryRequest {
            mask: EventData::new(),
            from: None,
            to: None,
        };
        assert_eq!(history.get_events(&[any], false).await, 0);
    }
}
