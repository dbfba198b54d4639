//! Module `event` contains the [`Event`] value type flowing through the hub,
//! together with the type/source constants used by the hub's own signal
//! events.
//!
//! Events are immutable: producers build them once, the hub never mutates
//! them, and rule-driven transforms go through [`Event::clone_with_data`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload type carried by an [`Event`] and by shared-state snapshots:
/// a nested mapping from string keys to JSON-like values.
pub type EventData = serde_json::Map<String, serde_json::Value>;

/// Well-known event `type` tags dispatched by the hub itself.
pub mod event_type {
    /// Events emitted by the Event Hub core.
    pub const HUB: &str = "com.adobe.eventType.hub";

    /// Matches any event type when used in a listener registration.
    pub const WILDCARD: &str = "*";
}

/// Well-known event `source` tags dispatched by the hub itself.
pub mod event_source {
    /// Signal emitted once the hub has been started.
    pub const BOOTED: &str = "com.adobe.eventSource.booted";

    /// Signal emitted whenever a standard shared state has been set.
    pub const SHARED_STATE: &str = "com.adobe.eventSource.sharedState";

    /// Signal emitted whenever an XDM shared state has been set.
    pub const XDM_SHARED_STATE: &str = "com.adobe.eventSource.xdmSharedState";

    /// Matches any event source when used in a listener registration.
    pub const WILDCARD: &str = "*";
}

/// Payload key carrying the owner name inside a shared-state change signal.
pub const STATE_OWNER_KEY: &str = "stateowner";

/// An immutable occurrence dispatched through the hub.
///
/// Every `Event` is assigned a monotone event number by the hub at dispatch
/// time; the number is not part of the value itself, the hub keeps the
/// authoritative `id → number` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable unique identifier, assigned at construction.
    pub id: String,

    /// Human-readable label, used for logging only.
    pub name: String,

    /// Opaque type tag, matched (case-insensitively) by listeners.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Opaque source tag, matched (case-insensitively) by listeners.
    pub source: String,

    /// Wall-clock time of construction.
    pub timestamp: DateTime<Utc>,

    /// Optional nested payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,

    /// Identifier of the trigger event this event responds to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,

    /// Identifier of the event that caused this one to be dispatched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Ordered data-path selectors used by the event-history index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<String>>,
}

impl Event {
    /// Creates a new `Event` with a fresh unique identifier and the current
    /// timestamp. Payload and linkage are attached through the `with_*`
    /// combinators.
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            data: None,
            response_id: None,
            parent_id: None,
            mask: None,
        }
    }

    /// Attaches a payload to the event.
    #[must_use]
    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches the event-history mask selectors.
    #[must_use]
    pub fn with_mask(mut self, mask: Vec<String>) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Sets the causal parent of this event.
    #[must_use]
    pub fn with_parent(mut self, parent: &Event) -> Self {
        self.parent_id = Some(parent.id.clone());
        self
    }

    /// Marks this event as the response to `trigger`, linking both the
    /// response and the causal parent to the trigger's identifier.
    #[must_use]
    pub fn in_response_to(mut self, trigger: &Event) -> Self {
        self.response_id = Some(trigger.id.clone());
        self.parent_id = Some(trigger.id.clone());
        self
    }

    /// Returns a copy of this event carrying `data` instead of the original
    /// payload.
    ///
    /// Identifier and timestamp are preserved: the clone is the same logical
    /// occurrence, transformed. The hub relies on this when preprocessors
    /// rewrite payloads without breaking the `id → number` mapping.
    #[must_use]
    pub fn clone_with_data(&self, data: EventData) -> Self {
        let mut event = self.clone();
        event.data = Some(data);
        event
    }

    /// Whether this event is a response to a previously dispatched trigger.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.response_id.is_some()
    }
}

/// An [`Event`] paired with the number the hub assigned to it at ingress.
///
/// Used on the internal channels between the hub writer, the dispatcher and
/// the extension containers; listeners only ever see the inner [`Event`].
#[derive(Debug, Clone)]
pub(crate) struct OrderedEvent {
    pub(crate) number: u64,
    pub(crate) event: Event,
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn data_of(pairs: &[(&str, serde_json::Value)]) -> EventData {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn new_events_get_distinct_identifiers() {
        let first = Event::new("first", "com.test.type", "com.test.source");
        let second = Event::new("second", "com.test.type", "com.test.source");

        assert_ne!(first.id, second.id);
        assert!(first.data.is_none());
        assert!(!first.is_response());
    }

    #[test]
    fn response_links_back_to_the_trigger() {
        let trigger = Event::new("trigger", "com.test.type", "com.test.requestContent");

        let response = Event::new("response", "com.test.type", "com.test.responseContent")
            .with_data(data_of(&[("status", json!("ok"))]))
            .in_response_to(&trigger);

        assert!(response.is_response());
        assert_eq!(response.response_id.as_deref(), Some(trigger.id.as_str()));
        assert_eq!(response.parent_id.as_deref(), Some(trigger.id.as_str()));
    }

    #[test]
    fn clone_with_data_preserves_identity() {
        let event = Event::new("original", "com.test.type", "com.test.source")
            .with_data(data_of(&[("k", json!("v1"))]));

        let transformed = event.clone_with_data(data_of(&[("k", json!("v2"))]));

        assert_eq!(event.id, transformed.id);
        assert_eq!(event.timestamp, transformed.timestamp);
        assert_eq!(
            transformed.data.as_ref().and_then(|d| d.get("k")),
            Some(&json!("v2"))
        );
    }
}
