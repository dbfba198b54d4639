//! Module `extension` defines the contract a host module implements to plug
//! into the hub: the [`Extension`] trait, the listener callback types, and
//! the listener match rule.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::api::ExtensionApi;
use crate::event::Event;

/// Callback registered against an `(event type, event source)` pair.
///
/// Listeners run serially on their extension's own task; the returned future
/// is awaited to completion before the next listener (or event) runs, so a
/// listener may freely await shared-state reads through the
/// [`ExtensionApi`].
pub type EventListener = Box<dyn FnMut(Event) -> BoxFuture<'static, ()> + Send>;

/// Factory constructing an extension, invoked on the extension's own task
/// with the API façade the extension keeps for its lifetime.
pub type ExtensionFactory =
    Box<dyn FnOnce(Arc<dyn ExtensionApi>) -> anyhow::Result<Box<dyn Extension>> + Send>;

/// A pluggable module hosted by the hub.
///
/// Only [`Extension::name`] is mandatory; everything else has a sensible
/// default. All methods are invoked on the extension's own serial task.
pub trait Extension: Send + 'static {
    /// Canonical name used for registration and shared-state lookups.
    /// Must be non-blank.
    fn name(&self) -> &str;

    /// Human-readable name, published in the hub's shared state.
    fn friendly_name(&self) -> &str {
        self.name()
    }

    /// Version string, published in the hub's shared state.
    fn version(&self) -> Option<&str> {
        None
    }

    /// Additional metadata, published in the hub's shared state.
    fn metadata(&self) -> Option<HashMap<String, String>> {
        None
    }

    /// Invoked once the hub has accepted the registration.
    fn on_registered(&mut self) {}

    /// Invoked when the extension is unregistered or the hub shuts down.
    fn on_unregistered(&mut self) {}

    /// Per-event readiness gate consulted before the head of the inbox is
    /// committed. Returning `false` leaves the event at the head; no later
    /// event is delivered until this one is consumed.
    fn ready_for_event(&mut self, _event: &Event) -> bool {
        true
    }
}

/// Descriptive attributes of a registered extension, captured at
/// registration time and published in the hub's shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInfo {
    /// Canonical (shared-state) name.
    pub name: String,
    /// Human-readable name.
    pub friendly_name: String,
    /// Optional version string.
    pub version: Option<String>,
    /// Optional metadata map.
    pub metadata: Option<HashMap<String, String>>,
}

/// A listener registration: the `(type, source)` pair plus the callback.
pub(crate) struct ListenerEntry {
    pub(crate) event_type: String,
    pub(crate) source: String,
    pub(crate) listener: EventListener,
}

impl ListenerEntry {
    /// Match rule: each side matches on (ASCII case-insensitive) equality or
    /// on the literal `*` wildcard in the registration.
    pub(crate) fn matches(&self, event: &Event) -> bool {
        tag_matches(&self.event_type, &event.event_type) && tag_matches(&self.source, &event.source)
    }
}

fn tag_matches(registered: &str, actual: &str) -> bool {
    registered == crate::event::event_type::WILDCARD || registered.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod test {
    use futures::FutureExt;

    use super::*;

    fn entry(event_type: &str, source: &str) -> ListenerEntry {
        ListenerEntry {
            event_type: event_type.to_owned(),
            source: source.to_owned(),
            listener: Box::new(|_| async {}.boxed()),
        }
    }

    fn event(event_type: &str, source: &str) -> Event {
        Event::new("test", event_type, source)
    }

    #[test]
    fn listener_matching_is_case_insensitive() {
        let listener = entry("com.test.Type", "com.test.Source");

        assert!(listener.matches(&event("com.test.type", "com.test.source")));
        assert!(listener.matches(&event("COM.TEST.TYPE", "COM.TEST.SOURCE")));
        assert!(!listener.matches(&event("com.test.type", "com.other.source")));
        assert!(!listener.matches(&event("com.other.type", "com.test.source")));
    }

    #[test]
    fn wildcard_matches_only_on_the_literal_star() {
        let wildcard = entry("*", "*");
        assert!(wildcard.matches(&event("anything", "at.all")));

        let source_only = entry("com.test.type", "*");
        assert!(source_only.matches(&event("com.test.type", "whatever")));
        assert!(!source_only.matches(&event("com.other.type", "whatever")));

        // An event tagged "*" does not match a non-wildcard registration.
        let exact = entry("com.test.type", "com.test.source");
        assert!(!exact.matches(&event("*", "*")));
    }
}
