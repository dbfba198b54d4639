//! Module `state` contains the versioned shared-state model: append-only
//! snapshot sequences per `(extension, kind)`, pending slots resolved
//! asynchronously, and the read results handed back to extensions.
//!
//! A [`SharedStateManager`] holds the snapshots for one `(extension, kind)`
//! pair. It is not internally synchronized: the hub writer is its single
//! owner, and every write and read goes through that writer.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::EventData;

/// Read sentinel meaning "the newest available version".
pub const VERSION_LATEST: u64 = u64::MAX;

/// The two independent shared-state families an extension can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SharedStateKind {
    /// Regular extension shared state.
    Standard,
    /// XDM-formatted shared state.
    Xdm,
}

/// Status of a shared-state read result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedStateStatus {
    /// A snapshot with data was found.
    Set,
    /// The resolved snapshot is reserved but not yet populated, or the
    /// barrier rule downgraded a set snapshot.
    Pending,
    /// No snapshot exists at or below the queried version.
    None,
}

/// Selects how a shared-state read treats pending snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedStateResolution {
    /// Return the newest snapshot at or below the version, pending or set.
    Any,
    /// Return the newest *set* snapshot at or below the version.
    LastSet,
}

/// Outcome of a shared-state read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedStateResult {
    /// Status of the resolved snapshot.
    pub status: SharedStateStatus,
    /// Snapshot payload; `None` for pending or missing snapshots.
    pub value: Option<EventData>,
}

impl SharedStateResult {
    pub(crate) fn none() -> Self {
        Self {
            status: SharedStateStatus::None,
            value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Snapshot {
    Pending,
    Set(EventData),
}

impl Snapshot {
    fn result(&self) -> SharedStateResult {
        match self {
            Snapshot::Pending => SharedStateResult {
                status: SharedStateStatus::Pending,
                value: None,
            },
            Snapshot::Set(data) => SharedStateResult {
                status: SharedStateStatus::Set,
                value: Some(data.clone()),
            },
        }
    }
}

/// Ordered, versioned map of state snapshots for one `(extension, kind)`.
///
/// Versions are event numbers; appends must be strictly increasing. A
/// pending snapshot reserves a version and is populated exactly once through
/// [`SharedStateManager::update_pending_state`].
#[derive(Debug, Default)]
pub struct SharedStateManager {
    states: BTreeMap<u64, Snapshot>,
}

impl SharedStateManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_version_valid(&self, version: u64) -> bool {
        match self.states.keys().next_back() {
            Some(last) => *last < version,
            None => true,
        }
    }

    /// Appends a set snapshot at `version`.
    ///
    /// Returns `false` when `version` is not strictly greater than the last
    /// appended version (which also covers any version already occupied).
    pub fn set_state(&mut self, version: u64, data: EventData) -> bool {
        if !self.is_version_valid(version) {
            return false;
        }

        self.states.insert(version, Snapshot::Set(data));
        true
    }

    /// Reserves a pending snapshot at `version`, under the same ordering rule
    /// as [`SharedStateManager::set_state`].
    pub fn set_pending_state(&mut self, version: u64) -> bool {
        if !self.is_version_valid(version) {
            return false;
        }

        self.states.insert(version, Snapshot::Pending);
        true
    }

    /// Converts the pending snapshot at `version` to set.
    ///
    /// Returns `false` when no snapshot exists at `version` or the snapshot
    /// has already been set.
    pub fn update_pending_state(&mut self, version: u64, data: EventData) -> bool {
        match self.states.get_mut(&version) {
            Some(snapshot @ Snapshot::Pending) => {
                *snapshot = Snapshot::Set(data);
                true
            }
            _ => false,
        }
    }

    /// Returns the newest snapshot with version ≤ `version`, regardless of
    /// its status.
    #[must_use]
    pub fn resolve(&self, version: u64) -> SharedStateResult {
        self.states
            .range(..=version)
            .next_back()
            .map_or_else(SharedStateResult::none, |(_, snapshot)| snapshot.result())
    }

    /// Returns the newest *set* snapshot with version ≤ `version`.
    #[must_use]
    pub fn resolve_last_set(&self, version: u64) -> SharedStateResult {
        self.states
            .range(..=version)
            .rev()
            .find(|(_, snapshot)| matches!(snapshot, Snapshot::Set(_)))
            .map_or_else(SharedStateResult::none, |(_, snapshot)| snapshot.result())
    }

    /// Whether no snapshot has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Removes every snapshot.
    pub fn clear(&mut self) {
        self.states.clear();
    }
}

/// One-shot handle converting a pending shared state to set.
///
/// Returned by `create_pending_shared_state`; calling
/// [`SharedStateResolver::resolve`] more than once is a logged no-op, the
/// snapshot keeps the first payload.
pub struct SharedStateResolver {
    #[allow(clippy::type_complexity)]
    inner: Mutex<Option<Box<dyn FnOnce(EventData) + Send>>>,
}

impl std::fmt::Debug for SharedStateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateResolver")
            .field("resolved", &self.inner.lock().is_none())
            .finish()
    }
}

impl SharedStateResolver {
    pub(crate) fn new(resolve: impl FnOnce(EventData) + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Some(Box::new(resolve))),
        }
    }

    /// Populates the reserved snapshot with `data`.
    pub fn resolve(&self, data: EventData) {
        match self.inner.lock().take() {
            Some(resolve) => resolve(data),
            None => {
                tracing::warn!("pending shared state has already been resolved, ignoring");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn data(key: &str, value: &str) -> EventData {
        let mut map = EventData::new();
        map.insert(key.to_owned(), json!(value));
        map
    }

    #[test]
    fn versions_must_strictly_increase() {
        let mut manager = SharedStateManager::new();

        assert!(manager.set_state(1, data("k", "v1")));
        assert!(!manager.set_state(1, data("k", "again")));
        assert!(!manager.set_state(0, data("k", "older")));
        assert!(manager.set_state(5, data("k", "v5")));
        assert!(!manager.set_pending_state(5));
        assert!(manager.set_pending_state(6));
    }

    #[test]
    fn resolve_picks_the_newest_version_at_or_below() {
        let mut manager = SharedStateManager::new();
        manager.set_state(1, data("k", "v1"));
        manager.set_state(4, data("k", "v4"));

        assert_eq!(
            manager.resolve(3).value,
            Some(data("k", "v1")),
            "version 3 resolves to the snapshot at version 1"
        );
        assert_eq!(manager.resolve(4).value, Some(data("k", "v4")));
        assert_eq!(manager.resolve(VERSION_LATEST).value, Some(data("k", "v4")));
        assert_eq!(manager.resolve(0).status, SharedStateStatus::None);
    }

    #[test]
    fn resolve_returns_pending_while_last_set_skips_it() {
        let mut manager = SharedStateManager::new();
        manager.set_state(1, data("k", "v1"));
        manager.set_pending_state(3);

        let any = manager.resolve(5);
        assert_eq!(any.status, SharedStateStatus::Pending);
        assert_eq!(any.value, None);

        let last_set = manager.resolve_last_set(5);
        assert_eq!(last_set.status, SharedStateStatus::Set);
        assert_eq!(last_set.value, Some(data("k", "v1")));
    }

    #[test]
    fn pending_converts_to_set_exactly_once() {
        let mut manager = SharedStateManager::new();
        manager.set_pending_state(2);

        assert!(manager.update_pending_state(2, data("x", "1")));
        assert!(!manager.update_pending_state(2, data("x", "2")));
        assert!(!manager.update_pending_state(7, data("x", "3")));

        assert_eq!(manager.resolve(2).value, Some(data("x", "1")));
    }

    #[test]
    fn clear_empties_the_manager() {
        let mut manager = SharedStateManager::new();
        manager.set_state(1, data("k", "v"));
        assert!(!manager.is_empty());

        manager.clear();
        assert!(manager.is_empty());
        assert_eq!(manager.resolve(VERSION_LATEST).status, SharedStateStatus::None);
    }

    #[test]
    fn resolver_runs_its_callback_only_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);

        let resolver = SharedStateResolver::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        resolver.resolve(data("x", "1"));
        resolver.resolve(data("x", "2"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
