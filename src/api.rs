//! Module `api` contains the [`ExtensionApi`] façade: the only surface an
//! extension sees of the hub and of its own container.
//!
//! The façade is an object-safe trait so tests can substitute a fake; the
//! hub injects the concrete [`HubBackedApi`] at container construction.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::container::ContainerMessage;
use crate::event::{Event, EventData};
use crate::extension::EventListener;
use crate::history::{EventHistory, EventHistoryRequest};
use crate::hub::writer::HubCommand;
use crate::state::{
    SharedStateKind, SharedStateResolution, SharedStateResolver, SharedStateResult,
};

/// The contract surface an extension uses to interact with the hub and with
/// its own container.
///
/// The async methods hand off to the hub writer and await its reply; they
/// must only be called from the extension's own task (listener bodies and
/// lifecycle callbacks), never from the hub writer itself.
#[async_trait]
pub trait ExtensionApi: Send + Sync {
    /// Registers a listener for the `(event type, event source)` pair in
    /// this extension's table.
    fn register_event_listener(&self, event_type: &str, source: &str, listener: EventListener);

    /// Enqueues `event` into the hub's global ingress.
    fn dispatch(&self, event: Event);

    /// Resumes event delivery to this extension.
    fn start_events(&self);

    /// Pauses event delivery to this extension; events keep accumulating in
    /// the inbox while paused.
    fn stop_events(&self);

    /// Publishes a set shared state owned by this extension, versioned at
    /// `event` (or at the hub's version-resolution rule when `event` is
    /// `None`). A warning is logged and nothing happens when the extension
    /// is not fully registered yet.
    fn create_shared_state(&self, kind: SharedStateKind, data: EventData, event: Option<&Event>);

    /// Reserves a pending shared state owned by this extension and returns
    /// the one-shot resolver converting it to set.
    ///
    /// Returns `None` when the extension is not fully registered or the
    /// version slot was rejected.
    async fn create_pending_shared_state(
        &self,
        kind: SharedStateKind,
        event: Option<&Event>,
    ) -> Option<SharedStateResolver>;

    /// Reads the shared state of `owner` versioned at `event`.
    ///
    /// Returns `None` when `owner` is not a registered extension, as opposed
    /// to a result with [`SharedStateStatus::None`](crate::state::SharedStateStatus)
    /// when the extension exists but has published nothing at that version.
    async fn get_shared_state(
        &self,
        kind: SharedStateKind,
        owner: &str,
        event: Option<&Event>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult>;

    /// Requests deregistration of this extension.
    fn unregister_extension(&self);

    /// Forwards a query to the event-history collaborator. Returns the match
    /// count, `-1` on collaborator failure, or `0` when no collaborator is
    /// configured.
    async fn get_historical_events(
        &self,
        requests: &[EventHistoryRequest],
        enforce_order: bool,
    ) -> i64;
}

/// Hub-backed [`ExtensionApi`] implementation handed to every extension
/// factory.
pub(crate) struct HubBackedApi {
    /// Canonical name of the owning extension; populated by the container
    /// right after construction succeeds. While `None`, state writes are
    /// rejected with a warning.
    name: Arc<RwLock<Option<String>>>,
    hub_tx: mpsc::UnboundedSender<HubCommand>,
    container_tx: mpsc::UnboundedSender<ContainerMessage>,
    history: Option<Arc<dyn EventHistory>>,
}

impl HubBackedApi {
    pub(crate) fn new(
        name: Arc<RwLock<Option<String>>>,
        hub_tx: mpsc::UnboundedSender<HubCommand>,
        container_tx: mpsc::UnboundedSender<ContainerMessage>,
        history: Option<Arc<dyn EventHistory>>,
    ) -> Self {
        Self {
            name,
            hub_tx,
            container_tx,
            history,
        }
    }

    fn owner_name(&self) -> Option<String> {
        self.name.read().clone()
    }
}

#[async_trait]
impl ExtensionApi for HubBackedApi {
    fn register_event_listener(&self, event_type: &str, source: &str, listener: EventListener) {
        let _ = self.container_tx.send(ContainerMessage::RegisterListener {
            event_type: event_type.to_owned(),
            source: source.to_owned(),
            listener,
        });
    }

    fn dispatch(&self, event: Event) {
        let _ = self.hub_tx.send(HubCommand::Dispatch(event));
    }

    fn start_events(&self) {
        let _ = self.container_tx.send(ContainerMessage::SetActive(true));
    }

    fn stop_events(&self) {
        let _ = self.container_tx.send(ContainerMessage::SetActive(false));
    }

    fn create_shared_state(&self, kind: SharedStateKind, data: EventData, event: Option<&Event>) {
        let Some(owner) = self.owner_name() else {
            tracing::warn!("create_shared_state called before the extension finished registering");
            return;
        };

        let _ = self.hub_tx.send(HubCommand::CreateSharedState {
            owner,
            kind,
            data,
            event_id: event.map(|e| e.id.clone()),
        });
    }

    async fn create_pending_shared_state(
        &self,
        kind: SharedStateKind,
        event: Option<&Event>,
    ) -> Option<SharedStateResolver> {
        let Some(owner) = self.owner_name() else {
            tracing::warn!(
                "create_pending_shared_state called before the extension finished registering"
            );
            return None;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.hub_tx
            .send(HubCommand::CreatePendingSharedState {
                owner,
                kind,
                event_id: event.map(|e| e.id.clone()),
                reply: reply_tx,
            })
            .ok()?;

        reply_rx.await.ok().flatten()
    }

    async fn get_shared_state(
        &self,
        kind: SharedStateKind,
        owner: &str,
        event: Option<&Event>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.hub_tx
            .send(HubCommand::GetSharedState {
                owner: owner.to_owned(),
                kind,
                event_id: event.map(|e| e.id.clone()),
                barrier,
                resolution,
                reply: reply_tx,
            })
            .ok()?;

        reply_rx.await.ok().flatten()
    }

    fn unregister_extension(&self) {
        let Some(name) = self.owner_name() else {
            tracing::warn!("unregister_extension called before the extension finished registering");
            return;
        };

        let _ = self.hub_tx.send(HubCommand::UnregisterExtension {
            name,
            reply: None,
        });
    }

    async fn get_historical_events(
        &self,
        requests: &[EventHistoryRequest],
        enforce_order: bool,
    ) -> i64 {
        match &self.history {
            Some(history) => history.get_events(requests, enforce_order).await,
            None => {
                tracing::debug!("no event-history collaborator configured");
                0
            }
        }
    }
}
