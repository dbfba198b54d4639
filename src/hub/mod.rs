//! Module `hub` contains the Event Hub core: the public [`EventHub`] handle,
//! and the single-writer tasks behind it (the hub writer owning numbering,
//! registry and shared state, and the dispatcher running the preprocessor
//! pipeline and the fan-out).
//!
//! The hub is an explicitly-constructed value: build one per SDK instance,
//! shut it down when the SDK goes away. Tests construct fresh instances.

pub(crate) mod dispatcher;
pub(crate) mod writer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RegistrationError, ResponseError};
use crate::event::Event;
use crate::extension::{EventListener, Extension, ExtensionFactory, ExtensionInfo};
use crate::history::EventHistory;
use crate::response::{self, ResponseHandler, ResponseMessage};
use crate::state::{SharedStateKind, SharedStateResolution, SharedStateResult};

/// Canonical shared-state name under which the hub publishes its own state.
pub const EVENT_HUB_NAME: &str = "com.adobe.module.eventhub";

/// Hidden extension backing hub-wide listener registrations.
pub(crate) const PLACEHOLDER_NAME: &str = "com.adobe.module.placeholder";

/// Tag identifying the cross-platform wrapper hosting the SDK, published in
/// the hub's shared state. Settable only before [`EventHub::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WrapperType {
    /// No wrapper; the SDK runs natively.
    #[default]
    None,
    /// React Native wrapper.
    ReactNative,
    /// Flutter wrapper.
    Flutter,
    /// Cordova wrapper.
    Cordova,
    /// Unity wrapper.
    Unity,
    /// Xamarin wrapper.
    Xamarin,
}

impl WrapperType {
    /// One-letter tag carried in the hub shared state.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            WrapperType::None => "N",
            WrapperType::ReactNative => "R",
            WrapperType::Flutter => "F",
            WrapperType::Cordova => "C",
            WrapperType::Unity => "U",
            WrapperType::Xamarin => "X",
        }
    }

    /// Human-readable wrapper name.
    #[must_use]
    pub fn friendly_name(self) -> &'static str {
        match self {
            WrapperType::None => "None",
            WrapperType::ReactNative => "React Native",
            WrapperType::Flutter => "Flutter",
            WrapperType::Cordova => "Cordova",
            WrapperType::Unity => "Unity",
            WrapperType::Xamarin => "Xamarin",
        }
    }
}

/// A pure transformation applied to every event between ingress and fan-out,
/// in registration order.
///
/// An error discards the event for downstream delivery; its event number
/// stays consumed.
pub trait EventPreprocessor: Send + 'static {
    /// Transforms `event`.
    fn process(&mut self, event: Event) -> anyhow::Result<Event>;
}

impl<F> EventPreprocessor for F
where
    F: FnMut(Event) -> anyhow::Result<Event> + Send + 'static,
{
    fn process(&mut self, event: Event) -> anyhow::Result<Event> {
        self(event)
    }
}

/// Configures and builds an [`EventHub`].
pub struct EventHubBuilder {
    history: Option<Arc<dyn EventHistory>>,
    response_workers: usize,
}

impl Default for EventHubBuilder {
    fn default() -> Self {
        Self {
            history: None,
            response_workers: 4,
        }
    }
}

impl EventHubBuilder {
    /// Attaches the event-history collaborator; events carrying a mask are
    /// recorded there.
    #[must_use]
    pub fn event_history(mut self, history: Arc<dyn EventHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Bounds the worker pool invoking response-listener callbacks.
    #[must_use]
    pub fn response_workers(mut self, workers: usize) -> Self {
        self.response_workers = workers.max(1);
        self
    }

    /// Spawns the hub's tasks and returns the handle.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> EventHub {
        let (response_tx, _response_task) = response::spawn(self.response_workers);
        let (dispatcher_tx, _dispatcher_task) =
            dispatcher::spawn(response_tx.clone(), self.history.clone());

        let registry_mirror = Arc::new(RwLock::new(HashMap::new()));
        let (hub_tx, _writer_task) = writer::spawn(
            dispatcher_tx,
            response_tx.clone(),
            self.history,
            Arc::clone(&registry_mirror),
        );

        EventHub {
            hub_tx,
            response_tx,
            registry_mirror,
        }
    }
}

/// Handle to a running Event Hub.
///
/// All methods are safe to call from any task; the mutations they describe
/// are serialized on the hub writer.
pub struct EventHub {
    hub_tx: mpsc::UnboundedSender<writer::HubCommand>,
    response_tx: mpsc::UnboundedSender<ResponseMessage>,
    registry_mirror: Arc<RwLock<HashMap<String, ExtensionInfo>>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Builds a hub with default configuration. See [`EventHub::builder`].
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a builder to configure the hub before spawning it.
    #[must_use]
    pub fn builder() -> EventHubBuilder {
        EventHubBuilder::default()
    }

    /// Enqueues `event` into the global ingress. Fire-and-forget: events
    /// dispatched before [`EventHub::start`] are queued and fanned out once
    /// the hub starts.
    pub fn dispatch(&self, event: Event) {
        let _ = self.hub_tx.send(writer::HubCommand::Dispatch(event));
    }

    /// Registers an extension constructed by `factory` on its own task.
    pub async fn register_extension<F>(&self, factory: F) -> Result<(), RegistrationError>
    where
        F: FnOnce(Arc<dyn crate::api::ExtensionApi>) -> anyhow::Result<Box<dyn Extension>>
            + Send
            + 'static,
    {
        self.register_boxed(Box::new(factory)).await
    }

    async fn register_boxed(&self, factory: ExtensionFactory) -> Result<(), RegistrationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.hub_tx
            .send(writer::HubCommand::RegisterExtension {
                factory,
                reply: reply_tx,
            })
            .map_err(|_| RegistrationError::Unknown)?;

        reply_rx.await.unwrap_or(Err(RegistrationError::Unknown))
    }

    /// Registers every extension in `factories`, then starts the hub once
    /// the last registration has completed. Returns the per-extension
    /// outcomes, in input order.
    pub async fn register_extensions(
        &self,
        factories: Vec<ExtensionFactory>,
    ) -> Vec<Result<(), RegistrationError>> {
        let outcomes = join_all(
            factories
                .into_iter()
                .map(|factory| self.register_boxed(factory)),
        )
        .await;

        self.start();
        outcomes
    }

    /// Deregisters the extension with canonical name `name`.
    pub async fn unregister_extension(&self, name: &str) -> Result<(), RegistrationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.hub_tx
            .send(writer::HubCommand::UnregisterExtension {
                name: name.to_owned(),
                reply: Some(reply_tx),
            })
            .map_err(|_| RegistrationError::Unknown)?;

        reply_rx.await.unwrap_or(Err(RegistrationError::Unknown))
    }

    /// Starts draining the ingress: publishes the hub shared state, emits
    /// the booted signal, and begins fan-out. Idempotent.
    pub fn start(&self) {
        let _ = self.hub_tx.send(writer::HubCommand::Start);
    }

    /// Sets the wrapper tag published in the hub shared state. Ignored (with
    /// a warning) once the hub has started.
    pub fn set_wrapper_type(&self, wrapper: WrapperType) {
        let _ = self.hub_tx.send(writer::HubCommand::SetWrapper(wrapper));
    }

    /// Appends a preprocessor to the pipeline.
    pub fn register_preprocessor<P: EventPreprocessor>(&self, preprocessor: P) {
        let _ = self
            .hub_tx
            .send(writer::HubCommand::RegisterPreprocessor(Box::new(
                preprocessor,
            )));
    }

    /// Registers a one-shot listener for the response to `trigger`.
    ///
    /// Exactly one of `Ok(response)` or `Err(`[`ResponseError`]`)` is
    /// delivered: the first event whose `response_id` matches the trigger,
    /// or a timeout/shutdown failure.
    pub fn register_response_listener<F>(&self, trigger: &Event, timeout: Duration, handler: F)
    where
        F: FnOnce(Result<Event, ResponseError>) + Send + 'static,
    {
        let handler: ResponseHandler = Box::new(handler);
        let _ = self.response_tx.send(ResponseMessage::Register {
            trigger_id: trigger.id.clone(),
            timeout,
            handler,
        });
    }

    /// Registers a hub-wide listener, hosted by the hub's internal
    /// placeholder container.
    pub fn register_listener<F>(&self, event_type: &str, source: &str, listener: F)
    where
        F: FnMut(Event) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let listener: EventListener = Box::new(listener);
        let _ = self.hub_tx.send(writer::HubCommand::RegisterListener {
            event_type: event_type.to_owned(),
            source: source.to_owned(),
            listener,
        });
    }

    /// Reads the shared state of `owner`; see
    /// [`ExtensionApi::get_shared_state`](crate::api::ExtensionApi::get_shared_state).
    pub async fn get_shared_state(
        &self,
        kind: SharedStateKind,
        owner: &str,
        event: Option<&Event>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.hub_tx
            .send(writer::HubCommand::GetSharedState {
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

    /// Snapshot of the currently registered extensions, sorted by name.
    #[must_use]
    pub fn registered_extensions(&self) -> Vec<ExtensionInfo> {
        let mut extensions: Vec<_> = self.registry_mirror.read().values().cloned().collect();
        extensions.sort_by(|a, b| a.name.cmp(&b.name));
        extensions
    }

    /// Stops intake, shuts down every container, and fails all outstanding
    /// response listeners. The handle is inert afterwards.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .hub_tx
            .send(writer::HubCommand::Shutdown { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}
