//! The hub writer: the single task owning event numbering, the extension
//! registry, every shared-state manager and the hub lifecycle. All mutation
//! requests arrive as [`HubCommand`] messages; synchronous-looking reads
//! (`get_shared_state`) are request/reply pairs over oneshot channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::api::HubBackedApi;
use crate::container::{self, ContainerMessage};
use crate::error::RegistrationError;
use crate::event::{event_source, event_type, Event, EventData, OrderedEvent, STATE_OWNER_KEY};
use crate::extension::{EventListener, Extension, ExtensionFactory, ExtensionInfo};
use crate::history::EventHistory;
use crate::hub::dispatcher::DispatcherMessage;
use crate::hub::{EventPreprocessor, WrapperType, EVENT_HUB_NAME, PLACEHOLDER_NAME};
use crate::response::ResponseMessage;
use crate::state::{
    SharedStateKind, SharedStateManager, SharedStateResolution, SharedStateResolver,
    SharedStateResult, SharedStateStatus, VERSION_LATEST,
};

pub(crate) enum HubCommand {
    Dispatch(Event),
    RegisterExtension {
        factory: ExtensionFactory,
        reply: oneshot::Sender<Result<(), RegistrationError>>,
    },
    /// A container finished constructing its extension.
    ContainerConstructed {
        token: u64,
        outcome: Result<ExtensionInfo, RegistrationError>,
    },
    UnregisterExtension {
        name: String,
        reply: Option<oneshot::Sender<Result<(), RegistrationError>>>,
    },
    Start,
    SetWrapper(WrapperType),
    RegisterPreprocessor(Box<dyn EventPreprocessor>),
    RegisterListener {
        event_type: String,
        source: String,
        listener: EventListener,
    },
    CreateSharedState {
        owner: String,
        kind: SharedStateKind,
        data: EventData,
        event_id: Option<String>,
    },
    CreatePendingSharedState {
        owner: String,
        kind: SharedStateKind,
        event_id: Option<String>,
        reply: oneshot::Sender<Option<SharedStateResolver>>,
    },
    ResolvePendingState {
        owner: String,
        kind: SharedStateKind,
        version: u64,
        data: EventData,
    },
    GetSharedState {
        owner: String,
        kind: SharedStateKind,
        event_id: Option<String>,
        barrier: bool,
        resolution: SharedStateResolution,
        reply: oneshot::Sender<Option<SharedStateResult>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct ExtensionRecord {
    info: ExtensionInfo,
    control_tx: mpsc::UnboundedSender<ContainerMessage>,
    last_processed: Arc<AtomicU64>,
    standard: SharedStateManager,
    xdm: SharedStateManager,
}

impl ExtensionRecord {
    fn manager(&self, kind: SharedStateKind) -> &SharedStateManager {
        match kind {
            SharedStateKind::Standard => &self.standard,
            SharedStateKind::Xdm => &self.xdm,
        }
    }

    fn manager_mut(&mut self, kind: SharedStateKind) -> &mut SharedStateManager {
        match kind {
            SharedStateKind::Standard => &mut self.standard,
            SharedStateKind::Xdm => &mut self.xdm,
        }
    }
}

struct PendingRegistration {
    reply: oneshot::Sender<Result<(), RegistrationError>>,
    control_tx: mpsc::UnboundedSender<ContainerMessage>,
    inbox_tx: mpsc::UnboundedSender<OrderedEvent>,
    last_processed: Arc<AtomicU64>,
}

/// Hidden extension hosting hub-wide listeners.
struct PlaceholderExtension;

impl Extension for PlaceholderExtension {
    fn name(&self) -> &str {
        PLACEHOLDER_NAME
    }
}

pub(crate) fn spawn(
    dispatcher_tx: mpsc::UnboundedSender<DispatcherMessage>,
    response_tx: mpsc::UnboundedSender<ResponseMessage>,
    history: Option<Arc<dyn EventHistory>>,
    registry_mirror: Arc<RwLock<HashMap<String, ExtensionInfo>>>,
) -> (mpsc::UnboundedSender<HubCommand>, JoinHandle<()>) {
    let (hub_tx, hub_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(
        hub_tx.clone(),
        hub_rx,
        dispatcher_tx,
        response_tx,
        history,
        registry_mirror,
    ));
    (hub_tx, task)
}

async fn run(
    hub_tx: mpsc::UnboundedSender<HubCommand>,
    mut hub_rx: mpsc::UnboundedReceiver<HubCommand>,
    dispatcher_tx: mpsc::UnboundedSender<DispatcherMessage>,
    response_tx: mpsc::UnboundedSender<ResponseMessage>,
    history: Option<Arc<dyn EventHistory>>,
    registry_mirror: Arc<RwLock<HashMap<String, ExtensionInfo>>>,
) {
    let mut writer = Writer {
        hub_tx,
        dispatcher_tx,
        response_tx,
        history,
        registry: HashMap::new(),
        registry_mirror,
        pending: HashMap::new(),
        next_token: 0,
        last_event_number: 0,
        event_numbers: HashMap::new(),
        hub_standard: SharedStateManager::new(),
        hub_xdm: SharedStateManager::new(),
        placeholder_control: None,
        started: false,
        wrapper: WrapperType::None,
    };

    // The placeholder container backing hub-wide listeners; it buffers
    // listener registrations until the handshake completes.
    let (discard_tx, _discard_rx) = oneshot::channel();
    let placeholder_control = writer.begin_registration(
        Box::new(|_| Ok(Box::new(PlaceholderExtension))),
        discard_tx,
    );
    writer.placeholder_control = Some(placeholder_control);

    while let Some(command) = hub_rx.recv().await {
        if !writer.handle(command) {
            break;
        }
    }
}

struct Writer {
    hub_tx: mpsc::UnboundedSender<HubCommand>,
    dispatcher_tx: mpsc::UnboundedSender<DispatcherMessage>,
    response_tx: mpsc::UnboundedSender<ResponseMessage>,
    history: Option<Arc<dyn EventHistory>>,
    registry: HashMap<String, ExtensionRecord>,
    registry_mirror: Arc<RwLock<HashMap<String, ExtensionInfo>>>,
    pending: HashMap<u64, PendingRegistration>,
    next_token: u64,
    last_event_number: u64,
    event_numbers: HashMap<String, u64>,
    hub_standard: SharedStateManager,
    hub_xdm: SharedStateManager,
    placeholder_control: Option<mpsc::UnboundedSender<ContainerMessage>>,
    started: bool,
    wrapper: WrapperType,
}

impl Writer {
    /// Processes one command; returns `false` once the hub has shut down.
    fn handle(&mut self, command: HubCommand) -> bool {
        match command {
            HubCommand::Dispatch(event) => self.ingest(event),

            HubCommand::RegisterExtension { factory, reply } => {
                self.begin_registration(factory, reply);
            }

            HubCommand::ContainerConstructed { token, outcome } => {
                self.finish_registration(token, outcome);
            }

            HubCommand::UnregisterExtension { name, reply } => {
                let outcome = self.unregister(&name);
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }

            HubCommand::Start => self.start(),

            HubCommand::SetWrapper(wrapper) => {
                if self.started {
                    tracing::warn!("wrapper type can only be set before start, ignoring");
                } else {
                    self.wrapper = wrapper;
                }
            }

            HubCommand::RegisterPreprocessor(preprocessor) => {
                let _ = self
                    .dispatcher_tx
                    .send(DispatcherMessage::AddPreprocessor(preprocessor));
            }

            HubCommand::RegisterListener {
                event_type,
                source,
                listener,
            } => {
                if let Some(control) = &self.placeholder_control {
                    let _ = control.send(ContainerMessage::RegisterListener {
                        event_type,
                        source,
                        listener,
                    });
                }
            }

            HubCommand::CreateSharedState {
                owner,
                kind,
                data,
                event_id,
            } => self.create_shared_state(&owner, kind, data, event_id.as_deref()),

            HubCommand::CreatePendingSharedState {
                owner,
                kind,
                event_id,
                reply,
            } => {
                let resolver = self.create_pending_shared_state(&owner, kind, event_id.as_deref());
                let _ = reply.send(resolver);
            }

            HubCommand::ResolvePendingState {
                owner,
                kind,
                version,
                data,
            } => self.resolve_pending_state(&owner, kind, version, data),

            HubCommand::GetSharedState {
                owner,
                kind,
                event_id,
                barrier,
                resolution,
                reply,
            } => {
                let result =
                    self.get_shared_state(&owner, kind, event_id.as_deref(), barrier, resolution);
                let _ = reply.send(result);
            }

            HubCommand::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }

        true
    }

    /// Assigns the next event number and hands the event to the dispatcher.
    fn ingest(&mut self, event: Event) {
        self.last_event_number += 1;
        let number = self.last_event_number;
        self.event_numbers.insert(event.id.clone(), number);

        tracing::trace!(
            event.id = %event.id,
            event.number = number,
            event.r#type = %event.event_type,
            "event entered the hub"
        );

        let _ = self
            .dispatcher_tx
            .send(DispatcherMessage::Event(OrderedEvent { number, event }));
    }

    /// Creates the container plumbing for a new extension and spawns its
    /// task; the outcome comes back as [`HubCommand::ContainerConstructed`].
    fn begin_registration(
        &mut self,
        factory: ExtensionFactory,
        reply: oneshot::Sender<Result<(), RegistrationError>>,
    ) -> mpsc::UnboundedSender<ContainerMessage> {
        let token = self.next_token;
        self.next_token += 1;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let last_processed = Arc::new(AtomicU64::new(0));
        let api_name = Arc::new(RwLock::new(None));

        let api = Arc::new(HubBackedApi::new(
            Arc::clone(&api_name),
            self.hub_tx.clone(),
            control_tx.clone(),
            self.history.clone(),
        ));

        let (constructed_tx, constructed_rx) = oneshot::channel();
        container::spawn(
            factory,
            api,
            api_name,
            control_rx,
            inbox_rx,
            Arc::clone(&last_processed),
            constructed_tx,
        );

        // Glue task: converts the container's one-shot construction outcome
        // into a command, so the writer never awaits inline.
        let hub_tx = self.hub_tx.clone();
        tokio::spawn(async move {
            let outcome = constructed_rx
                .await
                .unwrap_or(Err(RegistrationError::Unknown));
            let _ = hub_tx.send(HubCommand::ContainerConstructed { token, outcome });
        });

        self.pending.insert(
            token,
            PendingRegistration {
                reply,
                control_tx: control_tx.clone(),
                inbox_tx,
                last_processed,
            },
        );

        control_tx
    }

    fn finish_registration(
        &mut self,
        token: u64,
        outcome: Result<ExtensionInfo, RegistrationError>,
    ) {
        let Some(pending) = self.pending.remove(&token) else {
            return;
        };

        let info = match outcome {
            Ok(info) => info,
            Err(error) => {
                let _ = pending.reply.send(Err(error));
                return;
            }
        };

        if self.registry.contains_key(&info.name) {
            tracing::warn!(extension.name = %info.name, "duplicate extension registration rejected");
            let _ = pending.control_tx.send(ContainerMessage::Reject);
            let _ = pending
                .reply
                .send(Err(RegistrationError::DuplicateExtensionName));
            return;
        }

        let name = info.name.clone();
        let _ = pending.control_tx.send(ContainerMessage::Accept);
        let _ = self.dispatcher_tx.send(DispatcherMessage::AddSink {
            name: name.clone(),
            inbox: pending.inbox_tx,
        });

        if name != PLACEHOLDER_NAME {
            self.registry_mirror.write().insert(name.clone(), info.clone());
        }

        self.registry.insert(
            name,
            ExtensionRecord {
                info,
                control_tx: pending.control_tx,
                last_processed: pending.last_processed,
                standard: SharedStateManager::new(),
                xdm: SharedStateManager::new(),
            },
        );

        self.publish_hub_state();
        let _ = pending.reply.send(Ok(()));
    }

    fn unregister(&mut self, name: &str) -> Result<(), RegistrationError> {
        let Some(record) = self.registry.remove(name) else {
            return Err(RegistrationError::ExtensionNotRegistered);
        };

        let _ = self.dispatcher_tx.send(DispatcherMessage::RemoveSink {
            name: name.to_owned(),
        });
        let _ = record.control_tx.send(ContainerMessage::Shutdown);
        self.registry_mirror.write().remove(name);
        self.publish_hub_state();

        Ok(())
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let _ = self.dispatcher_tx.send(DispatcherMessage::Start);
        self.publish_hub_state();
        self.ingest(Event::new("EventHub", event_type::HUB, event_source::BOOTED));
    }

    fn shutdown(&mut self) {
        let _ = self.response_tx.send(ResponseMessage::Shutdown);
        for (_, record) in self.registry.drain() {
            let _ = record.control_tx.send(ContainerMessage::Shutdown);
        }
        self.registry_mirror.write().clear();
        let _ = self.dispatcher_tx.send(DispatcherMessage::Shutdown);
        tracing::debug!("event hub shut down");
    }

    /// Version for a shared-state write: the reference event's number, a
    /// fresh logical tick when the manager already has snapshots, or the
    /// bootstrap version zero.
    fn write_version(&mut self, manager_is_empty: bool, event_id: Option<&str>) -> u64 {
        if let Some(number) = event_id.and_then(|id| self.event_numbers.get(id)) {
            return *number;
        }

        if manager_is_empty {
            0
        } else {
            self.last_event_number += 1;
            self.last_event_number
        }
    }

    fn create_shared_state(
        &mut self,
        owner: &str,
        kind: SharedStateKind,
        data: EventData,
        event_id: Option<&str>,
    ) {
        let Some(is_empty) = self
            .registry
            .get(owner)
            .map(|record| record.manager(kind).is_empty())
        else {
            tracing::warn!(owner, "create_shared_state for an unregistered extension, ignoring");
            return;
        };

        let version = self.write_version(is_empty, event_id);
        let record = self.registry.get_mut(owner).expect("owner was just looked up");

        if record.manager_mut(kind).set_state(version, data) {
            self.dispatch_state_change(owner, kind);
        } else {
            tracing::warn!(
                owner,
                version,
                "shared state write rejected, version is not monotonically increasing"
            );
        }
    }

    fn create_pending_shared_state(
        &mut self,
        owner: &str,
        kind: SharedStateKind,
        event_id: Option<&str>,
    ) -> Option<SharedStateResolver> {
        let Some(is_empty) = self
            .registry
            .get(owner)
            .map(|record| record.manager(kind).is_empty())
        else {
            tracing::warn!(
                owner,
                "create_pending_shared_state for an unregistered extension, ignoring"
            );
            return None;
        };

        let version = self.write_version(is_empty, event_id);
        let record = self.registry.get_mut(owner).expect("owner was just looked up");

        if !record.manager_mut(kind).set_pending_state(version) {
            tracing::warn!(
                owner,
                version,
                "pending shared state rejected, version is not monotonically increasing"
            );
            return None;
        }

        let hub_tx = self.hub_tx.clone();
        let owner = owner.to_owned();
        Some(SharedStateResolver::new(move |data| {
            let _ = hub_tx.send(HubCommand::ResolvePendingState {
                owner,
                kind,
                version,
                data,
            });
        }))
    }

    fn resolve_pending_state(
        &mut self,
        owner: &str,
        kind: SharedStateKind,
        version: u64,
        data: EventData,
    ) {
        let Some(record) = self.registry.get_mut(owner) else {
            tracing::warn!(owner, "pending shared state resolved after unregistration, ignoring");
            return;
        };

        if record.manager_mut(kind).update_pending_state(version, data) {
            self.dispatch_state_change(owner, kind);
        } else {
            tracing::warn!(owner, version, "no pending shared state at this version");
        }
    }

    fn get_shared_state(
        &self,
        owner: &str,
        kind: SharedStateKind,
        event_id: Option<&str>,
        barrier: bool,
        resolution: SharedStateResolution,
    ) -> Option<SharedStateResult> {
        // The hub's own state resolves through the same path; the hub has
        // processed every event it has numbered, so the barrier never holds
        // it back.
        let (manager, last_processed) = if owner == EVENT_HUB_NAME {
            let manager = match kind {
                SharedStateKind::Standard => &self.hub_standard,
                SharedStateKind::Xdm => &self.hub_xdm,
            };
            (manager, u64::MAX)
        } else {
            let record = self.registry.get(owner)?;
            (
                record.manager(kind),
                record.last_processed.load(Ordering::Relaxed),
            )
        };

        let number = event_id.and_then(|id| self.event_numbers.get(id)).copied();
        let version = number.unwrap_or(VERSION_LATEST);

        let mut result = match resolution {
            SharedStateResolution::Any => manager.resolve(version),
            SharedStateResolution::LastSet => manager.resolve_last_set(version),
        };

        if barrier {
            if let Some(version) = number {
                if result.status == SharedStateStatus::Set
                    && last_processed < version.saturating_sub(1)
                {
                    result.status = SharedStateStatus::Pending;
                }
            }
        }

        Some(result)
    }

    /// Emits the internal signal telling every extension that `owner`'s
    /// state of the given kind has advanced.
    fn dispatch_state_change(&mut self, owner: &str, kind: SharedStateKind) {
        let (name, source) = match kind {
            SharedStateKind::Standard => ("Shared state change", event_source::SHARED_STATE),
            SharedStateKind::Xdm => ("Shared state change (XDM)", event_source::XDM_SHARED_STATE),
        };

        let mut data = EventData::new();
        data.insert(STATE_OWNER_KEY.to_owned(), json!(owner));

        self.ingest(Event::new(name, event_type::HUB, source).with_data(data));
    }

    /// Publishes the hub's own shared state: core version, wrapper tag and
    /// the registered-extension directory. No-op until the hub is started.
    fn publish_hub_state(&mut self) {
        if !self.started {
            return;
        }

        let mut extensions = serde_json::Map::new();
        for (name, record) in &self.registry {
            if name == PLACEHOLDER_NAME {
                continue;
            }

            let mut entry = serde_json::Map::new();
            entry.insert(
                "friendlyName".to_owned(),
                json!(record.info.friendly_name),
            );
            if let Some(version) = &record.info.version {
                entry.insert("version".to_owned(), json!(version));
            }
            if let Some(metadata) = &record.info.metadata {
                entry.insert("metadata".to_owned(), json!(metadata));
            }
            extensions.insert(name.clone(), serde_json::Value::Object(entry));
        }

        let mut data = EventData::new();
        data.insert("version".to_owned(), json!(env!("CARGO_PKG_VERSION")));
        data.insert(
            "wrapper".to_owned(),
            json!({
                "type": self.wrapper.tag(),
                "friendlyName": self.wrapper.friendly_name(),
            }),
        );
        data.insert("extensions".to_owned(), serde_json::Value::Object(extensions));

        let version = self.write_version(self.hub_standard.is_empty(), None);
        if self.hub_standard.set_state(version, data) {
            self.dispatch_state_change(EVENT_HUB_NAME, SharedStateKind::Standard);
        }
    }
}
