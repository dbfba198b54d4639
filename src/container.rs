//! Module `container` runs one extension on its own serial task: constructs
//! it, owns its listener table and inbox, and enforces the delivery
//! contract (pause/resume, per-event readiness, strict ordering).

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::api::ExtensionApi;
use crate::error::RegistrationError;
use crate::event::OrderedEvent;
use crate::extension::{EventListener, ExtensionFactory, ExtensionInfo, ListenerEntry};

/// Control messages processed by the container task, with priority over
/// queued events.
pub(crate) enum ContainerMessage {
    RegisterListener {
        event_type: String,
        source: String,
        listener: EventListener,
    },
    /// `start_events` (true) / `stop_events` (false).
    SetActive(bool),
    /// The hub accepted the registration; enter the delivery loop.
    Accept,
    /// The hub rejected the registration (duplicate name); tear down quietly.
    Reject,
    /// Unregistration or hub shutdown.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
}

/// Spawns the container task for one extension.
///
/// The factory runs on the spawned task. The outcome of construction and
/// name validation is reported once through `constructed`; the hub then
/// answers with [`ContainerMessage::Accept`] or [`ContainerMessage::Reject`]
/// on the control channel.
pub(crate) fn spawn(
    factory: ExtensionFactory,
    api: Arc<dyn ExtensionApi>,
    api_name: Arc<RwLock<Option<String>>>,
    control_rx: mpsc::UnboundedReceiver<ContainerMessage>,
    inbox_rx: mpsc::UnboundedReceiver<OrderedEvent>,
    last_processed: Arc<AtomicU64>,
    constructed: oneshot::Sender<Result<ExtensionInfo, RegistrationError>>,
) -> JoinHandle<()> {
    tokio::spawn(run(
        factory,
        api,
        api_name,
        control_rx,
        inbox_rx,
        last_processed,
        constructed,
    ))
}

#[allow(clippy::too_many_lines)]
async fn run(
    factory: ExtensionFactory,
    api: Arc<dyn ExtensionApi>,
    api_name: Arc<RwLock<Option<String>>>,
    mut control_rx: mpsc::UnboundedReceiver<ContainerMessage>,
    mut inbox_rx: mpsc::UnboundedReceiver<OrderedEvent>,
    last_processed: Arc<AtomicU64>,
    constructed: oneshot::Sender<Result<ExtensionInfo, RegistrationError>>,
) {
    let mut extension = match factory(Arc::clone(&api)) {
        Ok(extension) => extension,
        Err(error) => {
            tracing::error!(%error, "extension factory failed");
            let _ = constructed.send(Err(RegistrationError::ExtensionInitializationFailure));
            return;
        }
    };

    let name = extension.name().trim().to_owned();
    if name.is_empty() {
        let _ = constructed.send(Err(RegistrationError::InvalidExtensionName));
        return;
    }

    *api_name.write() = Some(name.clone());

    let info = ExtensionInfo {
        name: name.clone(),
        friendly_name: extension.friendly_name().to_owned(),
        version: extension.version().map(str::to_owned),
        metadata: extension.metadata(),
    };

    if constructed.send(Ok(info)).is_err() {
        return;
    }

    let mut listeners: Vec<ListenerEntry> = Vec::new();
    let mut state = RunState::Running;

    // Initializing: listener registrations issued during construction are
    // honored, events are not delivered until the hub accepts.
    loop {
        match control_rx.recv().await {
            Some(ContainerMessage::Accept) => break,
            Some(ContainerMessage::RegisterListener {
                event_type,
                source,
                listener,
            }) => listeners.push(ListenerEntry {
                event_type,
                source,
                listener,
            }),
            Some(ContainerMessage::SetActive(active)) => {
                state = if active {
                    RunState::Running
                } else {
                    RunState::Paused
                };
            }
            Some(ContainerMessage::Reject | ContainerMessage::Shutdown) | None => return,
        }
    }

    extension.on_registered();
    tracing::debug!(extension.name = %name, "extension registered");

    let mut queue: VecDeque<OrderedEvent> = VecDeque::new();
    let mut inbox_open = true;

    loop {
        // Deliver every consecutive ready head; a paused or not-ready head
        // stops the drain without advancing the queue.
        while state == RunState::Running {
            let Some(head) = queue.front() else { break };

            if !extension.ready_for_event(&head.event) {
                tracing::trace!(
                    extension.name = %name,
                    event.number = head.number,
                    "extension not ready, holding event at the head of the inbox"
                );
                break;
            }

            let OrderedEvent { number, event } = queue.pop_front().expect("head was just peeked");

            for entry in listeners.iter_mut() {
                if !entry.matches(&event) {
                    continue;
                }

                let invocation = AssertUnwindSafe((entry.listener)(event.clone())).catch_unwind();
                if invocation.await.is_err() {
                    tracing::error!(
                        extension.name = %name,
                        event.id = %event.id,
                        "listener panicked while handling event"
                    );
                }
            }

            last_processed.store(number, Ordering::Relaxed);
        }

        tokio::select! {
            biased;

            message = control_rx.recv() => match message {
                Some(ContainerMessage::RegisterListener { event_type, source, listener }) => {
                    listeners.push(ListenerEntry { event_type, source, listener });
                }
                Some(ContainerMessage::SetActive(active)) => {
                    state = if active { RunState::Running } else { RunState::Paused };
                    tracing::debug!(extension.name = %name, active, "run state changed");
                }
                Some(ContainerMessage::Shutdown) => {
                    extension.on_unregistered();
                    tracing::debug!(extension.name = %name, "extension unregistered");
                    return;
                }
                // Registration handshake is over; nothing to do.
                Some(ContainerMessage::Accept | ContainerMessage::Reject) => {}
                None => return,
            },

            event = inbox_rx.recv(), if inbox_open => match event {
                Some(event) => queue.push_back(event),
                None => inbox_open = false,
            },
        }
    }
}
