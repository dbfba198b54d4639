//! The dispatcher: a single-writer task consuming the numbered ingress,
//! running the preprocessor pipeline, and fanning preprocessed events out to
//! extension inboxes, the response table and the event-history writer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{Event, OrderedEvent};
use crate::history::EventHistory;
use crate::hub::EventPreprocessor;
use crate::response::ResponseMessage;

pub(crate) enum DispatcherMessage {
    Event(OrderedEvent),
    AddSink {
        name: String,
        inbox: mpsc::UnboundedSender<OrderedEvent>,
    },
    RemoveSink {
        name: String,
    },
    AddPreprocessor(Box<dyn EventPreprocessor>),
    /// The hub has been started; deliver the backlog and go live.
    Start,
    Shutdown,
}

pub(crate) fn spawn(
    response_tx: mpsc::UnboundedSender<ResponseMessage>,
    history: Option<Arc<dyn EventHistory>>,
) -> (mpsc::UnboundedSender<DispatcherMessage>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let history_tx = history.map(spawn_history_writer);
    let task = tokio::spawn(run(rx, response_tx, history_tx));
    (tx, task)
}

/// The history domain: one task serializing `record_event` calls, fed
/// fire-and-forget by the dispatcher.
fn spawn_history_writer(history: Arc<dyn EventHistory>) -> mpsc::UnboundedSender<Event> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !history.record_event(&event).await {
                tracing::warn!(event.id = %event.id, "event-history record failed");
            }
        }
    });

    tx
}

struct Dispatcher {
    preprocessors: Vec<Box<dyn EventPreprocessor>>,
    sinks: HashMap<String, mpsc::UnboundedSender<OrderedEvent>>,
    response_tx: mpsc::UnboundedSender<ResponseMessage>,
    history_tx: Option<mpsc::UnboundedSender<Event>>,
    started: bool,
    backlog: VecDeque<OrderedEvent>,
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<DispatcherMessage>,
    response_tx: mpsc::UnboundedSender<ResponseMessage>,
    history_tx: Option<mpsc::UnboundedSender<Event>>,
) {
    let mut dispatcher = Dispatcher {
        preprocessors: Vec::new(),
        sinks: HashMap::new(),
        response_tx,
        history_tx,
        started: false,
        backlog: VecDeque::new(),
    };

    while let Some(message) = rx.recv().await {
        match message {
            DispatcherMessage::Event(event) => {
                if dispatcher.started {
                    dispatcher.deliver(event);
                } else {
                    dispatcher.backlog.push_back(event);
                }
            }
            DispatcherMessage::AddSink { name, inbox } => {
                dispatcher.sinks.insert(name, inbox);
            }
            DispatcherMessage::RemoveSink { name } => {
                dispatcher.sinks.remove(&name);
            }
            DispatcherMessage::AddPreprocessor(preprocessor) => {
                dispatcher.preprocessors.push(preprocessor);
            }
            DispatcherMessage::Start => {
                dispatcher.started = true;
                while let Some(event) = dispatcher.backlog.pop_front() {
                    dispatcher.deliver(event);
                }
            }
            DispatcherMessage::Shutdown => return,
        }
    }
}

impl Dispatcher {
    fn deliver(&mut self, ordered: OrderedEvent) {
        let OrderedEvent { number, mut event } = ordered;

        for preprocessor in &mut self.preprocessors {
            match preprocessor.process(event) {
                Ok(transformed) => event = transformed,
                Err(error) => {
                    // The event number stays consumed; only fan-out is skipped.
                    tracing::error!(%error, event.number = number, "preprocessor failed, discarding event");
                    return;
                }
            }
        }

        if event.is_response() {
            let _ = self
                .response_tx
                .send(ResponseMessage::Response(event.clone()));
        }

        for inbox in self.sinks.values() {
            let _ = inbox.send(OrderedEvent {
                number,
                event: event.clone(),
            });
        }

        if event.mask.is_some() {
            if let Some(history_tx) = &self.history_tx {
                let _ = history_tx.send(event);
            }
        }
    }
}
