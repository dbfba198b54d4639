//! Module `response` correlates response events with the trigger events that
//! requested them: a table of one-shot handlers keyed by trigger identifier,
//! each with its own timeout, invoked on a bounded worker pool.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::ResponseError;
use crate::event::Event;

/// One-shot callback receiving either the response event or the failure
/// reason. Exactly one invocation happens per registration.
pub type ResponseHandler = Box<dyn FnOnce(Result<Event, ResponseError>) + Send>;

pub(crate) enum ResponseMessage {
    Register {
        trigger_id: String,
        timeout: Duration,
        handler: ResponseHandler,
    },
    /// A preprocessed event carrying a `response_id` arrived.
    Response(Event),
    /// A registration's timer fired.
    TimedOut(String),
    /// Fail every outstanding registration and stop.
    Shutdown,
}

struct PendingResponse {
    handler: ResponseHandler,
    timer: JoinHandle<()>,
}

/// Spawns the completion domain: a single task owning the trigger table,
/// plus a bounded pool of workers invoking the handlers.
pub(crate) fn spawn(
    worker_permits: usize,
) -> (mpsc::UnboundedSender<ResponseMessage>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(tx.clone(), rx, worker_permits));
    (tx, task)
}

async fn run(
    self_tx: mpsc::UnboundedSender<ResponseMessage>,
    mut rx: mpsc::UnboundedReceiver<ResponseMessage>,
    worker_permits: usize,
) {
    let workers = Arc::new(Semaphore::new(worker_permits));
    let mut pending: HashMap<String, PendingResponse> = HashMap::new();

    while let Some(message) = rx.recv().await {
        match message {
            ResponseMessage::Register {
                trigger_id,
                timeout,
                handler,
            } => {
                let timer = {
                    let self_tx = self_tx.clone();
                    let trigger_id = trigger_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = self_tx.send(ResponseMessage::TimedOut(trigger_id));
                    })
                };

                if let Some(replaced) =
                    pending.insert(trigger_id.clone(), PendingResponse { handler, timer })
                {
                    // A second listener on the same trigger supersedes the
                    // first, which is failed as timed out.
                    tracing::warn!(%trigger_id, "response listener replaced for trigger");
                    replaced.timer.abort();
                    invoke(&workers, replaced.handler, Err(ResponseError::Timeout));
                }
            }

            ResponseMessage::Response(event) => {
                let Some(trigger_id) = event.response_id.clone() else {
                    continue;
                };

                if let Some(entry) = pending.remove(&trigger_id) {
                    entry.timer.abort();
                    invoke(&workers, entry.handler, Ok(event));
                }
            }

            ResponseMessage::TimedOut(trigger_id) => {
                if let Some(entry) = pending.remove(&trigger_id) {
                    tracing::debug!(%trigger_id, "response listener timed out");
                    invoke(&workers, entry.handler, Err(ResponseError::Timeout));
                }
            }

            ResponseMessage::Shutdown => {
                for (_, entry) in pending.drain() {
                    entry.timer.abort();
                    invoke(&workers, entry.handler, Err(ResponseError::Shutdown));
                }
                return;
            }
        }
    }
}

/// Invokes `handler` on the bounded worker pool. A panicking handler is
/// logged and swallowed; the table task is never affected.
fn invoke(
    workers: &Arc<Semaphore>,
    handler: ResponseHandler,
    outcome: Result<Event, ResponseError>,
) {
    let workers = Arc::clone(workers);
    tokio::spawn(async move {
        let _permit = workers.acquire_owned().await;

        if std::panic::catch_unwind(AssertUnwindSafe(move || handler(outcome))).is_err() {
            tracing::error!("response handler panicked");
        }
    });
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    fn trigger() -> Event {
        Event::new("trigger", "com.test.type", "com.test.requestContent")
    }

    fn response_to(trigger: &Event) -> Event {
        Event::new("response", "com.test.type", "com.test.responseContent")
            .in_response_to(trigger)
    }

    #[tokio::test(start_paused = true)]
    async fn a_matching_response_cancels_the_timeout() {
        let (tx, _task) = spawn(1);

        let trigger = trigger();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);

        tx.send(ResponseMessage::Register {
            trigger_id: trigger.id.clone(),
            timeout: Duration::from_millis(500),
            handler: Box::new(move |outcome| sink.lock().unwrap().push(outcome)),
        })
        .unwrap();

        tx.send(ResponseMessage::Response(response_to(&trigger)))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1, "handler must run exactly once");
        assert!(outcomes[0].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_exactly_once_without_a_response() {
        let (tx, _task) = spawn(1);

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let trigger = trigger();

        tx.send(ResponseMessage::Register {
            trigger_id: trigger.id.clone(),
            timeout: Duration::from_millis(50),
            handler: Box::new(move |outcome| {
                assert_eq!(outcome.unwrap_err(), ResponseError::Timeout);
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        })
        .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        // A late response must find no registration left.
        tx.send(ResponseMessage::Response(response_to(&trigger)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_outstanding_registrations() {
        let (tx, task) = spawn(1);

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);

        tx.send(ResponseMessage::Register {
            trigger_id: trigger().id,
            timeout: Duration::from_secs(3600),
            handler: Box::new(move |outcome| sink.lock().unwrap().push(outcome)),
        })
        .unwrap();

        tx.send(ResponseMessage::Shutdown).unwrap();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], Err(ResponseError::Shutdown));
    }
}
