//! Serialized delivery of handler callbacks.
//!
//! [`AsyncDispatcher`] feeds a single worker task through an mpsc channel,
//! so handler invocations are totally ordered and never concurrent. An
//! optional permit count bounds how many event tasks may be queued or
//! running at once; when permits run out the *stream worker* blocks in
//! `submit`, which is exactly the backpressure we want.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes_utils::Str;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info_span};

use crate::error::ClientError;
use crate::handler::EventHandler;
use crate::parse::event::MessageEvent;

enum HandlerCall {
    Open,
    Closed,
    Message(MessageEvent<'static>),
    Comment(Str),
    Error(Arc<ClientError>),
    /// Barrier: acknowledged once everything queued before it has run.
    Flush(oneshot::Sender<()>),
    /// Sentinel: drain what came before, then stop the worker.
    Shutdown,
}

struct QueuedCall {
    call: HandlerCall,
    /// Held while the call is queued or running; dropping it readmits the
    /// next event task.
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

pub(crate) struct AsyncDispatcher {
    tx: UnboundedSender<QueuedCall>,
    rx: Mutex<Option<UnboundedReceiver<QueuedCall>>>,
    permits: Option<Arc<Semaphore>>,
    handler: Arc<dyn EventHandler>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncDispatcher {
    pub(crate) fn new(handler: Arc<dyn EventHandler>, max_event_tasks_in_flight: usize) -> Self {
        let (tx, rx) = unbounded_channel();
        let permits = if max_event_tasks_in_flight > 0 {
            Some(Arc::new(Semaphore::new(max_event_tasks_in_flight)))
        } else {
            None
        };
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            permits,
            handler,
            worker: Mutex::new(None),
        }
    }

    /// The handler itself, for streaming-mode calls made inline on the
    /// stream worker.
    pub(crate) fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.handler)
    }

    /// Starts the dispatch worker. Does nothing on repeat calls.
    pub(crate) fn spawn_worker(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let handler = Arc::clone(&self.handler);
        let worker = tokio::spawn(run_worker(handler, rx).instrument(info_span!("sse-dispatch")));
        *self.worker.lock() = Some(worker);
    }

    /// Waits until the worker has terminated or the deadline passes. The
    /// handle is kept on timeout so a later wait can try again.
    pub(crate) async fn join_worker(&self, deadline: tokio::time::Instant) -> bool {
        let handle = self.worker.lock().take();
        let Some(mut handle) = handle else {
            return true;
        };
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                *self.worker.lock() = Some(handle);
                false
            }
        }
    }

    pub(crate) async fn submit_message(&self, event: MessageEvent<'static>) {
        self.submit_event_task(HandlerCall::Message(event)).await;
    }

    pub(crate) async fn submit_comment(&self, comment: Str) {
        self.submit_event_task(HandlerCall::Comment(comment)).await;
    }

    /// Event tasks respect the in-flight bound; this acquisition is the
    /// stream worker's suspension point under backpressure.
    async fn submit_event_task(&self, call: HandlerCall) {
        let permit = match &self.permits {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        };
        let _ = self.tx.send(QueuedCall {
            call,
            _permit: permit,
        });
    }

    // Lifecycle notifications bypass the event-task bound so that
    // `close()` and `restart()` stay non-blocking.

    pub(crate) fn submit_open(&self) {
        let _ = self.tx.send(QueuedCall {
            call: HandlerCall::Open,
            _permit: None,
        });
    }

    pub(crate) fn submit_closed(&self) {
        let _ = self.tx.send(QueuedCall {
            call: HandlerCall::Closed,
            _permit: None,
        });
    }

    pub(crate) fn submit_error(&self, error: Arc<ClientError>) {
        let _ = self.tx.send(QueuedCall {
            call: HandlerCall::Error(error),
            _permit: None,
        });
    }

    /// Waits until every callback queued so far has finished.
    pub(crate) async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let queued = self.tx.send(QueuedCall {
            call: HandlerCall::Flush(ack_tx),
            _permit: None,
        });
        if queued.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Asks the worker to drain the queue and stop. Idempotent.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(QueuedCall {
            call: HandlerCall::Shutdown,
            _permit: None,
        });
    }
}

async fn run_worker(handler: Arc<dyn EventHandler>, mut rx: UnboundedReceiver<QueuedCall>) {
    while let Some(queued) = rx.recv().await {
        match queued.call {
            HandlerCall::Open => guard(handler.on_open()).await,
            HandlerCall::Closed => guard(handler.on_closed()).await,
            HandlerCall::Message(event) => guard(handler.on_message(event)).await,
            HandlerCall::Comment(comment) => guard(handler.on_comment(comment)).await,
            HandlerCall::Error(error) => guard(handler.on_error(&error)).await,
            HandlerCall::Flush(ack) => {
                let _ = ack.send(());
            }
            HandlerCall::Shutdown => break,
        }
    }
}

/// Handler failures must not disturb dispatch ordering or reach the stream
/// worker; log and move on.
async fn guard<F: Future<Output = ()>>(call: F) {
    if AssertUnwindSafe(call).catch_unwind().await.is_err() {
        error!("event handler panicked; continuing");
    }
}
