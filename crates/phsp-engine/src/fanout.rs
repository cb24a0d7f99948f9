//! Event fan-out: typed publish/subscribe over a bounded queue.
//!
//! A single dispatcher task drains the queue and awaits each subscriber in
//! registration order before moving to the next event. Delivery is therefore
//! serialized across every event kind, which is what keeps a `RunExited`
//! behind the last `Progress` of the same run.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use phsp_core::{EventKind, SweepEvent};

/// Receives events from the fan-out.
///
/// Calls are never concurrent with each other, so implementations may
/// mutate shared state without their own locking discipline.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &SweepEvent);
}

/// Adapter turning a closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&SweepEvent) + Send + Sync,
{
    async fn on_event(&self, event: &SweepEvent) {
        (self.0)(event)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&SweepEvent) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Forwards events into a channel; a closed receiver is ignored.
#[async_trait]
impl EventHandler for mpsc::UnboundedSender<SweepEvent> {
    async fn on_event(&self, event: &SweepEvent) {
        let _ = self.send(event.clone());
    }
}

enum Envelope {
    Event(SweepEvent),
    Barrier(oneshot::Sender<()>),
}

struct Subscription {
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
}

type Subscribers = Arc<RwLock<Vec<Subscription>>>;

/// Typed publish/subscribe bus.
pub struct EventBus {
    subscribers: Subscribers,
    tx: mpsc::Sender<Envelope>,
    dispatcher: JoinHandle<()>,
}

impl EventBus {
    /// Create a bus with a queue of `capacity` events and start its
    /// dispatcher. Must be called inside a tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscribers: Subscribers = Arc::new(RwLock::new(Vec::new()));
        let dispatcher = tokio::spawn(dispatch(subscribers.clone(), rx));
        Self {
            subscribers,
            tx,
            dispatcher,
        }
    }

    /// Register `handler` for events of `kind`.
    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.subscribers
            .write()
            .await
            .push(Subscription { kind, handler });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Queue an event. Waits for queue space when subscribers lag behind.
    pub async fn publish(&self, event: SweepEvent) {
        if self.tx.send(Envelope::Event(event)).await.is_err() {
            warn!("Event dispatcher stopped, dropping event");
        }
    }

    /// Resolve once every previously published event has been delivered.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Envelope::Barrier(done_tx)).await.is_err() {
            warn!("Event dispatcher stopped, nothing to flush");
            return;
        }
        let _ = done_rx.await;
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.tx.max_capacity())
            .finish_non_exhaustive()
    }
}

async fn dispatch(subscribers: Subscribers, rx: mpsc::Receiver<Envelope>) {
    let mut queue = ReceiverStream::new(rx);
    while let Some(envelope) = queue.next().await {
        match envelope {
            Envelope::Event(event) => {
                let kind = event.kind();
                let handlers: Vec<Arc<dyn EventHandler>> = subscribers
                    .read()
                    .await
                    .iter()
                    .filter(|s| s.kind == kind)
                    .map(|s| s.handler.clone())
                    .collect();
                debug!(kind = ?kind, subscribers = handlers.len(), "Delivering event");
                for handler in handlers {
                    handler.on_event(&event).await;
                }
            }
            Envelope::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Event dispatcher finished");
}
