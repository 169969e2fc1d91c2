//! In-process publish/subscribe fabric.
//!
//! Every subscriber owns an unbounded queue drained by its own task, so
//! async delivery preserves publish order per subscriber and a slow or
//! failing handler never holds up the publisher or its siblings.
//! `publish_sync` bypasses the queues and awaits every handler directly.
//!
//! A broadcast tap (`stream`) mirrors every published event for external
//! consumers such as a UI socket.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::error::EventError;
use crate::events::types::{Event, EventType};
use crate::fault::panic_message;

/// Default broadcast channel capacity for the external tap.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Identifies one subscription for `unsubscribe`.
pub type SubscriptionId = u64;

/// A subscriber callback.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter so plain async closures can subscribe.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
    queue: mpsc::UnboundedSender<Event>,
}

/// Async/sync event bus.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventType, Vec<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    tap: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (tap, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            tap,
        })
    }

    /// Register a handler for one event type.
    ///
    /// Spawns the subscriber's delivery task, so this must be called from
    /// within a Tokio runtime.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, mut rx) = mpsc::unbounded_channel::<Event>();

        let worker = Arc::clone(&handler);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = invoke(worker.as_ref(), &event).await;
            }
        });

        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type)
            .or_default()
            .push(Subscriber { id, handler, queue });

        debug!(event_type = %event_type, subscription = id, "Subscribed");
        id
    }

    /// Register an async closure as a handler.
    pub fn subscribe_fn<F, Fut>(&self, event_type: EventType, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(event_type, Arc::new(FnHandler(f)))
    }

    /// Remove one subscription. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = subscribers.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        before != list.len()
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Receive a copy of every event published from now on.
    pub fn stream(&self) -> broadcast::Receiver<Event> {
        self.tap.subscribe()
    }

    /// Fire-and-forget delivery. Returns once the event is queued.
    pub fn publish(&self, event: Event) -> Result<(), EventError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventError::Closed);
        }
        let event_type = event.event_type();
        {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = subscribers.get(&event_type) {
                for subscriber in list {
                    if subscriber.queue.send(event.clone()).is_err() {
                        warn!(event_type = %event_type, subscription = subscriber.id, "Subscriber queue closed");
                    }
                }
            }
        }
        // Ok if no external listener is attached.
        let _ = self.tap.send(event);
        Ok(())
    }

    /// Invoke every handler for the event and wait for all of them.
    ///
    /// Handlers run concurrently. Any failures are returned together after
    /// all handlers have finished.
    pub async fn publish_sync(&self, event: Event) -> Result<(), EventError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventError::Closed);
        }
        let event_type = event.event_type();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .map(|list| list.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default();

        let results = join_all(handlers.iter().map(|h| invoke(h.as_ref(), &event))).await;
        let _ = self.tap.send(event);

        let mut failures: Vec<EventError> = results.into_iter().filter_map(Result::err).collect();
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(EventError::Aggregate {
                event_type: event_type.to_string(),
                errors: failures.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    /// Stop accepting events and drop every subscription.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("Event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Run one handler inside a fault boundary.
async fn invoke(handler: &dyn EventHandler, event: &Event) -> Result<(), EventError> {
    let event_type = event.event_type();
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(event_type = %event_type, error = %e, "Event handler failed");
            Err(EventError::HandlerFailed {
                event_type: event_type.to_string(),
                message: e.to_string(),
            })
        }
        Err(payload) => {
            let message = panic_message(&payload);
            error!(event_type = %event_type, panic = %message, "Event handler panicked");
            Err(EventError::HandlerFailed {
                event_type: event_type.to_string(),
                message: format!("panicked: {message}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::events::types::{CollectionTriggered, DocumentEvent};
    use uuid::Uuid;

    fn doc_event(n: usize) -> Event {
        Event::DocumentSaved(DocumentEvent::new(Uuid::nil(), Uuid::nil(), format!("doc-{n}")))
    }

    fn doc_id(event: &Event) -> String {
        match event {
            Event::DocumentSaved(p) => p.document_id.clone(),
            _ => String::new(),
        }
    }

    fn explode() -> anyhow::Result<()> {
        panic!("handler exploded")
    }

    fn trigger() -> Event {
        Event::CollectionTriggered(CollectionTriggered {
            triggered_by: "test".into(),
            timestamp: chrono::Utc::now(),
        })
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, n: usize) {
        for _ in 0..200 {
            if seen.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn async_publish_preserves_order_per_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_fn(EventType::DocumentSaved, move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(doc_id(&event));
                anyhow::Ok(())
            }
        });

        for n in 0..20 {
            bus.publish(doc_event(n)).unwrap();
        }
        wait_for(&seen, 20).await;
        let expected: Vec<String> = (0..20).map(|n| format!("doc-{n}")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_affect_siblings() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_fn(EventType::DocumentSaved, |_event| async move { explode() });
        let sink = Arc::clone(&seen);
        bus.subscribe_fn(EventType::DocumentSaved, move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(doc_id(&event));
                anyhow::Ok(())
            }
        });

        bus.publish(doc_event(1)).unwrap();
        bus.publish(doc_event(2)).unwrap();
        wait_for(&seen, 2).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_sync_waits_and_surfaces_errors() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_fn(EventType::CollectionTriggered, move |_event| {
            let sink = Arc::clone(&sink);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                sink.lock().unwrap().push("done".to_string());
                anyhow::Ok(())
            }
        });
        bus.subscribe_fn(EventType::CollectionTriggered, |_event| async move {
            Err(anyhow::anyhow!("collector offline"))
        });

        let err = bus.publish_sync(trigger()).await.unwrap_err();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(err.to_string().contains("collector offline"));
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_handler() {
        let bus = EventBus::new();
        let a = bus.subscribe_fn(EventType::JobError, |_e| async { anyhow::Ok(()) });
        let _b = bus.subscribe_fn(EventType::JobError, |_e| async { anyhow::Ok(()) });
        assert_eq!(bus.subscriber_count(EventType::JobError), 2);
        assert!(bus.unsubscribe(EventType::JobError, a));
        assert!(!bus.unsubscribe(EventType::JobError, a));
        assert_eq!(bus.subscriber_count(EventType::JobError), 1);
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish() {
        let bus = EventBus::new();
        bus.close();
        assert!(matches!(bus.publish(trigger()), Err(EventError::Closed)));
        assert!(matches!(bus.publish_sync(trigger()).await, Err(EventError::Closed)));
    }

    #[tokio::test]
    async fn stream_mirrors_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.stream();
        bus.publish(doc_event(7)).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(doc_id(&event), "doc-7");
    }
}
