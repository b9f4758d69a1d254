//! Bounded multi-worker pub/sub distributing packet/state/error/lifecycle
//! events to subscribers and (indirectly) to the processor registry.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::packet::Packet;
use crate::session_types::StateChange;

/// The four event kinds the bus dispatches. `Lifecycle` is a wildcard
/// destination for packet/state/error events in addition to being a kind
/// in its own right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Packet,
    State,
    Error,
    Lifecycle,
}

/// Payload carried by an [`Event`].
#[derive(Debug, Clone)]
pub enum EventPayload {
    Packet(Packet),
    State(StateChange),
    Error(Arc<Error>),
    Lifecycle(serde_json::Value),
}

/// An event flowing through the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: SystemTime,
    pub session_id: String,
    pub payload: EventPayload,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(kind: EventKind, session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            kind,
            timestamp: SystemTime::now(),
            session_id: session_id.into(),
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.metadata.insert("sender".to_string(), serde_json::Value::String(sender.into()));
        self
    }
}

/// Subscriber capability. Implementations should be cheap to invoke; slow
/// handlers back-pressure the worker that happened to dequeue their event,
/// but not the other workers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> crate::error::Result<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(&Event) -> crate::error::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> crate::error::Result<()> {
        self(event)
    }
}

/// Opaque token returned by [`EventBus::subscribe`], required to unsubscribe.
/// The source this crate is grounded on compares function pointers for
/// identity; Rust closures/trait objects don't support that, so subscribers
/// are handed an explicit token instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken {
    kind: EventKind,
    id: u64,
}

type SubscriberList = Vec<(u64, Arc<dyn EventHandler>)>;

/// Bounded, multi-worker event bus. Publishing is non-blocking: a full
/// queue drops the event with a warning, a closed bus drops it silently.
pub struct EventBus {
    subscribers: Arc<parking_lot::RwLock<HashMap<EventKind, SubscriberList>>>,
    sender: mpsc::Sender<Event>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Event>>>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<tokio::sync::Notify>,
    next_id: AtomicU64,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Event bus construction defaults: 4 workers, a 256-event queue.
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_SIZE: usize = 256;

impl EventBus {
    pub fn new(queue_size: usize, workers: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let bus = Arc::new(Self {
            subscribers: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            next_id: AtomicU64::new(1),
            workers: parking_lot::Mutex::new(Vec::new()),
        });

        let worker_count = workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver = bus.receiver.clone();
            let subscribers = bus.subscribers.clone();
            let closed = bus.closed.clone();
            let shutdown = bus.shutdown.clone();
            handles.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, receiver, subscribers, closed, shutdown).await;
            }));
        }
        *bus.workers.lock() = handles;
        bus
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_QUEUE_SIZE, DEFAULT_WORKERS)
    }

    /// Shared-receiver worker loop. `recv` is raced against the shutdown
    /// notification rather than relying on the channel closing itself --
    /// the bus keeps its own `Sender` alive for its whole lifetime, so a
    /// worker parked in `recv().await` would otherwise never see the
    /// channel close and `close()` would deadlock trying to grab the same
    /// lock to call `Receiver::close` on it.
    async fn worker_loop(
        worker_id: usize,
        receiver: Arc<AsyncMutex<mpsc::Receiver<Event>>>,
        subscribers: Arc<parking_lot::RwLock<HashMap<EventKind, SubscriberList>>>,
        closed: Arc<AtomicBool>,
        shutdown: Arc<tokio::sync::Notify>,
    ) {
        loop {
            if closed.load(Ordering::Acquire) {
                tracing::debug!(worker_id, "event bus worker exiting: bus closed");
                break;
            }

            let event = tokio::select! {
                event = async {
                    let mut rx = receiver.lock().await;
                    rx.recv().await
                } => event,
                _ = shutdown.notified() => None,
            };

            match event {
                Some(event) => Self::dispatch(&subscribers, event).await,
                None => {
                    tracing::debug!(worker_id, "event bus worker exiting: queue closed");
                    break;
                }
            }
        }
    }

    async fn dispatch(subscribers: &parking_lot::RwLock<HashMap<EventKind, SubscriberList>>, event: Event) {
        let direct: SubscriberList = subscribers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        for (_, handler) in &direct {
            Self::invoke_guarded(handler, &event).await;
        }

        if event.kind != EventKind::Lifecycle {
            let lifecycle: SubscriberList = subscribers
                .read()
                .get(&EventKind::Lifecycle)
                .cloned()
                .unwrap_or_default();
            for (_, handler) in &lifecycle {
                Self::invoke_guarded(handler, &event).await;
            }
        }
    }

    async fn invoke_guarded(handler: &Arc<dyn EventHandler>, event: &Event) {
        let result = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, kind = ?event.kind, "event handler returned error");
            }
            Err(_panic) => {
                tracing::error!(kind = ?event.kind, "event handler panicked; recovered");
            }
        }
    }

    /// Appends `handler` to `kind`'s subscriber list. Returns a token that
    /// must be presented to [`EventBus::unsubscribe`] to remove it.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().entry(kind).or_default().push((id, handler));
        SubscriptionToken { kind, id }
    }

    /// Removes the handler identified by `token`, if still present.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if let Some(list) = self.subscribers.write().get_mut(&token.kind) {
            list.retain(|(id, _)| *id != token.id);
        }
    }

    /// Non-blocking publish. Dropped silently if the bus is closed; dropped
    /// with a warning if the queue is full.
    pub fn publish(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("event bus queue full; dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Idempotent shutdown: flips the closed flag (publish becomes a
    /// no-op immediately) and wakes every worker out of its blocked
    /// `recv`, retrying the wakeup until each has actually exited --
    /// `Notify::notify_waiters` only reaches waiters registered at the
    /// moment it is called, so a worker that hasn't re-entered its
    /// `select!` yet could otherwise miss it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            std::mem::take(&mut *workers)
        };
        for mut handle in handles {
            self.shutdown.notify_waiters();
            loop {
                tokio::select! {
                    res = &mut handle => {
                        let _ = res;
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {
                        self.shutdown.notify_waiters();
                    }
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, Duration};

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) -> crate::error::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        async fn handle(&self, _event: &Event) -> crate::error::Result<()> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn subscriber_receives_matching_kind() {
        let bus = EventBus::new(16, 2);
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::Packet, Arc::new(CountingHandler { count: count.clone() }));

        bus.publish(Event::new(
            EventKind::Packet,
            "s1",
            EventPayload::Packet(Packet::Close(crate::packet::ClosePacket::new("x"))),
        ));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        bus.close().await;
    }

    #[tokio::test]
    async fn lifecycle_receives_all_non_lifecycle_kinds() {
        let bus = EventBus::new(16, 2);
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::Lifecycle, Arc::new(CountingHandler { count: count.clone() }));

        bus.publish(Event::new(
            EventKind::Packet,
            "s1",
            EventPayload::Packet(Packet::Close(crate::packet::ClosePacket::new("x"))),
        ));
        bus.publish(Event::new(
            EventKind::State,
            "s1",
            EventPayload::State(StateChange::new("begin")),
        ));
        bus.publish(Event::new(
            EventKind::Error,
            "s1",
            EventPayload::Error(Arc::new(Error::Configuration("x".into()))),
        ));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        bus.close().await;
    }

    #[tokio::test]
    async fn lifecycle_event_does_not_double_deliver_to_itself() {
        let bus = EventBus::new(16, 1);
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::Lifecycle, Arc::new(CountingHandler { count: count.clone() }));

        bus.publish(Event::new(
            EventKind::Lifecycle,
            "s1",
            EventPayload::Lifecycle(serde_json::Value::Null),
        ));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        bus.close().await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(16, 1);
        let count = Arc::new(AtomicUsize::new(0));
        let token = bus.subscribe(EventKind::Packet, Arc::new(CountingHandler { count: count.clone() }));
        bus.unsubscribe(token);

        bus.publish(Event::new(
            EventKind::Packet,
            "s1",
            EventPayload::Packet(Packet::Close(crate::packet::ClosePacket::new("x"))),
        ));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.close().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_other_handlers() {
        let bus = EventBus::new(16, 1);
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::Packet, Arc::new(PanickingHandler));
        bus.subscribe(EventKind::Packet, Arc::new(CountingHandler { count: count.clone() }));

        bus.publish(Event::new(
            EventKind::Packet,
            "s1",
            EventPayload::Packet(Packet::Close(crate::packet::ClosePacket::new("x"))),
        ));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        bus.close().await;
    }

    #[tokio::test]
    async fn closed_bus_drops_events_silently() {
        let bus = EventBus::new(16, 1);
        bus.close().await;
        bus.publish(Event::new(
            EventKind::Packet,
            "s1",
            EventPayload::Packet(Packet::Close(crate::packet::ClosePacket::new("x"))),
        ));
        // no panic, no hang -- publish after close is a silent no-op
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let bus = EventBus::new(16, 1);
        bus.close().await;
        bus.close().await;
        assert!(bus.is_closed());
    }
}
