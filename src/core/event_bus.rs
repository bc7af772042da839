//! Pub/Sub event bus carrying engine notifications.
//!
//! Architecture:
//! - Observers subscribe to an event type with a callback (immediate invocation)
//! - emit() invokes callbacks immediately AND queues the event
//! - poll() drains the queue for batch processing in the host loop
//!
//! Callback order: FIFO (first-subscribed, first-called) within same event type.
//!
//! Callbacks run on the emitting thread while the emitter may still hold its
//! own lock (a clock emits `FrameChanged` from inside `tick`). A callback must
//! not lock the component that emitted the event; read state via poll() instead.

use log::warn;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Maximum events in queue before oldest are evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// Marker trait for events. Events must be Send + Sync + 'static.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Boxed event for queue storage
pub type BoxedEvent = Box<dyn Event>;

#[derive(Default)]
struct Shared {
    subscribers: RwLock<HashMap<TypeId, Vec<Callback>>>,
    queue: Mutex<Vec<BoxedEvent>>,
}

/// Event bus owned by the engine context.
///
/// Cloning is cheap and yields a handle onto the same subscribers and queue.
#[derive(Clone, Default)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type E.
    ///
    /// # Example
    /// ```ignore
    /// bus.subscribe::<CacheChanged, _>(move |e| {
    ///     log::info!("cache at {} bytes", e.used);
    /// });
    /// ```
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Invoke callbacks for `event`, then queue it for poll().
    pub fn emit<E: Event + Clone>(&self, event: E) {
        // Clone the callback list so a subscriber may subscribe from inside its callback
        let callbacks: Vec<Callback> = self
            .shared
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .cloned()
            .unwrap_or_default();
        for cb in &callbacks {
            cb(&event);
        }

        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict_count = queue.len() / 2;
            warn!("EventBus queue full ({} events), evicting oldest {}", queue.len(), evict_count);
            queue.drain(0..evict_count);
        }
        queue.push(Box::new(event));
    }

    /// Drain all queued events.
    pub fn poll(&self) -> Vec<BoxedEvent> {
        std::mem::take(&mut *self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Handle for components that only emit.
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter { inner: Some(self.clone()) }
    }

    /// Clear subscribers for type E
    pub fn unsubscribe_all<E: Event>(&self) {
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&TypeId::of::<E>());
    }

    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_types", &self.shared.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .field("queue_len", &self.shared.queue.lock().map(|q| q.len()).unwrap_or(0))
            .finish()
    }
}

/// Emit-only handle. A detached emitter (no bus yet) drops events.
#[derive(Clone, Default, Debug)]
pub struct EventEmitter {
    inner: Option<EventBus>,
}

impl EventEmitter {
    /// No-op emitter for components built before the bus exists
    pub fn dummy() -> Self {
        Self { inner: None }
    }

    pub fn emit<E: Event + Clone>(&self, event: E) {
        if let Some(ref bus) = self.inner {
            bus.emit(event);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }
}

/// Downcast a queued event to its concrete type.
///
/// Derefs to `dyn Event` first; calling `as_any()` on the Box itself would
/// hit the blanket impl for `Box<dyn Event>` and never match.
#[inline]
pub fn downcast_event<E: Event>(event: &BoxedEvent) -> Option<&E> {
    (**event).as_any().downcast_ref::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Clone, Debug)]
    struct TestEvent {
        value: i32,
    }

    #[derive(Clone, Debug)]
    struct OtherEvent;

    #[test]
    fn test_subscribe_emit_immediate() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        bus.subscribe::<TestEvent, _>(move |e| {
            c.fetch_add(e.value, Ordering::SeqCst);
        });

        bus.emit(TestEvent { value: 10 });
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        bus.emit(TestEvent { value: 5 });
        assert_eq!(counter.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn test_emit_queues_for_poll() {
        let bus = EventBus::new();
        bus.emit(TestEvent { value: 1 });
        bus.emit(OtherEvent);

        let events = bus.poll();
        assert_eq!(events.len(), 2);
        assert_eq!(downcast_event::<TestEvent>(&events[0]).map(|e| e.value), Some(1));
        assert!(downcast_event::<TestEvent>(&events[1]).is_none());
        assert_eq!(bus.poll().len(), 0);
    }

    #[test]
    fn test_emitter_handle_and_dummy() {
        let bus = EventBus::new();
        let emitter = bus.emitter();
        assert!(emitter.is_attached());
        emitter.emit(TestEvent { value: 42 });
        assert_eq!(bus.queue_len(), 1);

        let dummy = EventEmitter::dummy();
        dummy.emit(TestEvent { value: 1 });
        assert_eq!(bus.queue_len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        bus.subscribe::<TestEvent, _>(|_| {});
        assert!(bus.has_subscribers::<TestEvent>());
        bus.unsubscribe_all::<TestEvent>();
        assert!(!bus.has_subscribers::<TestEvent>());
    }

    #[test]
    fn test_queue_eviction() {
        let bus = EventBus::new();
        for i in 0..(MAX_QUEUE_SIZE as i32 + 1) {
            bus.emit(TestEvent { value: i });
        }
        assert_eq!(bus.queue_len(), MAX_QUEUE_SIZE / 2 + 1);
    }
}
