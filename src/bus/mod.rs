//! In-process typed publish/subscribe hub.
//!
//! Event kinds are registered with [`EventBus::define`] together with a JSON
//! schema for their properties. [`EventBus::publish`] validates the payload and
//! delivers it synchronously, in subscription order, to every handler
//! registered for that exact kind and then to every [`EventBus::subscribe_all`]
//! handler. Handlers run on the publisher's task.
//!
//! Delivery iterates over a snapshot of the subscriber list taken when the
//! publish starts: a handler subscribed while an event is being delivered sees
//! the next event, never the in-flight one, and is never invoked twice.

pub mod events;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{KilnError, Result};
use crate::tools::validation::validate_arguments;

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

/// Returned by [`EventBus::once`] handlers to keep or drop the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    by_type: HashMap<String, Vec<(u64, Handler)>>,
    all: Vec<(u64, Handler)>,
}

#[derive(Default)]
struct BusInner {
    definitions: RwLock<HashMap<String, Value>>,
    subscribers: Mutex<Subscribers>,
}

impl BusInner {
    fn remove(&self, id: u64, event_type: Option<&str>) {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match event_type {
            Some(event_type) => {
                if let Some(list) = subs.by_type.get_mut(event_type) {
                    list.retain(|(sub_id, _)| *sub_id != id);
                    if list.is_empty() {
                        subs.by_type.remove(event_type);
                    }
                }
            }
            None => subs.all.retain(|(sub_id, _)| *sub_id != id),
        }
    }
}

/// Handle to a registered subscriber.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    event_type: Option<String>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id, self.event_type.as_deref());
        }
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

/// Typed publish/subscribe hub. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds = self
            .inner
            .definitions
            .read()
            .map(|defs| defs.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("kinds", &kinds).finish()
    }
}

impl EventBus {
    /// Create a bus with the built-in event kinds registered.
    pub fn new() -> Self {
        let bus = Self::empty();
        events::define_builtin(&bus);
        bus
    }

    /// Create a bus with no event kinds registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema for an event kind.
    pub fn define(&self, event_type: impl Into<String>, schema: Value) {
        self.inner
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(event_type.into(), schema);
    }

    pub fn is_defined(&self, event_type: &str) -> bool {
        self.inner
            .definitions
            .read()
            .map(|defs| defs.contains_key(event_type))
            .unwrap_or(false)
    }

    /// Validate and deliver an event.
    pub fn publish(&self, event_type: &str, properties: Value) -> Result<()> {
        {
            let defs = self
                .inner
                .definitions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let schema = defs.get(event_type).ok_or_else(|| {
                KilnError::Validation(format!("unknown event type '{event_type}'"))
            })?;
            validate_arguments(&properties, schema).map_err(|message| {
                KilnError::Validation(format!("invalid '{event_type}' event: {message}"))
            })?;
        }

        let handlers: Vec<Handler> = {
            let subs = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subs.by_type
                .get(event_type)
                .into_iter()
                .flatten()
                .chain(subs.all.iter())
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        if handlers.is_empty() {
            return Ok(());
        }

        let event = BusEvent {
            event_type: event_type.to_string(),
            properties,
        };
        tracing::trace!(event_type, subscribers = handlers.len(), "bus publish");
        for handler in handlers {
            handler(&event);
        }
        Ok(())
    }

    /// Serialize `properties` and publish them.
    pub fn publish_serialized<T: Serialize>(&self, event_type: &str, properties: &T) -> Result<()> {
        self.publish(event_type, serde_json::to_value(properties)?)
    }

    /// Subscribe to one event kind.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.next_id += 1;
        let id = subs.next_id;
        subs.by_type
            .entry(event_type.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            event_type: Some(event_type),
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.next_id += 1;
        let id = subs.next_id;
        subs.all.push((id, Arc::new(handler)));
        Subscription {
            id,
            event_type: None,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Run `handler` on matching events until it returns [`Flow::Done`].
    pub fn once<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) -> Flow + Send + Sync + 'static,
    {
        let slot: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handler_slot = slot.clone();
        let subscription = self.subscribe(event_type, move |event| {
            if done.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            if handler(event) == Flow::Done {
                done.store(true, std::sync::atomic::Ordering::SeqCst);
                if let Some(sub) = handler_slot.get() {
                    sub.unsubscribe();
                }
            }
        });
        let _ = slot.set(subscription.clone());
        subscription
    }

    /// Adapt a subscription into an async stream of events.
    pub fn channel(
        &self,
        event_type: impl Into<String>,
    ) -> (Subscription, UnboundedReceiverStream<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(event_type, move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, UnboundedReceiverStream::new(rx))
    }

    /// Stream every published event.
    pub fn channel_all(&self) -> (Subscription, UnboundedReceiverStream<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe_all(move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, UnboundedReceiverStream::new(rx))
    }

    #[cfg(test)]
    fn subscriber_count(&self, event_type: &str) -> usize {
        let subs = self.inner.subscribers.lock().unwrap();
        subs.by_type.get(event_type).map(Vec::len).unwrap_or(0)
    }
}
