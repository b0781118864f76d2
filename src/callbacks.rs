//! Per-object event subscriptions.
//!
//! Every hardware-facing object owns a [`CallbackRegistry`] that declares
//! the event types it emits (e.g. `"value"` for a signal, `"acq_done"` for a
//! device). Subscribing under an undeclared type fails with
//! [`HwError::UnknownEventType`].
//!
//! # Delivery guarantees
//!
//! - Callbacks for one event type run in registration order, one at a
//!   time. Each event type has its own delivery lock, so different event
//!   types of the same object may be delivered concurrently.
//! - The delivery lock is re-entrant: a callback may trigger a nested
//!   delivery on the same thread (e.g. a value callback that writes the
//!   signal again) without deadlocking.
//! - A panicking callback is logged and skipped; the remaining callbacks
//!   still run.
//! - Callbacks may subscribe or unsubscribe during delivery. A callback
//!   removed mid-delivery is not invoked afterwards.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::{HwError, HwResult};
use crate::reading::now;

/// A registered callback.
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Payload delivered to callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event type name.
    pub event_type: &'static str,
    /// Name of the emitting object.
    pub object: String,
    /// New value, for value-change events.
    pub value: Option<Value>,
    /// Previous value, if one was known.
    pub old_value: Option<Value>,
    /// UNIX timestamp of the event.
    pub timestamp: f64,
    /// Outcome, for completion events.
    pub success: Option<bool>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: &'static str, object: impl Into<String>) -> Self {
        Self {
            event_type,
            object: object.into(),
            value: None,
            old_value: None,
            timestamp: now(),
            success: None,
        }
    }

    /// Attach the new value.
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Attach the previous value.
    pub fn with_old_value(mut self, old_value: Option<Value>) -> Self {
        self.old_value = old_value;
        self
    }

    /// Override the timestamp.
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach the outcome of a completion event.
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }
}

/// Multi-event subscription store owned by one object.
pub struct CallbackRegistry {
    owner: String,
    event_types: &'static [&'static str],
    subs: Mutex<FxHashMap<&'static str, Vec<(SubscriptionId, Callback)>>>,
    cache: Mutex<FxHashMap<&'static str, Event>>,
    delivery: FxHashMap<&'static str, ReentrantMutex<()>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("owner", &self.owner)
            .field("event_types", &self.event_types)
            .finish()
    }
}

impl CallbackRegistry {
    /// Create a registry for `owner` emitting the given event types.
    pub fn new(owner: impl Into<String>, event_types: &'static [&'static str]) -> Self {
        Self {
            owner: owner.into(),
            event_types,
            subs: Mutex::new(FxHashMap::default()),
            cache: Mutex::new(FxHashMap::default()),
            delivery: event_types
                .iter()
                .map(|&ty| (ty, ReentrantMutex::new(())))
                .collect(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Event types this registry accepts.
    pub fn event_types(&self) -> &'static [&'static str] {
        self.event_types
    }

    fn resolve(&self, event_type: &str) -> HwResult<&'static str> {
        self.event_types
            .iter()
            .copied()
            .find(|&ty| ty == event_type)
            .ok_or_else(|| {
                HwError::UnknownEventType(format!("{event_type} (emitted by {})", self.owner))
            })
    }

    /// Register a callback for `event_type`.
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> HwResult<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_with_replay(event_type, callback, false)
    }

    /// Register a callback and, if `run` is set, replay the most recent
    /// event of that type to it immediately.
    pub fn subscribe_with_replay<F>(
        &self,
        event_type: &str,
        callback: F,
        run: bool,
    ) -> HwResult<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let ty = self.resolve(event_type)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(callback);

        let _delivery = self.delivery.get(ty).map(|m| m.lock());
        self.subs
            .lock()
            .entry(ty)
            .or_default()
            .push((id, Arc::clone(&callback)));

        if run {
            let cached = self.cache.lock().get(ty).cloned();
            if let Some(event) = cached {
                self.invoke(&callback, &event);
            }
        }
        Ok(id)
    }

    /// Remove a callback. Returns `false` if the handle was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.lock();
        for callbacks in subs.values_mut() {
            if let Some(pos) = callbacks.iter().position(|(sub, _)| *sub == id) {
                callbacks.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove every callback registered for `event_type`.
    pub fn reset(&self, event_type: &str) -> HwResult<()> {
        let ty = self.resolve(event_type)?;
        self.subs.lock().remove(ty);
        Ok(())
    }

    /// Remove every callback and forget cached events.
    pub fn clear(&self) {
        self.subs.lock().clear();
        self.cache.lock().clear();
    }

    /// Number of callbacks registered for `event_type`.
    pub fn len(&self, event_type: &str) -> usize {
        self.subs.lock().get(event_type).map_or(0, Vec::len)
    }

    /// Most recent event delivered for `event_type`.
    pub fn last_event(&self, event_type: &str) -> Option<Event> {
        self.cache.lock().get(event_type).cloned()
    }

    /// Deliver an event to every callback currently registered for its type.
    pub fn run(&self, event: Event) -> HwResult<()> {
        let ty = self.resolve(event.event_type)?;
        let _delivery = self.delivery.get(ty).map(|m| m.lock());

        self.cache.lock().insert(ty, event.clone());
        let snapshot: Vec<(SubscriptionId, Callback)> = self
            .subs
            .lock()
            .get(ty)
            .map(|cbs| cbs.iter().map(|(id, cb)| (*id, Arc::clone(cb))).collect())
            .unwrap_or_default();

        for (id, callback) in snapshot {
            if !self.is_registered(ty, id) {
                continue;
            }
            self.invoke(&callback, &event);
        }
        Ok(())
    }

    fn is_registered(&self, ty: &'static str, id: SubscriptionId) -> bool {
        self.subs
            .lock()
            .get(ty)
            .is_some_and(|cbs| cbs.iter().any(|(sub, _)| *sub == id))
    }

    fn invoke(&self, callback: &Callback, event: &Event) {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            tracing::error!(
                event_type = event.event_type,
                object = %self.owner,
                "subscription callback panicked"
            );
        }
    }
}
