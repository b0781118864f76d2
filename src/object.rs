//! Orchestration-facing contract shared by signals, devices and positioners.
//!
//! ## Method table
//!
//! | Method | Kind | Required | Returns |
//! |--------|------|----------|---------|
//! | `name()` / `kind()` / `set_kind()` | sync | yes | identity and classification |
//! | `parent()` | sync | provided | `Option<Arc<dyn HardwareObject>>` |
//! | `connect()` | async | yes | `HwResult<()>` |
//! | `connected()` | sync | yes | `bool` |
//! | `read()` / `describe()` | sync | yes | same keys, same order |
//! | `read_configuration()` / `describe_configuration()` | sync | yes | same keys, same order |
//! | `hints()` | sync | yes | [`Hints`] |
//! | `get()` | sync | yes | JSON value of the object |
//! | `trigger()` | sync | provided | already finished [`Status`] |
//! | `stage()` / `unstage()` | sync | provided | no-op |
//! | `stop()` | sync | provided | no-op |
//! | `subscribe()` / `unsubscribe()` | sync | provided | via `callbacks()` |
//! | `close()` | sync | yes | `()` |
//!
//! I/O failures of `trigger()` surface through the returned Status;
//! structural errors are returned as `Err` immediately.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::callbacks::{CallbackRegistry, Event, SubscriptionId};
use crate::device::Device;
use crate::error::{HwError, HwResult};
use crate::kind::Kind;
use crate::reading::{DataKey, DataMap, Hints, Reading};
use crate::signal::Signal;
use crate::status::Status;

/// Weak back-reference from a child to the object that owns it.
#[derive(Default)]
pub struct ParentSlot {
    parent: Mutex<Option<Weak<dyn HardwareObject>>>,
}

impl ParentSlot {
    /// The parent, if one is attached and still alive.
    pub fn get(&self) -> Option<Arc<dyn HardwareObject>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn attach(&self, child: &str, parent: Weak<dyn HardwareObject>) -> HwResult<()> {
        let mut slot = self.parent.lock();
        if slot.as_ref().is_some_and(|p| p.strong_count() > 0) {
            return Err(HwError::Configuration(format!(
                "{child} already belongs to another device"
            )));
        }
        *slot = Some(parent);
        Ok(())
    }
}

impl std::fmt::Debug for ParentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.get().map(|p| p.name().to_string());
        f.debug_tuple("ParentSlot").field(&name).finish()
    }
}

/// Uniform lifecycle contract exposed to the orchestration engine.
#[async_trait]
pub trait HardwareObject: Send + Sync {
    /// Full name; data keys are derived from it.
    fn name(&self) -> &str;

    /// Current classification.
    fn kind(&self) -> Kind;

    /// Reclassify the object.
    fn set_kind(&self, kind: Kind);

    /// Back-reference slot, set when the object is placed in a device.
    fn parent_slot(&self) -> &ParentSlot;

    /// The owning device, if any.
    fn parent(&self) -> Option<Arc<dyn HardwareObject>> {
        self.parent_slot().get()
    }

    /// Event registry of this object.
    fn callbacks(&self) -> &CallbackRegistry;

    /// Whether the object aggregates children.
    fn is_composite(&self) -> bool {
        false
    }

    /// Wait until the object (and every child) is connected.
    async fn connect(&self, timeout: Duration) -> HwResult<()>;

    /// Whether the object (and every child) is connected.
    fn connected(&self) -> bool;

    /// Current readings.
    fn read(&self) -> HwResult<DataMap<Reading>>;

    /// Metadata for `read()`.
    fn describe(&self) -> HwResult<DataMap<DataKey>>;

    /// Configuration readings.
    fn read_configuration(&self) -> HwResult<DataMap<Reading>>;

    /// Metadata for `read_configuration()`.
    fn describe_configuration(&self) -> HwResult<DataMap<DataKey>>;

    /// Fields to show by default.
    fn hints(&self) -> Hints;

    /// Current value as JSON.
    fn get(&self) -> HwResult<Value>;

    /// Start an acquisition.
    fn trigger(&self) -> HwResult<Status> {
        Ok(Status::finished())
    }

    /// Apply temporary settings before a scan.
    fn stage(&self) -> HwResult<()> {
        Ok(())
    }

    /// Revert what `stage()` applied.
    fn unstage(&self) -> HwResult<()> {
        Ok(())
    }

    /// Ask the hardware to halt any action in progress.
    fn stop(&self, _success: bool) -> HwResult<()> {
        Ok(())
    }

    /// Subscribe to one of the object's event types.
    fn subscribe(
        &self,
        event_type: &str,
        callback: Arc<dyn Fn(&Event) + Send + Sync>,
    ) -> HwResult<SubscriptionId> {
        self.callbacks()
            .subscribe(event_type, move |event: &Event| callback(event))
    }

    /// Remove a subscription made through `subscribe()`.
    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks().unsubscribe(id)
    }

    /// Release backend resources and drop every subscription.
    fn close(&self);

    /// Downcast to a signal.
    fn as_signal(&self) -> Option<&Signal> {
        None
    }

    /// Downcast to a device.
    fn as_device(&self) -> Option<&Device> {
        None
    }
}

/// Closes the wrapped object when dropped.
///
/// ```ignore
/// let det = DeviceGuard::new(build_detector()?);
/// det.stage()?;
/// // subscriptions are released here, even on early return
/// ```
pub struct DeviceGuard<T: HardwareObject + ?Sized> {
    object: Arc<T>,
}

impl<T: HardwareObject + ?Sized> DeviceGuard<T> {
    /// Take responsibility for closing `object`.
    pub fn new(object: Arc<T>) -> Self {
        Self { object }
    }

    /// Shared handle to the guarded object.
    pub fn handle(&self) -> Arc<T> {
        Arc::clone(&self.object)
    }
}

impl<T: HardwareObject + ?Sized> std::ops::Deref for DeviceGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: HardwareObject + ?Sized> Drop for DeviceGuard<T> {
    fn drop(&mut self) {
        tracing::debug!(object = self.object.name(), "closing");
        self.object.close();
    }
}
