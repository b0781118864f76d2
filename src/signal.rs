//! Named readable/writable values backed by a control-system channel.
//!
//! `set()` never blocks: it issues the write and returns a [`Status`] that
//! completes when the backend acknowledges it. I/O failures complete that
//! Status as failed; access and limit violations are returned as `Err`
//! before any write is issued.
//!
//! Event types: `"value"` on every value change (with `old_value`), and
//! `"meta"` with the channel metadata after each successful `connect()`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{ChannelBackend, ChannelMetadata, MonitorHandle, SoftChannel};
use crate::callbacks::{CallbackRegistry, Event, SubscriptionId};
use crate::config::RuntimeConfig;
use crate::error::{HwError, HwResult};
use crate::kind::Kind;
use crate::object::{HardwareObject, ParentSlot};
use crate::reading::{DataKey, DataMap, Dtype, Hints, Reading};
use crate::status::{Status, StatusOptions};

/// Event types emitted by a [`Signal`].
pub const SIGNAL_EVENTS: &[&str] = &["value", "meta"];

/// Write permission of a signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Readable and writable.
    #[default]
    ReadWrite,
    /// Writes fail with [`HwError::Access`].
    ReadOnly,
}

/// A single named value exposed by hardware.
pub struct Signal {
    name: String,
    kind: AtomicU8,
    backend: Arc<dyn ChannelBackend>,
    access: Access,
    internal: bool,
    limits: Option<(f64, f64)>,
    write_timeout: Option<Duration>,
    settle_time: Duration,
    registry: Arc<CallbackRegistry>,
    parent: ParentSlot,
    monitor: Mutex<Option<MonitorHandle>>,
    last_value: Arc<Mutex<Option<Value>>>,
}

impl Signal {
    /// Create a signal on top of a protocol binding.
    pub fn new(name: impl Into<String>, backend: Arc<dyn ChannelBackend>) -> Self {
        let name = name.into();
        Self {
            registry: Arc::new(CallbackRegistry::new(name.clone(), SIGNAL_EVENTS)),
            name,
            kind: AtomicU8::new(Kind::NORMAL.bits()),
            backend,
            access: Access::ReadWrite,
            internal: false,
            limits: None,
            write_timeout: None,
            settle_time: Duration::ZERO,
            parent: ParentSlot::default(),
            monitor: Mutex::new(None),
            last_value: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a signal backed by an in-memory [`SoftChannel`].
    pub fn soft(name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        let channel = SoftChannel::new(format!("SIM:{name}"), value);
        Self::new(name, Arc::new(channel))
    }

    /// Set the initial classification.
    pub fn with_kind(self, kind: Kind) -> Self {
        self.kind.store(kind.bits(), Ordering::Relaxed);
        self
    }

    /// Reject every write.
    pub fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }

    /// Only the owning device may write, through [`Signal::set_internal`].
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Reject numeric writes outside `[low, high]`.
    pub fn limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    /// Fail a write Status that is not acknowledged within `timeout`.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Delay the success of every write Status.
    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Take write timeout and settle time from a runtime configuration.
    pub fn with_config(mut self, config: &RuntimeConfig) -> Self {
        self.write_timeout = config.write_timeout();
        self.settle_time = config.settle_time();
        self
    }

    /// Write permission.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Whether outside writes are rejected.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Effective limits: explicit ones, else the channel's control limits.
    pub fn limit_range(&self) -> Option<(f64, f64)> {
        self.limits.or_else(|| self.backend.metadata().ctrl_limits())
    }

    /// Channel metadata.
    pub fn metadata(&self) -> ChannelMetadata {
        self.backend.metadata()
    }

    /// Address of the underlying channel.
    pub fn source(&self) -> &str {
        self.backend.source()
    }

    /// Current value.
    pub fn get(&self) -> HwResult<Value> {
        self.backend.get_value().map(|(value, _)| value)
    }

    /// Write a value. Fails with [`HwError::Access`] on read-only or
    /// internal signals.
    pub fn set(&self, value: Value) -> HwResult<Status> {
        if self.internal {
            return Err(HwError::Access(format!(
                "{} is internal to its device and cannot be set from outside",
                self.name
            )));
        }
        self.write(value)
    }

    /// Write an internal signal on behalf of its owner.
    pub fn set_internal(&self, value: Value) -> HwResult<Status> {
        self.write(value)
    }

    /// Subscribe to value changes.
    pub fn subscribe_value<F>(&self, callback: F) -> HwResult<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.ensure_monitor()?;
        self.registry.subscribe("value", callback)
    }

    fn check_value(&self, value: &Value) -> HwResult<()> {
        if self.access == Access::ReadOnly || !self.backend.metadata().write_access {
            return Err(HwError::Access(format!("{} is read-only", self.name)));
        }
        if let (Some(x), Some((low, high))) = (value.as_f64(), self.limit_range()) {
            if x < low || x > high {
                return Err(HwError::LimitViolation(format!(
                    "{}: {x} outside [{low}, {high}]",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn write(&self, value: Value) -> HwResult<Status> {
        self.check_value(&value)?;

        let status = Status::new(
            StatusOptions::default()
                .maybe_timeout(self.write_timeout)
                .settle_time(self.settle_time)
                .label(self.name.clone()),
        );
        if let Err(err) = self.ensure_monitor() {
            tracing::warn!(signal = %self.name, %err, "value monitor unavailable");
        }

        tracing::debug!(signal = %self.name, %value, "put");
        let acked = status.clone();
        let name = self.name.clone();
        let issued = self.backend.put_value(
            value,
            Box::new(move |result| {
                let outcome = match result {
                    Ok(()) => acked.set_finished(),
                    Err(err) => acked.set_exception(err),
                };
                if let Err(err) = outcome {
                    tracing::debug!(signal = %name, %err, "ack after completion ignored");
                }
            }),
        );
        if let Err(err) = issued {
            status.set_exception(err)?;
        }
        Ok(status)
    }

    fn ensure_monitor(&self) -> HwResult<()> {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Ok(());
        }
        if let Ok((value, _)) = self.backend.get_value() {
            *self.last_value.lock() = Some(value);
        }

        let registry = Arc::clone(&self.registry);
        let last_value = Arc::clone(&self.last_value);
        let name = self.name.clone();
        let handle = self
            .backend
            .subscribe_value_changes(Arc::new(move |value: &Value, timestamp: f64| {
                let old_value = last_value.lock().replace(value.clone());
                let event = Event::new("value", name.clone())
                    .with_value(value.clone())
                    .with_old_value(old_value)
                    .with_timestamp(timestamp);
                if let Err(err) = registry.run(event) {
                    tracing::error!(signal = %name, %err, "value event rejected");
                }
            }))?;
        *monitor = Some(handle);
        Ok(())
    }

    fn data_key(&self, value: &Value) -> DataKey {
        let meta = self.backend.metadata();
        DataKey {
            dtype: Dtype::of(value),
            shape: Dtype::shape_of(value),
            source: self.backend.source().to_string(),
            units: meta.units,
            precision: meta.precision,
            lower_ctrl_limit: meta.lower_ctrl_limit,
            upper_ctrl_limit: meta.upper_ctrl_limit,
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("kind", &HardwareObject::kind(self))
            .field("source", &self.backend.source())
            .field("access", &self.access)
            .finish()
    }
}

#[async_trait]
impl HardwareObject for Signal {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::from_bits_truncate(self.kind.load(Ordering::Relaxed))
    }

    fn set_kind(&self, kind: Kind) {
        self.kind.store(kind.bits(), Ordering::Relaxed);
    }

    fn parent_slot(&self) -> &ParentSlot {
        &self.parent
    }

    fn callbacks(&self) -> &CallbackRegistry {
        &self.registry
    }

    async fn connect(&self, timeout: Duration) -> HwResult<()> {
        self.backend.connect(timeout).await?;
        self.ensure_monitor()?;
        let meta = serde_json::to_value(self.backend.metadata())
            .map_err(|e| HwError::Backend(e.to_string()))?;
        self.registry.run(Event::new("meta", self.name.clone()).with_value(meta))
    }

    fn connected(&self) -> bool {
        self.backend.is_connected()
    }

    fn read(&self) -> HwResult<DataMap<Reading>> {
        let (value, timestamp) = self.backend.get_value()?;
        let mut map = DataMap::new();
        map.insert(self.name.clone(), Reading::new(value, timestamp));
        Ok(map)
    }

    fn describe(&self) -> HwResult<DataMap<DataKey>> {
        let value = Signal::get(self)?;
        let mut map = DataMap::new();
        map.insert(self.name.clone(), self.data_key(&value));
        Ok(map)
    }

    fn read_configuration(&self) -> HwResult<DataMap<Reading>> {
        self.read()
    }

    fn describe_configuration(&self) -> HwResult<DataMap<DataKey>> {
        self.describe()
    }

    fn hints(&self) -> Hints {
        let fields = if HardwareObject::kind(self).is_hinted() {
            vec![self.name.clone()]
        } else {
            Vec::new()
        };
        Hints { fields }
    }

    fn get(&self) -> HwResult<Value> {
        Signal::get(self)
    }

    fn subscribe(
        &self,
        event_type: &str,
        callback: Arc<dyn Fn(&Event) + Send + Sync>,
    ) -> HwResult<SubscriptionId> {
        if event_type == "value" {
            self.ensure_monitor()?;
        }
        self.registry
            .subscribe(event_type, move |event: &Event| callback(event))
    }

    fn close(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            self.backend.unsubscribe(handle);
        }
        self.registry.clear();
    }

    fn as_signal(&self) -> Option<&Signal> {
        Some(self)
    }
}
