//! Protocol-binding boundary.
//!
//! A [`ChannelBackend`] is one process variable (or equivalent) on the
//! control system. [`Signal`](crate::Signal) is the only consumer:
//!
//! ```text
//!   connect(timeout) ──→ get_value() / put_value(ack) ──→ subscribe_value_changes()
//!      (async)                 (sync)                          (sync)
//! ```
//!
//! ## Method table
//!
//! | Method | Kind | Returns |
//! |--------|------|---------|
//! | `source()` | sync | `&str` |
//! | `connect()` | async | `HwResult<()>`, `ConnectionTimeout` on deadline |
//! | `is_connected()` | sync | `bool` |
//! | `metadata()` | sync | [`ChannelMetadata`] |
//! | `get_value()` | sync | `HwResult<(Value, timestamp)>` |
//! | `put_value()` | sync | `HwResult<()>`; completion reported through the ack |
//! | `subscribe_value_changes()` | sync | `HwResult<MonitorHandle>` |
//! | `unsubscribe()` | sync | `()` |
//! | `disconnect()` | sync | `()`; drops every monitor |
//!
//! A backend may invoke the ack and the monitors from any thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HwError, HwResult};
use crate::reading::now;
use crate::timer;

/// Called once when a write is acknowledged (or rejected) by the hardware.
pub type AckCallback = Box<dyn FnOnce(HwResult<()>) + Send>;

/// Called on every value change with the new value and its timestamp.
pub type MonitorCallback = Arc<dyn Fn(&Value, f64) + Send + Sync>;

/// Handle returned by `subscribe_value_changes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorHandle(pub u64);

/// Control-system metadata attached to a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// Engineering units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Display precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Lower control limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_ctrl_limit: Option<f64>,
    /// Upper control limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_ctrl_limit: Option<f64>,
    /// Whether the channel accepts writes.
    pub write_access: bool,
}

impl ChannelMetadata {
    /// Control limits as a `(low, high)` pair, if both are set and distinct.
    pub fn ctrl_limits(&self) -> Option<(f64, f64)> {
        match (self.lower_ctrl_limit, self.upper_ctrl_limit) {
            (Some(low), Some(high)) if low != high => Some((low, high)),
            _ => None,
        }
    }
}

/// Trait for protocol bindings.
///
/// # Contract
///
/// - `put_value()` MUST return `Err` only for writes it refuses outright;
///   a write that was issued reports its outcome exactly once through the
///   ack callback.
/// - Monitors MUST be invoked in the order the values were produced.
/// - `get_value()` MUST NOT block on the network for longer than the
///   binding's own read timeout; it fails with `ReadTimeout` instead.
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    /// Address of the channel, reported as `source` in `describe()`.
    fn source(&self) -> &str;

    /// Wait until the channel is ready.
    async fn connect(&self, timeout: Duration) -> HwResult<()>;

    /// Whether the channel is currently connected.
    fn is_connected(&self) -> bool;

    /// Metadata reported by the control system.
    fn metadata(&self) -> ChannelMetadata;

    /// Current value and its timestamp.
    fn get_value(&self) -> HwResult<(Value, f64)>;

    /// Issue a write; `on_ack` fires once the hardware confirms it.
    fn put_value(&self, value: Value, on_ack: AckCallback) -> HwResult<()>;

    /// Register a value-change monitor.
    fn subscribe_value_changes(&self, callback: MonitorCallback) -> HwResult<MonitorHandle>;

    /// Remove a monitor. Unknown handles are ignored.
    fn unsubscribe(&self, handle: MonitorHandle);

    /// Release the channel and drop every monitor.
    fn disconnect(&self);
}

struct SoftState {
    value: Value,
    timestamp: f64,
    metadata: ChannelMetadata,
    monitors: Vec<(MonitorHandle, MonitorCallback)>,
    put_latency: Duration,
    put_failure: Option<String>,
    connect_delay: Duration,
}

/// In-memory channel used for simulation and tests.
///
/// Writes update the value and notify monitors immediately; the ack is
/// delayed by the configured put latency so that callers observe a
/// pending Status in between.
pub struct SoftChannel {
    source: String,
    state: Mutex<SoftState>,
    connected: AtomicBool,
    next_handle: AtomicU64,
}

impl SoftChannel {
    /// Create a writable channel holding `value`.
    pub fn new(source: impl Into<String>, value: Value) -> Self {
        Self {
            source: source.into(),
            state: Mutex::new(SoftState {
                value,
                timestamp: now(),
                metadata: ChannelMetadata {
                    write_access: true,
                    ..ChannelMetadata::default()
                },
                monitors: Vec::new(),
                put_latency: Duration::ZERO,
                put_failure: None,
                connect_delay: Duration::ZERO,
            }),
            connected: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Delay acknowledgement of every write.
    pub fn with_put_latency(self, latency: Duration) -> Self {
        self.state.lock().put_latency = latency;
        self
    }

    /// Start disconnected; `connect()` succeeds after `delay`.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state.lock().connect_delay = delay;
        self.connected.store(false, Ordering::Release);
        self
    }

    /// Replace the channel metadata.
    pub fn with_metadata(self, metadata: ChannelMetadata) -> Self {
        self.state.lock().metadata = metadata;
        self
    }

    /// Make every following write fail with a backend error (`None` restores).
    pub fn fail_puts(&self, reason: Option<String>) {
        self.state.lock().put_failure = reason;
    }

    /// Simulate a value change originating on the hardware side.
    pub fn inject(&self, value: Value) {
        self.store(value);
    }

    fn store(&self, value: Value) {
        let timestamp = now();
        let monitors: Vec<MonitorCallback> = {
            let mut state = self.state.lock();
            state.value = value.clone();
            state.timestamp = timestamp;
            state.monitors.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for monitor in monitors {
            monitor(&value, timestamp);
        }
    }
}

#[async_trait]
impl ChannelBackend for SoftChannel {
    fn source(&self) -> &str {
        &self.source
    }

    async fn connect(&self, timeout: Duration) -> HwResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let delay = self.state.lock().connect_delay;
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(HwError::ConnectionTimeout(format!(
                "{} not connected after {:.3}s",
                self.source,
                timeout.as_secs_f64()
            )));
        }
        tokio::time::sleep(delay).await;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn metadata(&self) -> ChannelMetadata {
        self.state.lock().metadata.clone()
    }

    fn get_value(&self) -> HwResult<(Value, f64)> {
        if !self.is_connected() {
            return Err(HwError::ReadTimeout(format!("{} is not connected", self.source)));
        }
        let state = self.state.lock();
        Ok((state.value.clone(), state.timestamp))
    }

    fn put_value(&self, value: Value, on_ack: AckCallback) -> HwResult<()> {
        if !self.is_connected() {
            return Err(HwError::Backend(format!("{} is not connected", self.source)));
        }
        let (latency, failure) = {
            let state = self.state.lock();
            (state.put_latency, state.put_failure.clone())
        };
        if let Some(reason) = failure {
            on_ack(Err(HwError::Backend(format!("{}: {reason}", self.source))));
            return Ok(());
        }

        self.store(value);
        if latency.is_zero() {
            on_ack(Ok(()));
        } else {
            timer::schedule(latency, move || on_ack(Ok(())));
        }
        Ok(())
    }

    fn subscribe_value_changes(&self, callback: MonitorCallback) -> HwResult<MonitorHandle> {
        let handle = MonitorHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.state.lock().monitors.push((handle, callback));
        Ok(handle)
    }

    fn unsubscribe(&self, handle: MonitorHandle) {
        self.state.lock().monitors.retain(|(h, _)| *h != handle);
    }

    fn disconnect(&self) {
        self.state.lock().monitors.clear();
        self.connected.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    #[test]
    fn test_put_notifies_monitors_then_acks() {
        let channel = SoftChannel::new("SIM:gain", json!(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel
            .subscribe_value_changes(Arc::new(move |v, _| sink.lock().push(v.clone())))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        channel
            .put_value(json!(4), Box::new(move |res| tx.send(res).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Ok(()));
        assert_eq!(*seen.lock(), vec![json!(4)]);
        assert_eq!(channel.get_value().unwrap().0, json!(4));
    }

    #[test]
    fn test_failed_put_keeps_value() {
        let channel = SoftChannel::new("SIM:gain", json!(1));
        channel.fail_puts(Some("interlock".into()));
        let (tx, rx) = mpsc::channel();
        channel
            .put_value(json!(4), Box::new(move |res| tx.send(res).unwrap()))
            .unwrap();
        assert!(matches!(rx.recv().unwrap(), Err(HwError::Backend(_))));
        assert_eq!(channel.get_value().unwrap().0, json!(1));
    }

    #[test]
    fn test_unsubscribed_monitor_is_silent() {
        let channel = SoftChannel::new("SIM:gain", json!(1));
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let handle = channel
            .subscribe_value_changes(Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        channel.unsubscribe(handle);
        channel.inject(json!(2));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ctrl_limits() {
        let meta = ChannelMetadata {
            lower_ctrl_limit: Some(-1.0),
            upper_ctrl_limit: Some(1.0),
            ..ChannelMetadata::default()
        };
        assert_eq!(meta.ctrl_limits(), Some((-1.0, 1.0)));
        assert_eq!(ChannelMetadata::default().ctrl_limits(), None);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let channel =
            SoftChannel::new("SIM:slow", json!(0)).with_connect_delay(Duration::from_secs(5));
        let err = channel.connect(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, HwError::ConnectionTimeout(_)));
        assert!(!channel.is_connected());

        let fast =
            SoftChannel::new("SIM:fast", json!(0)).with_connect_delay(Duration::from_millis(5));
        fast.connect(Duration::from_secs(1)).await.unwrap();
        assert!(fast.is_connected());
    }
}
