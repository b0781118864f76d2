//! Positioners: objects that move to a commanded position.
//!
//! [`SoftPositioner`] simulates motion on the background timer runtime.
//! Without a velocity a move completes instantly; with one, the readback
//! advances every tick and progress is published on the move Status.
//!
//! Event types: `"readback"` on every position update, `"start_moving"`
//! when a move is issued and `"done_moving"` (with `success`) when it ends.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::callbacks::{CallbackRegistry, Event};
use crate::config::RuntimeConfig;
use crate::error::{HwError, HwResult};
use crate::kind::Kind;
use crate::object::{HardwareObject, ParentSlot};
use crate::progress::Progress;
use crate::reading::{DataKey, DataMap, Dtype, Hints, Reading, now};
use crate::status::{Status, StatusOptions};
use crate::timer;

/// Event types emitted by positioners.
pub const POSITIONER_EVENTS: &[&str] = &["readback", "start_moving", "done_moving"];

/// An object that can be moved to a scalar position.
pub trait Positioner: HardwareObject {
    /// Current readback.
    fn position(&self) -> HwResult<f64>;

    /// Start a move; the Status completes when the move settles.
    fn set(&self, target: f64) -> HwResult<Status>;

    /// Soft limits as `(low, high)`.
    fn limits(&self) -> Option<(f64, f64)>;

    /// Engineering units.
    fn egu(&self) -> Option<&str> {
        None
    }

    /// Whether a move is in progress.
    fn moving(&self) -> bool;

    /// Reject targets outside the limits.
    fn check_value(&self, target: f64) -> HwResult<()> {
        if !target.is_finite() {
            return Err(HwError::LimitViolation(format!(
                "{}: {target} is not a valid position",
                self.name()
            )));
        }
        match self.limits() {
            Some((low, high)) if low < high && (target < low || target > high) => {
                Err(HwError::LimitViolation(format!(
                    "{}: {target} outside [{low}, {high}]",
                    self.name()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Builder for [`SoftPositioner`].
#[derive(Debug, Clone)]
pub struct SoftPositionerBuilder {
    name: String,
    kind: Kind,
    initial: f64,
    velocity: Option<f64>,
    limits: Option<(f64, f64)>,
    egu: Option<String>,
    precision: Option<u32>,
    timeout: Option<Duration>,
    settle_time: Duration,
    tick: Duration,
}

impl SoftPositionerBuilder {
    /// Starting position.
    pub fn initial(mut self, position: f64) -> Self {
        self.initial = position;
        self
    }

    /// Travel speed in units per second; instantaneous if unset.
    pub fn velocity(mut self, velocity: f64) -> Self {
        self.velocity = Some(velocity);
        self
    }

    /// Soft limits.
    pub fn limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    /// Engineering units.
    pub fn egu(mut self, egu: impl Into<String>) -> Self {
        self.egu = Some(egu.into());
        self
    }

    /// Display precision.
    pub fn precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Move timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Settle time after each move.
    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Readback update period.
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Classification.
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Take timeout, settle time and tick from a runtime configuration.
    pub fn with_config(mut self, config: &RuntimeConfig) -> Self {
        self.timeout = config.positioner_timeout();
        self.settle_time = config.settle_time();
        self.tick = config.motion_tick();
        self
    }

    /// Create the positioner.
    pub fn build(self) -> Arc<SoftPositioner> {
        Arc::new_cyclic(|me| SoftPositioner {
            registry: CallbackRegistry::new(self.name.clone(), POSITIONER_EVENTS),
            name: self.name,
            kind: AtomicU8::new(self.kind.bits()),
            parent: ParentSlot::default(),
            me: me.clone(),
            position: Mutex::new(self.initial),
            motion: Mutex::new(Motion::default()),
            velocity: self.velocity,
            limits: self.limits,
            egu: self.egu,
            precision: self.precision,
            timeout: self.timeout,
            settle_time: self.settle_time,
            tick: if self.tick.is_zero() {
                Duration::from_millis(20)
            } else {
                self.tick
            },
        })
    }
}

#[derive(Default)]
struct Motion {
    generation: u64,
    target: Option<f64>,
    status: Option<Status>,
}

/// Simulated positioner.
pub struct SoftPositioner {
    name: String,
    kind: AtomicU8,
    parent: ParentSlot,
    registry: CallbackRegistry,
    me: Weak<SoftPositioner>,
    position: Mutex<f64>,
    motion: Mutex<Motion>,
    velocity: Option<f64>,
    limits: Option<(f64, f64)>,
    egu: Option<String>,
    precision: Option<u32>,
    timeout: Option<Duration>,
    settle_time: Duration,
    tick: Duration,
}

impl SoftPositioner {
    /// Start building a positioner called `name`.
    pub fn builder(name: impl Into<String>) -> SoftPositionerBuilder {
        SoftPositionerBuilder {
            name: name.into(),
            kind: Kind::HINTED,
            initial: 0.0,
            velocity: None,
            limits: None,
            egu: None,
            precision: None,
            timeout: None,
            settle_time: Duration::ZERO,
            tick: Duration::from_millis(20),
        }
    }

    /// Last commanded target.
    pub fn target(&self) -> Option<f64> {
        self.motion.lock().target
    }

    fn is_current(&self, generation: u64) -> bool {
        self.motion.lock().generation == generation
    }

    fn update_position(&self, position: f64) {
        let old = std::mem::replace(&mut *self.position.lock(), position);
        let event = Event::new("readback", self.name.clone())
            .with_value(json!(position))
            .with_old_value(Some(json!(old)));
        if let Err(err) = self.registry.run(event) {
            tracing::error!(positioner = %self.name, %err, "readback rejected");
        }
    }

    fn emit(&self, event: Event) {
        if let Err(err) = self.registry.run(event) {
            tracing::error!(positioner = %self.name, %err, "event rejected");
        }
    }

    /// Complete the move of `generation` if it is still the current one.
    fn finish_move(&self, generation: u64, success: bool) {
        let status = {
            let mut motion = self.motion.lock();
            if motion.generation != generation {
                return;
            }
            motion.status.take()
        };
        self.complete(status, success);
    }

    fn complete(&self, status: Option<Status>, success: bool) {
        let Some(status) = status else {
            return;
        };
        self.emit(Event::new("done_moving", self.name.clone()).with_success(success));
        let outcome = if success {
            status.set_finished()
        } else {
            status.set_exception(HwError::Stopped(self.name.clone()))
        };
        if let Err(err) = outcome {
            tracing::debug!(positioner = %self.name, %err, "move already complete");
        }
    }

    /// Abandon the current move without completing its Status.
    fn halt(&self) {
        let mut motion = self.motion.lock();
        motion.generation += 1;
        if motion.status.take().is_some() {
            tracing::warn!(positioner = %self.name, "move halted");
        }
    }

    fn spawn_motion(&self, generation: u64, status: Status, initial: f64, target: f64, velocity: f64) -> bool {
        let me = self.me.clone();
        let tick = self.tick;
        let distance = (target - initial).abs();
        let direction = (target - initial).signum();
        timer::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(tick).await;
                let Some(positioner) = me.upgrade() else {
                    return;
                };
                if !positioner.is_current(generation) {
                    return;
                }
                let elapsed = started.elapsed().as_secs_f64();
                let travelled = (velocity * elapsed).min(distance);
                let position = initial + direction * travelled;
                positioner.update_position(position);
                status.notify_progress(
                    &Progress::for_move(positioner.name.clone(), initial, position, target, elapsed)
                        .with_unit(positioner.egu.clone())
                        .with_precision(positioner.precision),
                );
                if travelled >= distance {
                    positioner.finish_move(generation, true);
                    return;
                }
            }
        })
        .is_some()
    }
}

impl Positioner for SoftPositioner {
    fn position(&self) -> HwResult<f64> {
        Ok(*self.position.lock())
    }

    fn set(&self, target: f64) -> HwResult<Status> {
        self.check_value(target)?;

        let status = Status::new(
            StatusOptions::default()
                .maybe_timeout(self.timeout)
                .settle_time(self.settle_time)
                .label(self.name.clone()),
        );
        let me = self.me.clone();
        status.on_timeout(move || {
            if let Some(positioner) = me.upgrade() {
                positioner.halt();
            }
        });

        let initial = *self.position.lock();
        let (generation, superseded) = {
            let mut motion = self.motion.lock();
            motion.generation += 1;
            motion.target = Some(target);
            (motion.generation, motion.status.replace(status.clone()))
        };
        self.complete(superseded, false);

        tracing::debug!(positioner = %self.name, initial, target, "move");
        self.emit(
            Event::new("start_moving", self.name.clone())
                .with_value(json!(target))
                .with_old_value(Some(json!(initial))),
        );

        let velocity = self.velocity.filter(|v| *v > 0.0 && v.is_finite());
        let started = match velocity {
            Some(v) if target != initial => {
                self.spawn_motion(generation, status.clone(), initial, target, v)
            }
            _ => false,
        };
        if !started {
            self.update_position(target);
            self.finish_move(generation, true);
        }
        Ok(status)
    }

    fn limits(&self) -> Option<(f64, f64)> {
        self.limits
    }

    fn egu(&self) -> Option<&str> {
        self.egu.as_deref()
    }

    fn moving(&self) -> bool {
        self.motion.lock().status.is_some()
    }
}

#[async_trait]
impl HardwareObject for SoftPositioner {
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

    async fn connect(&self, _timeout: Duration) -> HwResult<()> {
        Ok(())
    }

    fn connected(&self) -> bool {
        true
    }

    fn read(&self) -> HwResult<DataMap<Reading>> {
        let mut map = DataMap::new();
        map.insert(self.name.clone(), Reading::new(json!(*self.position.lock()), now()));
        Ok(map)
    }

    fn describe(&self) -> HwResult<DataMap<DataKey>> {
        let mut map = DataMap::new();
        map.insert(
            self.name.clone(),
            DataKey {
                dtype: Dtype::Number,
                shape: Vec::new(),
                source: format!("SIM:{}", self.name),
                units: self.egu.clone(),
                precision: self.precision,
                lower_ctrl_limit: self.limits.map(|(low, _)| low),
                upper_ctrl_limit: self.limits.map(|(_, high)| high),
            },
        );
        Ok(map)
    }

    fn read_configuration(&self) -> HwResult<DataMap<Reading>> {
        Ok(DataMap::new())
    }

    fn describe_configuration(&self) -> HwResult<DataMap<DataKey>> {
        Ok(DataMap::new())
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
        Ok(json!(*self.position.lock()))
    }

    fn stop(&self, success: bool) -> HwResult<()> {
        let status = {
            let mut motion = self.motion.lock();
            motion.generation += 1;
            motion.status.take()
        };
        if status.is_some() {
            tracing::debug!(positioner = %self.name, success, "stop");
        }
        self.complete(status, success);
        Ok(())
    }

    fn close(&self) {
        self.halt();
        self.registry.clear();
    }
}
