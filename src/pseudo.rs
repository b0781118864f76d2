//! Compound positioners moving in a transformed coordinate space.
//!
//! A [`PseudoPositioner`] owns a set of real positioners and a
//! [`PositionerTransform`] relating pseudo and real coordinates:
//!
//! ```text
//!   set(partial pseudo) ──merge with target──→ forward() ──→ real set() × N ──→ Status::all
//!   position()          ←──────inverse()────── real positions
//! ```
//!
//! Axes left out of a move keep their last commanded *target*, not their
//! current readback, so consecutive partial moves compose. Transforms are
//! called synchronously and must be pure: no I/O, no blocking.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::callbacks::{CallbackRegistry, Event, SubscriptionId};
use crate::error::{HwError, HwResult};
use crate::kind::Kind;
use crate::object::{HardwareObject, ParentSlot};
use crate::positioner::{POSITIONER_EVENTS, Positioner};
use crate::reading::{DataKey, DataMap, Dtype, Hints, Reading, now};
use crate::status::{Status, StatusOptions};

/// A point in a named coordinate space, in axis order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    axes: Vec<(String, f64)>,
}

impl Position {
    /// Empty position.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, axis: impl Into<String>, value: f64) -> Self {
        self.insert(axis, value);
        self
    }

    /// Set one axis, keeping its place if already present.
    pub fn insert(&mut self, axis: impl Into<String>, value: f64) {
        let axis = axis.into();
        match self.axes.iter_mut().find(|(a, _)| *a == axis) {
            Some((_, slot)) => *slot = value,
            None => self.axes.push((axis, value)),
        }
    }

    /// Value of one axis.
    pub fn get(&self, axis: &str) -> Option<f64> {
        self.axes.iter().find(|(a, _)| a == axis).map(|(_, v)| *v)
    }

    /// Value of one axis, or a [`HwError::Transform`] naming the missing axis.
    pub fn require(&self, axis: &str) -> HwResult<f64> {
        self.get(axis)
            .ok_or_else(|| HwError::Transform(format!("missing axis {axis} in {self}")))
    }

    /// Axis names in order.
    pub fn axes(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|(a, _)| a.as_str())
    }

    /// `(axis, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.axes.iter().map(|(a, v)| (a.as_str(), *v))
    }

    /// Number of axes.
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    /// Whether no axis is set.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// `self` with every axis of `overrides` replaced.
    pub fn merged(&self, overrides: &Position) -> Position {
        let mut merged = self.clone();
        for (axis, value) in overrides.iter() {
            merged.insert(axis, value);
        }
        merged
    }

    /// Same axes, each value within `tolerance`.
    pub fn approx_eq(&self, other: &Position, tolerance: f64) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(axis, v)| other.get(axis).is_some_and(|o| (o - v).abs() <= tolerance))
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Position {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut position = Position::new();
        for (axis, value) in iter {
            position.insert(axis, value);
        }
        position
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(a, v)| format!("{a}={v}")).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Pure mapping between pseudo and real coordinates.
///
/// `inverse(forward(p))` must reproduce `p` within floating-point
/// tolerance for every valid `p`.
pub trait PositionerTransform: Send + Sync {
    /// Pseudo coordinates to real coordinates.
    fn forward(&self, pseudo: &Position) -> HwResult<Position>;

    /// Real coordinates to pseudo coordinates.
    fn inverse(&self, real: &Position) -> HwResult<Position>;
}

/// How real axes are commanded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    /// Every real axis starts at once.
    #[default]
    Concurrent,
    /// Real axes move one after another in declaration order; the first
    /// failure aborts the rest.
    Sequential,
}

/// One pseudo axis and its optional limits.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoAxis {
    name: String,
    limits: Option<(f64, f64)>,
}

impl PseudoAxis {
    /// Axis without limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: None,
        }
    }

    /// Reject targets outside `[low, high]`.
    pub fn limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    /// Axis name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder for [`PseudoPositioner`].
pub struct PseudoPositionerBuilder {
    name: String,
    kind: Kind,
    transform: Box<dyn PositionerTransform>,
    pseudo: Vec<PseudoAxis>,
    reals: Vec<(String, Arc<dyn Positioner>)>,
    mode: MoveMode,
}

impl PseudoPositionerBuilder {
    /// Add a pseudo axis.
    pub fn pseudo_axis(mut self, axis: PseudoAxis) -> Self {
        self.pseudo.push(axis);
        self
    }

    /// Add a real axis under the name used by the transform.
    pub fn real_axis(mut self, axis: impl Into<String>, positioner: Arc<dyn Positioner>) -> Self {
        self.reals.push((axis.into(), positioner));
        self
    }

    /// Concurrent or sequential real moves.
    pub fn mode(mut self, mode: MoveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Classification.
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Assemble the positioner and take ownership of the real axes.
    pub fn build(self) -> HwResult<Arc<PseudoPositioner>> {
        if self.pseudo.is_empty() || self.reals.is_empty() {
            return Err(HwError::Configuration(format!(
                "{}: needs at least one pseudo and one real axis",
                self.name
            )));
        }
        let mut seen = FxHashSet::default();
        let names = self
            .pseudo
            .iter()
            .map(|a| a.name.as_str())
            .chain(self.reals.iter().map(|(a, _)| a.as_str()));
        for axis in names {
            if !seen.insert(axis.to_string()) {
                return Err(HwError::Configuration(format!(
                    "{}: duplicate axis {axis}",
                    self.name
                )));
            }
        }

        let pseudo = Arc::new_cyclic(|me| PseudoPositioner {
            registry: CallbackRegistry::new(self.name.clone(), POSITIONER_EVENTS),
            name: self.name,
            kind: AtomicU8::new(self.kind.bits()),
            parent: ParentSlot::default(),
            me: me.clone(),
            transform: self.transform,
            pseudo: self.pseudo,
            reals: self.reals,
            mode: self.mode,
            target: Mutex::new(None),
            relays: Mutex::new(Vec::new()),
        });

        let weak: Weak<PseudoPositioner> = Arc::downgrade(&pseudo);
        let parent: Weak<dyn HardwareObject> = weak;
        for (_, real) in &pseudo.reals {
            real.parent_slot().attach(real.name(), parent.clone())?;
        }
        pseudo.relay_readbacks()?;
        Ok(pseudo)
    }
}

/// Positioner moving several real axes through a coordinate transform.
pub struct PseudoPositioner {
    name: String,
    kind: AtomicU8,
    parent: ParentSlot,
    registry: CallbackRegistry,
    me: Weak<PseudoPositioner>,
    transform: Box<dyn PositionerTransform>,
    pseudo: Vec<PseudoAxis>,
    reals: Vec<(String, Arc<dyn Positioner>)>,
    mode: MoveMode,
    target: Mutex<Option<Position>>,
    relays: Mutex<Vec<(usize, SubscriptionId)>>,
}

impl PseudoPositioner {
    /// Start building a pseudo positioner.
    pub fn builder<T>(name: impl Into<String>, transform: T) -> PseudoPositionerBuilder
    where
        T: PositionerTransform + 'static,
    {
        PseudoPositionerBuilder {
            name: name.into(),
            kind: Kind::HINTED,
            transform: Box::new(transform),
            pseudo: Vec::new(),
            reals: Vec::new(),
            mode: MoveMode::default(),
        }
    }

    /// Pseudo axis names in order.
    pub fn pseudo_axes(&self) -> impl Iterator<Item = &str> {
        self.pseudo.iter().map(|a| a.name.as_str())
    }

    /// Real axis names in order.
    pub fn real_axes(&self) -> impl Iterator<Item = &str> {
        self.reals.iter().map(|(a, _)| a.as_str())
    }

    /// The real positioner behind `axis`.
    pub fn real(&self, axis: &str) -> HwResult<Arc<dyn Positioner>> {
        self.reals
            .iter()
            .find(|(a, _)| a == axis)
            .map(|(_, p)| Arc::clone(p))
            .ok_or_else(|| HwError::UnknownComponent(format!("{}.{axis}", self.name)))
    }

    /// Move mode.
    pub fn mode(&self) -> MoveMode {
        self.mode
    }

    /// Current real readbacks.
    pub fn real_position(&self) -> HwResult<Position> {
        self.reals
            .iter()
            .map(|(axis, p)| Ok((axis.clone(), p.position()?)))
            .collect()
    }

    /// Current pseudo position, computed from the real readbacks.
    pub fn position(&self) -> HwResult<Position> {
        self.transform.inverse(&self.real_position()?)
    }

    /// Last commanded pseudo target.
    pub fn target(&self) -> Option<Position> {
        self.target.lock().clone()
    }

    /// Pseudo to real, through the transform.
    pub fn forward(&self, pseudo: &Position) -> HwResult<Position> {
        self.transform.forward(pseudo)
    }

    /// Real to pseudo, through the transform.
    pub fn inverse(&self, real: &Position) -> HwResult<Position> {
        self.transform.inverse(real)
    }

    /// Check a full pseudo position against pseudo limits and, after the
    /// forward transform, against every real axis.
    pub fn check_value(&self, pseudo: &Position) -> HwResult<Vec<(Arc<dyn Positioner>, f64)>> {
        for axis in &self.pseudo {
            let value = pseudo.require(&axis.name)?;
            if let Some((low, high)) = axis.limits {
                if value < low || value > high {
                    return Err(HwError::LimitViolation(format!(
                        "{}.{}: {value} outside [{low}, {high}]",
                        self.name, axis.name
                    )));
                }
            }
        }

        let real = self.transform.forward(pseudo)?;
        let mut moves = Vec::with_capacity(self.reals.len());
        for (axis, positioner) in &self.reals {
            let value = real.require(axis)?;
            positioner.check_value(value)?;
            moves.push((Arc::clone(positioner), value));
        }
        Ok(moves)
    }

    /// Move to a (possibly partial) pseudo position.
    ///
    /// Axes not given keep their last commanded target, or their current
    /// position if no move was commanded yet.
    pub fn set(&self, partial: &Position) -> HwResult<Status> {
        if let Some(axis) = partial.axes().find(|a| !self.pseudo.iter().any(|p| p.name == *a)) {
            return Err(HwError::UnknownComponent(format!("{}.{axis}", self.name)));
        }
        let base = match self.target() {
            Some(target) => target,
            None => self.position()?,
        };
        let merged = base.merged(partial);
        let moves = self.check_value(&merged)?;

        tracing::debug!(positioner = %self.name, target = %merged, mode = ?self.mode, "pseudo move");
        let previous = self.target.lock().replace(merged.clone());

        let status = match self.mode {
            MoveMode::Concurrent => match self.issue_all(&moves) {
                Ok(statuses) => Status::all(statuses),
                Err(err) => {
                    *self.target.lock() = previous;
                    return Err(err);
                }
            },
            MoveMode::Sequential => {
                let overall = Status::new(
                    StatusOptions::default().label(format!("{} (sequential)", self.name)),
                );
                run_step(Arc::new(moves), 0, overall.clone());
                overall
            }
        };
        self.emit(Event::new("start_moving", self.name.clone()).with_value(position_json(&merged)));

        let me = self.me.clone();
        status.add_callback(move |status| {
            if let Some(pseudo) = me.upgrade() {
                pseudo.emit(
                    Event::new("done_moving", pseudo.name.clone()).with_success(status.success()),
                );
            }
        });
        Ok(status)
    }

    /// Start every real move. If one is rejected, the axes already started
    /// are stopped and the rejection is returned.
    fn issue_all(&self, moves: &[(Arc<dyn Positioner>, f64)]) -> HwResult<Vec<Status>> {
        let mut started: Vec<(&Arc<dyn Positioner>, Status)> = Vec::with_capacity(moves.len());
        for (positioner, value) in moves {
            match positioner.set(*value) {
                Ok(status) => started.push((positioner, status)),
                Err(err) => {
                    tracing::warn!(
                        positioner = %self.name,
                        axis = positioner.name(),
                        %err,
                        "real move rejected, stopping started axes"
                    );
                    for (real, _) in &started {
                        if let Err(stop_err) = real.stop(false) {
                            tracing::error!(positioner = %self.name, axis = real.name(), %stop_err, "stop failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(started.into_iter().map(|(_, status)| status).collect())
    }

    /// Move a single pseudo axis.
    pub fn move_axis(&self, axis: &str, value: f64) -> HwResult<Status> {
        self.set(&Position::new().with(axis, value))
    }

    fn pseudo_key(&self, axis: &str) -> String {
        format!("{}_{axis}", self.name)
    }

    fn emit(&self, event: Event) {
        if let Err(err) = self.registry.run(event) {
            tracing::error!(positioner = %self.name, %err, "event rejected");
        }
    }

    fn relay_readbacks(&self) -> HwResult<()> {
        let mut relays = self.relays.lock();
        for (index, (_, real)) in self.reals.iter().enumerate() {
            let me = self.me.clone();
            let id = real.callbacks().subscribe("readback", move |_| {
                let Some(pseudo) = me.upgrade() else {
                    return;
                };
                match pseudo.position() {
                    Ok(position) => pseudo.emit(
                        Event::new("readback", pseudo.name.clone())
                            .with_value(position_json(&position)),
                    ),
                    Err(err) => {
                        tracing::debug!(positioner = %pseudo.name, %err, "readback not invertible")
                    }
                }
            })?;
            relays.push((index, id));
        }
        Ok(())
    }
}

fn position_json(position: &Position) -> Value {
    let map: Map<String, Value> = position
        .iter()
        .map(|(axis, value)| (axis.to_string(), json!(value)))
        .collect();
    Value::Object(map)
}

fn run_step(moves: Arc<Vec<(Arc<dyn Positioner>, f64)>>, index: usize, overall: Status) {
    let Some((positioner, target)) = moves.get(index) else {
        if let Err(err) = overall.set_finished() {
            tracing::debug!(%err, "sequential move already complete");
        }
        return;
    };
    match positioner.set(*target) {
        Err(err) => {
            if let Err(err) = overall.set_exception(err) {
                tracing::debug!(%err, "sequential move already complete");
            }
        }
        Ok(step) => {
            let remaining = Arc::clone(&moves);
            step.add_callback(move |step| match step.error() {
                Some(err) => {
                    if let Err(err) = overall.set_exception(err) {
                        tracing::debug!(%err, "sequential move already complete");
                    }
                }
                None => run_step(remaining, index + 1, overall),
            });
        }
    }
}

impl fmt::Debug for PseudoPositioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PseudoPositioner")
            .field("name", &self.name)
            .field("pseudo", &self.pseudo_axes().collect::<Vec<_>>())
            .field("real", &self.real_axes().collect::<Vec<_>>())
            .field("mode", &self.mode)
            .finish()
    }
}

#[async_trait]
impl HardwareObject for PseudoPositioner {
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

    fn is_composite(&self) -> bool {
        true
    }

    async fn connect(&self, timeout: Duration) -> HwResult<()> {
        let pending = self.reals.iter().map(|(_, p)| p.connect(timeout));
        match tokio::time::timeout(timeout, try_join_all(pending)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(HwError::ConnectionTimeout(format!(
                "{} not connected within {:.3}s",
                self.name,
                timeout.as_secs_f64()
            ))),
        }
    }

    fn connected(&self) -> bool {
        self.reals.iter().all(|(_, p)| p.connected())
    }

    fn read(&self) -> HwResult<DataMap<Reading>> {
        let timestamp = now();
        let mut out: DataMap<Reading> = self
            .position()?
            .iter()
            .map(|(axis, value)| (self.pseudo_key(axis), Reading::new(json!(value), timestamp)))
            .collect();
        for (_, real) in self.reals.iter().filter(|(_, p)| p.kind().is_read()) {
            out.extend(real.read()?);
        }
        Ok(out)
    }

    fn describe(&self) -> HwResult<DataMap<DataKey>> {
        let mut out: DataMap<DataKey> = self
            .pseudo
            .iter()
            .map(|axis| {
                (
                    self.pseudo_key(&axis.name),
                    DataKey {
                        dtype: Dtype::Number,
                        shape: Vec::new(),
                        source: format!("PY:{}.{}", self.name, axis.name),
                        units: None,
                        precision: None,
                        lower_ctrl_limit: axis.limits.map(|(low, _)| low),
                        upper_ctrl_limit: axis.limits.map(|(_, high)| high),
                    },
                )
            })
            .collect();
        for (_, real) in self.reals.iter().filter(|(_, p)| p.kind().is_read()) {
            out.extend(real.describe()?);
        }
        Ok(out)
    }

    fn read_configuration(&self) -> HwResult<DataMap<Reading>> {
        let mut out = DataMap::new();
        for (_, real) in &self.reals {
            out.extend(real.read_configuration()?);
        }
        Ok(out)
    }

    fn describe_configuration(&self) -> HwResult<DataMap<DataKey>> {
        let mut out = DataMap::new();
        for (_, real) in &self.reals {
            out.extend(real.describe_configuration()?);
        }
        Ok(out)
    }

    fn hints(&self) -> Hints {
        if !HardwareObject::kind(self).is_hinted() {
            return Hints::default();
        }
        Hints {
            fields: self.pseudo.iter().map(|a| self.pseudo_key(&a.name)).collect(),
        }
    }

    fn get(&self) -> HwResult<Value> {
        Ok(position_json(&self.position()?))
    }

    fn stop(&self, success: bool) -> HwResult<()> {
        let mut errors = Vec::new();
        for (_, real) in &self.reals {
            if let Err(err) = real.stop(success) {
                tracing::warn!(positioner = %self.name, axis = real.name(), %err, "stop failed");
                errors.push((real.name().to_string(), err));
            }
        }
        HwError::bundle(format!("stop {}", self.name), errors)
    }

    fn close(&self) {
        for (index, id) in self.relays.lock().drain(..) {
            if let Some((_, real)) = self.reals.get(index) {
                real.callbacks().unsubscribe(id);
            }
        }
        for (_, real) in &self.reals {
            real.close();
        }
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioner::SoftPositioner;
    use proptest::prelude::*;

    /// Center and gap of two blades.
    struct Slit;

    impl PositionerTransform for Slit {
        fn forward(&self, pseudo: &Position) -> HwResult<Position> {
            let center = pseudo.require("center")?;
            let gap = pseudo.require("gap")?;
            Ok(Position::new()
                .with("top", center + gap / 2.0)
                .with("bottom", center - gap / 2.0))
        }

        fn inverse(&self, real: &Position) -> HwResult<Position> {
            let top = real.require("top")?;
            let bottom = real.require("bottom")?;
            Ok(Position::new()
                .with("center", (top + bottom) / 2.0)
                .with("gap", top - bottom))
        }
    }

    /// Photon energy (keV) from a Si(111) crystal angle (degrees).
    struct Bragg;

    const HC_OVER_2D: f64 = 12.398_419_843 / (2.0 * 3.135_6);

    impl PositionerTransform for Bragg {
        fn forward(&self, pseudo: &Position) -> HwResult<Position> {
            let energy = pseudo.require("energy")?;
            let ratio = HC_OVER_2D / energy;
            if !(0.0..=1.0).contains(&ratio) {
                return Err(HwError::Transform(format!("{energy} keV is unreachable")));
            }
            Ok(Position::new().with("theta", ratio.asin().to_degrees()))
        }

        fn inverse(&self, real: &Position) -> HwResult<Position> {
            let theta = real.require("theta")?.to_radians();
            Ok(Position::new().with("energy", HC_OVER_2D / theta.sin()))
        }
    }

    fn slit(mode: MoveMode) -> (Arc<PseudoPositioner>, Arc<SoftPositioner>, Arc<SoftPositioner>) {
        let top = SoftPositioner::builder("slit_top").limits(-10.0, 10.0).build();
        let bottom = SoftPositioner::builder("slit_bottom").limits(-10.0, 10.0).build();
        let pseudo = PseudoPositioner::builder("slit", Slit)
            .pseudo_axis(PseudoAxis::new("center"))
            .pseudo_axis(PseudoAxis::new("gap").limits(0.0, 8.0))
            .real_axis("top", top.clone())
            .real_axis("bottom", bottom.clone())
            .mode(mode)
            .build()
            .unwrap();
        (pseudo, top, bottom)
    }

    proptest! {
        #[test]
        fn test_slit_round_trip(center in -100.0f64..100.0, gap in -10.0f64..10.0) {
            let p = Position::new().with("center", center).with("gap", gap);
            let back = Slit.inverse(&Slit.forward(&p).unwrap()).unwrap();
            prop_assert!(back.approx_eq(&p, 1e-9));
        }

        #[test]
        fn test_bragg_round_trip(energy in 2.5f64..30.0) {
            let p = Position::new().with("energy", energy);
            let back = Bragg.inverse(&Bragg.forward(&p).unwrap()).unwrap();
            prop_assert!(back.approx_eq(&p, 1e-9 * energy));
        }
    }

    #[test]
    fn test_position_merge_keeps_order() {
        let base = Position::new().with("h", 1.0).with("k", 2.0);
        let merged = base.merged(&Position::new().with("k", 5.0));
        assert_eq!(merged.axes().collect::<Vec<_>>(), vec!["h", "k"]);
        assert_eq!(merged.get("k"), Some(5.0));
        assert_eq!(merged.to_string(), "(h=1, k=5)");
    }

    #[test]
    fn test_concurrent_move() {
        let (slit, top, bottom) = slit(MoveMode::Concurrent);
        let status = slit
            .set(&Position::new().with("center", 1.0).with("gap", 2.0))
            .unwrap();
        status.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(top.position().unwrap(), 2.0);
        assert_eq!(bottom.position().unwrap(), 0.0);
        assert!(slit.position().unwrap().approx_eq(
            &Position::new().with("center", 1.0).with("gap", 2.0),
            1e-12
        ));
    }

    #[test]
    fn test_concurrent_move_with_settling_reals() {
        let top = SoftPositioner::builder("top")
            .settle_time(Duration::from_millis(10))
            .build();
        let bottom = SoftPositioner::builder("bottom")
            .settle_time(Duration::from_millis(10))
            .build();
        let slit = PseudoPositioner::builder("slit", Slit)
            .pseudo_axis(PseudoAxis::new("center"))
            .pseudo_axis(PseudoAxis::new("gap"))
            .real_axis("top", top.clone())
            .real_axis("bottom", bottom.clone())
            .build()
            .unwrap();

        slit.set(&Position::new().with("center", 1.0).with("gap", 2.0))
            .unwrap()
            .wait(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(top.position().unwrap(), 2.0);
        assert_eq!(bottom.position().unwrap(), 0.0);
    }

    /// Real axis whose controller refuses every move.
    struct Jammed {
        parent: ParentSlot,
        registry: CallbackRegistry,
    }

    impl Jammed {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                parent: ParentSlot::default(),
                registry: CallbackRegistry::new("jammed", POSITIONER_EVENTS),
            })
        }
    }

    #[async_trait]
    impl HardwareObject for Jammed {
        fn name(&self) -> &str {
            "jammed"
        }

        fn kind(&self) -> Kind {
            Kind::NORMAL
        }

        fn set_kind(&self, _kind: Kind) {}

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
            Ok(DataMap::new())
        }

        fn describe(&self) -> HwResult<DataMap<DataKey>> {
            Ok(DataMap::new())
        }

        fn read_configuration(&self) -> HwResult<DataMap<Reading>> {
            Ok(DataMap::new())
        }

        fn describe_configuration(&self) -> HwResult<DataMap<DataKey>> {
            Ok(DataMap::new())
        }

        fn hints(&self) -> Hints {
            Hints::default()
        }

        fn get(&self) -> HwResult<Value> {
            Ok(json!(0.0))
        }

        fn close(&self) {}
    }

    impl Positioner for Jammed {
        fn position(&self) -> HwResult<f64> {
            Ok(0.0)
        }

        fn set(&self, _target: f64) -> HwResult<Status> {
            Err(HwError::Backend("jammed: motor fault".into()))
        }

        fn limits(&self) -> Option<(f64, f64)> {
            None
        }

        fn moving(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_rejected_real_move_stops_started_axes() {
        let top = SoftPositioner::builder("top").velocity(1.0).build();
        let slit = PseudoPositioner::builder("slit", Slit)
            .pseudo_axis(PseudoAxis::new("center"))
            .pseudo_axis(PseudoAxis::new("gap"))
            .real_axis("top", top.clone())
            .real_axis("bottom", Jammed::new())
            .build()
            .unwrap();
        let started = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&started);
        slit.callbacks()
            .subscribe("start_moving", move |_| *counter.lock() += 1)
            .unwrap();

        let err = slit
            .set(&Position::new().with("center", 5.0).with("gap", 2.0))
            .unwrap_err();
        assert_eq!(err, HwError::Backend("jammed: motor fault".into()));
        assert!(!top.moving());
        assert!(slit.target().is_none());
        assert_eq!(*started.lock(), 0);
    }

    #[test]
    fn test_partial_move_uses_target_not_readback() {
        let top = SoftPositioner::builder("top").velocity(1.0).build();
        let bottom = SoftPositioner::builder("bottom").velocity(1.0).build();
        let slit = PseudoPositioner::builder("slit", Slit)
            .pseudo_axis(PseudoAxis::new("center"))
            .pseudo_axis(PseudoAxis::new("gap"))
            .real_axis("top", top.clone())
            .real_axis("bottom", bottom.clone())
            .build()
            .unwrap();

        let first = slit.move_axis("center", 5.0).unwrap();
        let second = slit.move_axis("gap", 2.0).unwrap();
        assert!(!first.success());
        assert_eq!(
            slit.target(),
            Some(Position::new().with("center", 5.0).with("gap", 2.0))
        );
        assert_eq!(top.target(), Some(6.0));
        assert_eq!(bottom.target(), Some(4.0));

        slit.stop(false).unwrap();
        assert!(matches!(
            second.wait(Some(Duration::from_secs(2))),
            Err(HwError::Stopped(_))
        ));
    }

    #[test]
    fn test_sequential_move_order() {
        let (slit, top, bottom) = slit(MoveMode::Sequential);
        let log = Arc::new(Mutex::new(Vec::new()));
        for real in [&top, &bottom] {
            let log = Arc::clone(&log);
            real.callbacks()
                .subscribe("start_moving", move |ev| log.lock().push(ev.object.clone()))
                .unwrap();
        }
        slit.set(&Position::new().with("center", 0.5).with("gap", 1.0))
            .unwrap()
            .wait(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(*log.lock(), vec!["slit_top", "slit_bottom"]);
    }

    #[test]
    fn test_limits() {
        let (slit, _, _) = slit(MoveMode::Concurrent);
        assert!(matches!(
            slit.move_axis("gap", 9.0),
            Err(HwError::LimitViolation(_))
        ));
        assert!(matches!(
            slit.move_axis("center", 10.5),
            Err(HwError::LimitViolation(_))
        ));
        assert!(slit.target().is_none());
    }

    #[test]
    fn test_unknown_axis() {
        let (slit, _, _) = slit(MoveMode::Concurrent);
        assert!(matches!(
            slit.move_axis("width", 1.0),
            Err(HwError::UnknownComponent(_))
        ));
    }

    #[test]
    fn test_unreachable_target_is_transform_error() {
        let theta = SoftPositioner::builder("theta").initial(10.0).build();
        let mono = PseudoPositioner::builder("mono", Bragg)
            .pseudo_axis(PseudoAxis::new("energy"))
            .real_axis("theta", theta)
            .build()
            .unwrap();
        assert!(matches!(mono.move_axis("energy", 0.5), Err(HwError::Transform(_))));
        mono.move_axis("energy", 8.0)
            .unwrap()
            .wait(Some(Duration::from_secs(1)))
            .unwrap();
        assert!((mono.position().unwrap().get("energy").unwrap() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_read_and_hints() {
        let (slit, _, _) = slit(MoveMode::Concurrent);
        assert_eq!(
            slit.read().unwrap().keys().collect::<Vec<_>>(),
            vec!["slit_center", "slit_gap", "slit_top", "slit_bottom"]
        );
        assert_eq!(
            slit.describe().unwrap().keys().collect::<Vec<_>>(),
            slit.read().unwrap().keys().collect::<Vec<_>>()
        );
        assert_eq!(slit.hints().fields, vec!["slit_center", "slit_gap"]);
        assert_eq!(slit.get().unwrap(), json!({"center": 0.0, "gap": 0.0}));
    }

    #[test]
    fn test_readback_relayed_from_reals() {
        let (slit, top, _) = slit(MoveMode::Concurrent);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        slit.callbacks()
            .subscribe("readback", move |ev| sink.lock().push(ev.value.clone()))
            .unwrap();
        top.set(2.0).unwrap();
        assert_eq!(
            seen.lock().last().cloned().flatten(),
            Some(json!({"center": 1.0, "gap": 2.0}))
        );
        assert_eq!(top.parent().map(|p| p.name().to_string()), Some("slit".into()));
    }
}
