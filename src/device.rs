//! Hierarchical composition of signals, positioners and sub-devices.
//!
//! A [`Device`] is built once from a [`DeviceBlueprint`]: an ordered list of
//! named [`Component`]s, each with a factory that instantiates the child.
//! Children are named `{device}_{attr}` and hold a weak reference back to
//! the device.
//!
//! ## Aggregation
//!
//! | Operation | Children visited | Child call |
//! |-----------|------------------|------------|
//! | `read()` / `describe()` | kind includes `NORMAL` | `read()` / `describe()` |
//! | `read_configuration()` | composite with `CONFIG` | `read_configuration()` |
//! | | leaf with `CONFIG` but not `NORMAL` | `read()` |
//! | `hints()` | kind includes `NORMAL` | `hints()` |
//!
//! A leaf that is both `NORMAL` and `CONFIG` is reported by `read()` only.
//!
//! ## Staging
//!
//! ```text
//!   Unstaged ──stage()──→ Staged ──unstage()──→ Unstaged
//!      │                                           ▲
//!      └──stage() fails, rollback fails──→ Partial ─┘ unstage()
//! ```
//!
//! `stage()` stages every child first, in declaration order, then applies
//! the device's own `stage_sigs`, stashing each original value. `unstage()`
//! restores stashed values in reverse order and then unstages children in
//! reverse order, attempting every step and reporting failures together.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::callbacks::{CallbackRegistry, Event};
use crate::config::RuntimeConfig;
use crate::error::{HwError, HwResult};
use crate::kind::Kind;
use crate::object::{HardwareObject, ParentSlot};
use crate::reading::{DataKey, DataMap, Hints, Reading};
use crate::signal::Signal;
use crate::status::Status;

/// Event types emitted by a [`Device`].
pub const DEVICE_EVENTS: &[&str] = &["acq_done"];

/// What a component factory knows about the child it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentContext {
    /// Attribute name within the parent device.
    pub attr: String,
    /// Full name of the child: `{parent}_{attr}`.
    pub name: String,
    /// Parent prefix followed by the component suffix.
    pub prefix: String,
}

type Factory = Box<dyn FnOnce(&ComponentContext) -> HwResult<Arc<dyn HardwareObject>> + Send>;
type TriggerHook = Box<dyn Fn(&Device) -> HwResult<Status> + Send + Sync>;

/// Declaration of one named child.
pub struct Component {
    attr: String,
    factory: Factory,
    kind: Option<Kind>,
    suffix: String,
    trigger_value: Option<Value>,
}

impl Component {
    /// Declare a child built by `factory`.
    pub fn new<F>(attr: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce(&ComponentContext) -> HwResult<Arc<dyn HardwareObject>> + Send + 'static,
    {
        Self {
            attr: attr.into(),
            factory: Box::new(factory),
            kind: None,
            suffix: String::new(),
            trigger_value: None,
        }
    }

    /// Declare a signal child.
    pub fn signal<F>(attr: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce(&ComponentContext) -> Signal + Send + 'static,
    {
        Self::new(attr, move |ctx| {
            let signal: Arc<dyn HardwareObject> = Arc::new(factory(ctx));
            Ok(signal)
        })
    }

    /// Declare a soft signal child holding `value`.
    pub fn soft(attr: impl Into<String>, value: Value) -> Self {
        Self::signal(attr, move |ctx| Signal::soft(ctx.name.clone(), value))
    }

    /// Declare a sub-device. The blueprint's name and prefix are replaced
    /// by the ones derived from the parent.
    pub fn device(attr: impl Into<String>, blueprint: DeviceBlueprint) -> Self {
        Self::new(attr, move |ctx| {
            let device: Arc<dyn HardwareObject> = DeviceBlueprint {
                name: ctx.name.clone(),
                prefix: ctx.prefix.clone(),
                ..blueprint
            }
            .build()?;
            Ok(device)
        })
    }

    /// Override the child's kind.
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Suffix appended to the parent prefix.
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Value written to this signal by `trigger()`.
    pub fn trigger_value(mut self, value: Value) -> Self {
        self.trigger_value = Some(value);
        self
    }
}

/// Declarative description of a device, instantiated by [`build`](Self::build).
pub struct DeviceBlueprint {
    name: String,
    prefix: String,
    kind: Kind,
    components: Vec<Component>,
    stage_sigs: Vec<(String, Value)>,
    write_timeout: Option<Duration>,
    trigger: Option<TriggerHook>,
}

impl DeviceBlueprint {
    /// Start a blueprint for a device called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: String::new(),
            kind: Kind::NORMAL | Kind::CONFIG,
            components: Vec::new(),
            stage_sigs: Vec::new(),
            write_timeout: None,
            trigger: None,
        }
    }

    /// Control-system prefix shared by the children.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Kind of the device itself.
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Add a child.
    pub fn component(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }

    /// Value applied to the signal at `path` while staged.
    pub fn stage_sig(mut self, path: impl Into<String>, value: Value) -> Self {
        self.stage_sigs.push((path.into(), value));
        self
    }

    /// How long staging and configuration wait for each write.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Take the write timeout from a runtime configuration.
    pub fn with_config(mut self, config: &RuntimeConfig) -> Self {
        self.write_timeout = config.write_timeout();
        self
    }

    /// Replace the default `trigger()` behaviour.
    pub fn on_trigger<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Device) -> HwResult<Status> + Send + Sync + 'static,
    {
        self.trigger = Some(Box::new(hook));
        self
    }

    /// Instantiate every child and assemble the device.
    ///
    /// Fails with [`HwError::Configuration`] on duplicate attribute names or
    /// a child that already belongs to another device, and with
    /// [`HwError::UnknownComponent`] if a stage signal path does not resolve.
    pub fn build(self) -> HwResult<Arc<Device>> {
        let mut seen = FxHashSet::default();
        for component in &self.components {
            if component.attr.is_empty() || component.attr.contains('.') {
                return Err(HwError::Configuration(format!(
                    "{}: invalid component name {:?}",
                    self.name, component.attr
                )));
            }
            if !seen.insert(component.attr.clone()) {
                return Err(HwError::Configuration(format!(
                    "{}: duplicate component {}",
                    self.name, component.attr
                )));
            }
        }

        let mut children = Vec::with_capacity(self.components.len());
        for component in self.components {
            let ctx = ComponentContext {
                name: format!("{}_{}", self.name, component.attr),
                prefix: format!("{}{}", self.prefix, component.suffix),
                attr: component.attr,
            };
            let object = (component.factory)(&ctx)?;
            if let Some(kind) = component.kind {
                object.set_kind(kind);
            }
            children.push(Child {
                attr: ctx.attr,
                object,
                trigger_value: component.trigger_value,
            });
        }

        let device = Arc::new_cyclic(|me| Device {
            name: self.name.clone(),
            prefix: self.prefix,
            kind: AtomicU8::new(self.kind.bits()),
            me: me.clone(),
            children,
            stage_sigs: Mutex::new(Vec::new()),
            staging: Mutex::new(Staging::default()),
            write_timeout: self.write_timeout,
            registry: CallbackRegistry::new(self.name, DEVICE_EVENTS),
            parent: ParentSlot::default(),
            trigger: self.trigger,
        });

        let weak: Weak<Device> = Arc::downgrade(&device);
        let parent: Weak<dyn HardwareObject> = weak;
        for child in &device.children {
            child
                .object
                .parent_slot()
                .attach(child.object.name(), parent.clone())?;
        }
        for (path, value) in self.stage_sigs {
            device.add_stage_sig(path, value)?;
        }
        Ok(device)
    }
}

/// Staging state of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingState {
    /// Nothing applied.
    #[default]
    Unstaged,
    /// A failed `stage()` could not roll everything back.
    Partial,
    /// Every child is staged and every stage signal applied.
    Staged,
}

impl std::fmt::Display for StagingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingState::Unstaged => write!(f, "unstaged"),
            StagingState::Partial => write!(f, "partially staged"),
            StagingState::Staged => write!(f, "staged"),
        }
    }
}

struct Child {
    attr: String,
    object: Arc<dyn HardwareObject>,
    trigger_value: Option<Value>,
}

struct Applied {
    object: Arc<dyn HardwareObject>,
    original: Value,
}

#[derive(Default)]
struct Staging {
    state: StagingState,
    applied: Vec<Applied>,
}

/// Named composition of hardware objects with a uniform lifecycle.
pub struct Device {
    name: String,
    prefix: String,
    kind: AtomicU8,
    me: Weak<Device>,
    children: Vec<Child>,
    stage_sigs: Mutex<Vec<(String, Value)>>,
    staging: Mutex<Staging>,
    write_timeout: Option<Duration>,
    registry: CallbackRegistry,
    parent: ParentSlot,
    trigger: Option<TriggerHook>,
}

impl Device {
    /// Control-system prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Attribute names of the children, in declaration order.
    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|c| c.attr.as_str())
    }

    /// Children with their attribute names, in declaration order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Arc<dyn HardwareObject>)> {
        self.children.iter().map(|c| (c.attr.as_str(), &c.object))
    }

    fn child(&self, attr: &str) -> HwResult<Arc<dyn HardwareObject>> {
        self.children
            .iter()
            .find(|c| c.attr == attr)
            .map(|c| Arc::clone(&c.object))
            .ok_or_else(|| HwError::UnknownComponent(format!("{}.{attr}", self.name)))
    }

    /// Look up a descendant by attribute name or dotted path (`"cam.gain"`).
    pub fn component(&self, path: &str) -> HwResult<Arc<dyn HardwareObject>> {
        let mut parts = path.split('.');
        let first = parts.next().unwrap_or_default();
        let mut current = self.child(first)?;
        for part in parts {
            let next = match current.as_device() {
                Some(device) => device.child(part)?,
                None => {
                    return Err(HwError::UnknownComponent(format!(
                        "{}.{path}: {} has no children",
                        self.name,
                        current.name()
                    )));
                }
            };
            current = next;
        }
        Ok(current)
    }

    fn signal_at(&self, path: &str) -> HwResult<Arc<dyn HardwareObject>> {
        let object = self.component(path)?;
        if object.as_signal().is_none() {
            return Err(HwError::Unsupported(format!(
                "{}.{path} is not a signal",
                self.name
            )));
        }
        Ok(object)
    }

    /// Current stage signals.
    pub fn stage_sigs(&self) -> Vec<(String, Value)> {
        self.stage_sigs.lock().clone()
    }

    /// Add or replace a stage signal. Rejected while staged.
    pub fn add_stage_sig(&self, path: impl Into<String>, value: Value) -> HwResult<()> {
        let path = path.into();
        self.signal_at(&path)?;
        if self.staging_state() != StagingState::Unstaged {
            return Err(HwError::InvalidState(format!(
                "{}: stage_sigs cannot change while {}",
                self.name,
                self.staging_state()
            )));
        }
        let mut sigs = self.stage_sigs.lock();
        match sigs.iter_mut().find(|(p, _)| *p == path) {
            Some((_, slot)) => *slot = value,
            None => sigs.push((path, value)),
        }
        Ok(())
    }

    /// Current staging state.
    pub fn staging_state(&self) -> StagingState {
        self.staging.lock().state
    }

    /// Connect using the deadline from a runtime configuration.
    pub async fn connect_with(&self, config: &RuntimeConfig) -> HwResult<()> {
        self.connect(config.connection_timeout()).await
    }

    /// Apply configuration values and return `(old, new)` configuration
    /// snapshots. Every path is resolved before anything is written.
    pub fn configure<I, K>(&self, settings: I) -> HwResult<(DataMap<Reading>, DataMap<Reading>)>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let targets = settings
            .into_iter()
            .map(|(path, value)| Ok((self.signal_at(path.as_ref())?, value)))
            .collect::<HwResult<Vec<_>>>()?;

        let old = self.read_configuration()?;
        for (object, value) in targets {
            if let Some(signal) = object.as_signal() {
                signal.set(value)?.wait(self.write_timeout)?;
            }
        }
        let new = self.read_configuration()?;
        Ok((old, new))
    }

    fn apply(&self, path: &str, value: Value, applied: &mut Vec<Applied>) -> HwResult<()> {
        let object = self.signal_at(path)?;
        let Some(signal) = object.as_signal() else {
            return Ok(());
        };
        let original = signal.get()?;
        tracing::debug!(device = %self.name, signal = signal.name(), %original, %value, "stage");
        let status = signal.set_internal(value)?;
        applied.push(Applied {
            object: Arc::clone(&object),
            original,
        });
        status.wait(self.write_timeout)
    }

    fn restore(&self, applied: &mut Vec<Applied>) -> Vec<(String, HwError)> {
        let mut errors = Vec::new();
        while let Some(Applied { object, original }) = applied.pop() {
            let Some(signal) = object.as_signal() else {
                continue;
            };
            tracing::debug!(device = %self.name, signal = signal.name(), %original, "unstage");
            let restored = signal
                .set_internal(original)
                .and_then(|status| status.wait(self.write_timeout));
            if let Err(err) = restored {
                tracing::warn!(device = %self.name, signal = signal.name(), %err, "restore failed");
                errors.push((signal.name().to_string(), err));
            }
        }
        errors
    }

    fn rollback(&self, staging: &mut Staging, staged: &[&Child]) {
        let mut errors = self.restore(&mut staging.applied);
        for child in staged.iter().rev() {
            if let Err(err) = child.object.unstage() {
                errors.push((child.object.name().to_string(), err));
            }
        }
        staging.state = if errors.is_empty() {
            StagingState::Unstaged
        } else {
            tracing::warn!(device = %self.name, failures = errors.len(), "stage rollback incomplete");
            StagingState::Partial
        };
    }

    fn emit_acq_done(&self, success: bool) {
        let event = Event::new("acq_done", self.name.clone()).with_success(success);
        if let Err(err) = self.registry.run(event) {
            tracing::error!(device = %self.name, %err, "acq_done rejected");
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("kind", &HardwareObject::kind(self))
            .field("components", &self.component_names().collect::<Vec<_>>())
            .field("staging", &self.staging_state())
            .finish()
    }
}

#[async_trait]
impl HardwareObject for Device {
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
        let pending = self.children.iter().map(|c| c.object.connect(timeout));
        match tokio::time::timeout(timeout, try_join_all(pending)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                let missing: Vec<&str> = self
                    .children
                    .iter()
                    .filter(|c| !c.object.connected())
                    .map(|c| c.object.name())
                    .collect();
                Err(HwError::ConnectionTimeout(format!(
                    "{} not connected within {:.3}s: {}",
                    self.name,
                    timeout.as_secs_f64(),
                    missing.join(", ")
                )))
            }
        }
    }

    fn connected(&self) -> bool {
        self.children.iter().all(|c| c.object.connected())
    }

    fn read(&self) -> HwResult<DataMap<Reading>> {
        let mut out = DataMap::new();
        for child in self.children.iter().filter(|c| c.object.kind().is_read()) {
            out.extend(child.object.read()?);
        }
        Ok(out)
    }

    fn describe(&self) -> HwResult<DataMap<DataKey>> {
        let mut out = DataMap::new();
        for child in self.children.iter().filter(|c| c.object.kind().is_read()) {
            out.extend(child.object.describe()?);
        }
        Ok(out)
    }

    fn read_configuration(&self) -> HwResult<DataMap<Reading>> {
        let mut out = DataMap::new();
        for child in &self.children {
            let kind = child.object.kind();
            if child.object.is_composite() {
                if kind.is_config() {
                    out.extend(child.object.read_configuration()?);
                }
            } else if kind.is_config() && !kind.is_read() {
                out.extend(child.object.read()?);
            }
        }
        Ok(out)
    }

    fn describe_configuration(&self) -> HwResult<DataMap<DataKey>> {
        let mut out = DataMap::new();
        for child in &self.children {
            let kind = child.object.kind();
            if child.object.is_composite() {
                if kind.is_config() {
                    out.extend(child.object.describe_configuration()?);
                }
            } else if kind.is_config() && !kind.is_read() {
                out.extend(child.object.describe()?);
            }
        }
        Ok(out)
    }

    fn hints(&self) -> Hints {
        let fields = self
            .children
            .iter()
            .filter(|c| c.object.kind().is_read())
            .flat_map(|c| c.object.hints().fields)
            .collect();
        Hints { fields }
    }

    fn get(&self) -> HwResult<Value> {
        let mut map = Map::new();
        for child in &self.children {
            map.insert(child.attr.clone(), child.object.get()?);
        }
        Ok(Value::Object(map))
    }

    fn trigger(&self) -> HwResult<Status> {
        if let Some(hook) = &self.trigger {
            return hook(self);
        }

        let mut triggers = self.children.iter().filter_map(|c| {
            c.trigger_value
                .as_ref()
                .map(|value| (&c.object, value.clone()))
        });
        let Some((object, value)) = triggers.next() else {
            return Ok(Status::finished());
        };
        if triggers.next().is_some() {
            return Err(HwError::Unsupported(format!(
                "{} has more than one trigger component",
                self.name
            )));
        }
        let Some(signal) = object.as_signal() else {
            return Err(HwError::Unsupported(format!(
                "trigger component {} is not a signal",
                object.name()
            )));
        };

        tracing::debug!(device = %self.name, signal = signal.name(), "trigger");
        let status = signal.set_internal(value)?;
        let me = self.me.clone();
        status.add_callback(move |status| {
            if let Some(device) = me.upgrade() {
                device.emit_acq_done(status.success());
            }
        });
        Ok(status)
    }

    fn stage(&self) -> HwResult<()> {
        let mut staging = self.staging.lock();
        if staging.state != StagingState::Unstaged {
            return Err(HwError::RedundantStaging(format!(
                "{} is already {}",
                self.name, staging.state
            )));
        }
        tracing::debug!(device = %self.name, "staging");

        let mut staged: Vec<&Child> = Vec::with_capacity(self.children.len());
        for child in &self.children {
            if let Err(err) = child.object.stage() {
                self.rollback(&mut staging, &staged);
                return Err(err);
            }
            staged.push(child);
        }

        let sigs = self.stage_sigs.lock().clone();
        for (path, value) in sigs {
            if let Err(err) = self.apply(&path, value, &mut staging.applied) {
                self.rollback(&mut staging, &staged);
                return Err(err);
            }
        }

        staging.state = StagingState::Staged;
        Ok(())
    }

    fn unstage(&self) -> HwResult<()> {
        let errors = {
            let mut staging = self.staging.lock();
            if staging.state == StagingState::Unstaged {
                return Ok(());
            }
            tracing::debug!(device = %self.name, "unstaging");

            let mut errors = self.restore(&mut staging.applied);
            for child in self.children.iter().rev() {
                if let Err(err) = child.object.unstage() {
                    tracing::warn!(device = %self.name, child = child.object.name(), %err, "unstage failed");
                    errors.push((child.object.name().to_string(), err));
                }
            }
            staging.state = StagingState::Unstaged;
            errors
        };
        HwError::bundle(format!("unstage {}", self.name), errors)
    }

    fn stop(&self, success: bool) -> HwResult<()> {
        let mut errors = Vec::new();
        for child in &self.children {
            if let Err(err) = child.object.stop(success) {
                tracing::warn!(device = %self.name, child = child.object.name(), %err, "stop failed");
                errors.push((child.object.name().to_string(), err));
            }
        }
        HwError::bundle(format!("stop {}", self.name), errors)
    }

    fn close(&self) {
        for child in &self.children {
            child.object.close();
        }
        self.registry.clear();
    }

    fn as_device(&self) -> Option<&Device> {
        Some(self)
    }
}
