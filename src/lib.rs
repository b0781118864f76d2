//! Device Contract: a hardware-abstraction runtime for experiment control
//!
//! This crate models laboratory hardware as a tree of named objects that a
//! scan engine can connect, stage, trigger, read and move without knowing
//! what sits behind them. Control-system access goes through the
//! [`ChannelBackend`] trait; [`SoftChannel`] and [`SoftPositioner`] provide
//! in-memory hardware for tests and simulations.
//!
//! # Overview
//!
//! | Concept | Type | Role |
//! |---------|------|------|
//! | Completion handle | [`Status`] | Pending → Succeeded / Failed, timeout, settle, callbacks |
//! | Conditional completion | [`SubscriptionStatus`] | Completes when a value change satisfies a predicate |
//! | Progress | [`Progress`] | Per-move fraction, elapsed and remaining time |
//! | Event fan-out | [`CallbackRegistry`] | Typed event subscriptions with replay |
//! | Leaf value | [`Signal`] | One process variable with access control and limits |
//! | Composite | [`Device`] | Named components, staging, configure, trigger |
//! | Motion | [`Positioner`], [`PseudoPositioner`] | Scalar and transformed moves |
//! | Errors | [`HwError`] | Categorized failures with a [`HwResult`] alias |
//!
//! # Lifecycle
//!
//! ```text
//!   build() ──→ connect() ──→ stage() ──→ trigger() / set() ──→ read() ──→ unstage()
//!   (sync)       (async)       (sync)        (→ Status)          (sync)      (sync)
//! ```
//!
//! Every long-running operation returns a [`Status`] immediately. Callers
//! block on [`Status::wait`], await [`Status::wait_async`], or register a
//! completion callback.
//!
//! ```ignore
//! use device_contract::{DeviceBlueprint, Component, HardwareObject, Kind};
//! use serde_json::json;
//!
//! let det = DeviceBlueprint::new("det")
//!     .component(Component::soft("acquire", json!(0)).trigger_value(json!(1)))
//!     .component(Component::soft("counts", json!(0.0)).kind(Kind::HINTED))
//!     .component(Component::soft("exposure", json!(0.1)).kind(Kind::CONFIG))
//!     .stage_sig("exposure", json!(0.5))
//!     .build()?;
//!
//! det.stage()?;
//! det.trigger()?.wait(None)?;
//! let reading = det.read()?;
//! det.unstage()?;
//! ```

pub mod backend;
pub mod callbacks;
pub mod config;
pub mod device;
pub mod error;
pub mod kind;
pub mod object;
pub mod positioner;
pub mod progress;
pub mod pseudo;
pub mod reading;
pub mod signal;
pub mod status;
pub mod subscription;

mod timer;

pub use backend::{ChannelBackend, ChannelMetadata, MonitorHandle, SoftChannel};
pub use callbacks::{CallbackRegistry, Event, SubscriptionId};
pub use config::{RuntimeConfig, load_config, parse_config};
pub use device::{
    Component, ComponentContext, DEVICE_EVENTS, Device, DeviceBlueprint, StagingState,
};
pub use error::{HwError, HwResult};
pub use kind::Kind;
pub use object::{DeviceGuard, HardwareObject, ParentSlot};
pub use positioner::{POSITIONER_EVENTS, Positioner, SoftPositioner, SoftPositionerBuilder};
pub use progress::Progress;
pub use pseudo::{
    MoveMode, Position, PositionerTransform, PseudoAxis, PseudoPositioner,
    PseudoPositionerBuilder,
};
pub use reading::{DataKey, DataMap, Dtype, Hints, Reading};
pub use signal::{Access, SIGNAL_EVENTS, Signal};
pub use status::{Status, StatusOptions, StatusPhase, WeakStatus};
pub use subscription::{SubscriptionStatus, ValueChange};
