//! Minimal mock beamline built on the device contract.
//!
//! This demo implements the `ChannelBackend` trait for a simulated
//! detector trigger, composes it into a `Device`, and drives a soft motor
//! and a two-blade slit through a pseudo positioner.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use device_contract::backend::{AckCallback, MonitorCallback};
use device_contract::reading::now;
use device_contract::{
    ChannelBackend, ChannelMetadata, Component, DeviceBlueprint, DeviceGuard, HardwareObject,
    HwResult, Kind, MonitorHandle, Position, Positioner, PositionerTransform, PseudoAxis,
    PseudoPositioner, Signal, SoftChannel, SoftPositioner, StatusOptions, SubscriptionStatus,
    parse_config,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG: &str = r#"
connection_timeout = 1.0
write_timeout = 2.0
motion_tick = 0.01
positioner_timeout = 10.0
"#;

/// Counts per second of exposure.
const COUNT_RATE: f64 = 12_000.0;

#[derive(Default)]
struct AcquireState {
    value: Mutex<(Value, f64)>,
    monitors: Mutex<Vec<(MonitorHandle, MonitorCallback)>>,
}

impl AcquireState {
    fn store(&self, value: Value) {
        let timestamp = now();
        *self.value.lock() = (value.clone(), timestamp);
        let monitors: Vec<MonitorCallback> =
            self.monitors.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for monitor in monitors {
            monitor(&value, timestamp);
        }
    }
}

/// Acquire channel of a mock detector.
///
/// Writing `1` starts an exposure; when it ends the counts channel is
/// updated, the channel drops back to `0` and the write is acknowledged.
struct MockAcquire {
    source: String,
    state: Arc<AcquireState>,
    next_handle: AtomicU64,
    counts: Arc<SoftChannel>,
    exposure: Arc<SoftChannel>,
}

impl MockAcquire {
    fn new(source: &str, counts: Arc<SoftChannel>, exposure: Arc<SoftChannel>) -> Self {
        let state = AcquireState::default();
        *state.value.lock() = (json!(0), now());
        Self {
            source: source.to_string(),
            state: Arc::new(state),
            next_handle: AtomicU64::new(1),
            counts,
            exposure,
        }
    }
}

#[async_trait]
impl ChannelBackend for MockAcquire {
    fn source(&self) -> &str {
        &self.source
    }

    async fn connect(&self, _timeout: Duration) -> HwResult<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn metadata(&self) -> ChannelMetadata {
        ChannelMetadata {
            write_access: true,
            ..ChannelMetadata::default()
        }
    }

    fn get_value(&self) -> HwResult<(Value, f64)> {
        Ok(self.state.value.lock().clone())
    }

    fn put_value(&self, value: Value, on_ack: AckCallback) -> HwResult<()> {
        let armed = value.as_i64() == Some(1);
        self.state.store(value);
        if !armed {
            on_ack(Ok(()));
            return Ok(());
        }

        let seconds = self.exposure.get_value()?.0.as_f64().unwrap_or(0.1).max(0.0);
        let counts = Arc::clone(&self.counts);
        let state = Arc::clone(&self.state);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs_f64(seconds));
            counts.inject(json!((seconds * COUNT_RATE).round()));
            state.store(json!(0));
            on_ack(Ok(()));
        });
        Ok(())
    }

    fn subscribe_value_changes(&self, callback: MonitorCallback) -> HwResult<MonitorHandle> {
        let handle = MonitorHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.state.monitors.lock().push((handle, callback));
        Ok(handle)
    }

    fn unsubscribe(&self, handle: MonitorHandle) {
        self.state.monitors.lock().retain(|(h, _)| *h != handle);
    }

    fn disconnect(&self) {
        self.state.monitors.lock().clear();
    }
}

/// Center and gap of a vertical slit.
struct SlitGeometry;

impl PositionerTransform for SlitGeometry {
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("DEVICE_LOG")
                .from_env_lossy(),
        )
        .init();

    let config = parse_config(CONFIG)?;

    // Detector
    let counts = Arc::new(SoftChannel::new("MOCK:det:counts", json!(0)));
    let exposure = Arc::new(SoftChannel::new("MOCK:det:exposure", json!(0.1)));
    let acquire = Arc::new(
        Signal::new(
            "det_acquire",
            Arc::new(MockAcquire::new(
                "MOCK:det:acquire",
                Arc::clone(&counts),
                Arc::clone(&exposure),
            )),
        )
        .with_config(&config),
    );

    let acquire_child = Arc::clone(&acquire);
    let det = DeviceBlueprint::new("det")
        .prefix("MOCK:det:")
        .with_config(&config)
        .component(
            Component::new("acquire", move |_| {
                let child: Arc<dyn HardwareObject> = acquire_child;
                Ok(child)
            })
            .kind(Kind::OMITTED)
            .trigger_value(json!(1)),
        )
        .component(
            Component::signal("counts", move |ctx| Signal::new(ctx.name.clone(), counts))
                .kind(Kind::HINTED),
        )
        .component(
            Component::signal("exposure", move |ctx| Signal::new(ctx.name.clone(), exposure))
                .kind(Kind::CONFIG),
        )
        .stage_sig("exposure", json!(0.25))
        .build()?;
    let det = DeviceGuard::new(det);

    det.connect_with(&config).await?;
    println!("Device:     {} ({})", det.name(), det.prefix());
    println!("Components: {:?}", det.component_names().collect::<Vec<_>>());
    println!("Hints:      {:?}", det.hints().fields);
    println!();

    let acquired = SubscriptionStatus::new(
        &acquire,
        |change| change.old_value == Some(json!(1)) && change.value == json!(0),
        StatusOptions::default().timeout(Duration::from_secs(5)),
        false,
    )?;

    det.stage()?;
    println!("Staged:     {}", det.staging_state());
    det.trigger()?.wait_async(Some(Duration::from_secs(5))).await?;
    acquired.wait_async(None).await?;

    println!("Reading:");
    for (key, reading) in det.read()?.iter() {
        println!("  {key}: {} @ {:.3}", reading.value, reading.timestamp);
    }
    println!("Configuration:");
    for (key, reading) in det.read_configuration()?.iter() {
        println!("  {key}: {}", reading.value);
    }
    det.unstage()?;
    println!("Unstaged:   exposure back to {}", det.component("exposure")?.get()?);
    println!();

    // Motor
    let mtr = SoftPositioner::builder("mtr")
        .velocity(2.0)
        .limits(-10.0, 10.0)
        .egu("mm")
        .precision(3)
        .with_config(&config)
        .build();
    let status = mtr.set(1.0)?;
    status.watch(|progress| {
        tracing::debug!(
            current = ?progress.current,
            fraction = ?progress.fraction,
            remaining = ?progress.time_remaining,
            "mtr progress"
        );
    });
    status.wait_async(None).await?;
    println!(
        "Motor:      {} {} after {:?}",
        mtr.position()?,
        mtr.egu().unwrap_or(""),
        status.elapsed()
    );
    if let Err(err) = mtr.set(25.0) {
        println!("Rejected:   {err}");
    }
    println!();

    // Slit
    let top = SoftPositioner::builder("slit_top")
        .velocity(1.0)
        .limits(-5.0, 5.0)
        .with_config(&config)
        .build();
    let bottom = SoftPositioner::builder("slit_bottom")
        .velocity(1.0)
        .limits(-5.0, 5.0)
        .with_config(&config)
        .build();
    let slit = DeviceGuard::new(
        PseudoPositioner::builder("slit", SlitGeometry)
            .pseudo_axis(PseudoAxis::new("center"))
            .pseudo_axis(PseudoAxis::new("gap").limits(0.0, 4.0))
            .real_axis("top", top)
            .real_axis("bottom", bottom)
            .build()?,
    );

    slit.move_axis("gap", 1.0)?.wait_async(None).await?;
    slit.move_axis("center", 0.5)?.wait_async(None).await?;
    println!("Slit:       {} (real {})", slit.position()?, slit.real_position()?);
    if let Err(err) = slit.move_axis("gap", 6.0) {
        println!("Rejected:   {err}");
    }

    Ok(())
}
