//! End-to-end lifecycle checks through the public API.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use device_contract::{
    Component, DeviceBlueprint, DeviceGuard, Event, HardwareObject, HwError, HwResult, Kind,
    MoveMode, Position, Positioner, PositionerTransform, PseudoAxis, PseudoPositioner, Signal,
    SoftPositioner, StagingState, Status, StatusOptions, SubscriptionStatus, ValueChange,
    parse_config,
};
use serde_json::json;

/// Center and width of a two-blade aperture.
struct Aperture;

impl PositionerTransform for Aperture {
    fn forward(&self, pseudo: &Position) -> HwResult<Position> {
        let center = pseudo.require("center")?;
        let width = pseudo.require("width")?;
        Ok(Position::new()
            .with("left", center - width / 2.0)
            .with("right", center + width / 2.0))
    }

    fn inverse(&self, real: &Position) -> HwResult<Position> {
        let left = real.require("left")?;
        let right = real.require("right")?;
        Ok(Position::new()
            .with("center", (left + right) / 2.0)
            .with("width", right - left))
    }
}

#[test]
fn test_status_timeout_fails_wait() {
    let timeout = Duration::from_millis(50);
    let st = Status::new(StatusOptions::default().timeout(timeout));
    let started = Instant::now();
    let err = st.wait(None).unwrap_err();
    assert!(matches!(err, HwError::StatusTimeout(_)));
    assert!(err.is_timeout());
    assert!(started.elapsed() >= timeout - Duration::from_millis(5));
    assert!(st.done());
    assert!(!st.success());
}

#[test]
fn test_second_finish_is_invalid_state() {
    let st = Status::new(StatusOptions::default());
    st.set_finished().unwrap();
    assert!(st.done() && st.success());
    assert!(matches!(st.set_finished(), Err(HwError::InvalidState(_))));
}

#[test]
fn test_settle_time_delays_callbacks_and_wait() {
    let settle = Duration::from_millis(60);
    let st = Status::new(StatusOptions::default().settle_time(settle));
    let (tx, rx) = mpsc::channel();
    st.add_callback(move |_| {
        let _ = tx.send(Instant::now());
    });

    let finished_at = Instant::now();
    st.set_finished().unwrap();
    st.wait(Some(Duration::from_secs(2))).unwrap();
    assert!(finished_at.elapsed() >= settle);

    let fired_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(fired_at.duration_since(finished_at) >= settle);
}

#[test]
fn test_combination_fails_with_first_failure() {
    let a = Status::new(StatusOptions::default().label("a"));
    let b = Status::new(StatusOptions::default().label("b"));
    let both = &a & &b;

    a.set_exception(HwError::Backend("a broke".into())).unwrap();
    assert!(both.done());
    b.set_finished().unwrap();

    assert!(!both.success());
    assert_eq!(both.error(), Some(HwError::Backend("a broke".into())));
}

#[test]
fn test_combination_succeeds_when_both_succeed() {
    let a = Status::new(StatusOptions::default());
    let b = Status::new(StatusOptions::default());
    let both = a.and(&b);
    a.set_finished().unwrap();
    assert!(!both.done());
    b.set_finished().unwrap();
    both.wait(Some(Duration::from_secs(1))).unwrap();
}

#[test]
fn test_transform_round_trip_on_samples() {
    for center in [-3.0, -0.25, 0.0, 1.5, 42.0] {
        for width in [0.0, 0.1, 2.0, 7.5] {
            let p = Position::new().with("center", center).with("width", width);
            let back = Aperture.inverse(&Aperture.forward(&p).unwrap()).unwrap();
            assert!(back.approx_eq(&p, 1e-12), "{p} came back as {back}");
        }
    }
}

#[test]
fn test_read_and_configuration_follow_kind() {
    let dev = DeviceBlueprint::new("dev")
        .component(Component::soft("value", json!(1.5)).kind(Kind::NORMAL))
        .component(Component::soft("gain", json!(4)).kind(Kind::CONFIG))
        .component(Component::soft("raw", json!("0x1f")).kind(Kind::OMITTED))
        .build()
        .unwrap();

    let reading = dev.read().unwrap();
    assert_eq!(reading.keys().collect::<Vec<_>>(), vec!["dev_value"]);
    assert_eq!(reading.get("dev_value").unwrap().value, json!(1.5));

    let config = dev.read_configuration().unwrap();
    assert_eq!(config.keys().collect::<Vec<_>>(), vec!["dev_gain"]);
    assert_eq!(config.get("dev_gain").unwrap().value, json!(4));

    assert!(!reading.contains_key("dev_raw"));
    assert!(!config.contains_key("dev_raw"));
}

#[test]
fn test_stage_applies_and_unstage_restores() {
    let dev = DeviceBlueprint::new("dev")
        .component(Component::soft("sig", json!(2)))
        .stage_sig("sig", json!(5))
        .build()
        .unwrap();
    let sig = dev.component("sig").unwrap();

    dev.stage().unwrap();
    assert_eq!(dev.staging_state(), StagingState::Staged);
    assert_eq!(sig.get().unwrap(), json!(5));
    assert!(matches!(dev.stage(), Err(HwError::RedundantStaging(_))));

    dev.unstage().unwrap();
    assert_eq!(dev.staging_state(), StagingState::Unstaged);
    assert_eq!(sig.get().unwrap(), json!(2));
}

#[test]
fn test_subscription_status_falling_edge() {
    let busy = Arc::new(Signal::soft("busy", json!(0)));
    let falling = |c: &ValueChange| {
        c.old_value == Some(json!(1)) && c.value == json!(0)
    };

    let pending = SubscriptionStatus::new(&busy, falling, StatusOptions::default(), false).unwrap();
    busy.set(json!(1)).unwrap().wait(None).unwrap();
    assert!(!pending.done());

    let done = SubscriptionStatus::new(&busy, falling, StatusOptions::default(), false).unwrap();
    busy.set(json!(0)).unwrap().wait(None).unwrap();
    done.wait(Some(Duration::from_secs(1))).unwrap();
    pending.wait(Some(Duration::from_secs(1))).unwrap();
}

#[test]
fn test_read_only_write_is_rejected() {
    let sig = Signal::soft("ring_current", json!(200.0)).read_only();
    assert!(matches!(sig.set(json!(10)), Err(HwError::Access(_))));
    assert_eq!(sig.get().unwrap(), json!(200.0));
}

#[test]
fn test_guard_releases_subscriptions() {
    let dev = DeviceBlueprint::new("dev")
        .component(Component::soft("counts", json!(0)))
        .build()
        .unwrap();
    let counts = dev.component("counts").unwrap();
    {
        let guard = DeviceGuard::new(Arc::clone(&dev));
        guard
            .component("counts")
            .unwrap()
            .subscribe("value", Arc::new(|_: &Event| {}))
            .unwrap();
        assert_eq!(counts.callbacks().len("value"), 1);
    }
    assert_eq!(counts.callbacks().len("value"), 0);
}

#[test]
fn test_sequential_pseudo_move() {
    let left = SoftPositioner::builder("slit_left").limits(-5.0, 5.0).build();
    let right = SoftPositioner::builder("slit_right").limits(-5.0, 5.0).build();
    let slit = PseudoPositioner::builder("slit", Aperture)
        .pseudo_axis(PseudoAxis::new("center"))
        .pseudo_axis(PseudoAxis::new("width").limits(0.0, 4.0))
        .real_axis("left", left.clone())
        .real_axis("right", right.clone())
        .mode(MoveMode::Sequential)
        .build()
        .unwrap();

    slit.set(&Position::new().with("center", 1.0).with("width", 2.0))
        .unwrap()
        .wait(Some(Duration::from_secs(2)))
        .unwrap();
    assert!(
        slit.position()
            .unwrap()
            .approx_eq(&Position::new().with("center", 1.0).with("width", 2.0), 1e-12)
    );
    assert!(matches!(
        slit.move_axis("width", 6.0),
        Err(HwError::LimitViolation(_))
    ));
    assert_eq!(slit.hints().fields, vec!["slit_center", "slit_width"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_configured_motion_reports_progress() {
    let config = parse_config("motion_tick = 0.005\npositioner_timeout = 5.0\n").unwrap();
    let mtr = SoftPositioner::builder("mtr")
        .velocity(20.0)
        .with_config(&config)
        .build();

    let fractions = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&fractions);
    let st = mtr.set(1.0).unwrap();
    st.watch(move |p| sink.lock().push(p.fraction));
    st.wait_async(Some(Duration::from_secs(2))).await.unwrap();

    let seen = fractions.lock().clone();
    assert_eq!(seen.last().copied().flatten(), Some(1.0));
    assert_eq!(mtr.read().unwrap().get("mtr").unwrap().value, json!(1.0));
}
