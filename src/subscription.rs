//! Statuses that complete when a watched value satisfies a predicate.
//!
//! Value changes are posted onto a single-consumer channel and drained by
//! whichever delivery thread holds the evaluator lock, so the predicate
//! sees changes in the order they were produced and never runs
//! concurrently with itself. The lock is re-entrant: a predicate that
//! writes a watched signal does not deadlock.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use serde_json::Value;

use crate::callbacks::{Event, SubscriptionId};
use crate::error::HwResult;
use crate::object::HardwareObject;
use crate::reading::now;
use crate::signal::Signal;
use crate::status::{Status, StatusOptions, StatusPhase};

/// One value change seen by a predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    /// Name of the signal that changed.
    pub signal: String,
    /// Value before the change, if known.
    pub old_value: Option<Value>,
    /// Value after the change.
    pub value: Value,
    /// UNIX timestamp of the change.
    pub timestamp: f64,
}

impl ValueChange {
    fn from_event(event: &Event) -> Self {
        Self {
            signal: event.object.clone(),
            old_value: event.old_value.clone(),
            value: event.value.clone().unwrap_or(Value::Null),
            timestamp: event.timestamp,
        }
    }
}

type Predicate = Box<dyn Fn(&ValueChange) -> bool + Send + Sync>;

struct Evaluator {
    status: Status,
    predicate: Predicate,
    tx: flume::Sender<ValueChange>,
    rx: flume::Receiver<ValueChange>,
    lock: ReentrantMutex<()>,
}

impl Evaluator {
    fn post(&self, change: ValueChange) {
        if self.tx.send(change).is_err() {
            return;
        }
        let _guard = self.lock.lock();
        while let Ok(change) = self.rx.try_recv() {
            if self.status.done() {
                self.rx.drain().for_each(drop);
                return;
            }
            if (self.predicate)(&change) {
                tracing::debug!(status = %self.status, signal = %change.signal, "condition met");
                if let Err(err) = self.status.set_finished() {
                    tracing::debug!(%err, "condition met after completion");
                }
            }
        }
    }
}

/// A [`Status`] completed by the first value change that satisfies a
/// predicate.
///
/// Dereferences to the underlying Status. Subscriptions are removed as
/// soon as the Status finishes, whichever way it finishes.
pub struct SubscriptionStatus {
    status: Status,
}

impl SubscriptionStatus {
    /// Watch one signal.
    ///
    /// With `run` set, the predicate is also evaluated immediately against
    /// the most recent change (or the current value if none was seen yet).
    pub fn new<F>(
        signal: &Arc<Signal>,
        predicate: F,
        options: StatusOptions,
        run: bool,
    ) -> HwResult<Self>
    where
        F: Fn(&ValueChange) -> bool + Send + Sync + 'static,
    {
        Self::any(std::slice::from_ref(signal), predicate, options, run)
    }

    /// Watch several signals with one predicate.
    pub fn any<F>(
        signals: &[Arc<Signal>],
        predicate: F,
        options: StatusOptions,
        run: bool,
    ) -> HwResult<Self>
    where
        F: Fn(&ValueChange) -> bool + Send + Sync + 'static,
    {
        let initial = if run {
            signals
                .iter()
                .map(|signal| current_change(signal))
                .collect::<HwResult<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let status = Status::new(options);
        let (tx, rx) = flume::unbounded();
        let evaluator = Arc::new(Evaluator {
            status: status.clone(),
            predicate: Box::new(predicate),
            tx,
            rx,
            lock: ReentrantMutex::new(()),
        });

        let mut subscriptions: Vec<(Weak<Signal>, SubscriptionId)> = Vec::new();
        for signal in signals {
            let weak = Arc::downgrade(&evaluator);
            let subscribed = signal.subscribe_value(move |event| {
                if let Some(evaluator) = weak.upgrade() {
                    evaluator.post(ValueChange::from_event(event));
                }
            });
            match subscribed {
                Ok(id) => subscriptions.push((Arc::downgrade(signal), id)),
                Err(err) => {
                    release(&subscriptions);
                    return Err(err);
                }
            }
        }

        // The evaluator lives as long as the Status is pending.
        let keep_alive = Arc::clone(&evaluator);
        status.add_callback(move |_| {
            release(&subscriptions);
            drop(keep_alive);
        });

        for change in initial {
            evaluator.post(change);
        }

        Ok(Self { status })
    }

    /// The underlying Status.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Consume into the underlying Status.
    pub fn into_status(self) -> Status {
        self.status
    }
}

fn current_change(signal: &Signal) -> HwResult<ValueChange> {
    match signal.callbacks().last_event("value") {
        Some(event) => Ok(ValueChange::from_event(&event)),
        None => Ok(ValueChange {
            signal: signal.name().to_string(),
            old_value: None,
            value: signal.get()?,
            timestamp: now(),
        }),
    }
}

fn release(subscriptions: &[(Weak<Signal>, SubscriptionId)]) {
    for (signal, id) in subscriptions {
        if let Some(signal) = signal.upgrade() {
            signal.callbacks().unsubscribe(*id);
        }
    }
}

impl Deref for SubscriptionStatus {
    type Target = Status;

    fn deref(&self) -> &Status {
        &self.status
    }
}

impl std::fmt::Debug for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = self.status.phase();
        f.debug_struct("SubscriptionStatus")
            .field("label", &self.status.label())
            .field("pending", &matches!(phase, StatusPhase::Pending))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HwError;
    use serde_json::json;
    use std::time::Duration;

    fn falling_edge(change: &ValueChange) -> bool {
        change.old_value == Some(json!(1)) && change.value == json!(0)
    }

    #[test]
    fn test_completes_on_falling_edge() {
        let sig = Arc::new(Signal::soft("busy", json!(0)));
        let st = SubscriptionStatus::new(&sig, falling_edge, StatusOptions::default(), false)
            .unwrap();

        sig.set(json!(1)).unwrap().wait(None).unwrap();
        assert!(!st.done());
        sig.set(json!(0)).unwrap().wait(None).unwrap();
        st.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(st.success());
    }

    #[test]
    fn test_rising_edge_alone_stays_pending() {
        let sig = Arc::new(Signal::soft("busy", json!(0)));
        let st = SubscriptionStatus::new(&sig, falling_edge, StatusOptions::default(), false)
            .unwrap();
        sig.set(json!(1)).unwrap().wait(None).unwrap();
        assert!(!st.done());
    }

    #[test]
    fn test_run_evaluates_current_value() {
        let sig = Arc::new(Signal::soft("ready", json!(true)));
        let st = SubscriptionStatus::new(
            &sig,
            |change| change.value == json!(true),
            StatusOptions::default(),
            true,
        )
        .unwrap();
        assert!(st.success());
        assert_eq!(sig.callbacks().len("value"), 0);
    }

    #[test]
    fn test_without_run_ignores_current_value() {
        let sig = Arc::new(Signal::soft("busy", json!(0)));
        let at_zero = |change: &ValueChange| change.value == json!(0);

        let fresh = SubscriptionStatus::new(&sig, at_zero, StatusOptions::default(), false)
            .unwrap();
        assert!(!fresh.done());

        sig.set(json!(1)).unwrap().wait(None).unwrap();
        assert!(!fresh.done());
        sig.set(json!(0)).unwrap().wait(None).unwrap();
        fresh.wait(Some(Duration::from_secs(1))).unwrap();

        // A cached value event at zero must not complete a later watcher either.
        let later = SubscriptionStatus::new(&sig, at_zero, StatusOptions::default(), false)
            .unwrap();
        assert!(!later.done());
        sig.set(json!(1)).unwrap().wait(None).unwrap();
        assert!(!later.done());
        sig.set(json!(0)).unwrap().wait(None).unwrap();
        later.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(later.success());
    }

    #[test]
    fn test_unsubscribes_after_success() {
        let sig = Arc::new(Signal::soft("count", json!(0)));
        let st = SubscriptionStatus::new(
            &sig,
            |change| change.value.as_i64() >= Some(3),
            StatusOptions::default(),
            false,
        )
        .unwrap();
        assert_eq!(sig.callbacks().len("value"), 1);
        for n in 1..=3 {
            sig.set(json!(n)).unwrap().wait(None).unwrap();
        }
        assert!(st.success());
        assert_eq!(sig.callbacks().len("value"), 0);
    }

    #[test]
    fn test_timeout_unsubscribes() {
        let sig = Arc::new(Signal::soft("busy", json!(0)));
        let st = SubscriptionStatus::new(
            &sig,
            |_| false,
            StatusOptions::default().timeout(Duration::from_millis(20)),
            false,
        )
        .unwrap();
        assert!(matches!(st.wait(None), Err(HwError::StatusTimeout(_))));
        assert_eq!(sig.callbacks().len("value"), 0);
    }

    #[test]
    fn test_any_of_several_signals() {
        let a = Arc::new(Signal::soft("a", json!(0)));
        let b = Arc::new(Signal::soft("b", json!(0)));
        let st = SubscriptionStatus::any(
            &[Arc::clone(&a), Arc::clone(&b)],
            |change| change.signal == "b" && change.value == json!(5),
            StatusOptions::default(),
            false,
        )
        .unwrap();
        a.set(json!(5)).unwrap().wait(None).unwrap();
        assert!(!st.done());
        b.set(json!(5)).unwrap().wait(None).unwrap();
        assert!(st.success());
        assert_eq!(a.name(), "a");
    }
}
