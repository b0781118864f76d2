//! Progress notifications on a pending [`Status`].
//!
//! A progress watcher is a secondary callback channel: it reports how far
//! an action has come (for progress bars) and never affects completion.
//! Every field except `name` is optional; an issuer fills in only what it
//! can estimate, and absent fields are omitted when serialized.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::status::Status;

/// One progress update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Name of the object performing the action.
    pub name: String,
    /// Current value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    /// Value when the action started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<f64>,
    /// Value the action is heading to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    /// Engineering units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Display precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Fraction complete, in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    /// Seconds since the action started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_elapsed: Option<f64>,
    /// Estimated seconds until completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<f64>,
}

impl Progress {
    /// A progress update carrying only the object name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Progress of a move from `initial` towards `target`, currently at `current`.
    ///
    /// The fraction is clipped to `[0, 1]` and left out when the move has
    /// zero length. The remaining time is extrapolated linearly from the
    /// elapsed time.
    pub fn for_move(
        name: impl Into<String>,
        initial: f64,
        current: f64,
        target: f64,
        time_elapsed: f64,
    ) -> Self {
        let span = (target - initial).abs();
        let fraction = if span > 0.0 {
            let remaining = ((target - current).abs() / span).clamp(0.0, 1.0);
            Some(1.0 - remaining)
        } else {
            None
        }
        .filter(|f| f.is_finite());

        let time_remaining = fraction
            .filter(|&f| f > 0.0)
            .map(|f| time_elapsed * (1.0 - f) / f);

        Self {
            name: name.into(),
            current: Some(current),
            initial: Some(initial),
            target: Some(target),
            fraction,
            time_elapsed: Some(time_elapsed),
            time_remaining,
            ..Self::default()
        }
    }

    /// Attach engineering units.
    pub fn with_unit(mut self, unit: Option<String>) -> Self {
        self.unit = unit;
        self
    }

    /// Attach display precision.
    pub fn with_precision(mut self, precision: Option<u32>) -> Self {
        self.precision = precision;
        self
    }
}

/// A registered progress watcher.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Watcher list stored on a Status.
#[derive(Default)]
pub(crate) struct Watchers {
    callbacks: Mutex<Vec<ProgressCallback>>,
}

impl Watchers {
    pub(crate) fn push(&self, callback: ProgressCallback) {
        self.callbacks.lock().push(callback);
    }

    pub(crate) fn notify(&self, progress: &Progress) {
        let snapshot: Vec<ProgressCallback> = self.callbacks.lock().clone();
        for watcher in snapshot {
            if catch_unwind(AssertUnwindSafe(|| watcher(progress))).is_err() {
                tracing::error!(name = %progress.name, "progress watcher panicked");
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.callbacks.lock().clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}

impl Status {
    /// Subscribe to progress updates.
    ///
    /// If the Status already finished successfully the watcher is told
    /// once that the action is complete; otherwise it is kept until
    /// completion.
    pub fn watch<F>(&self, watcher: F)
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        if self.done() {
            if self.success() {
                watcher(&Progress {
                    fraction: Some(1.0),
                    ..Progress::named(self.label())
                });
            }
            return;
        }
        self.watchers().push(Arc::new(watcher));
    }

    /// Publish a progress update to every watcher. Ignored once finished.
    pub fn notify_progress(&self, progress: &Progress) {
        if !self.done() {
            self.watchers().notify(progress);
        }
    }

    /// Whether anyone is watching progress.
    pub fn has_watchers(&self) -> bool {
        !self.watchers().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusOptions;
    use serde_json::json;

    #[test]
    fn test_for_move_fraction() {
        let p = Progress::for_move("mtr", 0.0, 2.5, 10.0, 1.0);
        assert!((p.fraction.unwrap() - 0.25).abs() < 1e-12);
        assert!((p.time_remaining.unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_length_move_omits_fraction() {
        let p = Progress::for_move("mtr", 1.0, 1.0, 1.0, 0.5);
        assert!(p.fraction.is_none());
        assert!(p.time_remaining.is_none());
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let p = Progress {
            current: Some(1.0),
            ..Progress::named("mtr")
        };
        assert_eq!(
            serde_json::to_value(&p).unwrap(),
            json!({"name": "mtr", "current": 1.0})
        );
    }

    #[test]
    fn test_watchers_receive_updates_and_final_fraction() {
        let status = Status::new(StatusOptions::default().label("mtr"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        status.watch(move |p| sink.lock().push(p.fraction));

        status.notify_progress(&Progress::for_move("mtr", 0.0, 5.0, 10.0, 1.0));
        status.set_finished().unwrap();
        status.notify_progress(&Progress::for_move("mtr", 0.0, 6.0, 10.0, 1.0));

        assert_eq!(*seen.lock(), vec![Some(0.5), Some(1.0)]);
        assert!(!status.has_watchers());
    }

    #[test]
    fn test_watch_after_failure_is_silent() {
        let status = Status::failed(crate::HwError::Stopped("mtr".into()));
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        status.watch(move |_| *counter.lock() += 1);
        assert_eq!(*hits.lock(), 0);
    }
}
