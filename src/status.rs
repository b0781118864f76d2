//! Completion tracking for hardware actions.
//!
//! A [`Status`] represents exactly one pending hardware action: a move, a
//! write, an acquisition. It is created by whoever starts the action and
//! completed exactly once by whoever first learns the outcome.
//!
//! ```text
//!   Status::new() ──→ Pending ──set_finished()──→ (settle_time) ──→ Succeeded
//!                        │
//!                        ├──set_exception(err)──────────────────→ Failed(err)
//!                        │
//!                        └──(timeout + settle_time elapsed)─────→ Failed(StatusTimeout)
//! ```
//!
//! **Invariants:**
//! - `done` goes from `false` to `true` exactly once; the outcome is fixed
//!   at that moment.
//! - A second `set_finished()` / `set_exception()` fails with
//!   [`HwError::InvalidState`], including while the first one is still
//!   settling. Racing completions never deadlock: exactly one wins.
//! - Settling delays success only. Failures are visible immediately.
//! - The timeout clock covers `timeout + settle_time` from creation. A
//!   Status still settling at that deadline fails with a timeout.
//! - Completion callbacks run exactly once, outside the internal lock, in
//!   the thread that completed the Status (or the timer thread).
//! - Pending timers keep their Status alive. A Status whose handles were
//!   all dropped still settles or times out, and its callbacks still run.
//!   A combined Status keeps its branches alive until it resolves.
//!
//! A Status never retries. Retry policy belongs to the caller.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

use crate::error::{HwError, HwResult};
use crate::progress::{Progress, Watchers};
use crate::timer;

/// Phase of a Status.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusPhase {
    /// The action is still running (or settling).
    Pending,
    /// The action completed successfully.
    Succeeded,
    /// The action failed with an error.
    Failed(HwError),
}

impl StatusPhase {
    /// Check if this is a terminal phase.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusPhase::Pending)
    }

    /// Check if the action completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, StatusPhase::Succeeded)
    }
}

impl std::fmt::Display for StatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusPhase::Pending => write!(f, "Pending"),
            StatusPhase::Succeeded => write!(f, "Succeeded"),
            StatusPhase::Failed(err) => write!(f, "Failed: {err}"),
        }
    }
}

/// Construction options for a [`Status`].
#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    /// Fail with a timeout if not completed within this duration.
    pub timeout: Option<Duration>,
    /// Delay between `set_finished()` and the success becoming visible.
    pub settle_time: Duration,
    /// Human-readable name of the action, used in logs and progress.
    pub label: String,
}

impl StatusOptions {
    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the timeout if one is given.
    pub fn maybe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the settle time.
    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Set the label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

type CompletionCallback = Box<dyn FnOnce(&Status) + Send>;
type TimeoutHook = Box<dyn FnOnce() + Send>;

struct State {
    phase: StatusPhase,
    settling: bool,
    finished_at: Option<Instant>,
    callbacks: Vec<CompletionCallback>,
    on_timeout: Option<TimeoutHook>,
}

struct Inner {
    label: String,
    timeout: Option<Duration>,
    settle_time: Duration,
    created_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<State>,
    cond: Condvar,
    done_tx: watch::Sender<bool>,
    watchers: Watchers,
}

/// Single-assignment completion handle for a hardware action.
///
/// Cloning is cheap; all clones observe the same completion.
#[derive(Clone)]
pub struct Status {
    inner: Arc<Inner>,
}

impl Status {
    /// Create a pending Status, starting its timeout clock if one is set.
    pub fn new(options: StatusOptions) -> Self {
        let (done_tx, _) = watch::channel(false);
        let status = Self {
            inner: Arc::new(Inner {
                label: options.label,
                timeout: options.timeout,
                settle_time: options.settle_time,
                created_at: Utc::now(),
                started: Instant::now(),
                state: Mutex::new(State {
                    phase: StatusPhase::Pending,
                    settling: false,
                    finished_at: None,
                    callbacks: Vec::new(),
                    on_timeout: None,
                }),
                cond: Condvar::new(),
                done_tx,
                watchers: Watchers::default(),
            }),
        };

        if let Some(timeout) = status.inner.timeout.filter(|t| !t.is_zero()) {
            let pending = status.clone();
            timer::schedule(timeout + status.inner.settle_time, move || pending.expire());
        }
        status
    }

    /// A Status that has already succeeded.
    pub fn finished() -> Self {
        let status = Self::new(StatusOptions::default());
        status.resolve(StatusPhase::Succeeded);
        status
    }

    /// A Status that has already failed with `err`.
    pub fn failed(err: HwError) -> Self {
        let status = Self::new(StatusOptions::default());
        status.resolve(StatusPhase::Failed(err));
        status
    }

    /// Register a hook run when the timeout fires, before the Status fails.
    ///
    /// Used by issuers to ask the hardware to halt. The hook should hold
    /// only a weak reference to the issuing object.
    pub fn on_timeout<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.phase.is_terminal() {
            state.on_timeout = Some(Box::new(hook));
        }
    }

    /// Label given at construction.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Configured settle time.
    pub fn settle_time(&self) -> Duration {
        self.inner.settle_time
    }

    /// Wall-clock creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Time since creation, frozen once the Status finished.
    pub fn elapsed(&self) -> Duration {
        let finished_at = self.inner.state.lock().finished_at;
        finished_at.unwrap_or_else(Instant::now) - self.inner.started
    }

    /// Current phase.
    pub fn phase(&self) -> StatusPhase {
        self.inner.state.lock().phase.clone()
    }

    /// Whether the Status reached a terminal phase.
    pub fn done(&self) -> bool {
        self.inner.state.lock().phase.is_terminal()
    }

    /// Whether the Status finished successfully.
    pub fn success(&self) -> bool {
        self.inner.state.lock().phase.is_success()
    }

    /// The captured error, if the Status failed.
    pub fn error(&self) -> Option<HwError> {
        match &self.inner.state.lock().phase {
            StatusPhase::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub(crate) fn watchers(&self) -> &Watchers {
        &self.inner.watchers
    }

    /// Mark the action as finished successfully.
    ///
    /// Success becomes visible after the settle time. Fails with
    /// [`HwError::InvalidState`] if the Status is already finished or
    /// settling.
    pub fn set_finished(&self) -> HwResult<()> {
        {
            let mut state = self.inner.state.lock();
            self.ensure_pending(&state, "set_finished")?;
            state.settling = true;
        }

        let settle = self.inner.settle_time;
        if settle.is_zero() {
            self.resolve(StatusPhase::Succeeded);
        } else {
            let settling = self.clone();
            timer::schedule(settle, move || {
                settling.resolve(StatusPhase::Succeeded);
            });
        }
        Ok(())
    }

    /// Mark the action as failed with `err`, immediately.
    ///
    /// Fails with [`HwError::InvalidState`] if the Status is already
    /// finished or settling.
    pub fn set_exception(&self, err: HwError) -> HwResult<()> {
        let callbacks = {
            let mut state = self.inner.state.lock();
            self.ensure_pending(&state, "set_exception")?;
            self.transition(&mut state, StatusPhase::Failed(err))
        };
        self.run_callbacks(callbacks);
        Ok(())
    }

    fn ensure_pending(&self, state: &State, op: &str) -> HwResult<()> {
        if state.phase.is_terminal() || state.settling {
            return Err(HwError::InvalidState(format!(
                "{op} called on {} which is already {}",
                self.describe_target(),
                if state.settling && !state.phase.is_terminal() {
                    "settling"
                } else {
                    "finished"
                }
            )));
        }
        Ok(())
    }

    /// Complete the Status unless it already finished. Returns `true` if
    /// this call decided the outcome.
    pub(crate) fn resolve(&self, phase: StatusPhase) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return false;
            }
            self.transition(&mut state, phase)
        };
        self.run_callbacks(callbacks);
        true
    }

    fn transition(&self, state: &mut State, phase: StatusPhase) -> Vec<CompletionCallback> {
        state.phase = phase;
        state.finished_at = Some(Instant::now());
        state.on_timeout = None;
        self.inner.cond.notify_all();
        self.inner.done_tx.send_replace(true);
        std::mem::take(&mut state.callbacks)
    }

    fn run_callbacks(&self, callbacks: Vec<CompletionCallback>) {
        if self.success() {
            self.inner.watchers.notify(&Progress {
                fraction: Some(1.0),
                time_elapsed: Some(self.elapsed().as_secs_f64()),
                ..Progress::named(self.label())
            });
        }
        self.inner.watchers.clear();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
                tracing::error!(status = %self, "status callback panicked");
            }
        }
    }

    fn expire(&self) {
        let hook = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.on_timeout.take()
        };

        let budget = self.inner.timeout.unwrap_or_default() + self.inner.settle_time;
        tracing::warn!(status = %self, "timeout after {:.2} seconds", budget.as_secs_f64());
        if let Some(hook) = hook {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                tracing::error!(status = %self, "timeout hook panicked");
            }
        }
        self.resolve(StatusPhase::Failed(HwError::StatusTimeout(format!(
            "{} failed to complete within {:.3}s",
            self.describe_target(),
            budget.as_secs_f64()
        ))));
    }

    fn describe_target(&self) -> &str {
        if self.inner.label.is_empty() {
            "status"
        } else {
            &self.inner.label
        }
    }

    /// Register a callback run once when the Status finishes.
    ///
    /// If the Status already finished, the callback runs immediately in
    /// the caller's context and is not retained.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Status) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.phase.is_terminal() {
            drop(state);
            callback(self);
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }

    fn block(&self, timeout: Option<Duration>) -> HwResult<StatusPhase> {
        let mut state = self.inner.state.lock();
        match timeout {
            None => {
                while !state.phase.is_terminal() {
                    self.inner.cond.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.phase.is_terminal() {
                    if self.inner.cond.wait_until(&mut state, deadline).timed_out()
                        && !state.phase.is_terminal()
                    {
                        return Err(HwError::WaitTimeout(self.describe_target().to_string()));
                    }
                }
            }
        }
        Ok(state.phase.clone())
    }

    /// Block the calling thread until the Status finishes.
    ///
    /// Returns the captured error if the action failed, or
    /// [`HwError::WaitTimeout`] if `timeout` elapsed first. The local
    /// timeout does not affect the Status itself.
    pub fn wait(&self, timeout: Option<Duration>) -> HwResult<()> {
        match self.block(timeout)? {
            StatusPhase::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Block like [`wait`](Self::wait) but return the captured error
    /// instead of raising it (`None` on success).
    pub fn exception(&self, timeout: Option<Duration>) -> HwResult<Option<HwError>> {
        match self.block(timeout)? {
            StatusPhase::Failed(err) => Ok(Some(err)),
            _ => Ok(None),
        }
    }

    /// Wait for the Status without blocking the executor.
    pub async fn wait_async(&self, timeout: Option<Duration>) -> HwResult<()> {
        let mut rx = self.inner.done_tx.subscribe();
        let finished = async move { rx.wait_for(|done| *done).await.map(|_| ()) };
        let outcome = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, finished)
                .await
                .map_err(|_| HwError::WaitTimeout(self.describe_target().to_string()))?,
            None => finished.await,
        };
        outcome.map_err(|_| HwError::InvalidState(format!("{self} was dropped")))?;

        match self.phase() {
            StatusPhase::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// A Status that succeeds when both `self` and `other` succeed, and
    /// fails as soon as either fails with that branch's error.
    pub fn and(&self, other: &Status) -> Status {
        let label = format!("({} & {})", self.describe_target(), other.describe_target());
        Self::combine(label, [self.clone(), other.clone()])
    }

    /// A Status that succeeds when every Status in `statuses` succeeds.
    ///
    /// An empty set yields an already finished Status.
    pub fn all(statuses: impl IntoIterator<Item = Status>) -> Status {
        let statuses: Vec<Status> = statuses.into_iter().collect();
        let label = statuses
            .iter()
            .map(|s| s.describe_target().to_string())
            .collect::<Vec<_>>()
            .join(" & ");
        Self::combine(format!("({label})"), statuses)
    }

    fn combine(label: String, statuses: impl IntoIterator<Item = Status>) -> Status {
        let statuses: Vec<Status> = statuses.into_iter().collect();
        let combined = Status::new(StatusOptions::default().label(label));
        if statuses.is_empty() {
            combined.resolve(StatusPhase::Succeeded);
            return combined;
        }

        // Branches live until the combined Status resolves.
        let branches = statuses.clone();
        combined.add_callback(move |_| drop(branches));

        let remaining = Arc::new(AtomicUsize::new(statuses.len()));
        for branch in statuses {
            let combined = combined.clone();
            let remaining = Arc::clone(&remaining);
            branch.add_callback(move |finished| match finished.phase() {
                StatusPhase::Failed(err) => {
                    combined.resolve(StatusPhase::Failed(err));
                }
                _ => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        combined.resolve(StatusPhase::Succeeded);
                    }
                }
            });
        }
        combined
    }

    /// Weak handle that does not keep the Status alive.
    pub fn downgrade(&self) -> WeakStatus {
        WeakStatus {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl std::ops::BitAnd for &Status {
    type Output = Status;

    fn bitand(self, rhs: &Status) -> Status {
        self.and(rhs)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = self.phase();
        write!(
            f,
            "Status({}, done={}, success={})",
            self.describe_target(),
            phase.is_terminal(),
            phase.is_success()
        )
    }
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("label", &self.inner.label)
            .field("phase", &self.phase())
            .field("timeout", &self.inner.timeout)
            .field("settle_time", &self.inner.settle_time)
            .finish()
    }
}

/// Non-owning reference to a [`Status`].
#[derive(Clone)]
pub struct WeakStatus {
    inner: Weak<Inner>,
}

impl WeakStatus {
    /// Recover the Status if it is still alive.
    pub fn upgrade(&self) -> Option<Status> {
        self.inner.upgrade().map(|inner| Status { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_set_finished_twice() {
        let status = Status::new(StatusOptions::default());
        status.set_finished().unwrap();
        assert!(status.done());
        assert!(status.success());
        assert!(matches!(status.set_finished(), Err(HwError::InvalidState(_))));
        assert!(matches!(
            status.set_exception(HwError::Backend("late".into())),
            Err(HwError::InvalidState(_))
        ));
    }

    #[test]
    fn test_set_exception() {
        let status = Status::new(StatusOptions::default());
        status.set_exception(HwError::Backend("ioc down".into())).unwrap();
        assert!(status.done());
        assert!(!status.success());
        assert_eq!(status.wait(None), Err(HwError::Backend("ioc down".into())));
        assert_eq!(
            status.exception(None),
            Ok(Some(HwError::Backend("ioc down".into())))
        );
    }

    #[test]
    fn test_timeout_fails_status() {
        let status = Status::new(StatusOptions::default().timeout(ms(50)));
        let start = Instant::now();
        let err = status.wait(None).unwrap_err();
        assert!(matches!(err, HwError::StatusTimeout(_)));
        assert!(start.elapsed() >= ms(45));
    }

    #[test]
    fn test_local_wait_timeout_is_distinct() {
        let status = Status::new(StatusOptions::default());
        assert!(matches!(status.wait(Some(ms(20))), Err(HwError::WaitTimeout(_))));
        assert!(!status.done());
        status.set_finished().unwrap();
        assert_eq!(status.wait(Some(ms(20))), Ok(()));
    }

    #[test]
    fn test_settle_time_delays_success() {
        let status = Status::new(StatusOptions::default().settle_time(ms(100)));
        let (tx, rx) = std::sync::mpsc::channel();
        status.add_callback(move |_| {
            let _ = tx.send(Instant::now());
        });

        let start = Instant::now();
        status.set_finished().unwrap();
        assert!(!status.done());
        assert!(matches!(status.set_finished(), Err(HwError::InvalidState(_))));

        status.wait(None).unwrap();
        assert!(start.elapsed() >= ms(95));
        let fired_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired_at - start >= ms(95));
    }

    #[test]
    fn test_failure_ignores_settle_time() {
        let status = Status::new(StatusOptions::default().settle_time(Duration::from_secs(5)));
        let start = Instant::now();
        status.set_exception(HwError::Stopped("mtr".into())).unwrap();
        assert!(status.done());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_timeout_covers_settle_time() {
        let status = Status::new(
            StatusOptions::default()
                .timeout(ms(30))
                .settle_time(Duration::from_secs(5)),
        );
        status.set_finished().unwrap();
        let err = status.wait(Some(Duration::from_secs(2))).unwrap_err();
        assert!(matches!(err, HwError::StatusTimeout(_)));
    }

    #[test]
    fn test_add_callback_after_done_runs_immediately() {
        let status = Status::finished();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        status.add_callback(move |s| {
            assert!(s.success());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callbacks_run_exactly_once() {
        let status = Status::new(StatusOptions::default());
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&hits);
            status.add_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        status.set_finished().unwrap();
        let _ = status.set_finished();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_racing_completions_have_one_winner() {
        for _ in 0..50 {
            let status = Status::new(StatusOptions::default());
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let status = status.clone();
                    thread::spawn(move || {
                        if i % 2 == 0 {
                            status.set_finished().is_ok()
                        } else {
                            status.set_exception(HwError::Backend("lost".into())).is_ok()
                        }
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert!(status.done());
        }
    }

    #[test]
    fn test_and_succeeds_when_both_succeed() {
        let a = Status::new(StatusOptions::default().label("a"));
        let b = Status::new(StatusOptions::default().label("b"));
        let both = &a & &b;
        a.set_finished().unwrap();
        assert!(!both.done());
        b.set_finished().unwrap();
        assert!(both.success());
        assert_eq!(both.label(), "(a & b)");
    }

    #[test]
    fn test_and_fails_with_first_error() {
        let a = Status::new(StatusOptions::default());
        let b = Status::new(StatusOptions::default());
        let both = a.and(&b);
        a.set_exception(HwError::Stopped("a".into())).unwrap();
        assert_eq!(both.error(), Some(HwError::Stopped("a".into())));

        b.set_finished().unwrap();
        assert_eq!(both.error(), Some(HwError::Stopped("a".into())));
    }

    #[test]
    fn test_all_of_nothing_is_finished() {
        assert!(Status::all(Vec::new()).success());
    }

    #[test]
    fn test_on_timeout_hook_runs_before_failure() {
        let status = Status::new(StatusOptions::default().timeout(ms(20)));
        let stopped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stopped);
        status.on_timeout(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(status.wait(None).is_err());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(StatusPhase::Pending.to_string(), "Pending");
        assert_eq!(
            StatusPhase::Failed(HwError::Stopped("m".into())).to_string(),
            "Failed: Stopped: m"
        );
    }

    #[tokio::test]
    async fn test_wait_async() {
        let status = Status::new(StatusOptions::default().settle_time(ms(20)));
        status.set_finished().unwrap();
        status.wait_async(Some(Duration::from_secs(2))).await.unwrap();

        let pending = Status::new(StatusOptions::default());
        let err = pending.wait_async(Some(ms(10))).await.unwrap_err();
        assert!(matches!(err, HwError::WaitTimeout(_)));
    }

    #[test]
    fn test_dropped_status_still_times_out() {
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let status = Status::new(StatusOptions::default().timeout(ms(10)));
            status.add_callback(move |finished| {
                let _ = tx.send(finished.error());
            });
        }
        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(outcome, Some(HwError::StatusTimeout(_))));
    }

    #[test]
    fn test_dropped_settling_branch_completes_combined() {
        let a = Status::new(StatusOptions::default().label("a").settle_time(ms(20)));
        let both = a.and(&Status::finished());
        a.set_finished().unwrap();
        drop(a);
        both.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(both.success());
    }

    #[test]
    fn test_dropped_timed_branch_fails_combined() {
        let both = Status::new(StatusOptions::default().timeout(ms(20))).and(&Status::finished());
        let err = both.wait(Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, HwError::StatusTimeout(_)));
    }

    #[test]
    fn test_all_keeps_pending_branches_alive() {
        let a = Status::new(StatusOptions::default().label("a"));
        let weak = a.downgrade();
        let all = Status::all([a]);
        assert!(weak.upgrade().is_some());
        weak.upgrade().unwrap().set_finished().unwrap();
        assert!(all.success());
    }
}
