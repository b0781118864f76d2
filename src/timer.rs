//! Background timer runtime.
//!
//! Status timeouts, settle delays and simulated motion run on a small
//! dedicated tokio runtime that is started lazily on first use and lives for
//! the rest of the process. Timers therefore fire even when the caller has
//! no runtime of its own or is blocked in `Status::wait()` on a
//! current-thread runtime.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

static TIMER_RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

fn runtime() -> Option<&'static Runtime> {
    TIMER_RUNTIME
        .get_or_init(|| {
            Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("device-contract-timer")
                .enable_time()
                .build()
                .map_err(|err| tracing::error!(%err, "failed to start timer runtime"))
                .ok()
        })
        .as_ref()
}

/// Spawn a future on the timer runtime.
///
/// Falls back to the caller's runtime if the timer runtime could not be
/// started; returns `None` if neither is available.
pub(crate) fn spawn<F>(future: F) -> Option<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match runtime() {
        Some(rt) => Some(rt.spawn(future)),
        None => Handle::try_current().ok().map(|handle| handle.spawn(future)),
    }
}

/// Run `action` after `delay` on the timer runtime.
///
/// Without any runtime the delay is served by a detached OS thread.
pub(crate) fn schedule<F>(delay: Duration, action: F)
where
    F: FnOnce() + Send + 'static,
{
    let action = std::sync::Arc::new(parking_lot::Mutex::new(Some(action)));
    let deferred = std::sync::Arc::clone(&action);
    let spawned = spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(action) = deferred.lock().take() {
            action();
        }
    });
    if spawned.is_none() {
        if let Err(err) = schedule_on_thread(delay, action) {
            tracing::error!(%err, ?delay, "failed to start timer thread, action dropped");
        }
    }
}

fn schedule_on_thread<F>(
    delay: Duration,
    action: std::sync::Arc<parking_lot::Mutex<Option<F>>>,
) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name("device-contract-timer".into())
        .spawn(move || {
            std::thread::sleep(delay);
            if let Some(action) = action.lock().take() {
                action();
            }
        })
        .map(drop)
}
