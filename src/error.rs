//! Hardware error types.
//!
//! Errors are categorized by where they surface:
//!
//! | Category | Variants | Surfaces as |
//! |----------|----------|-------------|
//! | **Timeout** | `ConnectionTimeout`, `ReadTimeout`, `WriteTimeout`, `StatusTimeout` | Failed [`Status`](crate::Status) or `Err` from `connect()` |
//! | **Local wait** | `WaitTimeout` | `Err` from `Status::wait()` only; the action may still complete |
//! | **Structural** | `Access`, `InvalidState`, `RedundantStaging`, `UnknownEventType`, `UnknownComponent`, `LimitViolation`, `Unsupported` | `Err` at the call site |
//! | **Action** | `Stopped`, `Transform`, `Backend` | Failed [`Status`](crate::Status) |
//! | **Config** | `Configuration` | `Err` at construction time |
//! | **Collected** | `Bundle` | `Err` from `unstage()` / `stop()` after every step was attempted |
//!
//! `HwError` is `Clone`: a failed Status hands the same error to every
//! waiter and every completion callback.

use thiserror::Error;

/// Errors that can occur in hardware operations.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum HwError {
    // ── Timeouts ────────────────────────────────────────────────────
    /// A binding failed to reach a ready state within its timeout.
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    /// A read did not complete within its allotted time.
    #[error("Read timed out: {0}")]
    ReadTimeout(String),

    /// A write was not acknowledged within its allotted time.
    #[error("Write timed out: {0}")]
    WriteTimeout(String),

    /// A Status reached its own timeout before being marked complete.
    #[error("Status timed out: {0}")]
    StatusTimeout(String),

    /// A local wait deadline elapsed before the awaited Status finished.
    #[error("Status has not completed yet: {0}")]
    WaitTimeout(String),

    // ── Structural errors (raised synchronously) ────────────────────
    /// Write attempted on a read-only or internally managed signal.
    #[error("Access denied: {0}")]
    Access(String),

    /// Operation is not valid in the current state (e.g. double completion).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// `stage()` called on a device that is already (partially) staged.
    #[error("Redundant staging: {0}")]
    RedundantStaging(String),

    /// Subscription requested for an event type the object does not emit.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// No component with the given name or dotted path.
    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    /// Requested value lies outside the configured limits.
    #[error("Limit violation: {0}")]
    LimitViolation(String),

    /// The object does not support the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // ── Action errors (surface through a failed Status) ─────────────
    /// Motion or acquisition was halted by `stop()`.
    #[error("Stopped: {0}")]
    Stopped(String),

    /// A coordinate transform rejected its input.
    #[error("Transform error: {0}")]
    Transform(String),

    /// Error reported by the protocol binding.
    #[error("Backend error: {0}")]
    Backend(String),

    // ── Configuration ───────────────────────────────────────────────
    /// Invalid construction-time or runtime configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ── Collected failures ──────────────────────────────────────────
    /// Several independent failures collected by a best-effort operation.
    #[error("{context}: {} error(s): {}", errors.len(), format_bundle(errors))]
    Bundle {
        /// What was being attempted.
        context: String,
        /// `(object name, error)` for every step that failed.
        errors: Vec<(String, HwError)>,
    },
}

fn format_bundle(errors: &[(String, HwError)]) -> String {
    errors
        .iter()
        .map(|(name, err)| format!("{name} raised {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl HwError {
    /// Returns `true` for any timeout raised by the action itself.
    ///
    /// A local [`HwError::WaitTimeout`] is not included: it says nothing
    /// about the action, only that the caller stopped waiting.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout(_)
                | Self::ReadTimeout(_)
                | Self::WriteTimeout(_)
                | Self::StatusTimeout(_)
        )
    }

    /// Returns `true` if this error is transient and the caller may retry.
    pub fn is_transient(&self) -> bool {
        self.is_timeout() || matches!(self, Self::WaitTimeout(_) | Self::Backend(_))
    }

    /// Collect failures into a [`HwError::Bundle`], or `Ok(())` if there are none.
    pub fn bundle(context: impl Into<String>, errors: Vec<(String, HwError)>) -> HwResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Bundle {
                context: context.into(),
                errors,
            })
        }
    }
}

/// Result type for hardware operations.
pub type HwResult<T> = Result<T, HwError>;
