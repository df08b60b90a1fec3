//! Progress tracking for long-running operations.
//!
//! Completion is polled, never pushed. [`ProgressTracker`] runs a bounded
//! deadline loop of short remote waits; abandoning the wait leaves the
//! operation running on the server.

use crate::error::{Error, Result};
use crate::objects::RemoteObject;
use std::time::{Duration, Instant};
use tracing::debug;
use vboxctl_protocol::{codes, ApiRequest, ProgressState};

/// Default remote wait slice.
pub const DEFAULT_POLL: Duration = Duration::from_millis(200);

/// Stand-in deadline for waits too long for `Instant` to represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The instant `wait` from now, saturating instead of overflowing.
pub(crate) fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// One in-flight server-side operation.
#[derive(Debug, Clone)]
pub struct Progress {
    obj: RemoteObject,
}

impl Progress {
    pub(crate) fn new(obj: RemoteObject) -> Self {
        Self { obj }
    }

    /// Current state.
    pub fn state(&self) -> Result<ProgressState> {
        self.obj.invoke(ApiRequest::GetProgressState {
            this: self.obj.handle(),
        })
    }

    /// Returns true once the operation has completed (successfully or not).
    pub fn completed(&self) -> Result<bool> {
        Ok(self.state()?.completed)
    }

    /// Block server-side for up to `timeout` waiting for completion.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        self.obj.invoke(ApiRequest::WaitForCompletion {
            this: self.obj.handle(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Surface a failed result code as an error carrying the error chain.
    pub fn check_result(&self) -> Result<ProgressState> {
        let state = self.state()?;
        if state.completed && state.result_code != codes::S_OK {
            let message = state
                .error
                .first()
                .map(|e| e.text.clone())
                .unwrap_or_else(|| format!("{} failed", state.description));
            return Err(Error::RemoteOperation {
                message,
                result_code: state.result_code,
                chain: state.error,
            });
        }
        Ok(state)
    }

    pub fn release(&self) -> Result<()> {
        self.obj.release()
    }
}

/// Bounded polling of [`Progress`] objects.
#[derive(Debug, Clone, Copy)]
pub struct ProgressTracker {
    poll: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_POLL)
    }
}

impl ProgressTracker {
    /// Tracker issuing remote waits of at most `poll`.
    pub fn new(poll: Duration) -> Self {
        Self { poll }
    }

    /// Wait up to `max_wait` for `progress` to complete.
    ///
    /// Returns `Ok(true)` only if completion is seen before the deadline, and
    /// `Ok(false)` at the deadline; the operation is not cancelled.
    pub fn wait_for_completion(&self, progress: &Progress, max_wait: Duration) -> Result<bool> {
        let deadline = deadline_after(max_wait);
        let transport = progress.obj.transport();

        loop {
            transport.pump(Duration::ZERO);
            let now = Instant::now();
            if now >= deadline {
                debug!(waited = ?max_wait, "progress wait reached deadline");
                return Ok(false);
            }
            if progress.completed()? {
                return Ok(true);
            }
            progress.wait(self.poll.min(deadline - now))?;
        }
    }

    /// Like [`ProgressTracker::wait_for_completion`], but a missed deadline
    /// is an [`Error::TimeoutExceeded`].
    pub fn wait_or_timeout(&self, progress: &Progress, max_wait: Duration, operation: &str) -> Result<()> {
        if self.wait_for_completion(progress, max_wait)? {
            Ok(())
        } else {
            Err(Error::timeout(operation, max_wait))
        }
    }
}
