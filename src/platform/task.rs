//! Bounded polling for remote tasks

use std::time::{Duration, Instant};

use super::{ObjectRef, Platform, TaskRef, TaskState};
use crate::error::PlatformError;
use crate::{Error, Result};

/// How long to wait and how often to look
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Call `check` until it yields a value, failing with [`Error::Timeout`]
/// once `settings.timeout` has elapsed.
pub fn poll_until<T, F>(operation: &str, settings: PollSettings, mut check: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = check()? {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= settings.timeout {
            tracing::warn!(operation, timeout = ?settings.timeout, "Gave up waiting");
            return Err(Error::Timeout {
                operation: operation.to_string(),
                after: settings.timeout,
                handle: None,
            });
        }

        std::thread::sleep(settings.interval.min(settings.timeout - elapsed));
    }
}

/// Wait for a task to finish, returning the object it produced.
///
/// A task that ends in error surfaces as [`PlatformError::Fault`] with the
/// remote diagnostic text.
pub fn wait_for_task(
    platform: &dyn Platform,
    task: &TaskRef,
    operation: &str,
    settings: PollSettings,
) -> Result<Option<ObjectRef>> {
    tracing::debug!(task = %task.0, operation, "Waiting for task");
    poll_until(operation, settings, || match platform.task_state(task)? {
        TaskState::Success(result) => Ok(Some(result)),
        TaskState::Error(message) => Err(Error::Platform(PlatformError::Fault(message))),
        TaskState::Queued | TaskState::Running => Ok(None),
    })
}
