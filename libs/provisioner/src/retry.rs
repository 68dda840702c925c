//! Bounded fixed-delay retry loops.
//!
//! Every convergence wait in the worker shares the same shape: call, sleep a
//! fixed delay, call again, give up after a bounded number of attempts or a
//! wall-clock cap. Shutdown interrupts the sleep promptly.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::shutdown;

#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub attempts: u32,
    pub delay: Duration,
    pub max_duration: Option<Duration>,
}

impl RetrySchedule {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            max_duration: None,
        }
    }

    pub const fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }
}

/// Call `body` until it stops returning [`Error::TryAgain`].
///
/// Any other outcome is returned as-is. Exhausting the schedule yields a
/// fatal error; a shutdown request yields [`Error::Dying`].
pub async fn call<F, Fut, T>(
    schedule: RetrySchedule,
    shutdown_rx: &mut watch::Receiver<bool>,
    mut body: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    for attempt in 0..schedule.attempts {
        if attempt > 0 {
            tokio::select! {
                biased;
                _ = shutdown::wait(shutdown_rx) => return Err(Error::Dying),
                _ = tokio::time::sleep(schedule.delay) => {}
            }
            if let Some(max) = schedule.max_duration {
                if started.elapsed() >= max {
                    break;
                }
            }
        }
        match body().await {
            Err(Error::TryAgain) => continue,
            other => return other,
        }
    }
    Err(Error::other("retry budget exhausted"))
}
