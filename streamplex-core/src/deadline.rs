//! Deadline bookkeeping for blocking calls

use crate::error::StreamError;
use crate::Result;
use std::sync::{Condvar, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Absolute deadline derived from a caller's timeout; `None` waits forever
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| Instant::now() + t))
    }

    /// Time left, `Ok(None)` when unbounded, `Err(Timeout)` once expired
    pub(crate) fn remaining(&self) -> Result<Option<Duration>> {
        match self.0 {
            None => Ok(None),
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    Err(StreamError::Timeout)
                } else {
                    Ok(Some(at - now))
                }
            }
        }
    }

    /// Park on `cv` until notified or the deadline passes
    pub(crate) fn wait<'a, T>(
        &self,
        cv: &Condvar,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>> {
        match self.remaining()? {
            None => Ok(cv.wait(guard).unwrap_or_else(PoisonError::into_inner)),
            Some(left) => Ok(cv
                .wait_timeout(guard, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0),
        }
    }
}
