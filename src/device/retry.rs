// src/device/retry.rs

//! Bounded exponential backoff for transport calls

use crate::error::{Error, Result};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// How a single transport attempt failed
#[derive(Debug)]
pub enum CallError {
    /// Connection-level failure; the call may be retried after reconnecting
    Transient(String),
    /// Final outcome, returned to the caller unchanged
    Fatal(Error),
}

impl From<Error> for CallError {
    fn from(err: Error) -> Self {
        CallError::Fatal(err)
    }
}

/// Retry budget for one transport call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based; the first retry is
    /// attempt 2)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails fatally, or the budget runs out
    ///
    /// `op` receives the 1-based attempt number so it can reconnect before
    /// any attempt after the first.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> std::result::Result<T, CallError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                thread::sleep(self.backoff(attempt));
            }
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(CallError::Fatal(err)) => return Err(err),
                Err(CallError::Transient(msg)) => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, msg);
                    last = msg;
                }
            }
        }

        Err(Error::Connection(format!(
            "{} failed after {} attempt(s): {}",
            what, attempts, last
        )))
    }
}
