//! 🔄 Retry — exponential backoff as an explicit state machine.
//!
//! 🎬 *[the cluster returns 429. our hero waits half a second. 429 again.]*
//! *[one second. two. four. the music swells. 200 OK.]*
//!
//! No hidden loops, no magic decorator. A [`Backoff`] knows which attempt it is
//! on, what the next delay will be, where the ceiling is, and when to stop.
//! Callers ask it what to do after each failure and it answers with a
//! [`RetryDecision`]. The terminal state is `GiveUp`, and there is no way back. 🦆

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::errors::MigrationError;

/// 🔧 How stubborn to be. Shared by the bulk loader and the source extractor.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 🎯 Total attempts including the first one. `1` means "no retries".
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 🧱 The ceiling. Delays grow until they hit it, then stay there.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            max_attempts: self.max_attempts.max(1),
            attempt: 1,
            next_delay: Duration::from_millis(self.initial_backoff_ms),
            ceiling: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            multiplier: if self.multiplier.is_finite() && self.multiplier >= 1.0 {
                self.multiplier
            } else {
                1.0
            },
            gave_up: false,
        }
    }
}

/// 🚦 What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// ⏳ Sleep this long, then try again.
    RetryAfter(Duration),
    /// 🛑 Terminal. Either the failure was permanent or we ran out of attempts.
    GiveUp,
}

/// 🎰 One operation's retry state: attempt number, next delay, ceiling, terminal flag.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    max_attempts: u32,
    attempt: u32,
    next_delay: Duration,
    ceiling: Duration,
    multiplier: f64,
    gave_up: bool,
}

impl Backoff {
    /// 🔢 The attempt currently in flight, starting at 1.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 🔄 Record a failure and decide. `transient == false` jumps straight to `GiveUp`.
    pub(crate) fn on_failure(&mut self, transient: bool) -> RetryDecision {
        if self.gave_up || !transient || self.attempt >= self.max_attempts {
            self.gave_up = true;
            return RetryDecision::GiveUp;
        }
        let delay = self.next_delay.min(self.ceiling);
        self.attempt += 1;
        self.next_delay = self.next_delay.mul_f64(self.multiplier).min(self.ceiling);
        RetryDecision::RetryAfter(delay)
    }
}

/// 🔁 Run `op` until it succeeds, fails permanently, or the policy runs out.
///
/// Only errors for which [`MigrationError::is_transient`] holds are retried.
/// The last error is returned as-is once we give up.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, MigrationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MigrationError>>,
{
    let mut backoff = policy.backoff();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.on_failure(err.is_transient()) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        "🔄 {what} failed (attempt {} of {}), retrying in {:?}: {err}",
                        backoff.attempt() - 1,
                        backoff.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(err),
            },
        }
    }
}
