//! Long-running worker roles and their timing policies.
//!
//! | Role | Module | Trigger | Timing |
//! |------|--------|---------|--------|
//! | Search | [`search`] | broker deliveries on `query.<id>` | fixed re-subscribe delay |
//! | Archive | [`poll`] | self-paced, persisted cursor | [`Backoff`] |
//! | Feed | [`poll`] | self-paced, no cursor | [`Backoff`] |
//! | Release | [`release`] | timer | fixed interval |
//!
//! Every role returns `Ok(())` promptly once its token is cancelled. A
//! unit of work that already started runs to completion first.

pub mod poll;
pub mod release;
pub mod search;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay policy for self-paced workers.
///
/// The first cycle runs immediately. Success resets the delay to `base`;
/// failure doubles it (or sets it to `base` when it was zero), never past
/// `max`.
///
/// ```text
/// fail -> base, fail -> 2*base, fail -> 4*base, ok -> base
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: Duration::ZERO,
        }
    }

    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn on_success(&mut self) -> Duration {
        self.current = self.base;
        self.current
    }

    pub fn on_failure(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            self.base
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
        self.current
    }
}

/// Sleep for `delay`. Returns `false` if `cancel` fired first.
pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
