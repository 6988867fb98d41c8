//! Timeout budgets shared by every blocking call in the workspace.
//!
//! Blocking APIs take a [`Timeout`] and the progress machinery hands back the
//! part of the budget it did not use, so several progress sources can be
//! chained within a single deadline.

use std::time::{Duration, Instant};

/// Upper bound on how long a call may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the awaited condition holds.
    Infinite,
    /// Block for at most this long; `Duration::ZERO` means poll.
    After(Duration),
}

impl Timeout {
    /// Poll once without blocking.
    pub const ZERO: Timeout = Timeout::After(Duration::ZERO);

    /// Maps the conventional millisecond argument: negative means infinite.
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Timeout::Infinite
        } else {
            Timeout::After(Duration::from_millis(ms as u64))
        }
    }

    /// Inverse of [`Timeout::from_millis`].
    pub fn as_millis(&self) -> i64 {
        match self {
            Timeout::Infinite => -1,
            Timeout::After(d) => d.as_millis().min(i64::MAX as u128) as i64,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Timeout::After(d) if d.is_zero())
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Timeout::Infinite)
    }

    /// Duration form for APIs that need one; `None` means wait forever.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::After(d) => Some(*d),
        }
    }

    /// Starts counting this budget down from now.
    pub fn start(self) -> Deadline {
        Deadline {
            started: Instant::now(),
            budget: self,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(value: Duration) -> Self {
        Timeout::After(value)
    }
}

/// A [`Timeout`] anchored at the instant it started.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    budget: Timeout,
}

impl Deadline {
    /// Budget left; saturates at zero.
    pub fn remaining(&self) -> Timeout {
        match self.budget {
            Timeout::Infinite => Timeout::Infinite,
            Timeout::After(total) => Timeout::After(total.saturating_sub(self.started.elapsed())),
        }
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}
