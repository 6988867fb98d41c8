//! Caller-driven progress.
//!
//! Nothing in the provider runs on a thread of its own. Queues that need
//! remote work to happen before they can return entries carry a
//! [`ProgressSlot`]; blocking reads hand their remaining budget to whatever
//! source sits in the slot and fall back to a condition variable when the slot
//! is empty. Every source returns the part of the budget it did not use so
//! several sources can share one deadline.

use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use segfab_transport::Timeout;

use crate::error::{FabricError, FabricResult};

/// Longest stretch a source blocks before handing control back to the
/// queue that drove it.
pub(crate) const PROGRESS_SLICE: Duration = Duration::from_millis(1);

/// `budget` capped at one [`PROGRESS_SLICE`].
pub(crate) fn slice(budget: Timeout) -> Timeout {
    match budget {
        Timeout::Infinite => Timeout::After(PROGRESS_SLICE),
        Timeout::After(left) => Timeout::After(left.min(PROGRESS_SLICE)),
    }
}

/// Something that can advance pending work.
pub trait Progress: Send + Sync {
    /// Drives work for at most `budget` and returns the unused remainder.
    fn progress(&self, budget: Timeout) -> Timeout;
}

struct ProgressHook {
    source: Weak<dyn Progress>,
}

/// Holds the progress source attached to a queue.
///
/// Sources are held weakly: a queue outliving its endpoint simply stops
/// driving it.
#[derive(Default)]
pub struct ProgressSlot {
    hook: ArcSwapOption<ProgressHook>,
}

impl ProgressSlot {
    pub fn set(&self, source: Weak<dyn Progress>) {
        self.hook.store(Some(Arc::new(ProgressHook { source })));
    }

    /// Detaches `source` unless another source replaced it meanwhile.
    pub fn release(&self, source: &Weak<dyn Progress>) {
        self.hook.rcu(|current| match current {
            Some(hook) if hook.source.ptr_eq(source) => None,
            other => other.clone(),
        });
    }

    /// True when a live source is attached.
    pub fn is_set(&self) -> bool {
        self.hook
            .load()
            .as_ref()
            .is_some_and(|hook| hook.source.strong_count() > 0)
    }

    /// Runs the attached source; `None` when there is nothing to run.
    pub fn run(&self, budget: Timeout) -> Option<Timeout> {
        let hook = self.hook.load_full()?;
        let source = hook.source.upgrade()?;
        Some(source.progress(budget))
    }
}

impl std::fmt::Debug for ProgressSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Edge-counting wakeup for queues without a progress source.
#[derive(Debug, Default)]
pub struct Wakeup {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl Wakeup {
    /// Current epoch; pass it to [`Wakeup::wait_past`] to avoid lost wakeups.
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Blocks until the epoch moves past `seen` or `timeout` runs out.
    /// Returns true when woken.
    pub fn wait_past(&self, seen: u64, timeout: Timeout) -> bool {
        let deadline = timeout.start();
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            match deadline.remaining() {
                Timeout::Infinite => self.cv.wait(&mut epoch),
                Timeout::After(left) if left.is_zero() => return false,
                Timeout::After(left) => {
                    self.cv.wait_for(&mut epoch, left);
                }
            }
        }
        true
    }
}

/// Retries `attempt` until it stops reporting `Again` or `timeout` expires,
/// calling `block` with the remaining budget between attempts.
///
/// Expiry surfaces the last `Again`, which is what non-blocking readers see.
pub(crate) fn retry_until<T>(
    timeout: Timeout,
    mut attempt: impl FnMut() -> FabricResult<T>,
    mut block: impl FnMut(Timeout),
) -> FabricResult<T> {
    let deadline = timeout.start();
    loop {
        match attempt() {
            Err(FabricError::Again) => {}
            other => return other,
        }
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(FabricError::Again);
        }
        block(remaining);
    }
}
