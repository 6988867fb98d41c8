use std::fmt;

use segfab_transport::Timeout;

use crate::cq::WaitObj;
use crate::error::{FabricError, FabricResult};
use crate::lock::{CounterCell, LockMode};
use crate::progress::ProgressSlot;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterAttr {
    pub wait_obj: WaitObj,
}

/// Completion counter with a separate error count.
pub struct Counter {
    fid: u64,
    domain_fid: u64,
    value: CounterCell,
    errors: CounterCell,
    progress: ProgressSlot,
}

impl Counter {
    pub(crate) fn open(fid: u64, domain_fid: u64, mode: LockMode, attr: CounterAttr) -> FabricResult<Self> {
        attr.wait_obj.check()?;
        Ok(Self {
            fid,
            domain_fid,
            value: CounterCell::new(mode),
            errors: CounterCell::new(mode),
            progress: ProgressSlot::default(),
        })
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn domain_fid(&self) -> u64 {
        self.domain_fid
    }

    /// Current value after one round of progress.
    pub fn read(&self) -> u64 {
        self.progress.run(Timeout::ZERO);
        self.value.get()
    }

    /// Current error count after one round of progress.
    pub fn readerr(&self) -> u64 {
        self.progress.run(Timeout::ZERO);
        self.errors.get()
    }

    pub fn add(&self, delta: u64) {
        self.value.add(delta);
    }

    pub fn set(&self, value: u64) {
        self.value.set(value);
    }

    pub fn adderr(&self, delta: u64) {
        self.errors.add(delta);
    }

    pub fn seterr(&self, value: u64) {
        self.errors.set(value);
    }

    /// Drives progress until the counter reaches `threshold`.
    ///
    /// Fails with `TimedOut` when the budget runs out and with `Avail` when
    /// the error count moves while waiting.
    pub fn wait(&self, threshold: u64, timeout: Timeout) -> FabricResult<()> {
        let errors = self.readerr();
        let deadline = timeout.start();
        loop {
            if self.read() >= threshold {
                return Ok(());
            }
            if self.readerr() != errors {
                return Err(FabricError::Avail);
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return Err(FabricError::TimedOut);
            }
            if self.progress.run(remaining).is_none() {
                std::thread::yield_now();
            }
        }
    }

    pub(crate) fn progress_slot(&self) -> &ProgressSlot {
        &self.progress
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("fid", &self.fid)
            .field("value", &self.value.get())
            .field("errors", &self.errors.get())
            .finish()
    }
}
