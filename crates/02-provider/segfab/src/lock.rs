//! Per-object locking chosen once from the domain's threading level.
//!
//! Objects that the threading contract promises to serialize skip the mutex
//! and use a [`SerialCell`] instead. The cell still tracks ownership with an
//! atomic flag and panics when two threads overlap, so a caller that breaks
//! the contract gets a loud failure rather than a data race.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Threading guarantees the application gives the provider, weakest first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Threading {
    #[default]
    Unspec,
    Safe,
    Fid,
    Domain,
    Completion,
    Endpoint,
}

/// Synchronization strategy of one object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Locked,
    Serialized,
}

impl LockMode {
    /// Completion queues, event queues and counters.
    pub fn for_queues(threading: Threading) -> Self {
        if threading < Threading::Completion {
            LockMode::Locked
        } else {
            LockMode::Serialized
        }
    }

    /// Endpoint send and receive state.
    pub fn for_endpoint(threading: Threading) -> Self {
        if threading < Threading::Fid {
            LockMode::Locked
        } else {
            LockMode::Serialized
        }
    }
}

/// Cell for state the caller promises never to touch from two threads at once.
pub struct SerialCell<T> {
    busy: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is gated by the `busy` flag, which only one
// thread can win at a time; losers panic instead of touching the value.
unsafe impl<T: Send> Sync for SerialCell<T> {}

impl<T> SerialCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Runs `f` with exclusive access.
    ///
    /// # Panics
    ///
    /// Panics if another call is in progress, from this or another thread.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("serialized object accessed concurrently; raise the domain threading level");
        }
        let _release = Release(&self.busy);
        // SAFETY: the busy flag was acquired above and is held until `_release`
        // drops, so no other reference to the value exists.
        f(unsafe { &mut *self.value.get() })
    }

    /// Like [`SerialCell::with`] but returns `None` instead of panicking
    /// when the cell is busy.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        let _release = Release(&self.busy);
        // SAFETY: as in `with`.
        Some(f(unsafe { &mut *self.value.get() }))
    }
}

impl<T> fmt::Debug for SerialCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialCell")
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct Release<'a>(&'a AtomicBool);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State behind either a mutex or a [`SerialCell`], picked at construction.
#[derive(Debug)]
pub enum Guarded<T> {
    Locked(Mutex<T>),
    Serialized(SerialCell<T>),
}

impl<T> Guarded<T> {
    pub fn new(mode: LockMode, value: T) -> Self {
        match mode {
            LockMode::Locked => Guarded::Locked(Mutex::new(value)),
            LockMode::Serialized => Guarded::Serialized(SerialCell::new(value)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        match self {
            Guarded::Locked(mutex) => f(&mut mutex.lock()),
            Guarded::Serialized(cell) => cell.with(f),
        }
    }

    /// Runs `f` only if the state is free right now. Progress uses this so
    /// that driving an endpoint from a queue never contends with its owner.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        match self {
            Guarded::Locked(mutex) => mutex.try_lock().map(|mut guard| f(&mut guard)),
            Guarded::Serialized(cell) => cell.try_with(f),
        }
    }
}

/// 64-bit counter that either uses read-modify-write atomics or plain
/// load/store pairs when updates are serialized by contract.
#[derive(Debug)]
pub struct CounterCell {
    mode: LockMode,
    value: AtomicU64,
}

impl CounterCell {
    pub fn new(mode: LockMode) -> Self {
        Self {
            mode,
            value: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    pub fn add(&self, delta: u64) -> u64 {
        match self.mode {
            LockMode::Locked => self.value.fetch_add(delta, Ordering::AcqRel) + delta,
            LockMode::Serialized => {
                let next = self.value.load(Ordering::Relaxed).wrapping_add(delta);
                self.value.store(next, Ordering::Release);
                next
            }
        }
    }
}
