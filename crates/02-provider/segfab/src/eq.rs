//! Event queues for control-plane events.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use segfab_transport::Timeout;
use tracing::{debug, trace};

use crate::cq::WaitObj;
use crate::error::{self, FabricError, FabricResult};
use crate::flags::Flags;
use crate::info::Info;
use crate::progress::{retry_until, ProgressSlot, Wakeup};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A peer asked to connect to a passive endpoint.
    ConnReq,
    /// An endpoint finished connecting or accepting.
    Connected,
    /// An endpoint was shut down.
    Shutdown,
    /// Event written by the application.
    User(u32),
}

/// One control-plane event.
#[derive(Clone, Debug)]
pub struct EqEntry {
    pub event: EventKind,
    /// Object the event refers to.
    pub fid: u64,
    pub context: u64,
    /// Connection details for `ConnReq`.
    pub info: Option<Info>,
    pub data: Vec<u8>,
    /// Positive error number for error entries.
    pub err: i32,
    pub prov_errno: i32,
}

impl EqEntry {
    pub fn new(event: EventKind, fid: u64) -> Self {
        Self {
            event,
            fid,
            context: 0,
            info: None,
            data: Vec::new(),
            err: 0,
            prov_errno: 0,
        }
    }

    pub(crate) fn with_info(mut self, info: Info) -> Self {
        self.info = Some(info);
        self
    }

    pub(crate) fn failed(mut self, err: &FabricError) -> Self {
        self.err = err.errno();
        self.prov_errno = err.errno();
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EqAttr {
    pub size: usize,
    pub wait_obj: WaitObj,
}

#[derive(Debug, Default)]
struct Queues {
    events: VecDeque<EqEntry>,
    errors: VecDeque<EqEntry>,
}

/// An event queue opened on a fabric. Always locked: control events are
/// rare and may come from any thread.
pub struct EventQueue {
    fid: u64,
    queues: Mutex<Queues>,
    progress: ProgressSlot,
    wakeup: Wakeup,
}

impl EventQueue {
    pub(crate) fn open(fid: u64, attr: EqAttr) -> FabricResult<Self> {
        attr.wait_obj.check()?;
        debug!(fid, "opened event queue");
        Ok(Self {
            fid,
            queues: Mutex::new(Queues {
                events: VecDeque::with_capacity(attr.size),
                errors: VecDeque::new(),
            }),
            progress: ProgressSlot::default(),
            wakeup: Wakeup::default(),
        })
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    /// Non-blocking read; `PEEK` leaves the event queued.
    pub fn read(&self, flags: Flags) -> FabricResult<EqEntry> {
        self.sread(Timeout::ZERO, flags)
    }

    /// Blocking read. Fails with `Avail` as soon as an error event is pending.
    pub fn sread(&self, timeout: Timeout, flags: Flags) -> FabricResult<EqEntry> {
        let peek = flags.contains(Flags::PEEK);
        let epoch = Cell::new(0);
        retry_until(
            timeout,
            || {
                epoch.set(self.wakeup.epoch());
                self.progress.run(Timeout::ZERO);
                let mut queues = self.queues.lock();
                if !queues.errors.is_empty() {
                    return Err(FabricError::Avail);
                }
                take(&mut queues.events, peek)
            },
            |remaining| {
                if self.progress.run(remaining).is_none() {
                    self.wakeup.wait_past(epoch.get(), remaining);
                }
            },
        )
    }

    pub fn readerr(&self, flags: Flags) -> FabricResult<EqEntry> {
        take(&mut self.queues.lock().errors, flags.contains(Flags::PEEK))
    }

    /// Queues an application event.
    pub fn write(&self, event: u32, data: &[u8]) {
        let mut entry = EqEntry::new(EventKind::User(event), self.fid);
        entry.data = data.to_vec();
        self.push(entry);
    }

    pub fn strerror(&self, prov_errno: i32) -> &'static str {
        error::strerror(prov_errno)
    }

    /// Events and error events currently queued.
    pub fn pending(&self) -> (usize, usize) {
        let queues = self.queues.lock();
        (queues.events.len(), queues.errors.len())
    }

    pub(crate) fn push(&self, entry: EqEntry) {
        trace!(eq = self.fid, event = ?entry.event, err = entry.err, "event");
        {
            let mut queues = self.queues.lock();
            if entry.err != 0 {
                queues.errors.push_back(entry);
            } else {
                queues.events.push_back(entry);
            }
        }
        if !self.progress.is_set() {
            self.wakeup.notify();
        }
    }

    pub(crate) fn progress_slot(&self) -> &ProgressSlot {
        &self.progress
    }
}

fn take(queue: &mut VecDeque<EqEntry>, peek: bool) -> FabricResult<EqEntry> {
    let entry = if peek {
        queue.front().cloned()
    } else {
        queue.pop_front()
    };
    entry.ok_or(FabricError::Again)
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (events, errors) = self.pending();
        f.debug_struct("EventQueue")
            .field("fid", &self.fid)
            .field("events", &events)
            .field("errors", &errors)
            .finish()
    }
}
