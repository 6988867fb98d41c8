//! Completion queues.
//!
//! Entries are recycled through a slab sized by the queue attribute; the
//! success and error streams are separate FIFOs of slab handles. When the
//! application keeps more entries outstanding than the queue was sized for,
//! the slab grows by one batch and the growth is logged; entries are never
//! dropped.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use segfab_interconnect::{InterruptId, LocalInterrupt};
use segfab_transport::{Handle, Slab, Timeout};
use tracing::{debug, trace, warn};

use crate::av::{FiAddr, ADDR_NOTAVAIL};
use crate::context::Provider;
use crate::error::{self, FabricError, FabricResult};
use crate::flags::Flags;
use crate::lock::{Guarded, LockMode};
use crate::progress::{self, retry_until, ProgressSlot, Wakeup};
use crate::segment::HwContext;

/// Queue size used when the attribute leaves it at zero.
pub const DEFAULT_CQ_SIZE: usize = 1024;

/// Fields an entry exposes to [`CompletionQueue::read`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CqFormat {
    #[default]
    Unspec,
    Context,
    Msg,
    Data,
    Tagged,
}

/// Wait object requested for a queue or counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitObj {
    #[default]
    None,
    Unspec,
    Set,
    Fd,
    MutexCond,
}

impl WaitObj {
    pub(crate) fn check(self) -> FabricResult<()> {
        match self {
            WaitObj::None | WaitObj::Unspec => Ok(()),
            _ => Err(FabricError::Inval("unsupported wait object")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CqAttr {
    /// Entries preallocated; zero picks [`DEFAULT_CQ_SIZE`].
    pub size: usize,
    pub format: CqFormat,
    pub wait_obj: WaitObj,
}

/// One completion.
///
/// Message buffers are owned by the operation, so they come back here: `buf`
/// carries the posted buffer of a send or receive once it completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CqEntry {
    /// Application context passed when the operation was posted.
    pub context: u64,
    pub flags: Flags,
    pub len: usize,
    pub buf: Option<Vec<u8>>,
    pub data: u64,
    pub tag: u64,
    /// Bytes that did not fit (truncation) or were not transferred.
    pub olen: usize,
    /// Positive error number; zero for successful completions.
    pub err: i32,
    pub prov_errno: i32,
    pub src_addr: FiAddr,
}

impl Default for CqEntry {
    fn default() -> Self {
        Self {
            context: 0,
            flags: Flags::empty(),
            len: 0,
            buf: None,
            data: 0,
            tag: 0,
            olen: 0,
            err: 0,
            prov_errno: 0,
            src_addr: ADDR_NOTAVAIL,
        }
    }
}

impl CqEntry {
    pub(crate) fn success(context: u64, flags: Flags, len: usize) -> Self {
        Self {
            context,
            flags,
            len,
            ..Self::default()
        }
    }

    pub(crate) fn failure(context: u64, flags: Flags, len: usize, err: &FabricError) -> Self {
        Self {
            context,
            flags,
            len,
            err: err.errno(),
            prov_errno: err.errno(),
            ..Self::default()
        }
    }

    pub(crate) fn with_buf(mut self, buf: Vec<u8>) -> Self {
        self.buf = Some(buf);
        self
    }

    pub(crate) fn with_olen(mut self, olen: usize) -> Self {
        self.olen = olen;
        self
    }

    pub fn is_error(&self) -> bool {
        self.err != 0
    }

    fn masked(mut self, format: CqFormat) -> Self {
        match format {
            CqFormat::Context => {
                self.flags = Flags::empty();
                self.len = 0;
                self.data = 0;
                self.tag = 0;
            }
            CqFormat::Msg => {
                self.data = 0;
                self.tag = 0;
            }
            CqFormat::Data => self.tag = 0,
            CqFormat::Tagged | CqFormat::Unspec => {}
        }
        self
    }
}

/// Occupancy of a completion queue's entry pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CqStats {
    /// Slots allocated, including growth past the configured size.
    pub capacity: usize,
    /// Entries waiting in either stream.
    pub live: usize,
    pub completions: usize,
    pub errors: usize,
    /// Times the pool had to grow past its configured size.
    pub growth_events: usize,
}

#[derive(Debug)]
struct CqPool {
    slab: Slab<CqEntry>,
    success: VecDeque<Handle>,
    errors: VecDeque<Handle>,
    size: usize,
}

impl CqPool {
    fn new(size: usize) -> Self {
        Self {
            slab: Slab::preallocated(size, size.clamp(1, 64)),
            success: VecDeque::with_capacity(size),
            errors: VecDeque::new(),
            size,
        }
    }

    fn push(&mut self, entry: CqEntry) {
        if self.slab.free_slots() == 0 {
            warn!(size = self.size, live = self.slab.len(), "completion pool exhausted, growing");
        }
        let is_error = entry.is_error();
        let handle = self.slab.insert(entry);
        if is_error {
            self.errors.push_back(handle);
        } else {
            self.success.push_back(handle);
        }
    }

    fn pop_success(&mut self, count: usize) -> Vec<CqEntry> {
        let take = count.min(self.success.len());
        self.success
            .drain(..take)
            .filter_map(|handle| self.slab.remove(handle))
            .collect()
    }

    fn pop_error(&mut self, peek: bool) -> Option<CqEntry> {
        if peek {
            let handle = *self.errors.front()?;
            return self.slab.get(handle).cloned();
        }
        let handle = self.errors.pop_front()?;
        self.slab.remove(handle)
    }

    fn stats(&self) -> CqStats {
        CqStats {
            capacity: self.slab.capacity(),
            live: self.slab.len(),
            completions: self.success.len(),
            errors: self.errors.len(),
            growth_events: self.slab.growth_events(),
        }
    }
}

struct CqInterrupt {
    interrupt: Box<dyn LocalInterrupt>,
    flags: Flags,
}

/// A completion queue opened on a domain.
pub struct CompletionQueue {
    fid: u64,
    domain_fid: u64,
    format: CqFormat,
    provider: Arc<Provider>,
    pool: Guarded<CqPool>,
    progress: ProgressSlot,
    wakeup: Wakeup,
    interrupt: ArcSwapOption<CqInterrupt>,
}

impl CompletionQueue {
    pub(crate) fn open(
        provider: Arc<Provider>,
        domain_fid: u64,
        mode: LockMode,
        attr: CqAttr,
    ) -> FabricResult<Arc<Self>> {
        attr.wait_obj.check()?;
        let size = if attr.size == 0 {
            DEFAULT_CQ_SIZE
        } else {
            attr.size
        };
        let fid = provider.next_fid();
        debug!(fid, size, format = ?attr.format, ?mode, "opened completion queue");
        Ok(Arc::new(Self {
            fid,
            domain_fid,
            format: attr.format,
            provider,
            pool: Guarded::new(mode, CqPool::new(size)),
            progress: ProgressSlot::default(),
            wakeup: Wakeup::default(),
            interrupt: ArcSwapOption::empty(),
        }))
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn domain_fid(&self) -> u64 {
        self.domain_fid
    }

    pub fn format(&self) -> CqFormat {
        self.format
    }

    /// Non-blocking read of up to `count` completions.
    ///
    /// Fails with `Avail` when only error entries are pending and with
    /// `Again` when nothing is pending at all.
    pub fn read(&self, count: usize) -> FabricResult<Vec<CqEntry>> {
        self.sread(count, Timeout::ZERO)
    }

    /// Like [`CompletionQueue::read`], also returning each entry's source address.
    pub fn readfrom(&self, count: usize) -> FabricResult<Vec<(CqEntry, FiAddr)>> {
        self.sreadfrom(count, Timeout::ZERO)
    }

    /// Takes the oldest error entry.
    pub fn readerr(&self) -> FabricResult<CqEntry> {
        self.readerr_flags(Flags::empty())
    }

    /// [`CompletionQueue::readerr`] honouring `PEEK`.
    pub fn readerr_flags(&self, flags: Flags) -> FabricResult<CqEntry> {
        let peek = flags.contains(Flags::PEEK);
        self.pool
            .with(|pool| pool.pop_error(peek))
            .ok_or(FabricError::Again)
    }

    /// Blocking read: drives progress for up to `timeout` while the queue is empty.
    pub fn sread(&self, count: usize, timeout: Timeout) -> FabricResult<Vec<CqEntry>> {
        let format = self.format;
        Ok(self
            .read_blocking(count, timeout)?
            .into_iter()
            .map(|entry| entry.masked(format))
            .collect())
    }

    pub fn sreadfrom(&self, count: usize, timeout: Timeout) -> FabricResult<Vec<(CqEntry, FiAddr)>> {
        let format = self.format;
        Ok(self
            .read_blocking(count, timeout)?
            .into_iter()
            .map(|entry| {
                let src = entry.src_addr;
                (entry.masked(format), src)
            })
            .collect())
    }

    /// Wakes a reader blocked in [`CompletionQueue::sread`] so it checks the
    /// queue again.
    ///
    /// Readers driven by a progress source return to the queue after every
    /// slice and need no wakeup.
    pub fn signal(&self) {
        if !self.progress.is_set() {
            self.wakeup.notify();
        }
    }

    /// Attaches an interrupt to the queue; every trigger becomes a completion
    /// carrying `flags` and the interrupt id in `data`.
    ///
    /// `id` zero lets the adapter choose. Returns the interrupt id in use.
    pub fn wait_data(&self, id: u64, flags: Flags) -> FabricResult<InterruptId> {
        let id = InterruptId::try_from(id)
            .map_err(|_| FabricError::Inval("interrupt id does not fit 32 bits"))?;
        let requested = (id != 0).then_some(id);
        let interrupt = self
            .provider
            .interconnect()
            .create_interrupt(requested)
            .map_err(HwContext::Resource.err())?;
        let id = interrupt.id();
        debug!(cq = self.fid, interrupt = id, "completion queue interrupt attached");
        self.interrupt
            .store(Some(Arc::new(CqInterrupt { interrupt, flags })));
        Ok(id)
    }

    /// Interrupt currently attached by [`CompletionQueue::wait_data`].
    pub fn interrupt_id(&self) -> Option<InterruptId> {
        self.interrupt.load().as_ref().map(|irq| irq.interrupt.id())
    }

    pub fn strerror(&self, prov_errno: i32) -> &'static str {
        error::strerror(prov_errno)
    }

    pub fn stats(&self) -> CqStats {
        self.pool.with(|pool| pool.stats())
    }

    pub(crate) fn push(&self, entry: CqEntry) {
        trace!(cq = self.fid, flags = ?entry.flags, len = entry.len, err = entry.err, "completion");
        self.pool.with(|pool| pool.push(entry));
        self.signal();
    }

    pub(crate) fn progress_slot(&self) -> &ProgressSlot {
        &self.progress
    }

    fn drain(&self, count: usize) -> FabricResult<Vec<CqEntry>> {
        self.pool.with(|pool| {
            if pool.success.is_empty() {
                if pool.errors.is_empty() {
                    Err(FabricError::Again)
                } else {
                    Err(FabricError::Avail)
                }
            } else {
                Ok(pool.pop_success(count.max(1)))
            }
        })
    }

    fn read_blocking(&self, count: usize, timeout: Timeout) -> FabricResult<Vec<CqEntry>> {
        let epoch = Cell::new(0);
        retry_until(
            timeout,
            || {
                epoch.set(self.wakeup.epoch());
                self.make_progress(Timeout::ZERO);
                self.drain(count)
            },
            |remaining| self.block(remaining, epoch.get()),
        )
    }

    fn make_progress(&self, budget: Timeout) {
        let left = self.progress.run(budget).unwrap_or(budget);
        if let Some(irq) = self.interrupt.load_full() {
            self.poll_interrupt(&irq, left);
        }
    }

    fn block(&self, remaining: Timeout, epoch: u64) {
        let irq = self.interrupt.load_full();
        match (self.progress.is_set(), irq) {
            (true, Some(irq)) => {
                self.progress.run(progress::slice(remaining));
                self.poll_interrupt(&irq, Timeout::ZERO);
            }
            (true, None) => {
                self.progress.run(remaining);
            }
            (false, Some(irq)) => {
                // Interrupt waits are sliced so a signal or a push from
                // another thread is seen within one slice.
                let deadline = remaining.start();
                while self.wakeup.epoch() == epoch && !deadline.remaining().is_zero() {
                    if self.poll_interrupt(&irq, progress::slice(deadline.remaining())) {
                        break;
                    }
                }
            }
            (false, None) => {
                self.wakeup.wait_past(epoch, remaining);
            }
        }
    }

    /// Turns pending triggers into completions; true when any arrived.
    fn poll_interrupt(&self, irq: &CqInterrupt, timeout: Timeout) -> bool {
        let mut wait = timeout;
        let mut fired = false;
        while irq.interrupt.wait(wait).is_ok() {
            fired = true;
            let entry = CqEntry {
                flags: irq.flags,
                data: u64::from(irq.interrupt.id()),
                ..CqEntry::default()
            };
            self.pool.with(|pool| pool.push(entry));
            wait = Timeout::ZERO;
        }
        fired
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("fid", &self.fid)
            .field("format", &self.format)
            .field("progress", &self.progress)
            .field("stats", &self.stats())
            .finish()
    }
}
