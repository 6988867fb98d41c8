//! Active endpoints.
//!
//! An [`Endpoint`] is a cheap handle over shared state that queues and
//! counters reach through weak progress hooks. The data path lives in
//! [`crate::msg`] and [`crate::rma`], connection setup in [`crate::cm`]; this
//! module holds what they share: bindings, completion routing and the
//! progress function.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use segfab_transport::{RingReader, RingWriter, Timeout};
use tracing::debug;

use crate::av::{AddressVector, PeerAddr};
use crate::cm::{ConnHandle, Link};
use crate::cntr::Counter;
use crate::cq::{CompletionQueue, CqEntry};
use crate::domain::Domain;
use crate::eq::EventQueue;
use crate::error::{FabricError, FabricResult};
use crate::flags::{Flags, EP_MSG_CAPS, MSG_CAPS, RMA_CAPS};
use crate::info::Info;
use crate::lock::{Guarded, LockMode};
use crate::msg::Channel;
use crate::progress::{self, Progress};
use crate::rma::RmaCache;

/// Which completion stream an operation reports to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Send,
    Recv,
    Read,
    Write,
}

#[derive(Debug, Default)]
pub(crate) struct Bindings {
    send_cq: Option<Arc<CompletionQueue>>,
    recv_cq: Option<Arc<CompletionQueue>>,
    read_cq: Option<Arc<CompletionQueue>>,
    write_cq: Option<Arc<CompletionQueue>>,
    send_cntr: Option<Arc<Counter>>,
    recv_cntr: Option<Arc<Counter>>,
    read_cntr: Option<Arc<Counter>>,
    write_cntr: Option<Arc<Counter>>,
    pub(crate) av: Option<Arc<AddressVector>>,
}

impl Bindings {
    fn cq_slot(&mut self, direction: Direction) -> &mut Option<Arc<CompletionQueue>> {
        match direction {
            Direction::Send => &mut self.send_cq,
            Direction::Recv => &mut self.recv_cq,
            Direction::Read => &mut self.read_cq,
            Direction::Write => &mut self.write_cq,
        }
    }

    fn cntr_slot(&mut self, direction: Direction) -> &mut Option<Arc<Counter>> {
        match direction {
            Direction::Send => &mut self.send_cntr,
            Direction::Recv => &mut self.recv_cntr,
            Direction::Read => &mut self.read_cntr,
            Direction::Write => &mut self.write_cntr,
        }
    }

    /// Every queue and counter this endpoint drives, duplicates included.
    fn progress_targets(&self) -> (Vec<&Arc<CompletionQueue>>, Vec<&Arc<Counter>>) {
        let cqs = [&self.send_cq, &self.recv_cq, &self.read_cq, &self.write_cq];
        let cntrs = [&self.send_cntr, &self.recv_cntr, &self.read_cntr, &self.write_cntr];
        (
            cqs.into_iter().flatten().collect(),
            cntrs.into_iter().flatten().collect(),
        )
    }

    fn targets(&self, direction: Direction) -> (Option<Arc<CompletionQueue>>, Option<Arc<Counter>>) {
        let (cq, cntr) = match direction {
            Direction::Send => (&self.send_cq, &self.send_cntr),
            Direction::Recv => (&self.recv_cq, &self.recv_cntr),
            Direction::Read => (&self.read_cq, &self.read_cntr),
            Direction::Write => (&self.write_cq, &self.write_cntr),
        };
        (cq.clone(), cntr.clone())
    }
}

/// Directions selected by bind flags. `SEND` covers every initiator-side
/// stream.
fn directions(flags: Flags) -> FabricResult<Vec<Direction>> {
    let mut out = Vec::with_capacity(4);
    if flags.contains(Flags::SEND) {
        out.extend([Direction::Send, Direction::Read, Direction::Write]);
    }
    if flags.contains(Flags::RECV) {
        out.push(Direction::Recv);
    }
    if flags.contains(Flags::READ) && !out.contains(&Direction::Read) {
        out.push(Direction::Read);
    }
    if flags.contains(Flags::WRITE) && !out.contains(&Direction::Write) {
        out.push(Direction::Write);
    }
    if out.is_empty() {
        return Err(FabricError::Inval("bind flags select no direction"));
    }
    Ok(out)
}

/// Plain `MSG`/`RMA` stand for all of their sub-capabilities.
fn expand_caps(caps: Flags) -> FabricResult<Flags> {
    if caps.is_empty() {
        return Ok(EP_MSG_CAPS);
    }
    if !EP_MSG_CAPS.contains(caps) {
        return Err(FabricError::Inval("unsupported endpoint capabilities"));
    }
    let mut expanded = caps;
    if caps.contains(Flags::MSG) && !caps.intersects(Flags::SEND | Flags::RECV) {
        expanded |= MSG_CAPS;
    }
    if caps.contains(Flags::RMA)
        && !caps.intersects(Flags::READ | Flags::WRITE | Flags::REMOTE_READ | Flags::REMOTE_WRITE)
    {
        expanded |= RMA_CAPS;
    }
    Ok(expanded)
}

pub(crate) struct EndpointShared {
    pub(crate) fid: u64,
    pub(crate) domain: Arc<Domain>,
    caps: Flags,
    pub(crate) dest_addr: Option<PeerAddr>,
    pub(crate) handle: Mutex<Option<ConnHandle>>,
    pub(crate) eq: ArcSwapOption<EventQueue>,
    pub(crate) bindings: RwLock<Bindings>,
    pub(crate) link: ArcSwapOption<Link>,
    pub(crate) connected: AtomicBool,
    pub(crate) tx: Guarded<Channel<RingWriter>>,
    pub(crate) rx: Guarded<Channel<RingReader>>,
    pub(crate) rma: Guarded<RmaCache>,
    pub(crate) max_msg_size: usize,
}

impl EndpointShared {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Posts `entry` to the queue and counter bound for `direction`.
    pub(crate) fn complete(&self, direction: Direction, entry: CqEntry) {
        let (cq, cntr) = self.bindings.read().targets(direction);
        if let Some(cntr) = cntr {
            if entry.is_error() {
                cntr.adderr(1);
            } else {
                cntr.add(1);
            }
        }
        if let Some(cq) = cq {
            cq.push(entry);
        }
    }

    /// One pass over both message queues; returns how many operations completed.
    pub(crate) fn drive(&self) -> usize {
        self.progress_send() + self.progress_recv()
    }
}

impl Progress for EndpointShared {
    fn progress(&self, budget: Timeout) -> Timeout {
        let deadline = budget.start();
        if self.drive() > 0 {
            return deadline.remaining();
        }
        let wait = progress::slice(budget);
        if wait.is_zero() {
            return deadline.remaining();
        }
        match self.link.load_full() {
            Some(link) if self.is_connected() => {
                if link.wait(wait) {
                    self.drive();
                }
            }
            _ => {
                if let Some(pause) = wait.duration() {
                    std::thread::sleep(pause);
                }
            }
        }
        deadline.remaining()
    }
}

/// A connection-oriented endpoint.
pub struct Endpoint {
    pub(crate) shared: Arc<EndpointShared>,
}

impl Endpoint {
    pub(crate) fn open(domain: Arc<Domain>, info: &Info) -> FabricResult<Self> {
        let caps = expand_caps(info.caps)?;
        let mode = LockMode::for_endpoint(domain.threading());
        let max_msg_size = domain.provider().config().max_msg_size();
        let fid = domain.provider().next_fid();
        debug!(fid, ?caps, ?mode, "opened endpoint");
        Ok(Self {
            shared: Arc::new(EndpointShared {
                fid,
                caps,
                dest_addr: info.dest_addr,
                handle: Mutex::new(info.handle.clone()),
                eq: ArcSwapOption::empty(),
                bindings: RwLock::new(Bindings::default()),
                link: ArcSwapOption::empty(),
                connected: AtomicBool::new(false),
                tx: Guarded::new(mode, Channel::new()),
                rx: Guarded::new(mode, Channel::new()),
                rma: Guarded::new(mode, RmaCache::default()),
                max_msg_size,
                domain,
            }),
        })
    }

    pub fn fid(&self) -> u64 {
        self.shared.fid
    }

    pub fn caps(&self) -> Flags {
        self.shared.caps
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Peer of the current connection.
    pub fn peer(&self) -> Option<PeerAddr> {
        self.shared.link.load().as_ref().map(|link| link.peer())
    }

    /// Sends and receives still waiting for the ring.
    pub fn pending(&self) -> (usize, usize) {
        (
            self.shared.tx.with(|tx| tx.pending()),
            self.shared.rx.with(|rx| rx.pending()),
        )
    }

    /// Routes completions for the directions in `flags` to `cq` and lets
    /// the queue drive this endpoint's progress.
    pub fn bind_cq(&self, cq: &Arc<CompletionQueue>, flags: Flags) -> FabricResult<()> {
        self.check_domain(cq.domain_fid())?;
        let directions = directions(flags)?;
        {
            let mut bindings = self.shared.bindings.write();
            for direction in directions {
                *bindings.cq_slot(direction) = Some(Arc::clone(cq));
            }
        }
        cq.progress_slot().set(self.progress_source());
        debug!(ep = self.fid(), cq = cq.fid(), ?flags, "bound completion queue");
        Ok(())
    }

    pub fn bind_cntr(&self, cntr: &Arc<Counter>, flags: Flags) -> FabricResult<()> {
        self.check_domain(cntr.domain_fid())?;
        let directions = directions(flags)?;
        {
            let mut bindings = self.shared.bindings.write();
            for direction in directions {
                *bindings.cntr_slot(direction) = Some(Arc::clone(cntr));
            }
        }
        cntr.progress_slot().set(self.progress_source());
        Ok(())
    }

    pub fn bind_eq(&self, eq: &Arc<EventQueue>) -> FabricResult<()> {
        self.shared.eq.store(Some(Arc::clone(eq)));
        Ok(())
    }

    pub fn bind_av(&self, av: &Arc<AddressVector>) -> FabricResult<()> {
        self.check_domain(av.domain_fid())?;
        self.shared.bindings.write().av = Some(Arc::clone(av));
        Ok(())
    }

    pub fn enable(&self) -> FabricResult<()> {
        Ok(())
    }

    /// Local address: this node and no rendezvous segment.
    pub fn name(&self) -> PeerAddr {
        PeerAddr::new(self.shared.domain.provider().local_node_id(), 0)
    }

    /// Writes the encoded local address into `buf`; returns its length.
    pub fn getname(&self, buf: &mut [u8]) -> FabricResult<usize> {
        encode_name(self.name(), buf)
    }

    fn check_domain(&self, domain_fid: u64) -> FabricResult<()> {
        if domain_fid != self.shared.domain.fid() {
            return Err(FabricError::Inval("object belongs to another domain"));
        }
        Ok(())
    }

    fn progress_source(&self) -> Weak<dyn Progress> {
        let weak: Weak<EndpointShared> = Arc::downgrade(&self.shared);
        weak
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let source = self.progress_source();
        let bindings = self.shared.bindings.read();
        let (cqs, cntrs) = bindings.progress_targets();
        for cq in cqs {
            cq.progress_slot().release(&source);
        }
        for cntr in cntrs {
            cntr.progress_slot().release(&source);
        }
    }
}

pub(crate) fn encode_name(addr: PeerAddr, buf: &mut [u8]) -> FabricResult<usize> {
    let bytes = addr.to_bytes();
    let dst = buf
        .get_mut(..bytes.len())
        .ok_or(FabricError::TooSmall)?;
    dst.copy_from_slice(&bytes);
    Ok(bytes.len())
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("fid", &self.shared.fid)
            .field("caps", &self.shared.caps)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
