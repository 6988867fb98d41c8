//! Connection management over a shared control segment.
//!
//! A listening passive endpoint exports a control segment holding
//! `max_peers` handshake records of ten words each:
//!
//! ```text
//! word 0      tag        PRESENT | connector node, stored last by the acceptor
//! words 1..5  acceptor   segment id, offset, recv irq | send irq << 32, size
//! words 5..9  connector  same layout, size stored last
//! word 9      claim      set by the connector with compare-and-swap
//! ```
//!
//! Connecting to the control segment is itself the connection request: the
//! listener sees the segment event, reports `ConnReq`, and the application
//! accepts on a new endpoint, which publishes a record for the connector's
//! node and waits for the connector to fill in its half.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use segfab_interconnect::{
    HwError, InterruptId, LocalInterrupt, LocalSegment, NodeId, RemoteInterrupt, RemoteSegment,
    SegmentEvent,
};
use segfab_transport::{BufferLayout, RingReader, RingWriter, Timeout, Window};
use tracing::{debug, trace, warn};

use crate::av::PeerAddr;
use crate::context::Provider;
use crate::ep::{encode_name, Endpoint, EndpointShared};
use crate::eq::{EqEntry, EventKind, EventQueue};
use crate::error::{FabricError, FabricResult};
use crate::flags::EP_MSG_CAPS;
use crate::info::{EpAttr, EpType, Info, MAX_CTX_CNT, PROTO_SEGFAB, PROTO_VERSION};
use crate::progress::{self, Progress};
use crate::segment::{BufferDescriptor, HwContext, MsgBuffer};

const WORD: usize = 8;
const RECORD_WORDS: usize = 10;
const RECORD_BYTES: usize = RECORD_WORDS * WORD;
const TAG: usize = 0;
const ACCEPTOR: usize = 1;
const CONNECTOR: usize = 5;
const CLAIM: usize = 9;
const PRESENT: u64 = 1 << 63;

/// Pause between scans while a handshake partner is not there yet.
const HANDSHAKE_POLL: Duration = Duration::from_micros(50);

/// One side's half of a handshake record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SegmentData {
    buffer: BufferDescriptor,
    recv_irq: InterruptId,
    send_irq: InterruptId,
}

impl SegmentData {
    fn store(&self, record: &Window, base: usize) {
        let word = |i: usize| record.word((base + i) * WORD);
        word(0).store(u64::from(self.buffer.segment_id), Ordering::Relaxed);
        word(1).store(self.buffer.offset, Ordering::Relaxed);
        word(2).store(
            u64::from(self.recv_irq) | (u64::from(self.send_irq) << 32),
            Ordering::Relaxed,
        );
        word(3).store(self.buffer.size, Ordering::Release);
    }

    /// `None` until the size word has been published.
    fn load(record: &Window, base: usize) -> Option<Self> {
        let word = |i: usize| record.word((base + i) * WORD);
        let size = word(3).load(Ordering::Acquire);
        if size == 0 {
            return None;
        }
        let irqs = word(2).load(Ordering::Relaxed);
        Some(Self {
            buffer: BufferDescriptor {
                segment_id: word(0).load(Ordering::Relaxed) as u32,
                offset: word(1).load(Ordering::Relaxed),
                size,
            },
            recv_irq: irqs as InterruptId,
            send_irq: (irqs >> 32) as InterruptId,
        })
    }
}

fn tag_for(node: NodeId) -> u64 {
    PRESENT | u64::from(node)
}

/// Local resources one side brings to a connection.
struct Wiring {
    buffer: MsgBuffer,
    recv_irq: Box<dyn LocalInterrupt>,
    send_irq: Box<dyn LocalInterrupt>,
}

impl Wiring {
    fn allocate(provider: &Arc<Provider>) -> FabricResult<Self> {
        let buffer = MsgBuffer::allocate(provider)?;
        let interconnect = provider.interconnect();
        let recv_irq = interconnect
            .create_interrupt(None)
            .map_err(HwContext::Resource.err())?;
        let send_irq = interconnect
            .create_interrupt(None)
            .map_err(HwContext::Resource.err())?;
        Ok(Self {
            buffer,
            recv_irq,
            send_irq,
        })
    }

    fn data(&self) -> SegmentData {
        SegmentData {
            buffer: self.buffer.descriptor(),
            recv_irq: self.recv_irq.id(),
            send_irq: self.send_irq.id(),
        }
    }
}

/// Everything a connected endpoint holds on to.
pub(crate) struct Link {
    peer: PeerAddr,
    _buffer: MsgBuffer,
    _remote: Box<dyn RemoteSegment>,
    /// Raised by the peer after it wrote into our buffer.
    recv_irq: Box<dyn LocalInterrupt>,
    /// Raised by the peer after it consumed from its buffer.
    send_irq: Box<dyn LocalInterrupt>,
    peer_recv_irq: Box<dyn RemoteInterrupt>,
    peer_send_irq: Box<dyn RemoteInterrupt>,
}

impl Link {
    pub(crate) fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub(crate) fn notify_written(&self) {
        if let Err(err) = self.peer_recv_irq.trigger() {
            warn!(peer = %self.peer, %err, "failed to signal peer receive interrupt");
        }
    }

    pub(crate) fn notify_consumed(&self) {
        if let Err(err) = self.peer_send_irq.trigger() {
            warn!(peer = %self.peer, %err, "failed to signal peer send interrupt");
        }
    }

    /// Waits up to `timeout` for the peer to write; credit notifications
    /// are drained on the way. Returns true when woken by the peer.
    pub(crate) fn wait(&self, timeout: Timeout) -> bool {
        while self.send_irq.wait(Timeout::ZERO).is_ok() {}
        self.recv_irq.wait(timeout).is_ok()
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Handshake records exported by a listener.
struct ControlTable {
    segment: Box<dyn LocalSegment>,
    free: Mutex<Vec<usize>>,
}

impl ControlTable {
    fn record(&self, slot: usize) -> FabricResult<Window> {
        Ok(self.segment.window().sub(slot * RECORD_BYTES, RECORD_BYTES)?)
    }

    /// Publishes `local` for a connector on `node` and waits for its reply.
    fn exchange(&self, node: NodeId, local: SegmentData, timeout: Timeout) -> FabricResult<SegmentData> {
        let slot = self
            .free
            .lock()
            .pop()
            .ok_or(FabricError::NoSpc("listener has no free handshake records"))?;
        let result = self.record(slot).and_then(|record| {
            local.store(&record, ACCEPTOR);
            record.word(TAG * WORD).store(tag_for(node), Ordering::Release);
            trace!(slot, node, "handshake record published");
            let deadline = timeout.start();
            loop {
                if let Some(peer) = SegmentData::load(&record, CONNECTOR) {
                    return Ok(peer);
                }
                if deadline.expired() {
                    return Err(FabricError::ConnAborted);
                }
                thread::sleep(HANDSHAKE_POLL);
            }
        });
        self.release(slot);
        result
    }

    fn release(&self, slot: usize) {
        if let Ok(record) = self.record(slot) {
            record.word(TAG * WORD).store(0, Ordering::Release);
            record.fill(WORD, (CLAIM - 1) * WORD, 0);
            record.word(CLAIM * WORD).store(0, Ordering::Release);
        }
        self.free.lock().push(slot);
    }
}

struct PendingConn {
    table: Arc<ControlTable>,
    node: NodeId,
}

/// Connection request handed out with a `ConnReq` event; pass the event's
/// info to [`crate::Domain::endpoint`] and accept on the new endpoint.
#[derive(Clone)]
pub struct ConnHandle(Arc<PendingConn>);

impl ConnHandle {
    /// Node asking to connect.
    pub fn node(&self) -> NodeId {
        self.0.node
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnHandle").field(&self.0.node).finish()
    }
}

struct PassiveShared {
    fid: u64,
    provider: Arc<Provider>,
    addr: PeerAddr,
    eq: ArcSwapOption<EventQueue>,
    table: ArcSwapOption<ControlTable>,
}

impl PassiveShared {
    fn connreq(&self, table: Arc<ControlTable>, node: NodeId) -> Info {
        Info {
            caps: EP_MSG_CAPS,
            src_addr: Some(self.addr),
            dest_addr: Some(PeerAddr::new(node, 0)),
            handle: Some(ConnHandle(Arc::new(PendingConn { table, node }))),
            ep_attr: EpAttr {
                ep_type: EpType::Msg,
                protocol: PROTO_SEGFAB,
                protocol_version: PROTO_VERSION,
                max_msg_size: self.provider.config().max_msg_size(),
                tx_ctx_cnt: MAX_CTX_CNT,
                rx_ctx_cnt: MAX_CTX_CNT,
            },
            ..Info::default()
        }
    }
}

impl Progress for PassiveShared {
    /// Waits for one connection event and turns it into `ConnReq`.
    fn progress(&self, budget: Timeout) -> Timeout {
        let deadline = budget.start();
        let (Some(table), Some(eq)) = (self.table.load_full(), self.eq.load_full()) else {
            return budget;
        };
        match table.segment.wait_event(progress::slice(budget)) {
            Ok(SegmentEvent::Connect { node }) => {
                debug!(pep = self.fid, node, "connection request");
                let info = self.connreq(Arc::clone(&table), node);
                eq.push(EqEntry::new(EventKind::ConnReq, self.fid).with_info(info));
            }
            Ok(SegmentEvent::Disconnect { node }) => {
                trace!(pep = self.fid, node, "control segment released");
            }
            Err(HwError::Timeout) => {}
            Err(err) => warn!(pep = self.fid, %err, "control segment event failed"),
        }
        deadline.remaining()
    }
}

/// A listening endpoint.
pub struct PassiveEndpoint {
    shared: Arc<PassiveShared>,
}

impl PassiveEndpoint {
    pub(crate) fn open(provider: Arc<Provider>, info: &Info) -> FabricResult<Self> {
        let segment_id = info
            .src_addr
            .map(|addr| addr.segment_id)
            .ok_or(FabricError::Inval("passive endpoint needs a source address"))?;
        let addr = PeerAddr::new(provider.local_node_id(), segment_id);
        let fid = provider.next_fid();
        Ok(Self {
            shared: Arc::new(PassiveShared {
                fid,
                provider,
                addr,
                eq: ArcSwapOption::empty(),
                table: ArcSwapOption::empty(),
            }),
        })
    }

    pub fn fid(&self) -> u64 {
        self.shared.fid
    }

    /// The only object a passive endpoint binds.
    pub fn bind_eq(&self, eq: &Arc<EventQueue>) -> FabricResult<()> {
        self.shared.eq.store(Some(Arc::clone(eq)));
        Ok(())
    }

    /// Exports the control segment and lets the bound event queue poll it.
    pub fn listen(&self) -> FabricResult<()> {
        let shared = &self.shared;
        let eq = shared.eq.load_full().ok_or(FabricError::NoEq)?;
        if shared.table.load().is_some() {
            return Err(FabricError::Inval("already listening"));
        }
        let max_peers = shared.provider.config().max_peers;
        let segment = shared
            .provider
            .interconnect()
            .create_segment(shared.addr.segment_id, max_peers * RECORD_BYTES)
            .map_err(HwContext::Listen.err())?;
        shared.table.store(Some(Arc::new(ControlTable {
            segment,
            free: Mutex::new((0..max_peers).rev().collect()),
        })));
        let source: Weak<PassiveShared> = Arc::downgrade(shared);
        eq.progress_slot().set(source);
        debug!(pep = shared.fid, addr = %shared.addr, max_peers, "listening");
        Ok(())
    }

    pub fn name(&self) -> PeerAddr {
        self.shared.addr
    }

    pub fn getname(&self, buf: &mut [u8]) -> FabricResult<usize> {
        encode_name(self.shared.addr, buf)
    }
}

impl fmt::Debug for PassiveEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassiveEndpoint")
            .field("fid", &self.shared.fid)
            .field("addr", &self.shared.addr)
            .field("listening", &self.shared.table.load().is_some())
            .finish()
    }
}

impl Endpoint {
    /// Connects to the listener at `addr` (or the endpoint's destination
    /// address). Blocks until the listener accepts or the configured connect
    /// timeout expires.
    pub fn connect(&self, addr: Option<PeerAddr>) -> FabricResult<()> {
        let shared = &self.shared;
        let eq = shared.eq.load_full().ok_or(FabricError::NoEq)?;
        if shared.is_connected() {
            return Err(FabricError::Inval("endpoint already connected"));
        }
        let dest = addr
            .or(shared.dest_addr)
            .ok_or(FabricError::Inval("no destination address"))?;
        debug!(ep = shared.fid, %dest, "connecting");
        let result = shared.handshake_connect(dest);
        if let Err(err) = &result {
            eq.push(EqEntry::new(EventKind::Connected, shared.fid).failed(err));
        }
        result
    }

    /// Accepts the connection request this endpoint was opened for.
    pub fn accept(&self) -> FabricResult<()> {
        let shared = &self.shared;
        let eq = shared.eq.load_full().ok_or(FabricError::NoEq)?;
        let handle = shared
            .handle
            .lock()
            .take()
            .ok_or(FabricError::Inval("endpoint has no pending connection"))?;
        let provider = shared.domain.provider();
        let result = Wiring::allocate(provider).and_then(|wiring| {
            let peer = handle.0.table.exchange(
                handle.0.node,
                wiring.data(),
                provider.config().accept_timeout,
            )?;
            shared.establish(handle.0.node, wiring, peer)
        });
        if let Err(err) = &result {
            eq.push(EqEntry::new(EventKind::Connected, shared.fid).failed(err));
        }
        result
    }

    /// Tears the connection down. Queued operations complete with
    /// `Canceled`; calling it again is a no-op.
    pub fn shutdown(&self) -> FabricResult<()> {
        let shared = &self.shared;
        if !shared.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let link = shared.link.swap(None);
        shared.cancel_pending();
        drop(link);
        debug!(ep = shared.fid, "shut down");
        if let Some(eq) = shared.eq.load_full() {
            eq.push(EqEntry::new(EventKind::Shutdown, shared.fid));
        }
        Ok(())
    }
}

impl EndpointShared {
    fn handshake_connect(&self, dest: PeerAddr) -> FabricResult<()> {
        let provider = self.domain.provider();
        let timeout = provider.config().connect_timeout;
        let deadline = timeout.start();
        let control = provider
            .interconnect()
            .connect_segment(dest.node_id, dest.segment_id, timeout)
            .map_err(HwContext::Connect.err())?;
        let wiring = Wiring::allocate(provider)?;
        let window = control
            .map(0, control.len())
            .map_err(HwContext::Connect.err())?;
        let me = tag_for(provider.local_node_id());

        loop {
            for slot in 0..window.len() / RECORD_BYTES {
                let record = window.sub(slot * RECORD_BYTES, RECORD_BYTES)?;
                if record.word(TAG * WORD).load(Ordering::Acquire) != me {
                    continue;
                }
                let claim = record.word(CLAIM * WORD);
                if claim
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                let peer = (record.word(TAG * WORD).load(Ordering::Acquire) == me)
                    .then(|| SegmentData::load(&record, ACCEPTOR))
                    .flatten();
                let Some(peer) = peer else {
                    claim.store(0, Ordering::Release);
                    continue;
                };
                trace!(slot, node = dest.node_id, "claimed handshake record");
                wiring.data().store(&record, CONNECTOR);
                control.flush().map_err(HwContext::Connect.err())?;
                drop(control);
                return self.establish(dest.node_id, wiring, peer);
            }
            if deadline.expired() {
                return Err(FabricError::ConnAborted);
            }
            thread::sleep(HANDSHAKE_POLL);
        }
    }

    /// Maps the peer's buffer, builds both ring halves and marks the
    /// endpoint connected.
    fn establish(&self, node: NodeId, wiring: Wiring, peer: SegmentData) -> FabricResult<()> {
        let provider = self.domain.provider();
        let interconnect = provider.interconnect();
        let timeout = provider.config().connect_timeout;
        let connect = HwContext::Connect.err();

        let remote = interconnect
            .connect_segment(node, peer.buffer.segment_id, timeout)
            .map_err(&connect)?;
        let offset = usize::try_from(peer.buffer.offset)
            .map_err(|_| FabricError::Inval("peer buffer offset out of range"))?;
        let size = usize::try_from(peer.buffer.size)
            .map_err(|_| FabricError::Inval("peer buffer size out of range"))?;
        let far = BufferLayout::split(&remote.map(offset, size).map_err(&connect)?)?;
        let near = BufferLayout::split(wiring.buffer.window())?;
        let writer = RingWriter::new(far.data, near.status)?;
        let reader = RingReader::new(near.data, far.status)?;
        let peer_recv_irq = interconnect
            .connect_interrupt(node, peer.recv_irq, timeout)
            .map_err(&connect)?;
        let peer_send_irq = interconnect
            .connect_interrupt(node, peer.send_irq, timeout)
            .map_err(&connect)?;

        let link = Link {
            peer: PeerAddr::new(node, peer.buffer.segment_id),
            _buffer: wiring.buffer,
            _remote: remote,
            recv_irq: wiring.recv_irq,
            send_irq: wiring.send_irq,
            peer_recv_irq,
            peer_send_irq,
        };
        debug!(ep = self.fid, peer = %link.peer, "connected");
        self.tx.with(|tx| tx.ring = Some(writer));
        self.rx.with(|rx| rx.ring = Some(reader));
        self.link.store(Some(Arc::new(link)));
        self.connected.store(true, Ordering::Release);
        if let Some(eq) = self.eq.load_full() {
            eq.push(EqEntry::new(EventKind::Connected, self.fid));
        }
        self.drive();
        Ok(())
    }
}
