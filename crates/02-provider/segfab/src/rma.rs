//! One-sided reads and writes against remote memory regions.
//!
//! Each endpoint keeps exactly one remote region mapped. Targeting a
//! different `{node, key}` drops the old mapping before connecting the new
//! one. Copies are bounded by the mapped length; whatever does not fit is
//! reported through the completion rather than failing the call.

use std::fmt;

use segfab_interconnect::{Interconnect, InterruptId, NodeId, RemoteSegment, SegmentId};
use segfab_transport::{Timeout, Window};
use tracing::{debug, trace, warn};

use crate::av::{FiAddr, ADDR_NOTAVAIL};
use crate::cq::CqEntry;
use crate::ep::{Direction, Endpoint, EndpointShared};
use crate::error::{FabricError, FabricResult};
use crate::flags::Flags;
use crate::segment::HwContext;

/// Remote side of an RMA transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RmaIov {
    /// Byte offset into the remote region.
    pub addr: u64,
    pub len: usize,
    pub key: u64,
}

/// Descriptor for [`Endpoint::readmsg`] and [`Endpoint::writemsg`].
#[derive(Debug)]
pub struct RmaMsg<B> {
    pub iov: Vec<B>,
    pub addr: FiAddr,
    pub rma_iov: Vec<RmaIov>,
    pub context: u64,
    /// Immediate data; with `REMOTE_CQ_DATA` its low 32 bits name the
    /// interrupt raised on the target.
    pub data: u64,
}

struct MappedRegion {
    node: NodeId,
    key: SegmentId,
    segment: Box<dyn RemoteSegment>,
    window: Window,
}

/// Single-entry cache of the most recent RMA target.
#[derive(Default)]
pub(crate) struct RmaCache {
    entry: Option<MappedRegion>,
    connects: u64,
}

impl RmaCache {
    fn region(
        &mut self,
        interconnect: &dyn Interconnect,
        node: NodeId,
        key: SegmentId,
    ) -> FabricResult<&MappedRegion> {
        let hit = self
            .entry
            .as_ref()
            .is_some_and(|e| e.node == node && e.key == key);
        if !hit {
            self.entry = None;
            let segment = interconnect
                .connect_segment(node, key, Timeout::ZERO)
                .map_err(HwContext::Rma.err())?;
            let window = segment
                .map(0, segment.len())
                .map_err(HwContext::Rma.err())?;
            self.connects += 1;
            debug!(node, key, len = window.len(), "mapped remote region");
            self.entry = Some(MappedRegion {
                node,
                key,
                segment,
                window,
            });
        }
        self.entry.as_ref().ok_or(FabricError::RemoteIo)
    }

    pub(crate) fn connects(&self) -> u64 {
        self.connects
    }
}

impl fmt::Debug for RmaCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RmaCache")
            .field("target", &self.entry.as_ref().map(|e| (e.node, e.key)))
            .field("connects", &self.connects)
            .finish()
    }
}

enum Access<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Access<'_> {
    fn len(&self) -> usize {
        match self {
            Access::Read(buf) => buf.len(),
            Access::Write(buf) => buf.len(),
        }
    }

    fn direction(&self) -> Direction {
        match self {
            Access::Read(_) => Direction::Read,
            Access::Write(_) => Direction::Write,
        }
    }
}

fn single<B>(mut iov: Vec<B>) -> FabricResult<B> {
    if iov.len() != 1 {
        return Err(FabricError::Inval("only one iov per transfer"));
    }
    iov.pop().ok_or(FabricError::Inval("only one iov per transfer"))
}

impl Endpoint {
    /// Reads `buf.len()` bytes at `addr` of the region `key` on the peer.
    pub fn read(&self, buf: &mut [u8], src_addr: FiAddr, addr: u64, key: u64, context: u64) -> FabricResult<()> {
        let remote = RmaIov {
            addr,
            len: buf.len(),
            key,
        };
        self.shared
            .rma(Access::Read(buf), src_addr, remote, context, 0, Flags::empty())
    }

    pub fn readv(&self, iov: Vec<&mut [u8]>, src_addr: FiAddr, addr: u64, key: u64, context: u64) -> FabricResult<()> {
        self.read(single(iov)?, src_addr, addr, key, context)
    }

    pub fn readmsg(&self, msg: RmaMsg<&mut [u8]>, flags: Flags) -> FabricResult<()> {
        let remote = single(msg.rma_iov)?;
        let buf = single(msg.iov)?;
        self.shared
            .rma(Access::Read(buf), msg.addr, remote, msg.context, msg.data, flags)
    }

    /// Writes `buf` at `addr` of the region `key` on the peer.
    pub fn write(&self, buf: &[u8], dest_addr: FiAddr, addr: u64, key: u64, context: u64) -> FabricResult<()> {
        let remote = RmaIov {
            addr,
            len: buf.len(),
            key,
        };
        self.shared
            .rma(Access::Write(buf), dest_addr, remote, context, 0, Flags::empty())
    }

    pub fn writev(&self, iov: Vec<&[u8]>, dest_addr: FiAddr, addr: u64, key: u64, context: u64) -> FabricResult<()> {
        self.write(single(iov)?, dest_addr, addr, key, context)
    }

    pub fn writemsg(&self, msg: RmaMsg<&[u8]>, flags: Flags) -> FabricResult<()> {
        let remote = single(msg.rma_iov)?;
        let buf = single(msg.iov)?;
        self.shared
            .rma(Access::Write(buf), msg.addr, remote, msg.context, msg.data, flags)
    }

    /// Write followed by an interrupt on the target whose id is the low 32
    /// bits of `data`.
    pub fn writedata(
        &self,
        buf: &[u8],
        data: u64,
        dest_addr: FiAddr,
        addr: u64,
        key: u64,
        context: u64,
    ) -> FabricResult<()> {
        let remote = RmaIov {
            addr,
            len: buf.len(),
            key,
        };
        self.shared.rma(
            Access::Write(buf),
            dest_addr,
            remote,
            context,
            data,
            Flags::REMOTE_CQ_DATA,
        )
    }

    /// Remote regions connected by this endpoint so far.
    pub fn rma_connects(&self) -> u64 {
        self.shared.rma.with(|cache| cache.connects())
    }
}

impl EndpointShared {
    /// Node that owns the region: the connected peer, else the address
    /// vector entry for `addr`. The second half is the address completions
    /// report as their source.
    fn rma_target(&self, addr: FiAddr) -> FabricResult<(NodeId, FiAddr)> {
        if let Some(link) = self.link.load_full() {
            return Ok((link.peer().node_id, ADDR_NOTAVAIL));
        }
        let bindings = self.bindings.read();
        let av = bindings
            .av
            .as_ref()
            .ok_or(FabricError::NotConn)?;
        Ok((av.lookup(addr)?.node_id, addr))
    }

    fn rma(
        &self,
        access: Access<'_>,
        addr: FiAddr,
        remote: RmaIov,
        context: u64,
        data: u64,
        flags: Flags,
    ) -> FabricResult<()> {
        let key = SegmentId::try_from(remote.key)
            .map_err(|_| FabricError::Inval("memory key does not fit 32 bits"))?;
        let (node, source) = self.rma_target(addr)?;
        let requested = access.len();
        let direction = access.direction();
        let offset = usize::try_from(remote.addr).unwrap_or(usize::MAX);
        let interconnect = self.domain.provider().interconnect();

        // Errors before the copy fail the call; anything after it is
        // reported through the completion.
        let (copied, flushed) = self.rma.with(|cache| -> FabricResult<_> {
            let region = cache.region(&**interconnect, node, key)?;
            let fits = region.window.len().saturating_sub(offset).min(requested);
            match access {
                Access::Read(buf) if fits > 0 => region.window.read(offset, &mut buf[..fits]),
                Access::Write(buf) if fits > 0 => region.window.write(offset, &buf[..fits]),
                _ => {}
            }
            let notify = flags.contains(Flags::REMOTE_CQ_DATA);
            let flushed: FabricResult<()> =
                if direction == Direction::Write && (notify || !flags.contains(Flags::MORE)) {
                    region.segment.flush().map_err(HwContext::Rma.err())
                } else {
                    Ok(())
                };
            if notify {
                let irq = data as InterruptId;
                if let Err(err) = interconnect
                    .connect_interrupt(node, irq, Timeout::ZERO)
                    .and_then(|remote| remote.trigger())
                {
                    warn!(ep = self.fid, node, irq, %err, "could not raise remote interrupt");
                }
            }
            Ok((fits, flushed))
        })?;

        trace!(ep = self.fid, node, key, offset, requested, copied, ?direction, "rma");
        let op = match direction {
            Direction::Read => Flags::RMA | Flags::READ,
            _ => Flags::RMA | Flags::WRITE,
        };
        let mut entry = match flushed {
            Err(err) => CqEntry::failure(context, op, copied, &err),
            Ok(()) if copied < requested => {
                CqEntry::failure(context, op, copied, &FabricError::TooSmall).with_olen(requested - copied)
            }
            Ok(()) => CqEntry::success(context, op, copied),
        };
        entry.data = data;
        entry.src_addr = source;
        self.complete(direction, entry);
        Ok(())
    }
}
