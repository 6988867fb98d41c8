//! Two-sided messaging over the connection's rings.
//!
//! Posting tries the ring directly when nothing is queued ahead of the
//! operation; otherwise the operation waits in its channel until progress
//! gets to it. Channels drain strictly in order and stop at the first
//! operation the ring cannot take yet.

use std::collections::VecDeque;

use segfab_transport::{Handle, Received, RingReader, RingWriter, Slab, TransportResult};
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::av::FiAddr;
use crate::cq::CqEntry;
use crate::ep::{Direction, Endpoint, EndpointShared};
use crate::error::{FabricError, FabricResult};
use crate::flags::Flags;

/// Pending operations are allocated this many at a time.
const PENDING_BATCH: usize = 512;

/// A posted send or receive and the buffer that travels with it.
#[derive(Debug)]
pub(crate) struct PendingOp {
    pub(crate) buf: Vec<u8>,
    pub(crate) context: u64,
}

/// One direction of a connection: its ring half and the operations queued
/// behind it.
#[derive(Debug)]
pub(crate) struct Channel<R> {
    pub(crate) ring: Option<R>,
    ops: Slab<PendingOp>,
    order: VecDeque<Handle>,
}

impl<R> Channel<R> {
    pub(crate) fn new() -> Self {
        Self {
            ring: None,
            ops: Slab::with_batch(PENDING_BATCH),
            order: VecDeque::new(),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.order.len()
    }

    fn enqueue(&mut self, op: PendingOp) {
        let handle = self.ops.insert(op);
        self.order.push_back(handle);
    }

    fn pop_front(&mut self) -> Option<PendingOp> {
        let handle = self.order.pop_front()?;
        self.ops.remove(handle)
    }

    /// Drops the ring and hands back every queued operation in order.
    pub(crate) fn detach(&mut self) -> Vec<PendingOp> {
        self.ring = None;
        let ops = &mut self.ops;
        self.order
            .drain(..)
            .filter_map(|handle| ops.remove(handle))
            .collect()
    }
}

impl Channel<RingWriter> {
    fn flush(&mut self) -> SmallVec<[PendingOp; 8]> {
        let mut done = SmallVec::new();
        while let Some(&handle) = self.order.front() {
            let (Some(writer), Some(op)) = (self.ring.as_mut(), self.ops.get(handle)) else {
                break;
            };
            if writer.try_write(&op.buf).is_err() {
                break;
            }
            if let Some(op) = self.pop_front() {
                done.push(op);
            }
        }
        done
    }
}

/// A matched receive: the frame it took, or why the ring could not be read.
type Delivery = (PendingOp, TransportResult<Received>);

impl Channel<RingReader> {
    /// Stops after a corrupt header; the receive at the front carries the error.
    fn fill(&mut self) -> SmallVec<[Delivery; 8]> {
        let mut done = SmallVec::new();
        while let Some(&handle) = self.order.front() {
            let (Some(reader), Some(op)) = (self.ring.as_mut(), self.ops.get_mut(handle)) else {
                break;
            };
            let outcome = match reader.try_read_into(&mut op.buf) {
                Ok(Some(received)) => Ok(received),
                Ok(None) => break,
                Err(err) => Err(err),
            };
            let corrupt = outcome.is_err();
            if let Some(op) = self.pop_front() {
                done.push((op, outcome));
            }
            if corrupt {
                break;
            }
        }
        done
    }
}

/// Message descriptor for [`Endpoint::sendmsg`] and [`Endpoint::recvmsg`].
#[derive(Debug, Default)]
pub struct Msg {
    pub iov: Vec<Vec<u8>>,
    /// Ignored on connected endpoints.
    pub addr: FiAddr,
    pub context: u64,
    pub data: u64,
}

fn single_iov(mut iov: Vec<Vec<u8>>) -> FabricResult<Vec<u8>> {
    match iov.len() {
        0 => Ok(Vec::new()),
        1 => Ok(iov.pop().unwrap_or_default()),
        _ => Err(FabricError::Inval("only one iov per message")),
    }
}

impl Endpoint {
    /// Sends `buf`; the buffer comes back in the send completion.
    pub fn send(&self, buf: Vec<u8>, context: u64) -> FabricResult<()> {
        self.shared.post_send(PendingOp { buf, context })
    }

    pub fn sendv(&self, iov: Vec<Vec<u8>>, context: u64) -> FabricResult<()> {
        self.send(single_iov(iov)?, context)
    }

    pub fn sendmsg(&self, msg: Msg, _flags: Flags) -> FabricResult<()> {
        self.send(single_iov(msg.iov)?, msg.context)
    }

    /// Posts `buf` for the next incoming message. The completion returns the
    /// buffer truncated to the bytes received.
    pub fn recv(&self, buf: Vec<u8>, context: u64) -> FabricResult<()> {
        self.shared.post_recv(PendingOp { buf, context })
    }

    pub fn recvv(&self, iov: Vec<Vec<u8>>, context: u64) -> FabricResult<()> {
        self.recv(single_iov(iov)?, context)
    }

    pub fn recvmsg(&self, msg: Msg, _flags: Flags) -> FabricResult<()> {
        self.recv(single_iov(msg.iov)?, msg.context)
    }
}

impl EndpointShared {
    fn post_send(&self, op: PendingOp) -> FabricResult<()> {
        if op.buf.len() > self.max_msg_size {
            return Err(FabricError::MsgSize);
        }
        let connected = self.is_connected();
        let sent = self.tx.with(|tx| -> FabricResult<Option<PendingOp>> {
            if let Some(writer) = tx.ring.as_mut() {
                if op.buf.len() > writer.max_payload() {
                    return Err(FabricError::MsgSize);
                }
                if connected && tx.order.is_empty() && writer.try_write(&op.buf).is_ok() {
                    return Ok(Some(op));
                }
            }
            tx.enqueue(op);
            Ok(None)
        })?;
        if let Some(op) = sent {
            self.sent(std::iter::once(op));
        }
        Ok(())
    }

    fn post_recv(&self, mut op: PendingOp) -> FabricResult<()> {
        let connected = self.is_connected();
        let received = self.rx.with(|rx| {
            if connected && rx.order.is_empty() {
                match rx.ring.as_mut().map(|r| r.try_read_into(&mut op.buf)) {
                    Some(Ok(Some(received))) => return Some((op, Ok(received))),
                    Some(Err(err)) => return Some((op, Err(err))),
                    Some(Ok(None)) | None => {}
                }
            }
            rx.enqueue(op);
            None
        });
        if let Some(done) = received {
            self.received(std::iter::once(done));
        }
        Ok(())
    }

    /// Pushes queued sends into the ring; no-op while disconnected.
    pub(crate) fn progress_send(&self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let done = self.tx.try_with(|tx| tx.flush()).unwrap_or_default();
        let count = done.len();
        if count > 0 {
            self.sent(done);
        }
        count
    }

    /// Matches queued receives with frames in the ring; no-op while disconnected.
    pub(crate) fn progress_recv(&self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let done = self.rx.try_with(|rx| rx.fill()).unwrap_or_default();
        let count = done.len();
        if count > 0 {
            self.received(done);
        }
        count
    }

    fn sent(&self, ops: impl IntoIterator<Item = PendingOp>) {
        if let Some(link) = self.link.load_full() {
            link.notify_written();
        }
        for op in ops {
            trace!(ep = self.fid, len = op.buf.len(), "message sent");
            let entry = CqEntry::success(op.context, Flags::MSG | Flags::SEND, op.buf.len())
                .with_buf(op.buf);
            self.complete(Direction::Send, entry);
        }
    }

    fn received(&self, ops: impl IntoIterator<Item = Delivery>) {
        if let Some(link) = self.link.load_full() {
            link.notify_consumed();
        }
        for (mut op, outcome) in ops {
            let received = match outcome {
                Ok(received) => received,
                Err(err) => {
                    warn!(ep = self.fid, %err, "receive ring corrupt");
                    op.buf.clear();
                    let entry = CqEntry::failure(op.context, Flags::MSG | Flags::RECV, 0, &FabricError::RemoteIo);
                    self.complete(Direction::Recv, entry.with_buf(op.buf));
                    continue;
                }
            };
            trace!(ep = self.fid, copied = received.copied, frame = received.frame_len, "message received");
            op.buf.truncate(received.copied);
            let flags = Flags::MSG | Flags::RECV;
            let entry = match received.overflow() {
                0 => CqEntry::success(op.context, flags, received.copied),
                overflow => {
                    CqEntry::failure(op.context, flags, received.copied, &FabricError::TooSmall)
                        .with_olen(overflow)
                }
            };
            self.complete(Direction::Recv, entry.with_buf(op.buf));
        }
    }

    /// Fails every queued operation with `Canceled`, returning its buffer.
    pub(crate) fn cancel_pending(&self) {
        let sends = self.tx.with(|tx| tx.detach());
        let recvs = self.rx.with(|rx| rx.detach());
        for (direction, flags, ops) in [
            (Direction::Send, Flags::MSG | Flags::SEND, sends),
            (Direction::Recv, Flags::MSG | Flags::RECV, recvs),
        ] {
            for op in ops {
                let entry = CqEntry::failure(op.context, flags, 0, &FabricError::Canceled)
                    .with_buf(op.buf);
                self.complete(direction, entry);
            }
        }
    }
}
