//! Segment and resource layer.
//!
//! Message rings live in data segments the provider creates lazily. Each
//! segment is cut into `buffers_per_segment` equally sized buffers; a
//! [`MsgBuffer`] owns one of them and gives it back, zeroed, when dropped.
//! This module also owns the translation of interconnect failures into the
//! provider's error codes, which depends on what the caller was doing.

use std::fmt;
use std::sync::Weak;

use segfab_interconnect::{HwError, Interconnect, LocalSegment, SegmentId};
use segfab_transport::{BufferLayout, Window};
use tracing::{debug, trace};

use crate::config::ProviderConfig;
use crate::context::Provider;
use crate::error::{FabricError, FabricResult};

/// What the provider was doing when the interconnect failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HwContext {
    /// Creating a listener's control segment.
    Listen,
    /// Handshake and data-path wiring.
    Connect,
    /// Creating a memory region segment.
    Register,
    /// Mapping a remote region for RMA.
    Rma,
    /// Anything else.
    Resource,
}

impl HwContext {
    pub(crate) fn translate(self, err: HwError) -> FabricError {
        match (self, err) {
            (HwContext::Listen, HwError::SegmentIdUsed(_)) => FabricError::AddrInUse,
            (HwContext::Register, HwError::SegmentIdUsed(_)) => FabricError::NoKey,
            (
                HwContext::Connect,
                HwError::Timeout
                | HwError::Disconnected
                | HwError::NoSuchSegment { .. }
                | HwError::NoSuchInterrupt { .. },
            ) => FabricError::ConnAborted,
            (HwContext::Rma, HwError::Transport(err)) => FabricError::Transport(err),
            (HwContext::Rma, _) => FabricError::RemoteIo,
            (_, HwError::Exhausted) => FabricError::NoSpc("interconnect identifiers exhausted"),
            (_, HwError::Transport(err)) => FabricError::Transport(err),
            (_, err) => FabricError::Other(err),
        }
    }

    /// Adapter for `map_err`.
    pub(crate) fn err(self) -> impl Fn(HwError) -> FabricError {
        move |err| self.translate(err)
    }
}

/// Where a ring buffer lives, as exchanged during the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub segment_id: SegmentId,
    /// Byte offset of the buffer inside its segment.
    pub offset: u64,
    /// Buffer length including the status word.
    pub size: u64,
}

struct DataSegment {
    segment: Box<dyn LocalSegment>,
    free: Vec<usize>,
}

/// Lazily grown set of data segments.
pub(crate) struct BufferPool {
    segments: Vec<DataSegment>,
    buffer_len: usize,
    per_segment: usize,
    next_id: SegmentId,
    max_id: SegmentId,
}

impl BufferPool {
    pub(crate) fn new(config: &ProviderConfig) -> Self {
        Self {
            segments: Vec::new(),
            buffer_len: BufferLayout::buffer_len(config.buffer_size),
            per_segment: config.buffers_per_segment,
            next_id: config.min_msg_segment_id,
            max_id: config.max_msg_segment_id,
        }
    }

    /// Length of every buffer handed out, status word included.
    pub(crate) fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn free_buffers(&self) -> usize {
        self.segments.iter().map(|s| s.free.len()).sum()
    }

    fn take(&mut self, interconnect: &dyn Interconnect) -> FabricResult<(usize, usize)> {
        if let Some(pos) = self.segments.iter().position(|s| !s.free.is_empty()) {
            if let Some(slot) = self.segments[pos].free.pop() {
                return Ok((pos, slot));
            }
        }

        let size = self.buffer_len * self.per_segment;
        loop {
            if self.next_id >= self.max_id {
                return Err(FabricError::NoSpc("message segment ids exhausted"));
            }
            let id = self.next_id;
            self.next_id += 1;
            match interconnect.create_segment(id, size) {
                Ok(segment) => {
                    debug!(segment = id, size, "created data segment");
                    let mut free: Vec<usize> = (0..self.per_segment).rev().collect();
                    let slot = free.pop().ok_or(FabricError::NoMem)?;
                    self.segments.push(DataSegment { segment, free });
                    return Ok((self.segments.len() - 1, slot));
                }
                Err(HwError::SegmentIdUsed(_)) => {
                    trace!(segment = id, "data segment id taken, trying next");
                }
                Err(err) => return Err(HwContext::Resource.translate(err)),
            }
        }
    }

    fn release(&mut self, segment_id: SegmentId, slot: usize) {
        if let Some(segment) = self
            .segments
            .iter_mut()
            .find(|s| s.segment.id() == segment_id)
        {
            segment.free.push(slot);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("segments", &self.segments.len())
            .field("free", &self.free_buffers())
            .field("buffer_len", &self.buffer_len)
            .finish()
    }
}

/// One ring buffer borrowed from the provider's data segments.
pub struct MsgBuffer {
    provider: Weak<Provider>,
    window: Window,
    descriptor: BufferDescriptor,
    slot: usize,
}

impl MsgBuffer {
    pub(crate) fn allocate(provider: &std::sync::Arc<Provider>) -> FabricResult<Self> {
        let mut pool = provider.buffers().lock();
        let (index, slot) = pool.take(provider.interconnect().as_ref())?;
        let buffer_len = pool.buffer_len();
        let segment = &pool.segments[index].segment;
        let offset = slot * buffer_len;
        let window = segment.window().sub(offset, buffer_len)?;
        let descriptor = BufferDescriptor {
            segment_id: segment.id(),
            offset: offset as u64,
            size: buffer_len as u64,
        };
        trace!(?descriptor, "allocated message buffer");
        Ok(Self {
            provider: std::sync::Arc::downgrade(provider),
            window,
            descriptor,
            slot,
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        self.descriptor
    }
}

impl Drop for MsgBuffer {
    fn drop(&mut self) {
        self.window.fill(0, self.window.len(), 0);
        if let Some(provider) = self.provider.upgrade() {
            provider
                .buffers()
                .lock()
                .release(self.descriptor.segment_id, self.slot);
        }
    }
}

impl fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segfab_interconnect::loopback::LoopbackFabric;

    fn provider(buffers_per_segment: usize, segments: u32) -> std::sync::Arc<Provider> {
        let switch = LoopbackFabric::new();
        let config = ProviderConfig {
            buffer_size: 256,
            buffers_per_segment,
            min_msg_segment_id: 10,
            max_msg_segment_id: 10 + segments,
            max_peers: 4,
            ..ProviderConfig::default()
        };
        Provider::new(switch.node(1), config).expect("provider")
    }

    #[test]
    fn buffers_fill_segments_before_creating_new_ones() {
        let provider = provider(2, 4);
        let a = MsgBuffer::allocate(&provider).expect("first");
        let b = MsgBuffer::allocate(&provider).expect("second");
        let c = MsgBuffer::allocate(&provider).expect("third");

        assert_eq!(a.descriptor().segment_id, 10);
        assert_eq!(b.descriptor().segment_id, 10);
        assert_eq!(c.descriptor().segment_id, 11);
        assert_eq!(a.descriptor().size, 264);
        assert_ne!(a.descriptor().offset, b.descriptor().offset);
        assert_eq!(provider.buffers().lock().segment_count(), 2);
    }

    #[test]
    fn released_buffers_are_zeroed_and_reused() {
        let provider = provider(1, 1);
        let first = MsgBuffer::allocate(&provider).expect("buffer");
        first.window().write(8, b"stale");
        let descriptor = first.descriptor();
        drop(first);

        let again = MsgBuffer::allocate(&provider).expect("reused");
        assert_eq!(again.descriptor(), descriptor);
        assert!(again.window().to_vec().iter().all(|b| *b == 0));

        assert!(matches!(
            MsgBuffer::allocate(&provider),
            Err(FabricError::NoSpc(_))
        ));
    }

    #[test]
    fn taken_segment_ids_are_skipped() {
        let provider = provider(1, 3);
        let squatter = provider
            .interconnect()
            .create_segment(10, 64)
            .expect("squat on first id");
        let buffer = MsgBuffer::allocate(&provider).expect("buffer");
        assert_eq!(buffer.descriptor().segment_id, 11);
        drop(squatter);
    }

    #[test]
    fn translation_depends_on_context() {
        let used = HwError::SegmentIdUsed(7);
        assert!(matches!(
            HwContext::Listen.translate(used.clone()),
            FabricError::AddrInUse
        ));
        assert!(matches!(
            HwContext::Register.translate(used.clone()),
            FabricError::NoKey
        ));
        assert!(matches!(
            HwContext::Resource.translate(used),
            FabricError::Other(_)
        ));
        assert!(matches!(
            HwContext::Connect.translate(HwError::Timeout),
            FabricError::ConnAborted
        ));
        assert!(matches!(
            HwContext::Rma.translate(HwError::Disconnected),
            FabricError::RemoteIo
        ));
    }
}
