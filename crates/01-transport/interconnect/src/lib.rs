//! Hardware abstraction for segment-based interconnects.
//!
//! The provider talks to the adapter exclusively through [`Interconnect`]:
//! local segments that remote nodes can connect to and map, and numbered
//! interrupts that remote nodes can trigger. Every handle releases its
//! resource when dropped.
//!
//! [`loopback`] implements the trait in-process so that several simulated
//! nodes can share one address space in tests.

use std::fmt;

use segfab_transport::{Timeout, Window};

mod error;
pub mod loopback;

pub use error::{HwError, HwResult};

pub type NodeId = u32;
pub type SegmentId = u32;
pub type InterruptId = u32;

/// Notification delivered to the owner of a local segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentEvent {
    /// A remote node connected to the segment.
    Connect { node: NodeId },
    /// A remote node dropped its connection.
    Disconnect { node: NodeId },
}

/// Access to one adapter of the interconnect.
pub trait Interconnect: Send + Sync + fmt::Debug {
    /// Identifier of this node on the interconnect.
    fn local_node_id(&self) -> NodeId;

    /// Adapter number this handle was opened on.
    fn adapter(&self) -> u32;

    /// Creates a zeroed, remotely accessible segment with a fixed identifier.
    fn create_segment(&self, id: SegmentId, size: usize) -> HwResult<Box<dyn LocalSegment>>;

    /// Connects to a segment exported by `node`, waiting up to `timeout` for it to appear.
    fn connect_segment(
        &self,
        node: NodeId,
        id: SegmentId,
        timeout: Timeout,
    ) -> HwResult<Box<dyn RemoteSegment>>;

    /// Creates an interrupt; `None` lets the adapter pick a free identifier.
    fn create_interrupt(&self, id: Option<InterruptId>) -> HwResult<Box<dyn LocalInterrupt>>;

    /// Connects to an interrupt owned by `node`.
    fn connect_interrupt(
        &self,
        node: NodeId,
        id: InterruptId,
        timeout: Timeout,
    ) -> HwResult<Box<dyn RemoteInterrupt>>;
}

/// A segment owned by this node.
pub trait LocalSegment: Send + Sync + fmt::Debug {
    fn id(&self) -> SegmentId;

    /// The segment's memory.
    fn window(&self) -> Window;

    /// Waits for the next connection event.
    fn wait_event(&self, timeout: Timeout) -> HwResult<SegmentEvent>;
}

/// A connection to a segment owned by another node.
pub trait RemoteSegment: Send + Sync + fmt::Debug {
    fn node(&self) -> NodeId;

    fn id(&self) -> SegmentId;

    /// Size of the remote segment in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps `offset..offset + len` of the remote segment.
    fn map(&self, offset: usize, len: usize) -> HwResult<Window>;

    /// Orders and completes every store issued through mappings of this segment.
    fn flush(&self) -> HwResult<()>;
}

/// An interrupt this node can wait on.
pub trait LocalInterrupt: Send + Sync + fmt::Debug {
    fn id(&self) -> InterruptId;

    /// Waits for one trigger; `HwError::Timeout` when the budget runs out.
    fn wait(&self, timeout: Timeout) -> HwResult<()>;
}

/// An interrupt owned by another node.
pub trait RemoteInterrupt: Send + Sync + fmt::Debug {
    fn node(&self) -> NodeId;

    fn id(&self) -> InterruptId;

    fn trigger(&self) -> HwResult<()>;
}
