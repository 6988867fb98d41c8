use thiserror::Error;

use segfab_transport::TransportError;

use crate::{InterruptId, NodeId, SegmentId};

pub type HwResult<T> = Result<T, HwError>;

/// Failures reported by the interconnect layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HwError {
    #[error("segment {0} already exists on this node")]
    SegmentIdUsed(SegmentId),

    #[error("interrupt {0} already exists on this node")]
    InterruptIdUsed(InterruptId),

    #[error("segment {segment} not available on node {node}")]
    NoSuchSegment { node: NodeId, segment: SegmentId },

    #[error("interrupt {interrupt} not available on node {node}")]
    NoSuchInterrupt { node: NodeId, interrupt: InterruptId },

    #[error("operation timed out")]
    Timeout,

    #[error("remote resource went away")]
    Disconnected,

    #[error("mapping {offset}+{len} exceeds segment of {size} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("no free identifiers left")]
    Exhausted,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
