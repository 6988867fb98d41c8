//! Core shared-memory primitives for the segment fabric.
//!
//! This crate exposes the building blocks every higher layer shares:
//! * [`SharedRegion`] / [`Window`] – aligned memory and the bounds-checked views peers map.
//! * [`RingWriter`] / [`RingReader`] – the two halves of the cross-node frame ring.
//! * [`Slab`] – generation-checked recycler for queue entries.
//! * [`BucketMap`] – fixed-bucket hash map for registries.
//! * [`Timeout`] – chained wait budgets.

mod bucket_map;
mod error;
mod region;
mod ring;
mod slab;
pub mod wait;

pub use bucket_map::BucketMap;
pub use error::{TransportError, TransportResult};
pub use region::{RegionInit, SharedRegion, Window, WORD_ALIGN};
pub use ring::{
    frame_len, BufferLayout, Received, RingReader, RingWriter, Truncated, WouldBlock,
    FRAME_HEADER, MIN_RING_BYTES, STATUS_BYTES,
};
pub use slab::{Handle, Slab};
pub use wait::{Deadline, Timeout};
