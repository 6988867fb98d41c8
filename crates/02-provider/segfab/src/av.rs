//! Address vectors.
//!
//! In map mode an `FiAddr` *is* the peer address (node id in the high half,
//! segment id in the low half), so nothing needs to be stored. Table mode
//! appends addresses to a growable table and hands out indices.

use std::fmt;

use parking_lot::RwLock;
use segfab_interconnect::{NodeId, SegmentId};
use tracing::trace;

use crate::error::{FabricError, FabricResult};
use crate::flags::Flags;

/// Opaque address handed to the application.
pub type FiAddr = u64;

/// Marks "no address".
pub const ADDR_NOTAVAIL: FiAddr = u64::MAX;

/// `{node, segment}` pair identifying a rendezvous point or memory region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub node_id: NodeId,
    pub segment_id: SegmentId,
}

impl PeerAddr {
    /// Encoded length of an address.
    pub const LEN: usize = 8;

    pub const fn new(node_id: NodeId, segment_id: SegmentId) -> Self {
        Self {
            node_id,
            segment_id,
        }
    }

    /// Native-endian `node_id` followed by `segment_id`; both ends of a link
    /// share the same architecture.
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(&self.node_id.to_ne_bytes());
        out[4..].copy_from_slice(&self.segment_id.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> FabricResult<Self> {
        let bytes: &[u8; Self::LEN] = bytes
            .try_into()
            .map_err(|_| FabricError::Inval("address length mismatch"))?;
        let (node, segment) = bytes.split_at(4);
        Ok(Self {
            node_id: NodeId::from_ne_bytes([node[0], node[1], node[2], node[3]]),
            segment_id: SegmentId::from_ne_bytes([segment[0], segment[1], segment[2], segment[3]]),
        })
    }

    fn as_map_addr(self) -> FiAddr {
        (u64::from(self.node_id) << 32) | u64::from(self.segment_id)
    }

    fn from_map_addr(addr: FiAddr) -> Self {
        Self {
            node_id: (addr >> 32) as NodeId,
            segment_id: addr as SegmentId,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segfab://{}:{}", self.node_id, self.segment_id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AvType {
    #[default]
    Unspec,
    Map,
    Table,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AvAttr {
    pub av_type: AvType,
    /// Expected number of addresses; sizes the initial table.
    pub count: usize,
    pub flags: Flags,
}

#[derive(Debug)]
struct Table {
    entries: Vec<PeerAddr>,
    /// Slots reserved; grows to `2 * capacity + requested` when exceeded.
    capacity: usize,
}

impl Table {
    fn reserve(&mut self, additional: usize) {
        let needed = self.entries.len() + additional;
        if needed > self.capacity {
            self.capacity = 2 * self.capacity + additional;
            self.entries
                .reserve_exact(self.capacity - self.entries.len());
            trace!(capacity = self.capacity, "address table grown");
        }
    }
}

/// An address vector opened on a domain.
#[derive(Debug)]
pub struct AddressVector {
    fid: u64,
    domain_fid: u64,
    av_type: AvType,
    table: RwLock<Table>,
}

impl AddressVector {
    pub(crate) fn open(fid: u64, domain_fid: u64, attr: AvAttr) -> FabricResult<Self> {
        if !attr.flags.is_empty() {
            return Err(FabricError::BadFlags);
        }
        let av_type = match attr.av_type {
            AvType::Table => AvType::Table,
            AvType::Map | AvType::Unspec => AvType::Map,
        };
        let capacity = if av_type == AvType::Table { attr.count } else { 0 };
        Ok(Self {
            fid,
            domain_fid,
            av_type,
            table: RwLock::new(Table {
                entries: Vec::with_capacity(capacity),
                capacity,
            }),
        })
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn domain_fid(&self) -> u64 {
        self.domain_fid
    }

    pub fn av_type(&self) -> AvType {
        self.av_type
    }

    /// Inserts `addrs`, returning one `FiAddr` per address in order.
    pub fn insert(&self, addrs: &[PeerAddr]) -> Vec<FiAddr> {
        match self.av_type {
            AvType::Table => {
                let mut table = self.table.write();
                table.reserve(addrs.len());
                let first = table.entries.len() as FiAddr;
                table.entries.extend_from_slice(addrs);
                (first..first + addrs.len() as FiAddr).collect()
            }
            _ => addrs.iter().map(|addr| addr.as_map_addr()).collect(),
        }
    }

    /// Inserts addresses given in their byte encoding.
    pub fn insert_bytes(&self, raw: &[u8]) -> FabricResult<Vec<FiAddr>> {
        if raw.len() % PeerAddr::LEN != 0 {
            return Err(FabricError::Inval("address buffer length mismatch"));
        }
        let addrs = raw
            .chunks_exact(PeerAddr::LEN)
            .map(PeerAddr::from_bytes)
            .collect::<FabricResult<Vec<_>>>()?;
        Ok(self.insert(&addrs))
    }

    /// Maps an `FiAddr` back to the peer address it stands for.
    pub fn lookup(&self, addr: FiAddr) -> FabricResult<PeerAddr> {
        match self.av_type {
            AvType::Table => {
                let table = self.table.read();
                usize::try_from(addr)
                    .ok()
                    .and_then(|index| table.entries.get(index))
                    .copied()
                    .ok_or(FabricError::Inval("address not in table"))
            }
            _ => {
                if addr == ADDR_NOTAVAIL {
                    return Err(FabricError::Inval("address not available"));
                }
                Ok(PeerAddr::from_map_addr(addr))
            }
        }
    }

    /// Accepted and ignored; table entries are never reclaimed.
    pub fn remove(&self, _addrs: &[FiAddr]) -> FabricResult<()> {
        Ok(())
    }

    /// Printable form of an address.
    pub fn straddr(&self, addr: &PeerAddr) -> String {
        addr.to_string()
    }

    /// Addresses stored in table mode.
    pub fn len(&self) -> usize {
        self.table.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Table slots reserved so far.
    pub fn table_capacity(&self) -> usize {
        self.table.read().capacity
    }
}
