//! Fabric provider over a shared-memory segment interconnect.
//!
//! Connected endpoints exchange messages through a pair of rings that live
//! in segments each side exports to the other, and signal one another with
//! interconnect interrupts. One-sided reads and writes go straight to
//! memory regions the target registered as segments. All progress is
//! driven by the caller through completion queues, counters and event
//! queues.

#![allow(missing_docs)]

mod av;
mod cm;
mod cntr;
mod config;
mod context;
mod cq;
mod domain;
mod ep;
mod eq;
pub mod error;
mod fabric;
mod flags;
mod info;
mod lock;
mod mr;
mod msg;
mod progress;
mod rma;
mod segment;

pub use av::{AddressVector, AvAttr, AvType, FiAddr, PeerAddr, ADDR_NOTAVAIL};
pub use cm::{ConnHandle, PassiveEndpoint};
pub use cntr::{Counter, CounterAttr};
pub use config::{parse_tunable, ProviderConfig, ENV_PREFIX};
pub use context::{Provider, RegionInfo};
pub use cq::{CompletionQueue, CqAttr, CqEntry, CqFormat, CqStats, WaitObj, DEFAULT_CQ_SIZE};
pub use domain::Domain;
pub use ep::Endpoint;
pub use eq::{EqAttr, EqEntry, EventKind, EventQueue};
pub use error::{FabricError, FabricResult};
pub use fabric::Fabric;
pub use flags::{Flags, EP_MSG_CAPS, EP_RDM_CAPS, MSG_CAPS, RMA_CAPS};
pub use info::{
    getinfo, resolve_name, AddrFormat, DomainAttr, EpAttr, EpType, FabricAttr, Info, MrMode,
    ProgressMode, Version, FI_VERSION, PROVIDER_NAME,
};
pub use lock::Threading;
pub use mr::MemoryRegion;
pub use msg::Msg;
pub use progress::Progress;
pub use rma::{RmaIov, RmaMsg};
pub use segment::BufferDescriptor;
