use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::av::{AddressVector, AvAttr};
use crate::cntr::{Counter, CounterAttr};
use crate::context::Provider;
use crate::cq::{CompletionQueue, CqAttr};
use crate::ep::Endpoint;
use crate::error::{FabricError, FabricResult};
use crate::flags::Flags;
use crate::info::{DomainAttr, Info, MrMode, ProgressMode, PROVIDER_NAME};
use crate::lock::{LockMode, Threading};
use crate::mr::MemoryRegion;

/// A resource domain.
///
/// Owns nothing but its attributes: queues, counters and regions hold the
/// provider directly and remember which domain opened them so that bind can
/// reject cross-domain wiring.
pub struct Domain {
    fid: u64,
    fabric_fid: u64,
    provider: Arc<Provider>,
    threading: Threading,
    data_progress: ProgressMode,
    mr_mode: MrMode,
}

impl Domain {
    pub(crate) fn open(
        provider: Arc<Provider>,
        fabric_fid: u64,
        attr: &DomainAttr,
    ) -> FabricResult<Arc<Self>> {
        if let Some(name) = &attr.name {
            if name != PROVIDER_NAME {
                return Err(FabricError::NoData);
            }
        }
        let threading = match attr.threading {
            Threading::Unspec => Threading::Completion,
            t if t < Threading::Completion => t,
            _ => Threading::Completion,
        };
        let data_progress = match attr.data_progress {
            ProgressMode::Auto => ProgressMode::Auto,
            _ => ProgressMode::Manual,
        };
        let mr_mode = match attr.mr_mode {
            MrMode::Basic => MrMode::Basic,
            _ => MrMode::Scalable,
        };
        let fid = provider.next_fid();
        debug!(fid, ?threading, ?data_progress, ?mr_mode, "opened domain");
        Ok(Arc::new(Self {
            fid,
            fabric_fid,
            provider,
            threading,
            data_progress,
            mr_mode,
        }))
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn fabric_fid(&self) -> u64 {
        self.fabric_fid
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn threading(&self) -> Threading {
        self.threading
    }

    pub fn data_progress(&self) -> ProgressMode {
        self.data_progress
    }

    pub fn mr_mode(&self) -> MrMode {
        self.mr_mode
    }

    pub fn cq_open(&self, attr: CqAttr) -> FabricResult<Arc<CompletionQueue>> {
        CompletionQueue::open(
            Arc::clone(&self.provider),
            self.fid,
            LockMode::for_queues(self.threading),
            attr,
        )
    }

    pub fn cntr_open(&self, attr: CounterAttr) -> FabricResult<Arc<Counter>> {
        let fid = self.provider.next_fid();
        Counter::open(fid, self.fid, LockMode::for_queues(self.threading), attr).map(Arc::new)
    }

    pub fn av_open(&self, attr: AvAttr) -> FabricResult<Arc<AddressVector>> {
        let fid = self.provider.next_fid();
        AddressVector::open(fid, self.fid, attr).map(Arc::new)
    }

    /// Registers `len` bytes of memory for remote access under
    /// `requested_key`.
    pub fn mr_reg(
        &self,
        len: usize,
        access: Flags,
        requested_key: u64,
    ) -> FabricResult<MemoryRegion> {
        if self.mr_mode == MrMode::Basic {
            return Err(FabricError::BadFlags);
        }
        MemoryRegion::register(Arc::clone(&self.provider), len, access, requested_key)
    }

    /// Opens an active endpoint described by `info`.
    pub fn endpoint(self: &Arc<Self>, info: &Info) -> FabricResult<Endpoint> {
        Endpoint::open(Arc::clone(self), info)
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("fid", &self.fid)
            .field("threading", &self.threading)
            .field("data_progress", &self.data_progress)
            .field("mr_mode", &self.mr_mode)
            .finish()
    }
}
