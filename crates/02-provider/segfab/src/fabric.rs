use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::cm::PassiveEndpoint;
use crate::context::Provider;
use crate::domain::Domain;
use crate::eq::{EqAttr, EventQueue};
use crate::error::{FabricError, FabricResult};
use crate::info::{FabricAttr, Info, PROVIDER_NAME};

/// Top-level object; entry point for domains, event queues and listeners.
pub struct Fabric {
    fid: u64,
    provider: Arc<Provider>,
}

impl Fabric {
    pub fn open(provider: Arc<Provider>, attr: &FabricAttr) -> FabricResult<Arc<Self>> {
        for name in [&attr.name, &attr.prov_name].into_iter().flatten() {
            if name != PROVIDER_NAME {
                return Err(FabricError::NoData);
            }
        }
        let fid = provider.next_fid();
        debug!(fid, node = provider.local_node_id(), "opened fabric");
        Ok(Arc::new(Self { fid, provider }))
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn domain(&self, info: &Info) -> FabricResult<Arc<Domain>> {
        Domain::open(Arc::clone(&self.provider), self.fid, &info.domain_attr)
    }

    pub fn eq_open(&self, attr: EqAttr) -> FabricResult<Arc<EventQueue>> {
        EventQueue::open(self.provider.next_fid(), attr).map(Arc::new)
    }

    /// Opens a passive endpoint that will listen on `info.src_addr`.
    pub fn passive_ep(&self, info: &Info) -> FabricResult<PassiveEndpoint> {
        PassiveEndpoint::open(Arc::clone(&self.provider), info)
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("fid", &self.fid)
            .field("provider", &self.provider)
            .finish()
    }
}
