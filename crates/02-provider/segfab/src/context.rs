use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use segfab_interconnect::{Interconnect, NodeId};
use segfab_transport::BucketMap;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::FabricResult;
use crate::flags::Flags;
use crate::segment::BufferPool;

/// Registry record of a memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub fid: u64,
    pub len: usize,
    pub access: Flags,
}

/// Process-wide provider state.
///
/// Created once at initialization and shared by every fabric, domain and
/// endpoint opened through it. Holds the only mutable state that spans
/// objects: the data-segment allocator and the memory-region registry.
pub struct Provider {
    interconnect: Arc<dyn Interconnect>,
    config: ProviderConfig,
    buffers: Mutex<BufferPool>,
    regions: Mutex<BucketMap<u64, RegionInfo>>,
    next_fid: AtomicU64,
}

impl Provider {
    pub fn new(interconnect: Arc<dyn Interconnect>, config: ProviderConfig) -> FabricResult<Arc<Self>> {
        config.validate()?;
        debug!(
            node = interconnect.local_node_id(),
            adapter = config.adapter,
            buffer_size = config.buffer_size,
            "provider initialized"
        );
        Ok(Arc::new(Self {
            buffers: Mutex::new(BufferPool::new(&config)),
            regions: Mutex::new(BucketMap::new(config.mr_map_buckets)),
            next_fid: AtomicU64::new(1),
            interconnect,
            config,
        }))
    }

    /// Provider configured from `FI_SEGFAB_*` environment variables.
    pub fn from_env(interconnect: Arc<dyn Interconnect>) -> FabricResult<Arc<Self>> {
        Self::new(interconnect, ProviderConfig::from_env()?)
    }

    pub fn interconnect(&self) -> &Arc<dyn Interconnect> {
        &self.interconnect
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn local_node_id(&self) -> NodeId {
        self.interconnect.local_node_id()
    }

    /// Number of memory regions currently registered.
    pub fn registered_regions(&self) -> usize {
        self.regions.lock().len()
    }

    /// Looks up a registered memory region by key.
    pub fn region(&self, key: u64) -> Option<RegionInfo> {
        self.regions.lock().get(&key).copied()
    }

    /// Data segments created so far and buffers currently free in them.
    pub fn buffer_usage(&self) -> (usize, usize) {
        let pool = self.buffers.lock();
        (pool.segment_count(), pool.free_buffers())
    }

    pub(crate) fn next_fid(&self) -> u64 {
        self.next_fid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn buffers(&self) -> &Mutex<BufferPool> {
        &self.buffers
    }

    pub(crate) fn register_region(&self, key: u64, info: RegionInfo) {
        self.regions.lock().insert(key, info);
    }

    pub(crate) fn unregister_region(&self, key: u64) {
        self.regions.lock().remove(&key);
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("node", &self.local_node_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
