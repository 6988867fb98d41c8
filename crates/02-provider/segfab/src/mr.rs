use std::fmt;
use std::sync::Arc;

use segfab_interconnect::{LocalSegment, SegmentId};
use segfab_transport::Window;
use tracing::debug;

use crate::context::{Provider, RegionInfo};
use crate::error::{FabricError, FabricResult};
use crate::flags::Flags;
use crate::segment::HwContext;

/// Memory exposed to remote RMA under a key.
///
/// The key is the identifier of the segment backing the region, so a peer
/// that knows `{node, key}` can map it directly.
pub struct MemoryRegion {
    provider: Arc<Provider>,
    segment: Box<dyn LocalSegment>,
    fid: u64,
    key: SegmentId,
    access: Flags,
}

impl MemoryRegion {
    pub(crate) fn register(
        provider: Arc<Provider>,
        len: usize,
        access: Flags,
        requested_key: u64,
    ) -> FabricResult<Self> {
        let key = SegmentId::try_from(requested_key).map_err(|_| FabricError::KeyRejected)?;
        let segment = provider
            .interconnect()
            .create_segment(key, len)
            .map_err(HwContext::Register.err())?;
        let fid = provider.next_fid();
        provider.register_region(
            u64::from(key),
            RegionInfo {
                fid,
                len,
                access,
            },
        );
        debug!(fid, key, len, ?access, "registered memory region");
        Ok(Self {
            provider,
            segment,
            fid,
            key,
            access,
        })
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn key(&self) -> u64 {
        u64::from(self.key)
    }

    pub fn access(&self) -> Flags {
        self.access
    }

    pub fn len(&self) -> usize {
        self.segment.window().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The region's memory, as remote peers see it.
    pub fn window(&self) -> Window {
        self.segment.window()
    }

    /// Copies `dst.len()` bytes out of the region at `offset`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> FabricResult<()> {
        let window = self.segment.window().sub(offset, dst.len())?;
        window.read(0, dst);
        Ok(())
    }

    /// Copies `src` into the region at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> FabricResult<()> {
        let window = self.segment.window().sub(offset, src.len())?;
        window.write(0, src);
        Ok(())
    }

    /// Unregisters the region and destroys its segment.
    pub fn close(self) {}
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.provider.unregister_region(u64::from(self.key));
        debug!(fid = self.fid, key = self.key, "memory region closed");
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("fid", &self.fid)
            .field("key", &self.key)
            .field("access", &self.access)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use segfab_interconnect::loopback::LoopbackFabric;

    fn provider() -> Arc<Provider> {
        Provider::new(LoopbackFabric::new().node(1), ProviderConfig::default()).expect("provider")
    }

    #[test]
    fn registration_round_trip() {
        let fabric = LoopbackFabric::new();
        let provider = Provider::new(fabric.node(1), ProviderConfig::default()).expect("provider");
        let mr = MemoryRegion::register(Arc::clone(&provider), 128, Flags::REMOTE_WRITE, 5)
            .expect("register");
        assert_eq!(mr.key(), 5);
        assert_eq!(provider.registered_regions(), 1);
        assert_eq!(provider.region(5).map(|r| r.len), Some(128));

        mr.write(120, b"tail").expect("write");
        let mut out = [0u8; 4];
        mr.read(120, &mut out).expect("read");
        assert_eq!(&out, b"tail");
        assert!(mr.write(126, b"tail").is_err());

        mr.close();
        assert_eq!(provider.registered_regions(), 0);
        assert_eq!(fabric.segment_count(1), 0);
    }

    #[test]
    fn key_errors() {
        let provider = provider();
        assert!(matches!(
            MemoryRegion::register(Arc::clone(&provider), 64, Flags::empty(), 1 << 40),
            Err(FabricError::KeyRejected)
        ));
        let _held = MemoryRegion::register(Arc::clone(&provider), 64, Flags::empty(), 9)
            .expect("first");
        assert!(matches!(
            MemoryRegion::register(provider, 64, Flags::empty(), 9),
            Err(FabricError::NoKey)
        ));
    }
}
