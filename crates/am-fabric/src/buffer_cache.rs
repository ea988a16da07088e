//! Recycling pool of equally-sized backing regions.
//!
//! Every coalesced message type owns one cache sized to its coalescing
//! capacity. A buffer draws a [`RegionLease`] from the cache when it is
//! reset; when a sealed buffer ships, its lease travels with the outbound
//! send, and dropping the last handle returns the region to the pool. The
//! lease drop is the send's completion hook.

use crate::error::FabricResult;
use crate::region::Region;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct CacheInner {
    region_len: usize,
    alignment: usize,
    free: Mutex<Vec<Region>>,
}

/// Thread-safe allocate/release pool backing region reuse.
#[derive(Clone)]
pub struct BufferCache {
    inner: Arc<CacheInner>,
}

impl BufferCache {
    /// Creates a cache handing out regions of `region_len` bytes aligned to
    /// `alignment`.
    pub fn new(region_len: usize, alignment: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                region_len,
                alignment,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Draws a region from the pool, allocating a fresh one when empty.
    ///
    /// Recycled regions keep their previous contents; callers overwrite the
    /// slots they commit before anyone reads them.
    pub fn allocate(&self) -> FabricResult<Arc<RegionLease>> {
        let recycled = self.inner.free.lock().pop();
        let region = match recycled {
            Some(region) => region,
            None => Region::new_zeroed(self.inner.region_len, self.inner.alignment)?,
        };
        Ok(Arc::new(RegionLease {
            region: Some(region),
            cache: Arc::downgrade(&self.inner),
        }))
    }

    /// Length in bytes of the regions this cache hands out.
    pub fn region_len(&self) -> usize {
        self.inner.region_len
    }

    /// Number of regions currently parked in the pool.
    pub fn pooled(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// Shared handle on a cached region; the region returns to its pool when the
/// last handle drops.
pub struct RegionLease {
    region: Option<Region>,
    cache: Weak<CacheInner>,
}

impl RegionLease {
    /// Length in bytes of the leased region.
    pub fn len(&self) -> usize {
        self.region().len()
    }

    /// True when the leased region has zero usable length.
    pub fn is_empty(&self) -> bool {
        self.region().is_empty()
    }

    /// Base pointer of the leased region.
    pub fn base_ptr(&self) -> *mut u8 {
        self.region().base_ptr()
    }

    fn region(&self) -> &Region {
        self.region
            .as_ref()
            .expect("lease holds its region until drop")
    }
}

impl Drop for RegionLease {
    fn drop(&mut self) {
        if let (Some(region), Some(cache)) = (self.region.take(), self.cache.upgrade()) {
            cache.free.lock().push(region);
        }
    }
}

impl std::fmt::Debug for RegionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionLease")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_returns_region_to_pool_on_drop() {
        let cache = BufferCache::new(256, 64);
        let lease = cache.allocate().expect("allocate");
        let address = lease.base_ptr() as usize;
        assert_eq!(cache.pooled(), 0);

        drop(lease);
        assert_eq!(cache.pooled(), 1);

        let reused = cache.allocate().expect("allocate");
        assert_eq!(reused.base_ptr() as usize, address, "region is recycled");
        assert_eq!(cache.pooled(), 0);
    }

    #[test]
    fn clones_share_one_return() {
        let cache = BufferCache::new(64, 64);
        let lease = cache.allocate().expect("allocate");
        let carried = Arc::clone(&lease);
        drop(lease);
        assert_eq!(cache.pooled(), 0, "region still held by the send");
        drop(carried);
        assert_eq!(cache.pooled(), 1);
    }

    #[test]
    fn lease_outliving_cache_just_frees() {
        let cache = BufferCache::new(64, 64);
        let lease = cache.allocate().expect("allocate");
        drop(cache);
        drop(lease);
    }

    #[test]
    fn distinct_allocations_get_distinct_regions() {
        let cache = BufferCache::new(128, 64);
        let a = cache.allocate().expect("allocate");
        let b = cache.allocate().expect("allocate");
        assert_ne!(a.base_ptr(), b.base_ptr());
    }
}
