//! Seam to the underlying wire transport.
//!
//! The fabric never talks to a wire directly; it drives a [`BaseTransport`]
//! and receives bulk messages back through the [`DeliverySink`] it hands
//! over at attach time. The transport is assumed reliable and in-order per
//! `(source, destination, type)`.

use crate::buffer_cache::RegionLease;
use crate::error::FabricResult;
use crate::region::Region;
use crate::scheduler::Scheduler;
use crate::{MessageTypeId, Rank};
use std::sync::Arc;

/// One sealed buffer on its way out.
///
/// The lease is the completion hook: the transport (and, for an in-process
/// transport, the receiving side) drops it when done, returning the region
/// to the sender's cache.
pub struct OutboundMessage {
    /// Registration the elements belong to.
    pub message_type: MessageTypeId,
    /// Receiving rank.
    pub dest: Rank,
    /// Number of committed elements at the front of the region.
    pub count: usize,
    /// Backing region holding the committed elements.
    pub payload: Arc<RegionLease>,
}

/// Where a transport hands received bulk messages.
pub trait DeliverySink: Send + Sync {
    /// Delivers `count` elements of `message_type` that arrived from `src`.
    fn deliver(&self, message_type: MessageTypeId, src: Rank, payload: Arc<RegionLease>, count: usize);
}

/// Everything a transport needs from the fabric, handed over once.
pub struct TransportContext {
    /// Sink for received bulk messages.
    pub sink: Arc<dyn DeliverySink>,
    /// Scheduler the transport may install progress tasks on.
    pub scheduler: Arc<Scheduler>,
}

/// Contract of the underlying transport.
pub trait BaseTransport: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Communicator size.
    fn size(&self) -> usize;

    /// True when `r` names a peer in the communicator.
    fn is_valid_rank(&self, r: Rank) -> bool {
        r < self.size()
    }

    /// Installs the fabric's delivery sink and scheduler. Called exactly
    /// once, before any epoch begins.
    fn attach(&self, context: TransportContext);

    /// Collective epoch entry; returns `true` in exactly one thread of this
    /// rank.
    fn begin_epoch(&self) -> bool;

    /// Allocates a zeroed region suitable for coalescing buffers.
    fn alloc_region(&self, len: usize, alignment: usize) -> FabricResult<Region> {
        Region::new_zeroed(len, alignment)
    }

    /// Queues a sealed buffer for transmission.
    fn send(&self, message: OutboundMessage) -> FabricResult<()>;
}

/// A subset of `[0, size)` a message type may touch.
pub trait RankSet: Send + Sync {
    /// True when `r` is in the set.
    fn contains(&self, r: Rank) -> bool;

    /// Number of ranks in the set.
    fn len(&self) -> usize;

    /// The `idx`-th rank of the set, for `idx < len()`.
    fn rank_at(&self, idx: usize) -> Rank;

    /// True when the set is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle on a rank set.
pub type SharedRankSet = Arc<dyn RankSet>;

/// The full communicator `[0, size)`.
#[derive(Clone, Copy, Debug)]
pub struct AllRanks(pub usize);

impl RankSet for AllRanks {
    fn contains(&self, r: Rank) -> bool {
        r < self.0
    }

    fn len(&self) -> usize {
        self.0
    }

    fn rank_at(&self, idx: usize) -> Rank {
        debug_assert!(idx < self.0);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ranks_enumerates_the_communicator() {
        let set = AllRanks(4);
        assert_eq!(set.len(), 4);
        assert!(set.contains(0));
        assert!(set.contains(3));
        assert!(!set.contains(4));
        let ranks: Vec<Rank> = (0..set.len()).map(|i| set.rank_at(i)).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }
}
