//! In-process cluster of ranks wired through shared inboxes.
//!
//! Sends push the sealed buffer's lease straight into the destination
//! rank's inbox; a progress task installed on each rank's scheduler drains
//! the inbox into the fabric's delivery sink. Delivery is reliable and
//! FIFO per `(source, destination)`, which covers the in-order contract the
//! fabric assumes.

use crate::td::{ReduceOp, SharedTd, SharedTdGroup};
use am_fabric::{
    BaseTransport, Fabric, FabricError, FabricResult, MessageTypeId, OutboundMessage,
    PerfCounters, Rank, RegionLease, Scheduler, TaskResult, TransportContext,
};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Barrier};
use std::thread;

struct Delivery {
    message_type: MessageTypeId,
    src: Rank,
    payload: Arc<RegionLease>,
    count: usize,
}

struct ClusterShared {
    size: usize,
    inboxes: Vec<Mutex<VecDeque<Delivery>>>,
    epoch_barrier: Barrier,
}

/// One rank's endpoint of the in-process cluster.
pub struct LoopbackTransport {
    rank: Rank,
    shared: Arc<ClusterShared>,
}

impl BaseTransport for LoopbackTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn attach(&self, context: TransportContext) {
        let shared = Arc::clone(&self.shared);
        let rank = self.rank;
        let sink = context.sink;
        context.scheduler.add_idle_task(move |_s: &Scheduler| {
            let delivery = shared.inboxes[rank].lock().pop_front();
            match delivery {
                Some(d) => {
                    sink.deliver(d.message_type, d.src, d.payload, d.count);
                    TaskResult::BusyAndFinished
                }
                None => TaskResult::Idle,
            }
        });
    }

    fn begin_epoch(&self) -> bool {
        self.shared.epoch_barrier.wait();
        // One pumping thread per rank here, so that thread is the election.
        true
    }

    fn send(&self, message: OutboundMessage) -> FabricResult<()> {
        if !self.is_valid_rank(message.dest) {
            return Err(FabricError::InvalidRank {
                rank: message.dest,
                size: self.size(),
            });
        }
        self.shared.inboxes[message.dest].lock().push_back(Delivery {
            message_type: message.message_type,
            src: self.rank,
            payload: message.payload,
            count: message.count,
        });
        Ok(())
    }
}

/// Builder for a [`Cluster`]; the reduction defaults to summation.
pub struct ClusterBuilder {
    size: usize,
    reduce: ReduceOp,
}

impl ClusterBuilder {
    /// Starts a builder for `size` ranks.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            reduce: |a, b| a + b,
        }
    }

    /// Replaces the epoch-value reduction.
    pub fn reduce(mut self, reduce: ReduceOp) -> Self {
        self.reduce = reduce;
        self
    }

    /// Builds the cluster.
    pub fn build(self) -> Result<Cluster> {
        if self.size == 0 {
            return Err(anyhow!("a cluster needs at least one rank"));
        }
        Ok(Cluster {
            shared: Arc::new(ClusterShared {
                size: self.size,
                inboxes: (0..self.size).map(|_| Mutex::new(VecDeque::new())).collect(),
                epoch_barrier: Barrier::new(self.size),
            }),
            td_group: SharedTdGroup::new(self.size, self.reduce),
        })
    }
}

/// N ranks sharing one process, one detector, and one set of inboxes.
pub struct Cluster {
    shared: Arc<ClusterShared>,
    td_group: SharedTdGroup,
}

impl Cluster {
    /// Builds a sum-reducing cluster of `size` ranks.
    ///
    /// # Panics
    ///
    /// Panics when `size` is zero; use [`Cluster::builder`] for a fallible
    /// construction path.
    pub fn new(size: usize) -> Self {
        assert!(size >= 1, "a cluster needs at least one rank");
        ClusterBuilder::new(size)
            .build()
            .expect("non-zero size validated above")
    }

    /// Starts a [`ClusterBuilder`].
    pub fn builder(size: usize) -> ClusterBuilder {
        ClusterBuilder::new(size)
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// The transport endpoint of `rank`.
    pub fn transport(&self, rank: Rank) -> Arc<LoopbackTransport> {
        assert!(rank < self.shared.size, "rank {rank} outside the cluster");
        Arc::new(LoopbackTransport {
            rank,
            shared: Arc::clone(&self.shared),
        })
    }

    /// The detector view of `rank`.
    pub fn detector(&self, rank: Rank) -> Arc<SharedTd> {
        self.td_group.detector(rank)
    }

    /// Builds the fabric of `rank`. Call once per rank.
    pub fn node(&self, rank: Rank) -> Fabric {
        Fabric::new(self.transport(rank), self.detector(rank))
    }

    /// As [`node`](Self::node), with a custom counter sink.
    pub fn node_with_counters(&self, rank: Rank, counters: Arc<dyn PerfCounters>) -> Fabric {
        Fabric::builder(self.transport(rank), self.detector(rank))
            .counters(counters)
            .build()
    }

    /// Runs `f` once per rank, each on its own thread, and joins them all.
    /// A panicking rank propagates out of this call.
    pub fn run_with<F>(&self, f: F)
    where
        F: Fn(&Fabric, Rank) + Send + Sync,
    {
        thread::scope(|scope| {
            for rank in 0..self.shared.size {
                let fabric = self.node(rank);
                let f = &f;
                scope.spawn(move || f(&fabric, rank));
            }
        });
    }

    /// Convenience: builds a sum-reducing cluster and runs `f` on every rank.
    pub fn run<F>(size: usize, f: F)
    where
        F: Fn(&Fabric, Rank) + Send + Sync,
    {
        Cluster::new(size).run_with(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_fabric::BufferCache;

    #[test]
    fn builder_rejects_empty_clusters() {
        assert!(ClusterBuilder::new(0).build().is_err());
        assert!(ClusterBuilder::new(1).build().is_ok());
    }

    #[test]
    fn transports_report_rank_and_size() {
        let cluster = Cluster::new(3);
        let t = cluster.transport(2);
        assert_eq!(t.rank(), 2);
        assert_eq!(t.size(), 3);
        assert!(t.is_valid_rank(0));
        assert!(!t.is_valid_rank(3));
    }

    #[test]
    fn send_to_invalid_rank_is_refused() {
        let cluster = Cluster::new(2);
        let t = cluster.transport(0);
        let cache = BufferCache::new(32, 64);
        let lease = cache.allocate().expect("allocate");
        let refused = t.send(OutboundMessage {
            message_type: 0,
            dest: 9,
            count: 1,
            payload: lease,
        });
        assert!(refused.is_err());
    }
}
