//! Advisory performance-counter hooks.
//!
//! Every hook may be a no-op; nothing in the runtime depends on them for
//! correctness.

use crate::Rank;

/// Observation sink for runtime events.
pub trait PerfCounters: Send + Sync {
    /// An epoch began on `rank` (fired by the elected thread only).
    fn begin_epoch(&self, rank: Rank) {
        let _ = rank;
    }

    /// An epoch finished on `rank`.
    fn epoch_finished(&self, rank: Rank) {
        let _ = rank;
    }

    /// A buffer filled to capacity and shipped.
    fn full_buffer_send(&self, dest: Rank, count: usize, elem_size: usize) {
        let _ = (dest, count, elem_size);
    }

    /// A partially-filled buffer was sealed by a flush and shipped.
    fn flushed_message_size(&self, dest: Rank, count: usize, elem_size: usize) {
        let _ = (dest, count, elem_size);
    }

    /// A bulk message arrived from `src`.
    fn message_received(&self, src: Rank, count: usize, elem_size: usize) {
        let _ = (src, count, elem_size);
    }
}

/// Counter sink that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCounters;

impl PerfCounters for NoopCounters {}
