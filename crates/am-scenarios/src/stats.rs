//! Per-run scenario statistics and the sinks that collect them.

use parking_lot::Mutex;
use std::sync::Arc;

/// Counters a scenario accumulates while it runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScenarioStats {
    /// User sends issued.
    pub sent: u32,
    /// Elements observed by handlers.
    pub delivered: u32,
    /// Buffers shipped because they filled.
    pub full_buffer_sends: u32,
    /// Buffers shipped by a flush before filling.
    pub partial_flush_sends: u32,
}

impl ScenarioStats {
    /// Zeroes every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Destination for scenario stats updates.
pub trait StatsSink: Clone + Send + 'static {
    /// Runs `f` with exclusive access to the stats.
    fn with_stats<R>(&self, f: impl FnOnce(&mut ScenarioStats) -> R) -> R;
}

/// Stats sink backed by a shared mutex.
#[derive(Clone, Default)]
pub struct ArcStatsSink(pub Arc<Mutex<ScenarioStats>>);

impl ArcStatsSink {
    /// Wraps an existing shared stats cell.
    pub fn new(stats: Arc<Mutex<ScenarioStats>>) -> Self {
        Self(stats)
    }

    /// Copies the current stats out.
    pub fn snapshot(&self) -> ScenarioStats {
        *self.0.lock()
    }
}

impl StatsSink for ArcStatsSink {
    fn with_stats<R>(&self, f: impl FnOnce(&mut ScenarioStats) -> R) -> R {
        let mut guard = self.0.lock();
        f(&mut guard)
    }
}

impl StatsSink for Arc<Mutex<ScenarioStats>> {
    fn with_stats<R>(&self, f: impl FnOnce(&mut ScenarioStats) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_updates_are_visible_in_snapshots() {
        let sink = ArcStatsSink::default();
        sink.with_stats(|s| {
            s.sent += 3;
            s.delivered += 2;
        });
        let snap = sink.snapshot();
        assert_eq!(snap.sent, 3);
        assert_eq!(snap.delivered, 2);
    }

    #[test]
    fn reset_zeroes_everything() {
        let sink = ArcStatsSink::default();
        sink.with_stats(|s| {
            s.full_buffer_sends = 9;
            s.reset();
        });
        assert_eq!(sink.snapshot().full_buffer_sends, 0);
    }
}
