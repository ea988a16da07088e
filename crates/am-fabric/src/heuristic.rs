//! Coalescing heuristics.
//!
//! A heuristic is consulted after every coalesced send; returning `true`
//! asks the owning message type to flush all of its destinations now. The
//! reference implementation watches send velocity and flushes when the
//! application's message rate drops, so partially-filled buffers do not sit
//! on latency while the workload thins out.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Capability consulted once per send.
pub trait FlushHeuristic: Send + Sync {
    /// True means "flush now".
    fn execute(&self) -> bool;
}

/// Heuristic that never requests a flush.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFlush;

impl FlushHeuristic for NoFlush {
    fn execute(&self) -> bool {
        false
    }
}

struct VelocityWindow {
    started: Instant,
    velocity: f64,
}

/// Flushes when the observed messages-per-second falls below the previous
/// window's estimate.
///
/// Every `threshold` sends close one measurement window; the window's
/// velocity is compared against the prior one and a slowdown requests a
/// flush.
pub struct RelativeVelocity {
    threshold: u32,
    message_count: AtomicU32,
    window: Mutex<VelocityWindow>,
}

impl RelativeVelocity {
    /// Creates a heuristic closing a window every `threshold` sends.
    pub fn new(threshold: u32) -> Self {
        assert!(threshold > 0, "velocity window must cover at least one send");
        Self {
            threshold,
            message_count: AtomicU32::new(0),
            window: Mutex::new(VelocityWindow {
                started: Instant::now(),
                velocity: 1.0,
            }),
        }
    }

    /// The configured window size in sends.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl FlushHeuristic for RelativeVelocity {
    fn execute(&self) -> bool {
        let n = self.message_count.fetch_add(1, Ordering::Relaxed) + 1;
        if n != self.threshold {
            return false;
        }
        let mut window = self.window.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(window.started).as_secs_f64().max(1e-9);
        let velocity = f64::from(self.threshold) / elapsed;
        let slowed = velocity < window.velocity;
        window.velocity = velocity;
        window.started = now;
        self.message_count.store(0, Ordering::Relaxed);
        slowed
    }
}
