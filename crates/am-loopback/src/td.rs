//! Shared-memory termination detection.
//!
//! One detector serves the whole in-process cluster. It balances the global
//! count of announced messages against completed handlers, tracks which
//! ranks have requested the end of the epoch, and folds the per-rank
//! contributions with a configurable reduction. Once every rank is ending
//! and the counts balance, it broadcasts exactly one terminal message per
//! rank and resets itself for the next epoch.

use am_fabric::{
    MessageQueue, MessageTypeId, Rank, ReceiveOnly, TerminationDetector, TerminationMessage,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Binary fold combining the per-rank epoch values.
pub type ReduceOp = fn(u64, u64) -> u64;

struct EpochState {
    built: u64,
    done: u64,
    activity: u64,
    ending: Vec<bool>,
    ending_count: usize,
    combined: Option<u64>,
}

impl EpochState {
    fn new(size: usize) -> Self {
        Self {
            built: 0,
            done: 0,
            activity: 0,
            ending: vec![false; size],
            ending_count: 0,
            combined: None,
        }
    }

    fn quiescent(&self, size: usize) -> bool {
        self.ending_count == size && self.built == self.done && self.activity == 0
    }
}

struct Shared {
    size: usize,
    reduce: ReduceOp,
    state: Mutex<EpochState>,
    queues: Mutex<Vec<Option<MessageQueue<TerminationMessage>>>>,
}

impl Shared {
    /// Fires the epoch's terminal broadcast if the cluster is quiescent.
    /// State is reset under the lock; the sends happen outside it.
    fn maybe_fire(&self) {
        let combined = {
            let mut state = self.state.lock();
            if !state.quiescent(self.size) {
                return;
            }
            let combined = state.combined.unwrap_or(0);
            *state = EpochState::new(self.size);
            combined
        };

        let queues = self.queues.lock();
        for queue in queues.iter() {
            let queue = queue.as_ref().expect("every rank built its detector");
            queue.send(TerminationMessage::new(combined, true));
        }
    }
}

/// Factory handing each rank its view of the cluster detector.
pub struct SharedTdGroup {
    shared: Arc<Shared>,
}

impl SharedTdGroup {
    /// Creates a detector group for `size` ranks folding epoch values with
    /// `reduce`.
    pub fn new(size: usize, reduce: ReduceOp) -> Self {
        Self {
            shared: Arc::new(Shared {
                size,
                reduce,
                state: Mutex::new(EpochState::new(size)),
                queues: Mutex::new(vec![None; size]),
            }),
        }
    }

    /// Builds the per-rank detector and registers its termination queue.
    pub fn detector(&self, rank: Rank) -> Arc<SharedTd> {
        assert!(rank < self.shared.size, "rank {rank} outside the cluster");
        let queue = MessageQueue::new();
        self.shared.queues.lock()[rank] = Some(queue.clone());
        Arc::new(SharedTd {
            rank,
            queue,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// One rank's view of the cluster-wide termination detector.
pub struct SharedTd {
    rank: Rank,
    queue: MessageQueue<TerminationMessage>,
    shared: Arc<Shared>,
}

impl TerminationDetector for SharedTd {
    fn message_being_built(&self, _dest: Rank, _message_type: MessageTypeId) {
        self.shared.state.lock().built += 1;
    }

    fn handler_done(&self, _src: Rank) {
        self.shared.state.lock().done += 1;
        self.shared.maybe_fire();
    }

    fn setup_end_epoch(&self) {
        {
            let mut state = self.shared.state.lock();
            debug_assert!(!state.ending[self.rank], "rank {} ended twice", self.rank);
            state.ending[self.rank] = true;
            state.ending_count += 1;
        }
        self.shared.maybe_fire();
    }

    fn setup_end_epoch_with_value(&self, value: u64) {
        {
            let mut state = self.shared.state.lock();
            debug_assert!(!state.ending[self.rank], "rank {} ended twice", self.rank);
            state.ending[self.rank] = true;
            state.ending_count += 1;
            state.combined = Some(match state.combined {
                Some(current) => (self.shared.reduce)(current, value),
                None => value,
            });
        }
        self.shared.maybe_fire();
    }

    fn really_ending_epoch(&self) -> bool {
        self.shared.state.lock().ending_count == self.shared.size
    }

    fn termination_queue(&self) -> ReceiveOnly<TerminationMessage> {
        self.queue.receive_only()
    }

    fn increase_activity(&self, n: u64) {
        self.shared.state.lock().activity += n;
    }

    fn decrease_activity(&self, n: u64) {
        {
            let mut state = self.shared.state.lock();
            debug_assert!(state.activity >= n, "activity count underflow");
            state.activity = state.activity.saturating_sub(n);
        }
        self.shared.maybe_fire();
    }
}
