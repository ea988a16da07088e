//! Termination-detector contract.
//!
//! The detector is a policy object supplied by the transport layer. The
//! fabric forwards the events it cares about — a buffer starting to fill, a
//! handler completing, an epoch-end request — and waits for the single
//! terminal message the detector emits into its receive-only queue once the
//! whole communicator is quiescent. How the detector reaches that verdict is
//! its own business.

use crate::queue::ReceiveOnly;
use crate::{MessageTypeId, Rank};

/// The one message a detector emits per epoch.
#[derive(Clone, Copy, Debug)]
pub struct TerminationMessage {
    combined: u64,
    last_thread: bool,
}

impl TerminationMessage {
    /// Builds a terminal message carrying the epoch's combined value.
    pub fn new(combined: u64, last_thread: bool) -> Self {
        Self {
            combined,
            last_thread,
        }
    }

    /// The reduction of every rank's `end_epoch_with_value` contribution.
    pub fn combined_value(&self) -> u64 {
        self.combined
    }

    /// True in the message releasing the last waiting thread of this rank.
    pub fn is_last_thread(&self) -> bool {
        self.last_thread
    }
}

/// Distributed quiescence detection, seen from one rank.
pub trait TerminationDetector: Send + Sync {
    /// A coalescing buffer for `dest` received its first element; one
    /// logical message of type `message_type` is now being built.
    fn message_being_built(&self, dest: Rank, message_type: MessageTypeId);

    /// A handler finished processing a bulk message that arrived from `src`.
    fn handler_done(&self, src: Rank);

    /// This rank requests the end of the current epoch.
    fn setup_end_epoch(&self);

    /// As [`setup_end_epoch`](Self::setup_end_epoch), contributing `value`
    /// to the epoch's reduction.
    fn setup_end_epoch_with_value(&self, value: u64);

    /// True once every rank has requested the end of the epoch.
    fn really_ending_epoch(&self) -> bool;

    /// The queue the terminal message arrives on.
    fn termination_queue(&self) -> ReceiveOnly<TerminationMessage>;

    /// Holds the epoch open for `n` units of out-of-band work.
    fn increase_activity(&self, n: u64) {
        let _ = n;
    }

    /// Releases activity previously added with
    /// [`increase_activity`](Self::increase_activity).
    fn decrease_activity(&self, n: u64) {
        let _ = n;
    }
}
