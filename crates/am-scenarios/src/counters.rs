//! Recording implementation of the fabric's counter hooks.
//!
//! Hooks fire from whichever thread seals, flushes, or dispatches, so the
//! event log is an append buffer rather than a locked vector: concurrent
//! pushes are lock-free and recorded events never move.

use am::AppendBuffer;
use am_fabric::{PerfCounters, Rank};
use std::sync::Arc;

/// One observed counter event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterEvent {
    /// `begin_epoch` fired on a rank.
    BeginEpoch {
        /// Observing rank.
        rank: Rank,
    },
    /// An epoch finished on a rank.
    EpochFinished {
        /// Observing rank.
        rank: Rank,
    },
    /// A buffer filled and shipped.
    FullBufferSend {
        /// Destination rank.
        dest: Rank,
        /// Elements in the shipped buffer.
        count: usize,
    },
    /// A flush sealed and shipped a partial buffer.
    FlushedMessage {
        /// Destination rank.
        dest: Rank,
        /// Elements in the shipped buffer.
        count: usize,
    },
    /// A bulk message arrived.
    MessageReceived {
        /// Sending rank.
        src: Rank,
        /// Elements in the received buffer.
        count: usize,
    },
}

/// Counter sink that records every hook invocation.
#[derive(Clone, Default)]
pub struct RecordingCounters {
    events: Arc<AppendBuffer<CounterEvent>>,
}

impl RecordingCounters {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event seen so far, in commit order.
    pub fn events(&self) -> Vec<CounterEvent> {
        self.events.iter().copied().collect()
    }

    /// Shapes of the full-buffer sends, in order.
    pub fn full_sends(&self) -> Vec<(Rank, usize)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                CounterEvent::FullBufferSend { dest, count } => Some((*dest, *count)),
                _ => None,
            })
            .collect()
    }

    /// Shapes of the flush-sealed sends, in order.
    pub fn flushed_sends(&self) -> Vec<(Rank, usize)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                CounterEvent::FlushedMessage { dest, count } => Some((*dest, *count)),
                _ => None,
            })
            .collect()
    }

    /// Total elements observed arriving.
    pub fn received_elements(&self) -> usize {
        self.events
            .iter()
            .filter_map(|e| match e {
                CounterEvent::MessageReceived { count, .. } => Some(*count),
                _ => None,
            })
            .sum()
    }
}

impl PerfCounters for RecordingCounters {
    fn begin_epoch(&self, rank: Rank) {
        self.events.push_back(CounterEvent::BeginEpoch { rank });
    }

    fn epoch_finished(&self, rank: Rank) {
        self.events.push_back(CounterEvent::EpochFinished { rank });
    }

    fn full_buffer_send(&self, dest: Rank, count: usize, _elem_size: usize) {
        self.events
            .push_back(CounterEvent::FullBufferSend { dest, count });
    }

    fn flushed_message_size(&self, dest: Rank, count: usize, _elem_size: usize) {
        self.events
            .push_back(CounterEvent::FlushedMessage { dest, count });
    }

    fn message_received(&self, src: Rank, count: usize, _elem_size: usize) {
        self.events
            .push_back(CounterEvent::MessageReceived { src, count });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_append_in_order() {
        let rec = RecordingCounters::new();
        rec.begin_epoch(0);
        rec.full_buffer_send(1, 4, 8);
        rec.flushed_message_size(1, 2, 8);
        rec.message_received(0, 4, 8);
        rec.epoch_finished(0);

        assert_eq!(
            rec.events(),
            vec![
                CounterEvent::BeginEpoch { rank: 0 },
                CounterEvent::FullBufferSend { dest: 1, count: 4 },
                CounterEvent::FlushedMessage { dest: 1, count: 2 },
                CounterEvent::MessageReceived { src: 0, count: 4 },
                CounterEvent::EpochFinished { rank: 0 },
            ]
        );
        assert_eq!(rec.full_sends(), vec![(1, 4)]);
        assert_eq!(rec.flushed_sends(), vec![(1, 2)]);
        assert_eq!(rec.received_elements(), 4);
    }
}
