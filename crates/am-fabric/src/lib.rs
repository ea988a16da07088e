//! Active-message fabric.
//!
//! The fabric lets any rank in a communicator send a small typed datum to any
//! other rank and have a registered handler invoked there, inside an
//! epoch-structured execution model terminated by distributed quiescence.
//! Sends are coalesced: many user sends sharing a `(type, destination)` pair
//! are packed into one transport message through a lock-free bounded buffer
//! per destination.
//!
//! Layering, bottom up:
//!
//! - [`region`] / [`buffer_cache`] — aligned backing memory and its
//!   recycling pool; a [`RegionLease`] travels with each outbound send and
//!   returns the region to the pool when the send completes.
//! - [`scheduler`] — the cooperative task queue that serializes handler
//!   dispatch and drives idle-time flushing.
//! - [`transport`] / [`termination`] — the seams to the wire transport and
//!   the termination detector; both are collaborator traits, not
//!   implementations.
//! - [`message_type`] / [`fabric`] — the per-type registry and the façade
//!   owning epochs, activity counters, and flush objects.
//! - [`coalesced`] — the coalescing send path itself.

pub mod buffer_cache;
pub mod coalesced;
pub mod counters;
pub mod error;
pub mod fabric;
pub mod heuristic;
pub mod message_type;
pub mod queue;
pub mod region;
pub mod scheduler;
pub mod sorter;
pub mod termination;
pub mod transport;

/// Identifies a peer within the communicator; always in `[0, size)`.
pub type Rank = usize;

/// Numeric identity assigned to a message type at registration.
pub type MessageTypeId = u32;

pub use buffer_cache::{BufferCache, RegionLease};
pub use coalesced::{Coalesced, CoalescedConfig};
pub use counters::{NoopCounters, PerfCounters};
pub use error::{FabricError, FabricResult};
pub use fabric::{EndEpochRequest, Fabric, FabricBuilder};
pub use heuristic::{FlushHeuristic, NoFlush, RelativeVelocity};
pub use message_type::MessageType;
pub use queue::{MessageQueue, ReceiveOnly};
pub use region::Region;
pub use scheduler::{Priority, Scheduler, TaskResult};
pub use sorter::{BufferSorter, NoSort};
pub use termination::{TerminationDetector, TerminationMessage};
pub use transport::{
    AllRanks, BaseTransport, DeliverySink, OutboundMessage, RankSet, SharedRankSet,
    TransportContext,
};
