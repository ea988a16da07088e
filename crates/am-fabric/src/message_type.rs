//! Per-type registrations and the typed handle over them.
//!
//! A registration records the element layout, priority, rank sets, and the
//! raw-receive dispatcher of one declared message type. [`MessageType`] is
//! the typed handle the coalescing layer drives: it submits sealed buffers
//! to the transport and forwards termination-detector events.
//!
//! Installing a raw handler wires it through the dispatch wrapper, which
//! does the activity accounting: it bumps both handler counters at enqueue
//! time, gates on the scheduler's handler switch, completes with
//! `handler_done` toward the detector, and survives a panicking handler so
//! quiescence cannot be missed.

use crate::buffer_cache::RegionLease;
use crate::error::FabricResult;
use crate::fabric::Fabric;
use crate::scheduler::{Priority, Scheduler, TaskResult};
use crate::transport::{AllRanks, OutboundMessage, SharedRankSet};
use crate::{MessageTypeId, Rank};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) type RawReceiver = dyn Fn(Rank, Arc<RegionLease>, usize) + Send + Sync;

pub(crate) struct Registration {
    id: MessageTypeId,
    elem_size: usize,
    priority: Priority,
    max_count: AtomicUsize,
    possible_sources: Mutex<SharedRankSet>,
    possible_dests: Mutex<SharedRankSet>,
    dispatcher: Mutex<Option<Arc<RawReceiver>>>,
}

impl Registration {
    pub(crate) fn new(
        id: MessageTypeId,
        elem_size: usize,
        priority: Priority,
        communicator_size: usize,
    ) -> Self {
        let everyone: SharedRankSet = Arc::new(AllRanks(communicator_size));
        Self {
            id,
            elem_size,
            priority,
            max_count: AtomicUsize::new(1),
            possible_sources: Mutex::new(Arc::clone(&everyone)),
            possible_dests: Mutex::new(everyone),
            dispatcher: Mutex::new(None),
        }
    }

    pub(crate) fn possible_sources(&self) -> SharedRankSet {
        Arc::clone(&self.possible_sources.lock())
    }

    pub(crate) fn possible_dests(&self) -> SharedRankSet {
        Arc::clone(&self.possible_dests.lock())
    }

    pub(crate) fn dispatch(&self, src: Rank, payload: Arc<RegionLease>, count: usize) {
        let dispatcher = self.dispatcher.lock().clone();
        match dispatcher {
            Some(dispatcher) => dispatcher(src, payload, count),
            None => {
                debug_assert!(false, "message arrived before a handler was installed");
            }
        }
    }
}

/// Typed handle on a registered message type.
pub struct MessageType<T> {
    fabric: Fabric,
    registration: Arc<Registration>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for MessageType<T> {
    fn clone(&self) -> Self {
        Self {
            fabric: self.fabric.clone(),
            registration: Arc::clone(&self.registration),
            _marker: PhantomData,
        }
    }
}

impl<T: Copy + Send + 'static> MessageType<T> {
    pub(crate) fn from_parts(fabric: Fabric, registration: Arc<Registration>) -> Self {
        Self {
            fabric,
            registration,
            _marker: PhantomData,
        }
    }

    /// Numeric identity assigned at registration.
    pub fn id(&self) -> MessageTypeId {
        self.registration.id
    }

    /// Size in bytes of one element of this type.
    pub fn elem_size(&self) -> usize {
        self.registration.elem_size
    }

    /// Dispatch priority of received messages of this type.
    pub fn priority(&self) -> Priority {
        self.registration.priority
    }

    /// The owning fabric.
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Largest element count one bulk message of this type may carry.
    pub fn max_count(&self) -> usize {
        self.registration.max_count.load(Ordering::Relaxed)
    }

    /// Declares the largest element count of one bulk message.
    pub fn set_max_count(&self, max_count: usize) {
        debug_assert!(max_count >= 1);
        self.registration
            .max_count
            .store(max_count, Ordering::Relaxed);
    }

    /// Ranks this type may receive from.
    pub fn possible_sources(&self) -> SharedRankSet {
        self.registration.possible_sources()
    }

    /// Restricts the ranks this type may receive from. Mutate only between
    /// epochs.
    pub fn set_possible_sources(&self, set: SharedRankSet) {
        *self.registration.possible_sources.lock() = set;
    }

    /// Ranks this type may send to.
    pub fn possible_dests(&self) -> SharedRankSet {
        self.registration.possible_dests()
    }

    /// Restricts the ranks this type may send to. Mutate only between
    /// epochs.
    pub fn set_possible_dests(&self, set: SharedRankSet) {
        *self.registration.possible_dests.lock() = set;
    }

    /// Installs the raw bulk-receive handler, wrapped with activity
    /// accounting and scheduler dispatch.
    pub fn set_raw_handler<F>(&self, handler: F)
    where
        F: Fn(Rank, Arc<RegionLease>, usize) + Send + Sync + 'static,
    {
        let fabric = self.fabric.inner_weak();
        let priority = self.registration.priority;
        let handler = Arc::new(handler);
        let wrapper: Arc<RawReceiver> = Arc::new(move |src: Rank, payload: Arc<RegionLease>, count: usize| {
            let Some(inner) = fabric.upgrade() else {
                return;
            };
            inner.handler_calls_pending.fetch_add(1, Ordering::AcqRel);
            inner
                .handler_calls_pending_or_active
                .fetch_add(1, Ordering::AcqRel);

            let run_fabric = fabric.clone();
            let handler = Arc::clone(&handler);
            let mut slot = Some((src, payload, count));
            inner
                .scheduler
                .add_runnable(priority, move |scheduler: &Scheduler| {
                    if !scheduler.should_run_handlers() {
                        return TaskResult::Idle;
                    }
                    let Some((src, payload, count)) = slot.take() else {
                        return TaskResult::BusyAndFinished;
                    };
                    let Some(inner) = run_fabric.upgrade() else {
                        return TaskResult::RemoveFromQueue;
                    };
                    inner.handler_calls_pending.fetch_sub(1, Ordering::AcqRel);
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| handler(src, payload, count)));
                    if let Err(panic_payload) = outcome {
                        inner.record_handler_failure(panic_payload);
                    }
                    inner.td.handler_done(src);
                    inner
                        .handler_calls_pending_or_active
                        .fetch_sub(1, Ordering::AcqRel);
                    TaskResult::BusyAndFinished
                });
        });
        *self.registration.dispatcher.lock() = Some(wrapper);
    }

    /// Submits a sealed buffer of `count` elements to the transport.
    pub fn send(&self, payload: Arc<RegionLease>, count: usize, dest: Rank) -> FabricResult<()> {
        debug_assert!(self.fabric.is_valid_rank(dest));
        debug_assert!(count <= self.max_count());
        self.fabric.inner().base.send(OutboundMessage {
            message_type: self.registration.id,
            dest,
            count,
            payload,
        })
    }

    /// Tells the termination detector a message of this type is being built
    /// for `dest`.
    pub fn message_being_built(&self, dest: Rank) {
        debug_assert!(self.fabric.is_valid_rank(dest));
        self.fabric
            .inner()
            .td
            .message_being_built(dest, self.registration.id);
    }
}
