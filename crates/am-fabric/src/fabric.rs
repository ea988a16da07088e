//! Transport façade and epoch lifecycle.
//!
//! A [`Fabric`] owns the scheduler, the termination detector, the registered
//! message types, and the per-epoch activity accounting. It is a cheap-clone
//! handle; every registered message type and every end-epoch request carries
//! one.
//!
//! Epoch shape: a collective [`begin_epoch`](Fabric::begin_epoch) resets the
//! activity counters; [`end_epoch`](Fabric::end_epoch) flushes, announces
//! the end request to the termination detector, installs an idle task that
//! keeps flushing once the rank is otherwise quiet, and pumps the scheduler
//! until the detector's terminal message lands.

use crate::counters::{NoopCounters, PerfCounters};
use crate::error::FabricError;
use crate::message_type::{MessageType, Registration};
use crate::scheduler::{Priority, Scheduler, TaskResult};
use crate::termination::TerminationDetector;
use crate::transport::{BaseTransport, DeliverySink, TransportContext};
use crate::{buffer_cache::RegionLease, MessageTypeId, Rank};
use am::{IdAssigner, TypeInfoMap};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const EPOCH_IDLE: u8 = 0;
const EPOCH_ACTIVE: u8 = 1;
const EPOCH_ENDING: u8 = 2;

type FlushObject = Box<dyn Fn() -> bool + Send + Sync>;

pub(crate) struct Registry {
    pub(crate) ids: IdAssigner,
    pub(crate) by_id: HashMap<MessageTypeId, Arc<Registration>>,
    pub(crate) by_type: TypeInfoMap<SmallVec<[MessageTypeId; 2]>>,
}

pub(crate) struct FabricInner {
    pub(crate) base: Arc<dyn BaseTransport>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) td: Arc<dyn TerminationDetector>,
    pub(crate) counters: Arc<dyn PerfCounters>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) handler_calls_pending: AtomicU32,
    pub(crate) handler_calls_pending_or_active: AtomicU32,
    flush_objects: Mutex<SmallVec<[FlushObject; 4]>>,
    handler_failure: Mutex<Option<Box<dyn Any + Send>>>,
    epoch_phase: AtomicU8,
    rank: Rank,
    size: usize,
}

impl FabricInner {
    /// No handler is queued or running and the detector agrees the epoch is
    /// really ending.
    pub(crate) fn is_idle(&self) -> bool {
        self.handler_calls_pending_or_active.load(Ordering::Acquire) == 0
            && self.td.really_ending_epoch()
    }

    pub(crate) fn run_flush_objects(&self) -> TaskResult {
        let flushes = self.flush_objects.lock();
        let mut any_alive = false;
        for flush in flushes.iter() {
            any_alive |= flush();
        }
        if any_alive {
            TaskResult::BusyAndFinished
        } else {
            TaskResult::Idle
        }
    }

    /// Stores the first handler panic of the epoch; later ones are dropped.
    pub(crate) fn record_handler_failure(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.handler_failure.lock();
        if slot.is_none() {
            tracing::error!(
                "message handler panicked: {}",
                describe_panic(payload.as_ref())
            );
            *slot = Some(payload);
        }
    }
}

fn describe_panic(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

struct FabricSink {
    inner: Weak<FabricInner>,
}

impl DeliverySink for FabricSink {
    fn deliver(
        &self,
        message_type: MessageTypeId,
        src: Rank,
        payload: Arc<RegionLease>,
        count: usize,
    ) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let registration = { inner.registry.lock().by_id.get(&message_type).cloned() };
        match registration {
            Some(registration) => {
                debug_assert!(
                    registration.possible_sources().contains(src),
                    "message from rank {src} outside the declared source set"
                );
                registration.dispatch(src, payload, count);
            }
            None => {
                tracing::error!("dropping message for unregistered type {message_type}");
            }
        }
    }
}

/// Builder for a [`Fabric`]; the transport and detector are mandatory, the
/// counter sink and thread count have defaults.
pub struct FabricBuilder {
    base: Arc<dyn BaseTransport>,
    td: Arc<dyn TerminationDetector>,
    counters: Arc<dyn PerfCounters>,
    nthreads: usize,
}

impl FabricBuilder {
    /// Starts a builder over the given transport and termination detector.
    pub fn new(base: Arc<dyn BaseTransport>, td: Arc<dyn TerminationDetector>) -> Self {
        Self {
            base,
            td,
            counters: Arc::new(NoopCounters),
            nthreads: 1,
        }
    }

    /// Installs a performance-counter sink.
    pub fn counters(mut self, counters: Arc<dyn PerfCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Declares how many threads will pump the scheduler.
    pub fn nthreads(mut self, n: usize) -> Self {
        self.nthreads = n.max(1);
        self
    }

    /// Builds the fabric and attaches it to the transport.
    pub fn build(self) -> Fabric {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.set_nthreads(self.nthreads);
        let rank = self.base.rank();
        let size = self.base.size();
        let inner = Arc::new(FabricInner {
            base: self.base,
            scheduler: Arc::clone(&scheduler),
            td: self.td,
            counters: self.counters,
            registry: Mutex::new(Registry {
                ids: IdAssigner::new(),
                by_id: HashMap::new(),
                by_type: TypeInfoMap::new(),
            }),
            handler_calls_pending: AtomicU32::new(0),
            handler_calls_pending_or_active: AtomicU32::new(0),
            flush_objects: Mutex::new(SmallVec::new()),
            handler_failure: Mutex::new(None),
            epoch_phase: AtomicU8::new(EPOCH_IDLE),
            rank,
            size,
        });
        let sink = Arc::new(FabricSink {
            inner: Arc::downgrade(&inner),
        });
        inner.base.attach(TransportContext { sink, scheduler });
        Fabric { inner }
    }
}

/// Handle on the process's active-message runtime.
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Clone for Fabric {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Fabric {
    /// Builds a fabric with default counters over `base` and `td`.
    pub fn new(base: Arc<dyn BaseTransport>, td: Arc<dyn TerminationDetector>) -> Self {
        FabricBuilder::new(base, td).build()
    }

    /// Starts a [`FabricBuilder`].
    pub fn builder(
        base: Arc<dyn BaseTransport>,
        td: Arc<dyn TerminationDetector>,
    ) -> FabricBuilder {
        FabricBuilder::new(base, td)
    }

    pub(crate) fn inner(&self) -> &Arc<FabricInner> {
        &self.inner
    }

    pub(crate) fn inner_weak(&self) -> Weak<FabricInner> {
        Arc::downgrade(&self.inner)
    }

    /// This process's rank.
    pub fn rank(&self) -> Rank {
        self.inner.rank
    }

    /// Communicator size.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// True when `r` names a peer in the communicator.
    pub fn is_valid_rank(&self, r: Rank) -> bool {
        self.inner.base.is_valid_rank(r)
    }

    /// The scheduler serializing handler dispatch.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.inner.scheduler
    }

    /// The termination detector this fabric reports to.
    pub fn termination_detector(&self) -> &Arc<dyn TerminationDetector> {
        &self.inner.td
    }

    /// The installed performance-counter sink.
    pub fn counters(&self) -> &Arc<dyn PerfCounters> {
        &self.inner.counters
    }

    /// Registers a fresh message type for elements of `T`.
    pub fn create_message_type<T: Copy + Send + 'static>(
        &self,
        priority: Priority,
    ) -> MessageType<T> {
        let registration = {
            let mut registry = self.inner.registry.lock();
            let id = registry.ids.allocate();
            let registration = Arc::new(Registration::new(
                id,
                std::mem::size_of::<T>(),
                priority,
                self.inner.size,
            ));
            registry.by_id.insert(id, Arc::clone(&registration));
            registry
                .by_type
                .get_or_insert_with::<T>(SmallVec::new)
                .push(id);
            registration
        };
        MessageType::from_parts(self.clone(), registration)
    }

    /// IDs of every registration declared for element type `T`.
    pub fn message_type_ids<T: 'static>(&self) -> Vec<MessageTypeId> {
        self.inner
            .registry
            .lock()
            .by_type
            .get::<T>()
            .map(|ids| ids.to_vec())
            .unwrap_or_default()
    }

    /// Collective epoch entry. Resets the activity counters; the elected
    /// thread fires the `begin_epoch` counter hook.
    pub fn begin_epoch(&self) {
        self.inner.handler_calls_pending.store(0, Ordering::Release);
        self.inner
            .handler_calls_pending_or_active
            .store(0, Ordering::Release);
        self.inner.epoch_phase.store(EPOCH_ACTIVE, Ordering::Release);
        let elected = self.inner.base.begin_epoch();
        if elected {
            self.inner.counters.begin_epoch(self.inner.rank);
        }
    }

    /// Registers a flush callback; each coalesced type registers its own.
    /// The callback returns false once its owner is gone.
    pub fn add_flush_object(&self, flush: impl Fn() -> bool + Send + Sync + 'static) {
        self.inner.flush_objects.lock().push(Box::new(flush));
    }

    /// Invokes every registered flush callback. Safe from any thread.
    pub fn flush(&self) -> TaskResult {
        self.inner.run_flush_objects()
    }

    /// Both activity counters are zero and the detector reports the epoch
    /// really ending.
    pub fn idle(&self) -> bool {
        self.inner.is_idle()
    }

    /// Approximate count of handler calls queued but not yet started.
    pub fn handlers_pending(&self) -> u32 {
        self.inner.handler_calls_pending.load(Ordering::Relaxed)
    }

    /// True between `begin_epoch` and the end of the epoch.
    pub fn in_epoch(&self) -> bool {
        self.inner.epoch_phase.load(Ordering::Acquire) != EPOCH_IDLE
    }

    /// Holds the epoch open for `n` units of out-of-band work.
    pub fn increase_activity(&self, n: u64) {
        self.inner.td.increase_activity(n);
    }

    /// Releases activity previously added with
    /// [`increase_activity`](Self::increase_activity).
    pub fn decrease_activity(&self, n: u64) {
        self.inner.td.decrease_activity(n);
    }

    /// Declares how many threads will pump the scheduler.
    pub fn set_nthreads(&self, n: usize) {
        self.inner.scheduler.set_nthreads(n);
    }

    /// Configured scheduler thread count.
    pub fn nthreads(&self) -> usize {
        self.inner.scheduler.nthreads()
    }

    /// Starts ending the epoch; the returned request completes once the
    /// termination detector declares quiescence.
    pub fn i_end_epoch(&self) -> EndEpochRequest {
        self.end_epoch_common(None)
    }

    /// As [`i_end_epoch`](Self::i_end_epoch), contributing `value` to the
    /// epoch's reduction.
    pub fn i_end_epoch_with_value(&self, value: u64) -> EndEpochRequest {
        self.end_epoch_common(Some(value))
    }

    /// Ends the epoch, blocking on the scheduler until quiescence. Re-raises
    /// the first handler panic captured during the epoch.
    pub fn end_epoch(&self) {
        let mut request = self.i_end_epoch();
        request.wait();
        self.rethrow_handler_failure();
    }

    /// As [`end_epoch`](Self::end_epoch), returning the combined reduction
    /// value carried by the terminal message.
    pub fn end_epoch_with_value(&self, value: u64) -> u64 {
        let mut request = self.i_end_epoch_with_value(value);
        request.wait();
        let combined = request.value();
        self.rethrow_handler_failure();
        combined
    }

    fn end_epoch_common(&self, value: Option<u64>) -> EndEpochRequest {
        self.flush();
        self.inner.epoch_phase.store(EPOCH_ENDING, Ordering::Release);
        match value {
            Some(v) => self.inner.td.setup_end_epoch_with_value(v),
            None => self.inner.td.setup_end_epoch(),
        }

        let state = Arc::new(RequestState {
            active: AtomicBool::new(true),
            combined: AtomicU64::new(0),
        });
        let alive = Arc::new(AtomicBool::new(true));

        {
            let state = Arc::clone(&state);
            let alive = Arc::clone(&alive);
            let counters = Arc::clone(&self.inner.counters);
            let rank = self.inner.rank;
            let inner = self.inner_weak();
            self.inner.td.termination_queue().receive(move |message| {
                state.combined.store(message.combined_value(), Ordering::Release);
                if let Some(inner) = inner.upgrade() {
                    inner.epoch_phase.store(EPOCH_IDLE, Ordering::Release);
                }
                state.active.store(false, Ordering::Release);
                alive.store(false, Ordering::Release);
                if message.is_last_thread() {
                    counters.epoch_finished(rank);
                }
            });
        }

        {
            let inner = self.inner_weak();
            self.inner.scheduler.add_idle_task(move |_s: &Scheduler| {
                if !alive.load(Ordering::Acquire) {
                    return TaskResult::RemoveFromQueue;
                }
                let Some(inner) = inner.upgrade() else {
                    return TaskResult::RemoveFromQueue;
                };
                if !inner.is_idle() {
                    return TaskResult::Idle;
                }
                inner.run_flush_objects()
            });
        }

        EndEpochRequest {
            fabric: self.clone(),
            state,
        }
    }

    fn rethrow_handler_failure(&self) {
        let failure = self.inner.handler_failure.lock().take();
        if let Some(payload) = failure {
            std::panic::resume_unwind(payload);
        }
    }

    /// Aborts on a fault the runtime cannot continue past.
    pub(crate) fn fatal(&self, error: FabricError) -> ! {
        tracing::error!("fatal transport fault: {error}");
        panic!("fatal transport fault: {error}");
    }
}

struct RequestState {
    active: AtomicBool,
    combined: AtomicU64,
}

/// One-shot receive bound to the termination queue.
pub struct EndEpochRequest {
    fabric: Fabric,
    state: Arc<RequestState>,
}

impl EndEpochRequest {
    /// Pumps the scheduler once; true when the epoch has terminated.
    pub fn test(&mut self) -> bool {
        if self.state.active.load(Ordering::Acquire) {
            self.fabric.scheduler().run_one();
        }
        !self.state.active.load(Ordering::Acquire)
    }

    /// Blocks (pumping the scheduler) until the epoch terminates.
    pub fn wait(&mut self) -> &mut Self {
        while !self.test() {}
        self
    }

    /// The combined reduction value; meaningful once terminated.
    pub fn value(&self) -> u64 {
        debug_assert!(
            !self.state.active.load(Ordering::Acquire),
            "value read before termination"
        );
        self.state.combined.load(Ordering::Acquire)
    }
}
