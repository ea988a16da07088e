//! FIFO handler signals with detachable attachments.
//!
//! A signal holds a list of handlers sharing one call signature. Emission
//! invokes the currently attached handlers in attachment order; a handler
//! that panics unwinds out of `emit` and the signal stays usable. Handlers
//! must not attach to or detach from the signal they are being emitted on.

use crate::id_assigner::IdAssigner;
use parking_lot::Mutex;
use smallvec::SmallVec;

/// Opaque token identifying one attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachHandle(u32);

struct Slot<F> {
    id: u32,
    handler: F,
}

type SlotList<F> = SmallVec<[Slot<F>; 4]>;

/// Signal whose handlers take no arguments.
pub struct Signal0 {
    ids: IdAssigner,
    slots: Mutex<SlotList<Box<dyn FnMut() + Send>>>,
}

impl Signal0 {
    /// Creates a signal with no handlers attached.
    pub fn new() -> Self {
        Self {
            ids: IdAssigner::new(),
            slots: Mutex::new(SmallVec::new()),
        }
    }

    /// Appends `handler` to the emission order.
    pub fn attach(&self, handler: impl FnMut() + Send + 'static) -> AttachHandle {
        let id = self.ids.allocate();
        self.slots.lock().push(Slot {
            id,
            handler: Box::new(handler),
        });
        AttachHandle(id)
    }

    /// Removes the attachment named by `handle`; later emissions skip it.
    pub fn detach(&self, handle: AttachHandle) {
        let removed = {
            let mut slots = self.slots.lock();
            let before = slots.len();
            slots.retain(|slot| slot.id != handle.0);
            before != slots.len()
        };
        if removed {
            self.ids.free(handle.0);
        }
    }

    /// Attaches `handler` for the scope of the returned guard.
    pub fn attach_scoped(
        &self,
        handler: impl FnMut() + Send + 'static,
    ) -> ScopedAttach<'_, Self> {
        ScopedAttach {
            signal: self,
            handle: self.attach(handler),
        }
    }

    /// Invokes every attached handler in attachment order.
    pub fn emit(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            (slot.handler)();
        }
    }

    /// Number of attached handlers.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True when nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Signal0 {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal whose handlers take one argument by reference.
pub struct Signal1<A> {
    ids: IdAssigner,
    slots: Mutex<SlotList<Box<dyn FnMut(&A) + Send>>>,
}

impl<A> Signal1<A> {
    /// Creates a signal with no handlers attached.
    pub fn new() -> Self {
        Self {
            ids: IdAssigner::new(),
            slots: Mutex::new(SmallVec::new()),
        }
    }

    /// Appends `handler` to the emission order.
    pub fn attach(&self, handler: impl FnMut(&A) + Send + 'static) -> AttachHandle {
        let id = self.ids.allocate();
        self.slots.lock().push(Slot {
            id,
            handler: Box::new(handler),
        });
        AttachHandle(id)
    }

    /// Removes the attachment named by `handle`; later emissions skip it.
    pub fn detach(&self, handle: AttachHandle) {
        let removed = {
            let mut slots = self.slots.lock();
            let before = slots.len();
            slots.retain(|slot| slot.id != handle.0);
            before != slots.len()
        };
        if removed {
            self.ids.free(handle.0);
        }
    }

    /// Attaches `handler` for the scope of the returned guard.
    pub fn attach_scoped(
        &self,
        handler: impl FnMut(&A) + Send + 'static,
    ) -> ScopedAttach<'_, Self> {
        ScopedAttach {
            signal: self,
            handle: self.attach(handler),
        }
    }

    /// Invokes every attached handler in attachment order with `arg`.
    pub fn emit(&self, arg: &A) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            (slot.handler)(arg);
        }
    }

    /// Number of attached handlers.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True when nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A> Default for Signal1<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Detachable signal surface shared by [`ScopedAttach`].
pub trait Detachable {
    /// Removes the attachment named by `handle`.
    fn detach_handle(&self, handle: AttachHandle);
}

impl Detachable for Signal0 {
    fn detach_handle(&self, handle: AttachHandle) {
        self.detach(handle);
    }
}

impl<A> Detachable for Signal1<A> {
    fn detach_handle(&self, handle: AttachHandle) {
        self.detach(handle);
    }
}

/// Guard binding a handler for the duration of its scope; detaches on every
/// exit path, including unwinding.
pub struct ScopedAttach<'a, S: Detachable> {
    signal: &'a S,
    handle: AttachHandle,
}

impl<S: Detachable> ScopedAttach<'_, S> {
    /// The handle of the scoped attachment.
    pub fn handle(&self) -> AttachHandle {
        self.handle
    }
}

impl<S: Detachable> Drop for ScopedAttach<'_, S> {
    fn drop(&mut self) {
        self.signal.detach_handle(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn emit_invokes_each_attached_handler() {
        let sig = Signal0::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = {
            let hits = Arc::clone(&hits);
            sig.attach(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            })
        };
        sig.emit();
        sig.emit();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        sig.detach(h);
        sig.emit();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn handlers_run_in_attachment_order() {
        let sig = Signal0::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in [1, 2, 3] {
            let order = Arc::clone(&order);
            sig.attach(move || order.lock().push(tag));
        }
        sig.emit();
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn detaching_middle_handler_preserves_order() {
        let sig = Signal0::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in [1, 2, 3] {
            let order = Arc::clone(&order);
            handles.push(sig.attach(move || order.lock().push(tag)));
        }
        sig.detach(handles[1]);
        sig.emit();
        assert_eq!(*order.lock(), vec![1, 3]);
    }

    #[test]
    fn emit_with_argument() {
        let sig = Signal1::<i32>::new();
        let last = Arc::new(AtomicU32::new(0));
        {
            let last = Arc::clone(&last);
            sig.attach(move |v| last.store(*v as u32, Ordering::Relaxed));
        }
        sig.emit(&42);
        assert_eq!(last.load(Ordering::Relaxed), 42);
        sig.emit(&100);
        assert_eq!(last.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn emitting_empty_signal_is_a_noop() {
        let sig = Signal1::<String>::new();
        sig.emit(&"nobody home".to_string());
        assert!(sig.is_empty());
    }

    #[test]
    fn detach_twice_is_harmless() {
        let sig = Signal0::new();
        let h = sig.attach(|| {});
        sig.detach(h);
        sig.detach(h);
        assert!(sig.is_empty());
    }

    #[test]
    fn scoped_attach_detaches_on_scope_exit() {
        let sig = Signal0::new();
        let hits = Arc::new(AtomicU32::new(0));
        {
            let hits = Arc::clone(&hits);
            let _guard = sig.attach_scoped(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });
            sig.emit();
        }
        sig.emit();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(sig.is_empty());
    }

    #[test]
    fn scoped_attach_detaches_on_panic() {
        let sig = Arc::new(Signal0::new());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = sig.attach_scoped(|| {});
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(sig.is_empty());
    }

    #[test]
    fn panicking_handler_leaves_signal_usable() {
        let sig = Arc::new(Signal0::new());
        let hits = Arc::new(AtomicU32::new(0));
        let noisy = sig.attach(|| panic!("handler failure"));
        {
            let hits = Arc::clone(&hits);
            sig.attach(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sig.emit()));
        assert!(result.is_err());
        assert_eq!(sig.len(), 2, "attachments survive a panicking emission");

        sig.detach(noisy);
        sig.emit();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
