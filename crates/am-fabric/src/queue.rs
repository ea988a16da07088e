//! Callback message queue used for the termination channel.
//!
//! A `receive` registers a one-shot callback; a `send` either satisfies the
//! oldest waiting callback immediately or parks the value until one arrives.
//! Callbacks run on the sending (or receiving) caller's thread, outside the
//! queue lock.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type Callback<T> = Box<dyn FnOnce(T) + Send>;

struct QueueInner<T> {
    pending: VecDeque<T>,
    waiting: VecDeque<Callback<T>>,
}

/// Queue pairing sent values with registered one-shot receive callbacks.
pub struct MessageQueue<T> {
    inner: Arc<Mutex<QueueInner<T>>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> MessageQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                pending: VecDeque::new(),
                waiting: VecDeque::new(),
            })),
        }
    }

    /// Delivers `value` to the oldest waiting callback, or parks it.
    pub fn send(&self, value: T) {
        let callback = {
            let mut inner = self.inner.lock();
            match inner.waiting.pop_front() {
                Some(cb) => Some(cb),
                None => {
                    inner.pending.push_back(value);
                    return;
                }
            }
        };
        if let Some(cb) = callback {
            cb(value);
        }
    }

    /// Registers `callback` for the next value; runs immediately if one is
    /// already parked.
    pub fn receive(&self, callback: impl FnOnce(T) + Send + 'static) {
        let value = {
            let mut inner = self.inner.lock();
            match inner.pending.pop_front() {
                Some(v) => v,
                None => {
                    inner.waiting.push_back(Box::new(callback));
                    return;
                }
            }
        };
        callback(value);
    }

    /// Wraps the queue so holders can only register receives.
    pub fn receive_only(&self) -> ReceiveOnly<T> {
        ReceiveOnly {
            queue: self.clone(),
        }
    }

    /// Number of parked values.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-only view of a [`MessageQueue`].
pub struct ReceiveOnly<T> {
    queue: MessageQueue<T>,
}

impl<T> Clone for ReceiveOnly<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T> ReceiveOnly<T> {
    /// Registers `callback` for the next value.
    pub fn receive(&self, callback: impl FnOnce(T) + Send + 'static) {
        self.queue.receive(callback);
    }
}
