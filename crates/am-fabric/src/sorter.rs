//! Receive-side reordering of bulk buffers.

/// Reorders the elements of a received bulk buffer in place before they are
/// dispatched one by one.
pub trait BufferSorter<T>: Send + Sync {
    /// Reorders `buf`; called once per received bulk message.
    fn sort(&self, buf: &mut [T]);
}

/// Sorter that leaves the buffer in commit order.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSort;

impl<T> BufferSorter<T> for NoSort {
    fn sort(&self, _buf: &mut [T]) {}
}
