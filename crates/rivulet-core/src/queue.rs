//! Bounded MPMC FIFO with asynchronous backpressure.
//!
//! The queue sits between the pipeline stages: a producer writes item
//! records, a pool of workers reads them (and, on the output side, workers
//! write while a single consumer reads). Both directions apply backpressure
//! by suspending rather than rejecting.
//!
//! The close protocol is asymmetric on purpose: [`BoundedQueue::close`]
//! immediately fails new writers, while readers keep draining whatever is
//! already buffered and only observe the close once the queue is empty.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::Semaphore;

/// Error returned by [`BoundedQueue::write`] once the queue has been closed.
///
/// The rejected item is handed back so the caller can recover it; a failed
/// write must surface the caller's own error path instead of silently
/// dropping data.
pub struct WriteError<T>(pub T);

impl<T> WriteError<T> {
    /// Consumes the error, returning the item that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for WriteError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteError").finish()
    }
}

impl<T> fmt::Display for WriteError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue closed for writes")
    }
}

impl<T> std::error::Error for WriteError<T> {}

struct Inner<T> {
    buf: VecDeque<T>,
    closed: bool,
}

/// A bounded multi-producer/multi-consumer FIFO.
///
/// Writers suspend while the queue is full; readers suspend while it is
/// empty. Capacity is fixed at construction. The queue is driven through an
/// `Arc` by every stage that touches it.
///
/// # Examples
///
/// ```
/// use rivulet_core::queue::BoundedQueue;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let queue = Arc::new(BoundedQueue::new(8));
/// queue.write(1u32).await.unwrap();
/// queue.write(2u32).await.unwrap();
/// queue.close();
///
/// assert_eq!(queue.read().await, Some(1));
/// assert_eq!(queue.read().await, Some(2));
/// assert_eq!(queue.read().await, None);
/// # }
/// ```
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    /// Free capacity. Closed to fail writers once the queue is closed.
    slots: Semaphore,
    /// Buffered items. Closed once the queue is both closed and drained.
    items: Semaphore,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
            capacity,
        }
    }

    /// Enqueues `item`, suspending while the queue is full.
    ///
    /// Returns [`WriteError`] carrying the item back if the queue has been
    /// closed.
    pub async fn write(&self, item: T) -> Result<(), WriteError<T>> {
        let permit = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(WriteError(item)),
        };
        permit.forget();
        {
            let mut inner = self.inner.lock().unwrap();
            // A close may have raced us between the acquire and the push.
            if inner.closed {
                return Err(WriteError(item));
            }
            inner.buf.push_back(item);
        }
        self.items.add_permits(1);
        Ok(())
    }

    /// Dequeues the next item, suspending while the queue is empty.
    ///
    /// Returns `None` only after the queue has been closed *and* fully
    /// drained; items buffered at close time are still delivered.
    pub async fn read(&self) -> Option<T> {
        let permit = match self.items.acquire().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };
        permit.forget();
        let (item, drained) = {
            let mut inner = self.inner.lock().unwrap();
            let item = inner.buf.pop_front();
            let drained = inner.closed && inner.buf.is_empty();
            (item, drained)
        };
        self.slots.add_permits(1);
        if drained {
            self.items.close();
        }
        item
    }

    /// Closes the queue for writes. Idempotent.
    ///
    /// Suspended writers wake with [`WriteError`]; suspended readers wake
    /// with `None` once the buffer is empty.
    pub fn close(&self) {
        self.slots.close();
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.buf.is_empty()
        };
        if drained {
            self.items.close();
        }
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    /// Whether the buffer is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed capacity this queue was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the queue has been closed for writes.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
