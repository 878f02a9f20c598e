//! # Bounded Message Queue
//!
//! Multi-producer / multi-consumer FIFO with a fixed capacity. Transport
//! reader tasks push decoded control messages in; the file server's
//! message loop drains them. The bounded capacity is the system's
//! back-pressure mechanism: a stalled consumer eventually blocks every
//! producer on [`Channel::send`], which in turn parks the per-peer reader
//! tasks. That is intentional flow control, not a leak.
//!
//! Built from a mutex-guarded deque and two semaphores — one counting
//! free slots, one counting queued items — so both blocking and
//! non-blocking variants of send/receive fall out naturally.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

/// Default queue capacity for inbound control messages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub struct Channel<T> {
    queue: Mutex<VecDeque<T>>,
    slots: Semaphore,
    items: Semaphore,
    capacity: usize,
}

impl<T> Channel<T> {
    /// Create a channel holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be positive");
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
            capacity,
        }
    }

    /// Enqueue an item, waiting while the channel is full.
    pub async fn send(&self, item: T) {
        // The semaphore is never closed, so acquisition cannot fail.
        let permit = self.slots.acquire().await.expect("slot semaphore closed");
        permit.forget();
        self.queue.lock().expect("channel lock poisoned").push_back(item);
        self.items.add_permits(1);
    }

    /// Enqueue an item without waiting. Returns the item back when the
    /// channel is full.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.queue.lock().expect("channel lock poisoned").push_back(item);
                self.items.add_permits(1);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    /// Dequeue the oldest item, waiting while the channel is empty.
    pub async fn receive(&self) -> T {
        let permit = self.items.acquire().await.expect("item semaphore closed");
        permit.forget();
        let item = self
            .queue
            .lock()
            .expect("channel lock poisoned")
            .pop_front()
            .expect("item permit without queued item");
        self.slots.add_permits(1);
        item
    }

    /// Dequeue the oldest item without waiting.
    pub fn try_receive(&self) -> Option<T> {
        let permit = self.items.try_acquire().ok()?;
        permit.forget();
        let item = self
            .queue
            .lock()
            .expect("channel lock poisoned")
            .pop_front()
            .expect("item permit without queued item");
        self.slots.add_permits(1);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("channel lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
