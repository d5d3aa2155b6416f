//! Bounded transmit buffer with peek-then-confirm reads.
//!
//! Producers block (asynchronously) when the buffer is full; `abort` wakes
//! them all for shutdown. The consumer inspects the front element in place
//! and only confirms it once the packet actually left the socket, so a
//! would-block send retries the same element later.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Transmit statistics of one buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub tx_bytes: u64,
    pub tx_pkts: u64,
}

#[derive(Debug)]
struct Inner<T> {
    queue: VecDeque<T>,
    aborted: bool,
    stats: BufferStats,
}

/// Fixed-capacity FIFO between one producer task and the writer.
#[derive(Debug)]
pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    writable: Notify,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                aborted: false,
                stats: BufferStats::default(),
            }),
            capacity,
            writable: Notify::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("ring buffer poisoned").queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring buffer poisoned").queue.len()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.lock().expect("ring buffer poisoned").stats
    }

    /// Appends an element, waiting for room. Returns false once aborted.
    pub async fn write(&self, item: T) -> bool {
        let mut item = Some(item);
        loop {
            // Register for wakeups before checking, so a pop or abort
            // landing between the check and the await is not lost.
            let mut notified = std::pin::pin!(self.writable.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("ring buffer poisoned");
                if inner.aborted {
                    return false;
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(item.take().expect("item consumed twice"));
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Runs `f` on the front element without consuming it.
    pub fn with_front_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("ring buffer poisoned");
        inner.queue.front_mut().map(f)
    }

    /// Pops the front element after a successful transmission of `bytes`.
    pub fn confirm_read(&self, bytes: u64) -> Option<T> {
        let mut inner = self.inner.lock().expect("ring buffer poisoned");
        let item = inner.queue.pop_front();
        if item.is_some() {
            inner.stats.tx_bytes += bytes;
            inner.stats.tx_pkts += 1;
            // One slot freed, one producer woken.
            self.writable.notify_one();
        }
        item
    }

    /// Releases every blocked producer and refuses further writes.
    pub fn abort_write(&self) {
        self.inner.lock().expect("ring buffer poisoned").aborted = true;
        self.writable.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let buf = RingBuffer::new(8);
        for i in 0..5 {
            assert!(buf.write(i).await);
        }
        assert_eq!(buf.len(), 5);
        for i in 0..5 {
            assert_eq!(buf.with_front_mut(|v| *v), Some(i));
            assert_eq!(buf.confirm_read(10), Some(i));
        }
        assert!(buf.is_empty());
        let stats = buf.stats();
        assert_eq!(stats.tx_pkts, 5);
        assert_eq!(stats.tx_bytes, 50);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let buf = RingBuffer::new(2);
        buf.write(7u32).await;
        assert_eq!(buf.with_front_mut(|v| *v), Some(7));
        assert_eq!(buf.with_front_mut(|v| *v), Some(7));
        assert_eq!(buf.len(), 1);
    }

    #[tokio::test]
    async fn test_blocks_when_full_until_read() {
        let buf = Arc::new(RingBuffer::new(1));
        buf.write(1u32).await;

        let writer = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.write(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        assert_eq!(buf.confirm_read(1), Some(1));
        assert!(writer.await.unwrap());
        assert_eq!(buf.confirm_read(1), Some(2));
    }

    #[tokio::test]
    async fn test_abort_releases_blocked_writer() {
        let buf = Arc::new(RingBuffer::new(1));
        buf.write(1u32).await;

        let writer = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.write(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.abort_write();
        assert!(!writer.await.unwrap());
        // Writes after abort are refused outright.
        assert!(!buf.write(3).await);
    }
}
