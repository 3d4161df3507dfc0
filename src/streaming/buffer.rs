// Sample buffers
//
// `RollingBuffer` keeps the most recent N samples of one channel for display
// style consumers. `BlockQueue` is the bounded hand-off between a reader task
// and a consumer that may fall behind (audio playback and similar): when it is
// full a block is dropped and counted, the reader never waits.

use crate::streaming::types::{StreamError, StreamResult};
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Fixed capacity window of X/Y samples, newest at the tail.
///
/// The buffer is always fully populated: it starts zero filled and every write
/// shifts older samples towards the head.
#[derive(Debug, Clone)]
pub struct RollingBuffer {
    samples: Vec<[i32; 2]>,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> StreamResult<Self> {
        if capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "buffer capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            samples: vec![[0, 0]; capacity],
        })
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Appends `block`, discarding the same number of oldest samples.
    pub fn write(&mut self, block: &[[i32; 2]]) -> StreamResult<()> {
        let capacity = self.capacity();
        let length = block.len();
        if length > capacity {
            return Err(StreamError::InvalidConfig(format!(
                "block of {} samples exceeds buffer capacity {}",
                length, capacity
            )));
        }
        self.samples.copy_within(length.., 0);
        self.samples[capacity - length..].copy_from_slice(block);
        Ok(())
    }

    /// The most recent `size` samples, oldest first.
    pub fn read(&self, size: usize) -> StreamResult<&[[i32; 2]]> {
        let capacity = self.capacity();
        if size > capacity {
            return Err(StreamError::InvalidConfig(format!(
                "read of {} samples exceeds buffer capacity {}",
                size, capacity
            )));
        }
        Ok(&self.samples[capacity - size..])
    }

    /// Zero fills the buffer without reallocating.
    pub fn reset(&mut self) {
        self.samples.fill([0, 0]);
    }
}

/// What to discard when a `BlockQueue` is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OverflowStrategy {
    /// Keep what is queued, discard the incoming block
    #[default]
    DropNewest,

    /// Evict the oldest queued block to make room
    DropOldest,
}

/// Counters for a `BlockQueue`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMetrics {
    pub total_pushed: u64,
    pub total_popped: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
}

/// Bounded lock-free block queue with drop-on-overflow
///
/// Safe to share between one producer task and one consumer thread.
pub struct BlockQueue<T> {
    queue: ArrayQueue<T>,
    overflow_strategy: OverflowStrategy,

    total_pushed: AtomicU64,
    total_popped: AtomicU64,
    total_dropped: AtomicU64,
    peak_size: AtomicUsize,
}

impl<T> BlockQueue<T> {
    pub fn new(capacity: usize, strategy: OverflowStrategy) -> StreamResult<Self> {
        if capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "queue depth must be positive".to_string(),
            ));
        }
        Ok(Self {
            queue: ArrayQueue::new(capacity),
            overflow_strategy: strategy,
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            peak_size: AtomicUsize::new(0),
        })
    }

    /// Queues `item`. Returns false if a block was dropped to do so (or
    /// `item` itself was dropped).
    pub fn push(&self, item: T) -> bool {
        let (accepted, dropped) = match self.overflow_strategy {
            OverflowStrategy::DropNewest => {
                let accepted = self.queue.push(item).is_ok();
                (accepted, !accepted)
            }
            OverflowStrategy::DropOldest => (true, self.queue.force_push(item).is_some()),
        };

        if accepted {
            self.total_pushed.fetch_add(1, Ordering::Relaxed);
            self.peak_size.fetch_max(self.queue.len(), Ordering::Relaxed);
        }
        if dropped {
            let total = self.total_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("Block queue full, dropped packet ({} dropped so far)", total);
        }
        !dropped
    }

    pub fn pop(&self) -> Option<T> {
        let item = self.queue.pop();
        if item.is_some() {
            self.total_popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Removes up to `max_items`, oldest first.
    pub fn drain(&self, max_items: usize) -> Vec<T> {
        let mut items = Vec::with_capacity(max_items.min(self.queue.len()));
        while items.len() < max_items {
            match self.pop() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_popped: self.total_popped.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            peak_size: self.peak_size.load(Ordering::Relaxed),
            capacity: self.queue.capacity(),
        }
    }

    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}
