//! Lock-free sample ring between the sampling source and the receive task
//!
//! Single producer, single consumer. The producer never waits: a sample that
//! finds the ring full is dropped and counted. Capacity bounds how far the
//! consumer may fall behind.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SampleRing {
    queue: ArrayQueue<f32>,
    dropped: AtomicUsize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Store one sample. Returns false when the ring was full and the sample
    /// was dropped.
    pub fn push(&self, sample: f32) -> bool {
        match self.queue.push(sample) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<f32> {
        self.queue.pop()
    }

    /// Move up to `out.len()` samples into `out`
    pub fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.queue.pop() {
                Some(s) => {
                    out[n] = s;
                    n += 1;
                }
                None => break,
            }
        }
        n
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

    /// Samples lost to a full ring since creation
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
