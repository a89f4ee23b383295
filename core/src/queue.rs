//! Bounded FIFO of frame handles between pipeline tasks

use crate::arena::Frame;
use crate::error::{Result, TncError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::debug;
use std::time::Duration;

/// Blocking frame queue
///
/// Occupancy and free capacity always add up to the queue capacity. `put`
/// blocks while the queue is full, `get` while it is empty. Cloning gives
/// another handle to the same queue.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Publish a frame, waiting for room
    pub fn put(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| TncError::QueueClosed)
    }

    /// Publish without waiting. A full queue hands the frame back.
    pub fn try_put(&self, frame: Frame) -> std::result::Result<(), Frame> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(f)) | Err(TrySendError::Disconnected(f)) => Err(f),
        }
    }

    /// Take the oldest frame, waiting until one is available
    pub fn get(&self) -> Result<Frame> {
        self.rx.recv().map_err(|_| TncError::QueueClosed)
    }

    pub fn try_get(&self) -> Option<Frame> {
        match self.rx.try_recv() {
            Ok(f) => Some(f),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<Frame> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TncError::Timeout,
            RecvTimeoutError::Disconnected => TncError::QueueClosed,
        })
    }

    /// Release every queued frame. Must not race with a blocked `get`/`put`
    /// on the same queue.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while let Ok(frame) = self.rx.try_recv() {
            drop(frame);
            n += 1;
        }
        if n > 0 {
            debug!("Drained {} frames", n);
        }
        n
    }

    /// Wake a consumer with an empty sentinel frame
    pub fn signal(&self) -> Result<()> {
        self.put(Frame::empty())
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_capacity(&self) -> usize {
        self.capacity - self.len()
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let arena = Arena::with_capacity(8, 8);
        let q = FrameQueue::new(4);
        q.put(arena.frame_from(b"a").unwrap()).unwrap();
        q.put(arena.frame_from(b"b").unwrap()).unwrap();
        assert_eq!(q.get().unwrap().to_vec(), b"a");
        assert_eq!(q.get().unwrap().to_vec(), b"b");
    }

    #[test]
    fn test_capacity_accounting() {
        let arena = Arena::with_capacity(8, 8);
        let q = FrameQueue::new(2);
        assert_eq!(q.len() + q.free_capacity(), q.capacity());
        q.put(arena.frame_from(b"1").unwrap()).unwrap();
        assert_eq!(q.len() + q.free_capacity(), q.capacity());
        q.put(arena.frame_from(b"2").unwrap()).unwrap();
        assert_eq!(q.free_capacity(), 0);

        let rejected = q.try_put(arena.frame_from(b"3").unwrap());
        assert_eq!(rejected.unwrap_err().to_vec(), b"3");
    }

    #[test]
    fn test_drain_releases_frames() {
        let arena = Arena::with_capacity(8, 8);
        let q = FrameQueue::new(4);
        q.put(arena.frame_from(b"x").unwrap()).unwrap();
        q.put(arena.frame_from(b"y").unwrap()).unwrap();
        assert_eq!(arena.used_slots(), 2);
        assert_eq!(q.drain(), 2);
        assert_eq!(arena.used_slots(), 0);
        assert!(q.is_empty());
        assert_eq!(q.free_capacity(), 4);
    }

    #[test]
    fn test_signal_wakes_blocked_consumer() {
        let q = FrameQueue::new(1);
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.get().unwrap().is_empty())
        };
        q.signal().unwrap();
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_put_blocks_until_space() {
        let arena = Arena::with_capacity(8, 8);
        let q = FrameQueue::new(1);
        q.put(arena.frame_from(b"first").unwrap()).unwrap();
        let producer = {
            let q = q.clone();
            let frame = arena.frame_from(b"second").unwrap();
            thread::spawn(move || q.put(frame).unwrap())
        };
        assert_eq!(q.get().unwrap().to_vec(), b"first");
        producer.join().unwrap();
        assert_eq!(q.get().unwrap().to_vec(), b"second");
    }

    #[test]
    fn test_get_timeout() {
        let q = FrameQueue::new(1);
        assert_eq!(
            q.get_timeout(Duration::from_millis(10)).unwrap_err(),
            TncError::Timeout
        );
    }
}
