//! Reference-counted frame buffers
//!
//! All frame bytes live in one [`Arena`]: a fixed pool of fixed-size slots.
//! A [`Frame`] is a cursor over a singly-linked chain of slots. Chains can be
//! aliased without copying (fan-out to several consumers, header rewrites in
//! front of an existing payload); every slot carries a reference count and
//! returns to the pool when the last chain holding it is released.
//!
//! A frame is writable only while it is the sole owner of its chain. Sharing,
//! splicing or connecting turns every involved frame read-only, and a write
//! to a read-only frame is an error rather than a silent overwrite.
//!
//! The slot table is the one piece of shared mutable state. It sits behind a
//! single lock; no operation blocks while holding it.

use crate::config::ArenaConfig;
use crate::error::{Result, TncError};
use log::{debug, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type ExhaustionHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Slot {
    // One count per handle or chain link, so it cannot outgrow usize
    refcnt: usize,
    len: usize,
    next: Option<usize>,
}

const FREE_SLOT: Slot = Slot {
    refcnt: 0,
    len: 0,
    next: None,
};

struct SlotTable {
    slots: Vec<Slot>,
    data: Vec<u8>,
    slot_size: usize,
    free: usize,
    scan: usize,
}

impl SlotTable {
    fn new(count: usize, slot_size: usize) -> Self {
        Self {
            slots: vec![FREE_SLOT; count],
            data: vec![0u8; count * slot_size],
            slot_size,
            free: count,
            scan: 0,
        }
    }

    fn alloc(&mut self) -> Option<usize> {
        let n = self.slots.len();
        for k in 0..n {
            let i = (self.scan + k) % n;
            if self.slots[i].refcnt == 0 {
                self.slots[i] = Slot {
                    refcnt: 1,
                    len: 0,
                    next: None,
                };
                self.free -= 1;
                self.scan = (i + 1) % n;
                return Some(i);
            }
        }
        None
    }

    fn release_slot(&mut self, i: usize) {
        let slot = &mut self.slots[i];
        if slot.refcnt > 0 {
            slot.refcnt -= 1;
            if slot.refcnt == 0 {
                self.free += 1;
            }
        }
    }

    fn release_chain(&mut self, head: usize) {
        let mut cur = Some(head);
        while let Some(i) = cur {
            cur = self.slots[i].next;
            self.release_slot(i);
        }
    }

    fn retain_chain(&mut self, start: Option<usize>) {
        let mut cur = start;
        while let Some(i) = cur {
            self.slots[i].refcnt += 1;
            cur = self.slots[i].next;
        }
    }

    fn last(&self, head: usize) -> usize {
        let mut i = head;
        while let Some(n) = self.slots[i].next {
            i = n;
        }
        i
    }

    /// Slot and in-slot position of a byte offset. A boundary offset resolves
    /// to the end of the earlier slot so that a split there allocates nothing.
    fn locate(&self, head: usize, offset: usize) -> (usize, usize) {
        let mut slot = head;
        let mut pos = offset;
        while pos > self.slots[slot].len {
            match self.slots[slot].next {
                Some(n) => {
                    pos -= self.slots[slot].len;
                    slot = n;
                }
                None => break,
            }
        }
        (slot, pos.min(self.slots[slot].len))
    }

    /// Split `islot` at `pos`, moving the tail bytes into a fresh slot linked
    /// right after it. Returns the first slot after the split point.
    ///
    /// Every chain holding `islot` keeps reading the same bytes: the new slot
    /// inherits the reference count of the one it was cut from.
    fn split(&mut self, islot: usize, pos: usize) -> Result<Option<usize>> {
        let Slot { refcnt, len, next } = self.slots[islot];
        if pos >= len {
            return Ok(next);
        }
        let new = self.alloc().ok_or(TncError::ArenaExhausted)?;
        let ss = self.slot_size;
        self.data
            .copy_within(islot * ss + pos..islot * ss + len, new * ss);
        self.slots[new] = Slot {
            refcnt,
            len: len - pos,
            next,
        };
        self.slots[islot].next = Some(new);
        self.slots[islot].len = pos;
        Ok(Some(new))
    }

    fn byte(&self, slot: usize, pos: usize) -> u8 {
        self.data[slot * self.slot_size + pos]
    }

    fn push(&mut self, slot: usize, byte: u8) {
        let pos = self.slots[slot].len;
        self.data[slot * self.slot_size + pos] = byte;
        self.slots[slot].len += 1;
    }
}

/// Fixed pool of frame storage shared by every producer and consumer
pub struct Arena {
    table: Mutex<SlotTable>,
    capacity: usize,
    slot_size: usize,
    on_exhausted: Mutex<Option<ExhaustionHandler>>,
}

impl Arena {
    pub fn new(config: &ArenaConfig) -> Arc<Self> {
        Self::with_capacity(config.slots, config.slot_size)
    }

    pub fn with_capacity(slots: usize, slot_size: usize) -> Arc<Self> {
        let slot_size = slot_size.max(1);
        Arc::new(Self {
            table: Mutex::new(SlotTable::new(slots, slot_size)),
            capacity: slots,
            slot_size,
            on_exhausted: Mutex::new(None),
        })
    }

    /// Start a new, empty, writable frame
    pub fn acquire(self: &Arc<Self>) -> Result<Frame> {
        let slot = self.table.lock().alloc();
        match slot {
            Some(head) => Ok(Frame {
                chain: Some(Chain {
                    arena: Arc::clone(self),
                    cur: Cursor::new(head),
                }),
            }),
            None => {
                self.report_exhausted();
                Err(TncError::ArenaExhausted)
            }
        }
    }

    /// Start a writable frame holding `data`
    pub fn frame_from(self: &Arc<Self>, data: &[u8]) -> Result<Frame> {
        let mut frame = self.acquire()?;
        frame.write(data)?;
        Ok(frame)
    }

    /// Register a callback run whenever an allocation fails
    pub fn set_exhaustion_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_exhausted.lock() = Some(Arc::new(handler));
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn free_slots(&self) -> usize {
        self.table.lock().free
    }

    pub fn used_slots(&self) -> usize {
        self.capacity - self.free_slots()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_slots() * self.slot_size
    }

    // Runs with no arena lock held, the handler may touch the arena.
    fn report_exhausted(&self) {
        warn!("Buffer arena exhausted ({} slots in use)", self.capacity);
        let handler = self.on_exhausted.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("slot_size", &self.slot_size)
            .field("free_slots", &self.free_slots())
            .finish()
    }
}

/// Whether a frame may still be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Sole owner of its chain, appends allowed
    Exclusive,
    /// Chain is (or may be) aliased, read-only
    Shared,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    head: usize,
    wslot: Option<usize>,
    rslot: usize,
    rpos: usize,
    offset: usize,
    length: usize,
}

impl Cursor {
    fn new(head: usize) -> Self {
        Self {
            head,
            wslot: Some(head),
            rslot: head,
            rpos: 0,
            offset: 0,
            length: 0,
        }
    }

    fn rewind(&mut self) {
        self.rslot = self.head;
        self.rpos = 0;
        self.offset = 0;
    }

    // The read position is resolved lazily: `rpos` may run past the end of
    // `rslot` and is walked forward here. Subtracting (instead of zeroing)
    // keeps the position right when a shared slot was split under us.
    fn settle(&mut self, t: &SlotTable) {
        while self.rpos >= t.slots[self.rslot].len {
            match t.slots[self.rslot].next {
                Some(n) => {
                    self.rpos -= t.slots[self.rslot].len;
                    self.rslot = n;
                }
                None => break,
            }
        }
    }

    fn read(&mut self, t: &SlotTable) -> Result<u8> {
        if self.offset >= self.length {
            return Err(TncError::Eof);
        }
        self.settle(t);
        if self.rpos >= t.slots[self.rslot].len {
            return Err(TncError::Eof);
        }
        let byte = t.byte(self.rslot, self.rpos);
        self.rpos += 1;
        self.offset += 1;
        Ok(byte)
    }

    fn append(&mut self, t: &mut SlotTable, byte: u8) -> Result<()> {
        let mut w = self.wslot.ok_or(TncError::ReadOnly)?;
        if t.slots[w].len == t.slot_size {
            let new = t.alloc().ok_or(TncError::ArenaExhausted)?;
            t.slots[w].next = Some(new);
            w = new;
            self.wslot = Some(w);
        }
        t.push(w, byte);
        self.length += 1;
        Ok(())
    }
}

struct Chain {
    arena: Arc<Arena>,
    cur: Cursor,
}

/// Handle to a chain of slots in an [`Arena`]
///
/// Dropping a frame releases its hold on every slot in the chain.
pub struct Frame {
    chain: Option<Chain>,
}

impl Frame {
    /// A frame with no storage. Used as a wake-up sentinel on queues.
    pub fn empty() -> Self {
        Self { chain: None }
    }

    pub fn len(&self) -> usize {
        self.chain.as_ref().map_or(0, |c| c.cur.length)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn access(&self) -> Access {
        match &self.chain {
            Some(c) if c.cur.wslot.is_some() => Access::Exclusive,
            _ => Access::Shared,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.access() == Access::Exclusive
    }

    /// Current read position
    pub fn position(&self) -> usize {
        self.chain.as_ref().map_or(0, |c| c.cur.offset)
    }

    pub fn remaining(&self) -> usize {
        self.len() - self.position()
    }

    pub fn eof(&self) -> bool {
        self.remaining() == 0
    }

    /// Append one byte, growing the chain by a slot when the last one is full
    pub fn append(&mut self, byte: u8) -> Result<()> {
        let chain = self.chain.as_mut().ok_or(TncError::ReadOnly)?;
        let result = {
            let mut t = chain.arena.table.lock();
            chain.cur.append(&mut t, byte)
        };
        if let Err(TncError::ArenaExhausted) = result {
            chain.arena.report_exhausted();
        }
        result
    }

    /// Append a byte slice. On exhaustion the bytes written so far are kept.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let chain = self.chain.as_mut().ok_or(TncError::ReadOnly)?;
        let result = {
            let mut t = chain.arena.table.lock();
            data.iter().try_for_each(|&b| chain.cur.append(&mut t, b))
        };
        if let Err(TncError::ArenaExhausted) = result {
            chain.arena.report_exhausted();
        }
        result
    }

    pub fn put_str(&mut self, s: &str) -> Result<()> {
        self.write(s.as_bytes())
    }

    /// Next unread byte
    pub fn read(&mut self) -> Result<u8> {
        let chain = self.chain.as_mut().ok_or(TncError::Eof)?;
        let t = chain.arena.table.lock();
        chain.cur.read(&t)
    }

    /// Read up to `buf.len()` bytes from the current position
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let Some(chain) = self.chain.as_mut() else {
            return 0;
        };
        let t = chain.arena.table.lock();
        let mut n = 0;
        while n < buf.len() {
            match chain.cur.read(&t) {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    /// Unread bytes from the current position to the end
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; self.remaining()];
        let n = self.read_into(&mut buf);
        buf.truncate(n);
        buf
    }

    /// Whole content, independent of the read position
    pub fn to_vec(&self) -> Vec<u8> {
        let Some(chain) = self.chain.as_ref() else {
            return Vec::new();
        };
        let t = chain.arena.table.lock();
        let mut out = Vec::with_capacity(chain.cur.length);
        let mut cur = Some(chain.cur.head);
        while let Some(i) = cur {
            let want = chain.cur.length - out.len();
            let take = t.slots[i].len.min(want);
            let base = i * t.slot_size;
            out.extend_from_slice(&t.data[base..base + take]);
            if out.len() == chain.cur.length {
                break;
            }
            cur = t.slots[i].next;
        }
        out
    }

    pub fn rewind(&mut self) {
        if let Some(chain) = self.chain.as_mut() {
            chain.cur.rewind();
        }
    }

    /// Move the read position to `pos`
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        let length = self.len();
        if pos > length {
            return Err(TncError::InvalidOffset {
                offset: pos,
                length,
            });
        }
        if let Some(chain) = self.chain.as_mut() {
            chain.cur.rewind();
            chain.cur.rpos = pos;
            chain.cur.offset = pos;
        }
        Ok(())
    }

    /// New handle over the same chain, read position at the start.
    ///
    /// Both handles are read-only afterwards.
    pub fn share(&mut self) -> Frame {
        let Some(chain) = self.chain.as_mut() else {
            return Frame::empty();
        };
        chain.cur.wslot = None;
        chain.arena.table.lock().retain_chain(Some(chain.cur.head));
        let mut cur = chain.cur;
        cur.rewind();
        Frame {
            chain: Some(Chain {
                arena: Arc::clone(&chain.arena),
                cur,
            }),
        }
    }

    /// Graft `src` into this frame at byte `offset`.
    ///
    /// Reading from the start afterwards yields the first `offset` bytes of
    /// this frame, all of `src`, then the rest of this frame. The slot holding
    /// `offset` is split; no byte of `src` is copied. Both frames must be
    /// exclusive, both are read-only afterwards, and this frame's read position
    /// goes back to the start.
    pub fn splice(&mut self, src: &mut Frame, offset: usize) -> Result<()> {
        let dst = self.chain.as_mut().ok_or(TncError::ReadOnly)?;
        if dst.cur.wslot.is_none() {
            return Err(TncError::ReadOnly);
        }
        if offset > dst.cur.length {
            return Err(TncError::InvalidOffset {
                offset,
                length: dst.cur.length,
            });
        }
        let Some(x) = src.chain.as_mut() else {
            dst.cur.wslot = None;
            return Ok(());
        };
        if !Arc::ptr_eq(&dst.arena, &x.arena) {
            return Err(TncError::ArenaMismatch);
        }
        if x.cur.wslot.is_none() {
            return Err(TncError::ReadOnly);
        }

        let result = {
            let mut t = dst.arena.table.lock();
            let src_last = t.last(x.cur.head);
            if offset == 0 {
                t.retain_chain(Some(x.cur.head));
                t.retain_chain(Some(dst.cur.head));
                t.slots[src_last].next = Some(dst.cur.head);
                dst.cur.head = x.cur.head;
                Ok(())
            } else {
                let (islot, pos) = t.locate(dst.cur.head, offset);
                t.split(islot, pos).map(|rest| {
                    // The remainder is now reachable from src's chain as well
                    t.retain_chain(Some(x.cur.head));
                    t.retain_chain(rest);
                    t.slots[src_last].next = rest;
                    t.slots[islot].next = Some(x.cur.head);
                })
            }
        };
        if let Err(e) = result {
            dst.arena.report_exhausted();
            return Err(e);
        }

        dst.cur.length += x.cur.length;
        dst.cur.wslot = None;
        x.cur.wslot = None;
        dst.cur.rewind();
        debug!("Spliced {} bytes at offset {}", x.cur.length, offset);
        Ok(())
    }

    /// Append the part of `src` from `offset` onward to this frame, sharing
    /// its slots instead of copying them.
    ///
    /// This is how a rewritten address header is put in front of an existing
    /// payload: the result reads as this frame followed by `src[offset..]`.
    /// This frame must be exclusive; `src` may already be shared. Both are
    /// read-only afterwards.
    pub fn connect(&mut self, src: &mut Frame, offset: usize) -> Result<()> {
        let dst = self.chain.as_mut().ok_or(TncError::ReadOnly)?;
        if dst.cur.wslot.is_none() {
            return Err(TncError::ReadOnly);
        }
        let Some(x) = src.chain.as_mut() else {
            if offset > 0 {
                return Err(TncError::InvalidOffset { offset, length: 0 });
            }
            dst.cur.wslot = None;
            return Ok(());
        };
        if offset > x.cur.length {
            return Err(TncError::InvalidOffset {
                offset,
                length: x.cur.length,
            });
        }
        if !Arc::ptr_eq(&dst.arena, &x.arena) {
            return Err(TncError::ArenaMismatch);
        }

        let result = {
            let mut t = dst.arena.table.lock();
            let rest = if offset == 0 {
                Ok(Some(x.cur.head))
            } else {
                let (islot, pos) = t.locate(x.cur.head, offset);
                t.split(islot, pos)
            };
            rest.map(|rest| {
                let last = t.last(dst.cur.head);
                t.retain_chain(rest);
                t.slots[last].next = rest;
            })
        };
        if let Err(e) = result {
            dst.arena.report_exhausted();
            return Err(e);
        }

        dst.cur.length += x.cur.length - offset;
        dst.cur.wslot = None;
        x.cur.wslot = None;
        Ok(())
    }

    /// Drop the final byte, returning the trailing slot to the pool when it
    /// becomes empty
    pub fn trim_last(&mut self) -> Result<()> {
        let chain = self.chain.as_mut().ok_or(TncError::Eof)?;
        if chain.cur.wslot.is_none() {
            return Err(TncError::ReadOnly);
        }
        if chain.cur.length == 0 {
            return Err(TncError::Eof);
        }
        let cur = &mut chain.cur;
        let mut t = chain.arena.table.lock();

        let mut prev = cur.head;
        let mut last = cur.head;
        while let Some(n) = t.slots[last].next {
            prev = last;
            last = n;
        }
        t.slots[last].len -= 1;
        let mut freed = false;
        if t.slots[last].len == 0 && prev != last {
            t.release_slot(last);
            t.slots[prev].next = None;
            cur.wslot = Some(prev);
            freed = true;
        }
        cur.length -= 1;

        if cur.offset > cur.length || (freed && cur.rslot == last) {
            let pos = cur.offset.min(cur.length);
            cur.rewind();
            cur.rpos = pos;
            cur.offset = pos;
        }
        Ok(())
    }

    /// Give back leading slots that have been read completely
    pub fn clean_front(&mut self) {
        let Some(chain) = self.chain.as_mut() else {
            return;
        };
        let cur = &mut chain.cur;
        let mut t = chain.arena.table.lock();
        cur.settle(&t);
        while cur.head != cur.rslot {
            let h = cur.head;
            let Some(next) = t.slots[h].next else {
                break;
            };
            let len = t.slots[h].len;
            cur.head = next;
            cur.length -= len;
            cur.offset -= len;
            t.release_slot(h);
        }
    }

    /// Give the chain back to the arena
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(chain) = self.chain.take() {
            chain.arena.table.lock().release_chain(chain.cur.head);
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len())
            .field("position", &self.position())
            .field("access", &self.access())
            .finish()
    }
}
