//! Heard list: short-term memory of relayed frames
//!
//! A fixed ring of `{fingerprint, timestamp}` entries. Entries age out by
//! tick count, so a frame heard again after the window has passed is no
//! longer recognised. That is accepted: it is a loop breaker, not an exact
//! duplicate filter.

use crate::arena::Frame;
use crate::ax25::Header;
use crate::crc::{crc_ccitt_update, CRC_INIT};
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const HEARD_LIST_SIZE: usize = 32;
/// Age limit in ticks
pub const HEARD_LIST_MAX_AGE: u16 = 6;
pub const HEARD_LIST_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    val: u16,
    ts: u16,
}

#[derive(Debug, Clone)]
pub struct HeardList {
    entries: Vec<Entry>,
    next: usize,
    length: usize,
    time: u16,
    max_age: u16,
}

impl HeardList {
    pub fn new(size: usize, max_age: u16) -> Self {
        Self {
            entries: vec![Entry::default(); size.max(1)],
            next: 0,
            length: 0,
            time: 0,
            max_age,
        }
    }

    fn oldest(&self) -> usize {
        let n = self.entries.len();
        (self.next + n - self.length) % n
    }

    /// Advance time by one tick and forget entries older than the age limit
    pub fn tick(&mut self) {
        self.time = self.time.wrapping_add(1);
        while self.length > 0 {
            let i = self.oldest();
            if self.time.wrapping_sub(self.entries[i].ts) > self.max_age {
                self.length -= 1;
            } else {
                break;
            }
        }
    }

    pub fn exists(&self, fingerprint: u16) -> bool {
        let n = self.entries.len();
        let start = self.oldest();
        (0..self.length).any(|k| self.entries[(start + k) % n].val == fingerprint)
    }

    /// Record a fingerprint, overwriting the oldest position when full
    pub fn add(&mut self, fingerprint: u16) {
        self.entries[self.next] = Entry {
            val: fingerprint,
            ts: self.time,
        };
        self.next = (self.next + 1) % self.entries.len();
        if self.length < self.entries.len() {
            self.length += 1;
        }
    }

    /// True if the fingerprint was heard before. Records it either way.
    pub fn duplicate(&mut self, fingerprint: u16) -> bool {
        let heard = self.exists(fingerprint);
        self.add(fingerprint);
        heard
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn time(&self) -> u16 {
        self.time
    }

    /// Wrap for use by the relay and the ticker thread
    pub fn into_shared(self) -> SharedHeardList {
        Arc::new(Mutex::new(self))
    }
}

impl Default for HeardList {
    fn default() -> Self {
        Self::new(HEARD_LIST_SIZE, HEARD_LIST_MAX_AGE)
    }
}

/// Fingerprint of a frame for the heard list
///
/// Covers source and destination callsigns with SSIDs plus everything after
/// the address header, so the same packet arriving via different repeaters
/// matches.
pub fn fingerprint(header: &Header, frame: &mut Frame) -> u16 {
    let mut crc = CRC_INIT;
    for addr in [&header.src, &header.dest] {
        for &c in addr.callsign().as_bytes() {
            crc = crc_ccitt_update(crc, c);
        }
        crc = crc_ccitt_update(crc, addr.ssid);
    }
    if frame.seek(header.len()).is_ok() {
        crc = frame
            .read_remaining()
            .into_iter()
            .fold(crc, crc_ccitt_update);
    }
    crc
}

pub type SharedHeardList = Arc<Mutex<HeardList>>;

/// Tick the list at a fixed period until `shutdown` is set
pub fn spawn_ticker(
    list: SharedHeardList,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        debug!("Heard list ticker started ({:?})", period);
        let step = Duration::from_millis(50).min(period);
        let mut elapsed = Duration::ZERO;
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(step);
            elapsed += step;
            if elapsed >= period {
                elapsed = Duration::ZERO;
                list.lock().tick();
            }
        }
        debug!("Heard list ticker stopped");
    })
}
