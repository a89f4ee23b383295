//! HDLC deframer
//!
//! Driven one bit at a time by the demodulator. Finds flags, removes bit
//! stuffing, checks the frame check sequence and hands good frames to up to
//! three subscriber queues. Never blocks: a full subscriber queue loses its
//! copy of the frame.
//!
//! Bits are first run through an 8-bit look-ahead window so that a flag is
//! recognised as one token wherever it sits in the bit stream. The receive
//! state machine then works on `Bit`/`Flag` tokens.

use super::{HDLC_FLAG, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::arena::{Arena, Frame};
use crate::crc::{crc_ccitt_update, fcs_value, CRC_INIT};
use crate::queue::FrameQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub const SUBSCRIBER_MONITOR: usize = 0;
pub const SUBSCRIBER_RELAY: usize = 1;
pub const SUBSCRIBER_GATEWAY: usize = 2;
const SUBSCRIBER_SLOTS: usize = 3;

const DEDUP_HISTORY: usize = 16;

/// Subscriber table shared between the deframer and whoever (un)subscribes
#[derive(Clone, Default)]
pub struct Subscribers {
    slots: Arc<Mutex<[Option<FrameQueue>; SUBSCRIBER_SLOTS]>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `queue` at `index` (0 monitor, 1 relay, 2 gateway), or clear
    /// the slot with `None`.
    ///
    /// A queue that is replaced or removed is drained and then gets an empty
    /// sentinel frame, so a consumer blocked on it wakes up and can stop.
    /// Draining comes first so the sentinel is what stays behind. The swap
    /// happens under the table lock, and deliveries hold that lock too, so
    /// nothing lands in the old queue after the sentinel.
    /// Returns the previous queue.
    pub fn subscribe(&self, index: usize, queue: Option<FrameQueue>) -> Option<FrameQueue> {
        if index >= SUBSCRIBER_SLOTS {
            warn!("Ignoring subscription to invalid slot {}", index);
            return None;
        }
        let old = std::mem::replace(&mut self.slots.lock()[index], queue);
        if let Some(q) = &old {
            q.drain();
            if q.try_put(Frame::empty()).is_err() {
                warn!("Could not signal unsubscribed queue {}", index);
            }
        }
        old
    }

    pub fn is_subscribed(&self, index: usize) -> bool {
        self.slots.lock().get(index).map_or(false, Option::is_some)
    }

    /// Hand `frame` to every subscriber without blocking. The monitor gets
    /// the original handle, the others share it.
    fn deliver(&self, mut frame: Frame) {
        let slots = self.slots.lock();
        for (index, queue) in slots.iter().enumerate().skip(1) {
            if let Some(queue) = queue {
                if queue.try_put(frame.share()).is_err() {
                    warn!("Subscriber {} queue full, frame dropped", index);
                }
            }
        }
        if let Some(queue) = &slots[SUBSCRIBER_MONITOR] {
            if queue.try_put(frame).is_err() {
                warn!("Monitor queue full, frame dropped");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Bit(bool),
    Flag,
}

/// Receive state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Hunting for a flag
    FlagSync,
    /// Skipping flags between frames
    FrameSync,
    /// Assembling a frame
    Receiving,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeframerStats {
    pub frames: u64,
    pub checksum_errors: u64,
    pub duplicates: u64,
    pub aborts: u64,
    /// Good frames lost to arena exhaustion
    pub dropped: u64,
}

/// Per-frame receive state
#[derive(Debug)]
struct Reception {
    octet: u8,
    bit_count: u8,
    ones: u8,
    stuffed: bool,
    length: usize,
    crc: u16,
    // Register values one and two octets back
    crc_hist: [u16; 2],
    tail: [u8; 2],
    frame: Option<Frame>,
}

impl Reception {
    fn new(frame: Option<Frame>) -> Self {
        Self {
            octet: 0,
            bit_count: 0,
            ones: 0,
            stuffed: false,
            length: 0,
            crc: CRC_INIT,
            crc_hist: [CRC_INIT; 2],
            tail: [0; 2],
            frame,
        }
    }

    fn push(&mut self, octet: u8) {
        self.length += 1;
        self.crc_hist = [self.crc_hist[1], self.crc];
        self.crc = crc_ccitt_update(self.crc, octet);
        self.tail = [self.tail[1], octet];
        if let Some(frame) = self.frame.as_mut() {
            if frame.append(octet).is_err() {
                self.frame = None;
            }
        }
    }

    /// CRC of everything except the trailing FCS
    fn content_crc(&self) -> u16 {
        self.crc_hist[0]
    }
}

pub struct Deframer {
    arena: Arc<Arena>,
    subscribers: Subscribers,
    window: u8,
    window_bits: u8,
    state: State,
    rx: Reception,
    generation: u32,
    success: bool,
    recent: VecDeque<(u16, usize, u32)>,
    stats: DeframerStats,
}

impl Deframer {
    pub fn new(arena: Arc<Arena>, subscribers: Subscribers) -> Self {
        Self {
            arena,
            subscribers,
            window: 0,
            window_bits: 0,
            state: State::FlagSync,
            rx: Reception::new(None),
            generation: 0,
            success: false,
            recent: VecDeque::with_capacity(DEDUP_HISTORY),
            stats: DeframerStats::default(),
        }
    }

    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> DeframerStats {
        self.stats
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// True once a valid frame was found in the current receive window
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Start a new receive window: bump the generation and drop any partial
    /// frame
    pub fn next_window(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.success = false;
        self.window = 0;
        self.window_bits = 0;
        self.rx = Reception::new(None);
        self.state = State::FlagSync;
    }

    /// Feed one decoded bit
    pub fn push_bit(&mut self, bit: bool) {
        self.window |= (bit as u8) << self.window_bits;
        self.window_bits += 1;
        if self.window_bits < 8 {
            return;
        }
        if self.window == HDLC_FLAG {
            self.window = 0;
            self.window_bits = 0;
            self.on_token(Token::Flag);
        } else {
            let bit = self.window & 1 != 0;
            self.window >>= 1;
            self.window_bits = 7;
            self.on_token(Token::Bit(bit));
        }
    }

    /// Feed eight bits, least significant first
    pub fn push_octet(&mut self, octet: u8) {
        for i in 0..8 {
            self.push_bit((octet >> i) & 1 != 0);
        }
    }

    fn on_token(&mut self, token: Token) {
        match (self.state, token) {
            (State::FlagSync, Token::Flag) => self.state = State::FrameSync,
            (State::FlagSync, Token::Bit(_)) => {}
            (State::FrameSync, Token::Flag) => {}
            (State::FrameSync, Token::Bit(bit)) => {
                self.rx = Reception::new(self.arena.acquire().ok());
                self.state = State::Receiving;
                self.receive_bit(bit);
            }
            (State::Receiving, token) => self.receive(token),
        }
    }

    fn receive(&mut self, token: Token) {
        if self.rx.stuffed {
            self.rx.stuffed = false;
            if token != Token::Bit(false) {
                // Six ones in a row: abort sequence or noise
                debug!("Bit stuffing violation after {} bytes", self.rx.length);
                self.abort(State::FlagSync);
            }
            return;
        }
        match token {
            // The closing flag may also open the next frame
            Token::Flag if self.rx.bit_count == 0 => {
                self.complete();
                self.state = State::FrameSync;
            }
            Token::Flag => {
                debug!("Flag inside octet, dropping {} bytes", self.rx.length);
                self.abort(State::FrameSync);
            }
            Token::Bit(bit) => self.receive_bit(bit),
        }
    }

    fn receive_bit(&mut self, bit: bool) {
        let rx = &mut self.rx;
        rx.octet = ((bit as u8) << 7) | (rx.octet >> 1);
        if bit {
            rx.ones += 1;
        } else {
            rx.ones = 0;
        }
        if rx.ones == 5 {
            rx.stuffed = true;
            rx.ones = 0;
        }
        rx.bit_count += 1;
        if rx.bit_count == 8 {
            rx.bit_count = 0;
            let octet = rx.octet;
            rx.push(octet);
            if rx.length > MAX_FRAME_SIZE {
                debug!("Frame exceeds {} bytes, resynchronising", MAX_FRAME_SIZE);
                self.abort(State::FlagSync);
            }
        }
    }

    fn abort(&mut self, next: State) {
        self.stats.aborts += 1;
        self.rx = Reception::new(None);
        self.state = next;
    }

    fn complete(&mut self) {
        let rx = std::mem::replace(&mut self.rx, Reception::new(None));
        if rx.length <= MIN_FRAME_SIZE {
            return;
        }
        if fcs_value(rx.tail[0], rx.tail[1]) != rx.content_crc() {
            self.stats.checksum_errors += 1;
            info!("Invalid frame received, length={}", rx.length);
            return;
        }
        let content_len = rx.length - 2;
        let fingerprint = rx.content_crc();
        let Some(mut frame) = rx.frame else {
            self.stats.dropped += 1;
            warn!("Valid frame lost, buffer arena exhausted");
            return;
        };
        if frame.trim_last().and_then(|_| frame.trim_last()).is_err() {
            self.stats.dropped += 1;
            return;
        }
        // A repeat still counts as a find for this window
        self.success = true;
        if self.is_duplicate(fingerprint, content_len) {
            self.stats.duplicates += 1;
            debug!("Duplicate frame in generation {} dropped", self.generation);
            return;
        }
        self.stats.frames += 1;
        info!("Valid frame received, length={}", content_len);
        self.fan_out(frame);
    }

    fn is_duplicate(&mut self, crc: u16, length: usize) -> bool {
        let generation = self.generation;
        self.recent
            .retain(|&(_, _, g)| generation.wrapping_sub(g) <= 1);
        let seen = self
            .recent
            .iter()
            .any(|&(c, l, _)| c == crc && l == length);
        if !seen {
            if self.recent.len() == DEDUP_HISTORY {
                self.recent.pop_front();
            }
            self.recent.push_back((crc, length, generation));
        }
        seen
    }

    fn fan_out(&mut self, frame: Frame) {
        self.subscribers.deliver(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::{crc_ccitt, fcs_bytes};
    use crate::hdlc::encoder::{encode_frame_octets, BitStuffer};

    fn setup() -> (Arc<Arena>, Subscribers, FrameQueue, Deframer) {
        let arena = Arena::with_capacity(256, 32);
        let subs = Subscribers::new();
        let monitor = FrameQueue::new(16);
        subs.subscribe(SUBSCRIBER_MONITOR, Some(monitor.clone()));
        let deframer = Deframer::new(Arc::clone(&arena), subs.clone());
        (arena, subs, monitor, deframer)
    }

    fn feed(deframer: &mut Deframer, octets: &[u8]) {
        for &o in octets {
            deframer.push_octet(o);
        }
    }

    fn framed(data: &[u8]) -> Vec<u8> {
        encode_frame_octets(data, 2, 2)
    }

    fn framed_with_fcs(data: &[u8], fcs: [u8; 2]) -> Vec<u8> {
        let mut stuffer = BitStuffer::new();
        let mut out = Vec::new();
        stuffer.encode_byte(HDLC_FLAG, true, &mut out);
        for &b in data.iter().chain(fcs.iter()) {
            stuffer.encode_byte(b, false, &mut out);
        }
        stuffer.encode_byte(HDLC_FLAG, true, &mut out);
        stuffer.encode_byte(HDLC_FLAG, true, &mut out);
        stuffer.flush(&mut out);
        out
    }

    #[test]
    fn test_literal_ui_frame() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let data = [
            0x82, 0x9E, 0x9A, 0x40, 0x64, 0x9E, 0x8A, 0x98, 0x40, 0x61, 0xA6, 0x98, 0x9A, 0x9E,
            0x03, 0xF0,
        ];
        feed(&mut deframer, &framed(&data));
        let frame = monitor.try_get().unwrap();
        assert_eq!(frame.to_vec(), data);
        assert!(monitor.try_get().is_none());
        assert!(deframer.is_success());
    }

    #[test]
    fn test_stuffed_frame_roundtrip() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let mut data = vec![0xFF; 20];
        data.extend_from_slice(&[HDLC_FLAG; 6]);
        data.extend_from_slice(&[0x1F, 0xF8, 0x3E, 0x7C]);
        feed(&mut deframer, &encode_frame_octets(&data, 4, 2));
        assert_eq!(monitor.try_get().unwrap().to_vec(), data);
        assert_eq!(deframer.stats().frames, 1);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let data: Vec<u8> = (0x20..0x40).collect();
        let [lo, hi] = fcs_bytes(crc_ccitt(&data));
        feed(&mut deframer, &framed_with_fcs(&data, [lo ^ 0x04, hi]));
        assert!(monitor.try_get().is_none());
        assert_eq!(deframer.stats().checksum_errors, 1);
        assert!(!deframer.is_success());
    }

    #[test]
    fn test_every_single_bit_error_detected() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let data: Vec<u8> = (0x30..0x48).collect();
        let mut wire = data.clone();
        wire.extend_from_slice(&fcs_bytes(crc_ccitt(&data)));

        for bit in 0..wire.len() * 8 {
            let mut corrupt = wire.clone();
            corrupt[bit / 8] ^= 1 << (bit % 8);
            let (body, fcs) = corrupt.split_at(data.len());
            feed(&mut deframer, &framed_with_fcs(body, [fcs[0], fcs[1]]));
            assert_eq!(
                deframer.stats().checksum_errors as usize,
                bit + 1,
                "flip of bit {} not detected",
                bit
            );
            assert!(monitor.try_get().is_none());
        }

        let (body, fcs) = wire.split_at(data.len());
        feed(&mut deframer, &framed_with_fcs(body, [fcs[0], fcs[1]]));
        assert_eq!(monitor.try_get().unwrap().to_vec(), data);
    }

    #[test]
    fn test_short_frames_ignored() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        feed(&mut deframer, &framed(&[0x40; 14]));
        assert!(monitor.try_get().is_none());
        assert_eq!(deframer.stats().checksum_errors, 0);
    }

    #[test]
    fn test_shared_boundary_flag() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let a: Vec<u8> = (0x20..0x38).collect();
        let b: Vec<u8> = (0x40..0x58).collect();
        let mut stuffer = BitStuffer::new();
        let mut octets = Vec::new();
        stuffer.encode_byte(HDLC_FLAG, true, &mut octets);
        stuffer.encode_frame(&a, &mut octets);
        stuffer.encode_byte(HDLC_FLAG, true, &mut octets);
        stuffer.encode_frame(&b, &mut octets);
        stuffer.encode_byte(HDLC_FLAG, true, &mut octets);
        stuffer.encode_byte(HDLC_FLAG, true, &mut octets);
        stuffer.flush(&mut octets);
        feed(&mut deframer, &octets);
        assert_eq!(monitor.try_get().unwrap().to_vec(), a);
        assert_eq!(monitor.try_get().unwrap().to_vec(), b);
    }

    #[test]
    fn test_oversize_frame_aborts() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let data = vec![0x55; MAX_FRAME_SIZE + 10];
        feed(&mut deframer, &framed(&data));
        assert!(monitor.try_get().is_none());
        assert!(deframer.stats().aborts >= 1);
        // Recovers for the next frame
        let good: Vec<u8> = (0x20..0x40).collect();
        feed(&mut deframer, &framed(&good));
        assert_eq!(monitor.try_get().unwrap().to_vec(), good);
    }

    #[test]
    fn test_duplicates_within_generation() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let data: Vec<u8> = (0x20..0x40).collect();
        let octets = framed(&data);
        deframer.next_window();
        feed(&mut deframer, &octets);
        feed(&mut deframer, &octets);
        assert!(monitor.try_get().is_some());
        assert!(monitor.try_get().is_none());
        assert_eq!(deframer.stats().duplicates, 1);

        // One byte different is a different frame
        let mut other = data.clone();
        other[3] ^= 0x02;
        feed(&mut deframer, &framed(&other));
        assert!(monitor.try_get().is_some());
    }

    #[test]
    fn test_duplicate_window_expires() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let data: Vec<u8> = (0x20..0x40).collect();
        let octets = framed(&data);
        feed(&mut deframer, &octets);
        deframer.next_window();
        feed(&mut deframer, &octets);
        assert_eq!(deframer.stats().duplicates, 1);
        deframer.next_window();
        deframer.next_window();
        feed(&mut deframer, &octets);
        assert_eq!(deframer.stats().frames, 2);
        assert_eq!(monitor.len(), 2);
    }

    #[test]
    fn test_next_window_drops_partial_frame() {
        let (_arena, _subs, monitor, mut deframer) = setup();
        let data: Vec<u8> = (0x20..0x40).collect();
        let octets = framed(&data);
        feed(&mut deframer, &octets[..10]);
        assert_eq!(deframer.state(), State::Receiving);
        deframer.next_window();
        assert_eq!(deframer.state(), State::FlagSync);
        feed(&mut deframer, &octets[10..]);
        assert!(monitor.try_get().is_none());
    }

    #[test]
    fn test_fan_out_shares_frame() {
        let arena = Arena::with_capacity(64, 32);
        let subs = Subscribers::new();
        let monitor = FrameQueue::new(4);
        let relay = FrameQueue::new(4);
        let gateway = FrameQueue::new(4);
        subs.subscribe(SUBSCRIBER_MONITOR, Some(monitor.clone()));
        subs.subscribe(SUBSCRIBER_RELAY, Some(relay.clone()));
        subs.subscribe(SUBSCRIBER_GATEWAY, Some(gateway.clone()));
        let mut deframer = Deframer::new(Arc::clone(&arena), subs);

        let data: Vec<u8> = (0x20..0x40).collect();
        feed(&mut deframer, &framed(&data));
        let mut copies = vec![
            monitor.get().unwrap(),
            relay.get().unwrap(),
            gateway.get().unwrap(),
        ];
        let used = arena.used_slots();
        for c in copies.iter_mut() {
            assert_eq!(c.to_vec(), data);
            assert!(!c.is_writable());
        }
        // One chain, three handles
        assert_eq!(used, 1);
        copies.clear();
        assert_eq!(arena.used_slots(), 0);
    }

    #[test]
    fn test_no_monitor_releases_canonical() {
        let arena = Arena::with_capacity(64, 32);
        let subs = Subscribers::new();
        let relay = FrameQueue::new(4);
        subs.subscribe(SUBSCRIBER_RELAY, Some(relay.clone()));
        let mut deframer = Deframer::new(Arc::clone(&arena), subs);

        let data: Vec<u8> = (0x20..0x40).collect();
        feed(&mut deframer, &framed(&data));
        let frame = relay.get().unwrap();
        assert_eq!(frame.to_vec(), data);
        drop(frame);
        assert_eq!(arena.used_slots(), 0);
    }

    #[test]
    fn test_full_subscriber_does_not_block() {
        let (arena, subs, monitor, mut deframer) = setup();
        let relay = FrameQueue::new(1);
        subs.subscribe(SUBSCRIBER_RELAY, Some(relay.clone()));
        for k in 0..3u8 {
            let data: Vec<u8> = (0x20..0x40).map(|b| b ^ k).collect();
            feed(&mut deframer, &framed(&data));
        }
        assert_eq!(monitor.len(), 3);
        assert_eq!(relay.len(), 1);
        monitor.drain();
        relay.drain();
        assert_eq!(arena.used_slots(), 0);
    }

    #[test]
    fn test_unsubscribe_signals_and_drains() {
        let (arena, subs, monitor, mut deframer) = setup();
        let data: Vec<u8> = (0x20..0x40).collect();
        feed(&mut deframer, &framed(&data));
        assert_eq!(monitor.len(), 1);

        let old = subs.subscribe(SUBSCRIBER_MONITOR, None).unwrap();
        assert!(!subs.is_subscribed(SUBSCRIBER_MONITOR));
        assert_eq!(arena.used_slots(), 0);
        assert!(old.get().unwrap().is_empty());

        // Not subscribed: nothing delivered, nothing leaked
        feed(&mut deframer, &framed(&[0x33; 20]));
        assert!(monitor.is_empty());
        assert_eq!(arena.used_slots(), 0);
    }

    #[test]
    fn test_unsubscribe_while_receiving_leaves_sentinel_last() {
        let arena = Arena::with_capacity(1024, 32);
        let subs = Subscribers::new();
        let relay = FrameQueue::new(64);
        subs.subscribe(SUBSCRIBER_RELAY, Some(relay.clone()));
        let mut deframer = Deframer::new(Arc::clone(&arena), subs.clone());

        let receiving = std::thread::spawn(move || {
            for k in 0..200u8 {
                let data: Vec<u8> = (0..24u8).map(|i| i.wrapping_mul(7) ^ k).collect();
                feed(&mut deframer, &framed(&data));
            }
        });
        while relay.is_empty() {
            std::thread::yield_now();
        }
        subs.subscribe(SUBSCRIBER_RELAY, None);
        receiving.join().unwrap();

        assert_eq!(relay.len(), 1);
        assert!(relay.try_get().unwrap().is_empty());
        assert_eq!(arena.used_slots(), 0);
    }
}
