//! HDLC framer and channel access
//!
//! Takes frames from the transmit queue, waits for a clear channel using
//! p-persistent CSMA, then keys the radio and sends
//! `txdelay flags, frame, FCS, [flag, frame, FCS]..., txtail flags`.
//! Everything between the flags is bit-stuffed.

use super::HDLC_FLAG;
use crate::afsk::AfskModulator;
use crate::arena::Frame;
use crate::config::ChannelAccess;
use crate::crc::{crc_ccitt_update, fcs_bytes, CRC_INIT};
use crate::error::{Result, TncError};
use crate::queue::FrameQueue;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bit-serial HDLC output with zero-bit insertion
///
/// Octets are shifted out LSB first into an accumulator that is emitted every
/// eight bits. The accumulator is never reset, so stuffed bits shift the
/// octet alignment for the rest of the stream.
#[derive(Debug, Clone, Default)]
pub struct BitStuffer {
    out_byte: u8,
    out_bits: u8,
}

impl BitStuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // The newest five bits are all ones
    fn needs_stuffing(&self) -> bool {
        self.out_byte & 0x7c == 0x7c
    }

    fn push_bit(&mut self, bit: u8, out: &mut Vec<u8>) {
        self.out_byte |= bit << 7;
        self.out_bits += 1;
        if self.out_bits == 8 {
            out.push(self.out_byte);
            self.out_bits = 0;
        }
        self.out_byte >>= 1;
    }

    /// Encode one byte. Flags are sent verbatim; data gets a zero after
    /// every run of five ones.
    pub fn encode_byte(&mut self, byte: u8, flag: bool, out: &mut Vec<u8>) {
        // Data ending in five ones still needs its zero before a flag
        if flag && self.needs_stuffing() {
            self.push_bit(0, out);
        }
        let mut byte = byte;
        let mut sent = 0;
        while sent < 8 {
            if !flag && self.needs_stuffing() {
                self.push_bit(0, out);
                continue;
            }
            self.push_bit(byte & 1, out);
            byte >>= 1;
            sent += 1;
        }
    }

    pub fn encode_flags(&mut self, count: usize, out: &mut Vec<u8>) {
        for _ in 0..count {
            self.encode_byte(HDLC_FLAG, true, out);
        }
    }

    /// Encode frame content followed by its FCS
    pub fn encode_frame(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let mut crc = CRC_INIT;
        for &b in data {
            crc = crc_ccitt_update(crc, b);
            self.encode_byte(b, false, out);
        }
        for b in fcs_bytes(crc) {
            self.encode_byte(b, false, out);
        }
    }

    /// Complete a partial octet with flag bits
    pub fn flush(&mut self, out: &mut Vec<u8>) {
        let mut k = 0;
        while self.out_bits != 0 {
            self.push_bit((HDLC_FLAG >> k) & 1, out);
            k = (k + 1) % 8;
        }
    }
}

/// Stuffed octet stream for one frame with the given number of leading and
/// trailing flags
pub fn encode_frame_octets(data: &[u8], preamble: usize, postamble: usize) -> Vec<u8> {
    let mut stuffer = BitStuffer::new();
    let mut out = Vec::with_capacity(data.len() + data.len() / 5 + preamble + postamble + 4);
    stuffer.encode_flags(preamble, &mut out);
    stuffer.encode_frame(data, &mut out);
    stuffer.encode_flags(postamble.max(1), &mut out);
    stuffer.flush(&mut out);
    out
}

/// Radio control as seen by the framer
pub trait Radio: Send {
    /// Carrier or other traffic on the channel
    fn channel_busy(&mut self) -> bool;

    fn key_transmitter(&mut self);

    fn send_octet(&mut self, octet: u8);

    /// Block until every octet handed over has left the transmitter
    fn wait_transmit_complete(&mut self);

    fn release_transmitter(&mut self);
}

/// Radio that modulates transmitted octets into an audio buffer
///
/// Channel busy is read from a shared flag so a receiver's carrier detect or
/// a test can drive it.
#[derive(Debug)]
pub struct AfskLoopback {
    modulator: AfskModulator,
    samples: Vec<f32>,
    octets: Vec<u8>,
    busy: Arc<AtomicBool>,
    keyed: bool,
    transmissions: usize,
    unkeyed_octets: usize,
}

impl AfskLoopback {
    pub fn new() -> Self {
        Self {
            modulator: AfskModulator::default(),
            samples: Vec::new(),
            octets: Vec::new(),
            busy: Arc::new(AtomicBool::new(false)),
            keyed: false,
            transmissions: 0,
            unkeyed_octets: 0,
        }
    }

    /// Shared channel-busy flag
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.busy)
    }

    pub fn with_busy_flag(mut self, busy: Arc<AtomicBool>) -> Self {
        self.busy = busy;
        self
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    /// Raw octets handed to the modulator
    pub fn octets(&self) -> &[u8] {
        &self.octets
    }

    pub fn is_keyed(&self) -> bool {
        self.keyed
    }

    pub fn transmissions(&self) -> usize {
        self.transmissions
    }

    /// Octets that arrived while the transmitter was not keyed
    pub fn unkeyed_octets(&self) -> usize {
        self.unkeyed_octets
    }
}

impl Default for AfskLoopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Radio for AfskLoopback {
    fn channel_busy(&mut self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    fn key_transmitter(&mut self) {
        self.keyed = true;
        self.transmissions += 1;
    }

    fn send_octet(&mut self, octet: u8) {
        if !self.keyed {
            self.unkeyed_octets += 1;
        }
        self.octets.push(octet);
        self.modulator.modulate_octet(octet, &mut self.samples);
    }

    fn wait_transmit_complete(&mut self) {}

    fn release_transmitter(&mut self) {
        self.keyed = false;
    }
}

/// Framer state readable from other tasks
#[derive(Debug, Clone)]
pub struct FramerStatus {
    idle: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    input: FrameQueue,
}

impl FramerStatus {
    /// No transmission in progress
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Frames queued or being sent
    pub fn packets_waiting(&self) -> bool {
        !self.input.is_empty() || self.pending.load(Ordering::Acquire) > 0
    }

    /// Poll until the framer has nothing left to send
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let step = Duration::from_millis(5);
        let mut waited = Duration::ZERO;
        while self.packets_waiting() || !self.is_idle() {
            if waited >= timeout {
                return Err(TncError::Timeout);
            }
            thread::sleep(step);
            waited += step;
        }
        Ok(())
    }
}

pub struct Framer<R: Radio> {
    radio: R,
    input: FrameQueue,
    tx_monitor: Option<FrameQueue>,
    access: ChannelAccess,
    rng: StdRng,
    stuffer: BitStuffer,
    scratch: Vec<u8>,
    idle: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    deferrals: u64,
}

impl<R: Radio> Framer<R> {
    pub fn new(radio: R, input: FrameQueue, access: ChannelAccess) -> Self {
        Self {
            radio,
            input,
            tx_monitor: None,
            access,
            rng: StdRng::from_entropy(),
            stuffer: BitStuffer::new(),
            scratch: Vec::with_capacity(16),
            idle: Arc::new(AtomicBool::new(true)),
            pending: Arc::new(AtomicUsize::new(0)),
            deferrals: 0,
        }
    }

    /// Fixed seed for the persistence draw
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Mirror every transmitted frame onto `queue`
    pub fn set_tx_monitor(&mut self, queue: Option<FrameQueue>) {
        self.tx_monitor = queue;
    }

    pub fn status(&self) -> FramerStatus {
        FramerStatus {
            idle: Arc::clone(&self.idle),
            pending: Arc::clone(&self.pending),
            input: self.input.clone(),
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Slots spent waiting after losing the persistence draw
    pub fn deferrals(&self) -> u64 {
        self.deferrals
    }

    pub fn into_radio(self) -> R {
        self.radio
    }

    fn send_byte(&mut self, byte: u8, flag: bool) {
        self.stuffer.encode_byte(byte, flag, &mut self.scratch);
        for &o in &self.scratch {
            self.radio.send_octet(o);
        }
        self.scratch.clear();
    }

    fn send_flags(&mut self, count: u8) {
        for _ in 0..count {
            self.send_byte(HDLC_FLAG, true);
        }
    }

    /// p-persistent CSMA: wait for a clear channel, then transmit with
    /// probability `1 - persistence/256` per slot
    fn wait_for_channel(&mut self) {
        loop {
            while self.radio.channel_busy() {
                thread::sleep(self.access.slot_time);
            }
            let r: u8 = self.rng.gen();
            if r < self.access.persistence {
                self.deferrals += 1;
                thread::sleep(self.access.slot_time);
            } else {
                return;
            }
        }
    }

    fn send_frame(&mut self, frame: Frame) {
        let data = frame.to_vec();
        let mut crc = CRC_INIT;
        for &b in &data {
            crc = crc_ccitt_update(crc, b);
            self.send_byte(b, false);
        }
        let [lo, hi] = fcs_bytes(crc);
        self.send_byte(lo, false);
        self.send_byte(hi, false);

        if let Some(monitor) = &self.tx_monitor {
            if monitor.try_put(frame).is_err() {
                warn!("Transmit monitor queue full");
            }
        }
    }

    // Send `first` and up to `max_frames - 1` further queued frames in one
    // transmission
    fn transmit(&mut self, first: Frame) {
        self.idle.store(false, Ordering::Release);
        self.radio.key_transmitter();
        self.send_flags(self.access.txdelay);

        let mut frame = first;
        let mut sent = 0;
        loop {
            debug!("Transmitting frame of {} bytes", frame.len());
            self.send_frame(frame);
            self.pending.fetch_sub(1, Ordering::AcqRel);
            sent += 1;
            if sent >= self.access.max_frames as usize {
                break;
            }
            match self.input.try_get() {
                Some(next) if !next.is_empty() => {
                    self.pending.fetch_add(1, Ordering::AcqRel);
                    self.send_byte(HDLC_FLAG, true);
                    frame = next;
                }
                _ => break,
            }
        }

        self.send_flags(self.access.txtail);
        self.radio.wait_transmit_complete();
        self.radio.release_transmitter();
        self.idle.store(true, Ordering::Release);
        info!("Transmitted {} frame(s)", sent);
    }

    /// Wait for the channel, then transmit `frame`
    pub fn send(&mut self, frame: Frame) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.wait_for_channel();
        self.transmit(frame);
    }

    /// Key the transmitter and send `byte` unstuffed `count` times
    pub fn send_test_signal(&mut self, byte: u8, count: usize) {
        self.idle.store(false, Ordering::Release);
        self.radio.key_transmitter();
        for _ in 0..count {
            self.radio.send_octet(byte);
        }
        self.radio.wait_transmit_complete();
        self.radio.release_transmitter();
        self.idle.store(true, Ordering::Release);
    }

    /// Transmit queued frames until `shutdown` is set. Empty frames are
    /// wake-up sentinels.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        debug!("Framer started");
        while !shutdown.load(Ordering::Relaxed) {
            match self.input.get_timeout(POLL_INTERVAL) {
                Ok(frame) if frame.is_empty() => continue,
                Ok(frame) => self.send(frame),
                Err(TncError::Timeout) => continue,
                Err(e) => {
                    warn!("Framer input failed: {}", e);
                    break;
                }
            }
        }
        debug!("Framer stopped");
    }
}

impl<R: Radio + 'static> Framer<R> {
    /// Run the framer on its own thread. The radio is handed back on exit.
    pub fn spawn(mut self, shutdown: Arc<AtomicBool>) -> JoinHandle<R> {
        thread::spawn(move || {
            self.run(&shutdown);
            self.radio
        })
    }
}
