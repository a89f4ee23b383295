//! Receive pipeline: samples → carrier gated windows → demodulator → deframer
//!
//! Samples are collected into a receive window while carrier is detected.
//! When the carrier drops the window is decoded; if no frame came out of it
//! the same samples are run again through a pre-emphasis and then a
//! de-emphasis filter before giving up.

use crate::afsk::{CarrierDetect, Fir, Prefilter, ToneDemodulator, SAMPLES_PER_BIT};
use crate::arena::Arena;
use crate::config::DemodConfig;
use crate::hdlc::{Deframer, Subscribers};
use crate::ring::SampleRing;
use crate::SAMPLE_RATE;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Windows this short are noise bursts and are not decoded
pub const MIN_WINDOW_SAMPLES: usize = 2500;
/// A window is cut here even if the carrier stays on
pub const MAX_WINDOW_SAMPLES: usize = SAMPLE_RATE * 4;

/// Zero samples fed after each pass to flush the filters
const FLUSH_SAMPLES: usize = 16;
/// Samples kept from before the carrier came up
const LEAD_IN: usize = SAMPLES_PER_BIT * 16;
/// Samples still collected after the carrier dropped
const HANGOVER: usize = SAMPLES_PER_BIT * 16;

const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStats {
    pub windows: u64,
    pub skipped: u64,
    pub retried: u64,
    pub recovered: u64,
}

pub struct Receiver {
    demod: ToneDemodulator,
    deframer: Deframer,
    carrier: CarrierDetect,
    carrier_flag: Arc<AtomicBool>,
    retry_filters: bool,
    window: Vec<f32>,
    in_carrier: bool,
    hangover: usize,
    stats: RxStats,
}

impl Receiver {
    pub fn new(arena: Arc<Arena>, subscribers: Subscribers, config: &DemodConfig) -> Self {
        Self {
            demod: ToneDemodulator::new(config.auto_balance),
            deframer: Deframer::new(arena, subscribers),
            carrier: CarrierDetect::new(),
            carrier_flag: Arc::new(AtomicBool::new(false)),
            retry_filters: config.retry_filters,
            window: Vec::with_capacity(MIN_WINDOW_SAMPLES * 2),
            in_carrier: false,
            hangover: 0,
            stats: RxStats::default(),
        }
    }

    /// Carrier state, shared with whatever needs to know the channel is busy
    pub fn carrier_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.carrier_flag)
    }

    pub fn deframer(&self) -> &Deframer {
        &self.deframer
    }

    pub fn stats(&self) -> RxStats {
        self.stats
    }

    /// Decode one sample straight through, without windows or retries
    pub fn process_sample(&mut self, sample: f32) {
        if let Some(bit) = self.demod.process_sample(sample) {
            self.deframer.push_bit(bit);
        }
    }

    /// Feed one live sample. Closed windows are decoded as they complete.
    pub fn push_sample(&mut self, sample: f32) {
        let busy = self.carrier.update(sample);
        self.carrier_flag.store(busy, Ordering::Relaxed);
        self.window.push(sample);

        if busy {
            self.in_carrier = true;
            self.hangover = HANGOVER;
        } else if self.in_carrier {
            if self.hangover == 0 {
                self.close_window();
                return;
            }
            self.hangover -= 1;
        } else if self.window.len() > LEAD_IN {
            let excess = self.window.len() - LEAD_IN;
            self.window.drain(..excess);
        }

        if self.window.len() >= MAX_WINDOW_SAMPLES {
            self.close_window();
        }
    }

    pub fn push_samples(&mut self, samples: &[f32]) {
        for &s in samples {
            self.push_sample(s);
        }
    }

    /// Decode whatever is left of an open window
    pub fn finish(&mut self) {
        if self.in_carrier {
            self.close_window();
        }
    }

    fn close_window(&mut self) {
        let window = std::mem::take(&mut self.window);
        self.in_carrier = false;
        self.hangover = 0;
        self.decode_window(&window);
        self.window = window;
        self.window.clear();
    }

    /// Decode a captured window, retrying with pre-filters when nothing was
    /// found. Returns true if a valid frame was found.
    pub fn decode_window(&mut self, samples: &[f32]) -> bool {
        if samples.len() <= MIN_WINDOW_SAMPLES {
            trace!("Skipping {} sample window", samples.len());
            self.stats.skipped += 1;
            return false;
        }
        self.stats.windows += 1;
        self.deframer.next_window();
        self.run_pass(samples, None);
        if self.deframer.is_success() || !self.retry_filters {
            return self.deframer.is_success();
        }

        self.stats.retried += 1;
        for prefilter in [Prefilter::PreEmphasis, Prefilter::DeEmphasis] {
            debug!("Nothing decoded, retrying window with {:?}", prefilter);
            self.run_pass(samples, prefilter.fir());
            if self.deframer.is_success() {
                self.stats.recovered += 1;
                return true;
            }
        }
        false
    }

    fn run_pass(&mut self, samples: &[f32], mut prefilter: Option<Fir>) {
        let flush = std::iter::repeat(0.0).take(FLUSH_SAMPLES);
        for sample in samples.iter().copied().chain(flush) {
            let sample = match prefilter.as_mut() {
                Some(fir) => fir.filter(sample),
                None => sample,
            };
            self.process_sample(sample);
        }
    }

    /// Consume samples from a ring until `shutdown` is set, then decode what
    /// is left in the ring and hand the receiver back
    pub fn spawn_stream(
        mut self,
        ring: Arc<SampleRing>,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<Receiver> {
        thread::spawn(move || {
            debug!("Receiver started");
            let mut buf = vec![0.0f32; READ_CHUNK];
            while !shutdown.load(Ordering::Relaxed) {
                let n = ring.pop_into(&mut buf);
                if n == 0 {
                    thread::sleep(Duration::from_millis(2));
                    continue;
                }
                self.push_samples(&buf[..n]);
            }
            loop {
                let n = ring.pop_into(&mut buf);
                if n == 0 {
                    break;
                }
                self.push_samples(&buf[..n]);
            }
            self.finish();
            if ring.dropped() > 0 {
                debug!("Sample ring dropped {} samples", ring.dropped());
            }
            debug!("Receiver stopped: {:?}", self.stats);
            self
        })
    }
}
