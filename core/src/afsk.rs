//! Bell 202 AFSK: tone demodulator, tone modulator and carrier detect
//!
//! Samples are `f32` in roughly `[-1.0, 1.0]` at [`SAMPLE_RATE`]. The
//! demodulator emits one NRZI-decoded bit per recovered bit period; the
//! modulator turns octets (LSB first) into phase-continuous tone samples.

use crate::{BIT_RATE, MARK_FREQ, SAMPLE_RATE, SPACE_FREQ};
use std::f32::consts::PI;

pub const SAMPLES_PER_BIT: usize = SAMPLE_RATE / BIT_RATE;

// Phase accumulator: PHASE_STEP per sample, one bit per PHASE_MAX
const PHASE_STEP: i32 = 8;
const PHASE_NUDGE: i32 = 1;
const PHASE_MAX: i32 = SAMPLES_PER_BIT as i32 * PHASE_STEP;
const PHASE_THRESHOLD: i32 = PHASE_MAX / 2;

// Filter taps in 1/128 units
const BP_MARK: [i8; 11] = [-12, -16, -15, 0, 20, 29, 20, 0, -15, -16, -12];
const BP_SPACE: [i8; 11] = [11, 15, -8, -26, 4, 30, 4, -26, -8, 15, 11];
const LP_BIT: [i8; 8] = [-9, 3, 26, 47, 47, 26, 3, -9];
const BP_CARRIER: [i8; 30] = [
    3, 4, -2, -5, -3, 1, -2, -3, 7, 19, 8, -24, -37, -4, 38, 38, -4, -37, -24, 8, 19, 7, -3, -2,
    1, -3, -5, -2, 4, 3,
];
const PRE_EMPHASIS: [i8; 5] = [-18, -29, 93, -29, -18];
const DE_EMPHASIS: [i8; 5] = [6, 39, 60, 39, 6];

/// Carrier detect threshold on the smoothed band energy
const CARRIER_THRESHOLD: f32 = 75.0 / 16384.0;

const BALANCE_ALPHA: f32 = 1.0 / 32.0;
const BALANCE_FLOOR: f32 = 1e-4;

fn transition(bits: u8) -> bool {
    (bits ^ (bits >> 1)) & 1 != 0
}

/// Direct-form FIR filter with its own delay line
#[derive(Debug, Clone)]
pub struct Fir {
    coef: Vec<f32>,
    mem: Vec<f32>,
}

impl Fir {
    pub fn new(taps: &[i8]) -> Self {
        Self {
            coef: taps.iter().map(|&c| c as f32 / 128.0).collect(),
            mem: vec![0.0; taps.len()],
        }
    }

    pub fn filter(&mut self, sample: f32) -> f32 {
        self.mem.rotate_right(1);
        self.mem[0] = sample;
        self.mem.iter().zip(&self.coef).map(|(m, c)| m * c).sum()
    }

    pub fn reset(&mut self) {
        self.mem.iter_mut().for_each(|m| *m = 0.0);
    }
}

/// Optional filter put in front of the demodulator on a retry pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefilter {
    None,
    PreEmphasis,
    DeEmphasis,
}

impl Prefilter {
    pub fn fir(self) -> Option<Fir> {
        match self {
            Prefilter::None => None,
            Prefilter::PreEmphasis => Some(Fir::new(&PRE_EMPHASIS)),
            Prefilter::DeEmphasis => Some(Fir::new(&DE_EMPHASIS)),
        }
    }
}

/// Trailing average of both tone magnitudes
#[derive(Debug, Clone, Default)]
struct Balance {
    mark: f32,
    space: f32,
}

impl Balance {
    fn weigh(&mut self, mark: f32, space: f32) -> (f32, f32) {
        self.mark += (mark - self.mark) * BALANCE_ALPHA;
        self.space += (space - self.space) * BALANCE_ALPHA;
        (
            mark / self.mark.max(BALANCE_FLOOR),
            space / self.space.max(BALANCE_FLOOR),
        )
    }
}

/// Tone demodulator with early/late bit clock recovery
///
/// Filter memory and phase persist for the whole receive session.
#[derive(Debug, Clone)]
pub struct ToneDemodulator {
    mark: Fir,
    space: Fir,
    lowpass: Fir,
    balance: Option<Balance>,
    sampled_bits: u8,
    phase: i32,
    found_bits: u8,
}

impl ToneDemodulator {
    pub fn new(auto_balance: bool) -> Self {
        Self {
            mark: Fir::new(&BP_MARK),
            space: Fir::new(&BP_SPACE),
            lowpass: Fir::new(&LP_BIT),
            balance: auto_balance.then(Balance::default),
            sampled_bits: 0,
            phase: 0,
            found_bits: 0,
        }
    }

    /// Feed one sample. Returns a decoded bit when a bit period ends.
    pub fn process_sample(&mut self, sample: f32) -> Option<bool> {
        let mut mark = self.mark.filter(sample).abs();
        let mut space = self.space.filter(sample).abs();
        if let Some(balance) = self.balance.as_mut() {
            (mark, space) = balance.weigh(mark, space);
        }
        let level = self.lowpass.filter(space - mark);
        self.sampled_bits = (self.sampled_bits << 1) | (level > 0.0) as u8;

        if transition(self.sampled_bits) {
            if self.phase < PHASE_THRESHOLD {
                self.phase += PHASE_NUDGE;
            } else {
                self.phase -= PHASE_NUDGE;
            }
        }
        self.phase += PHASE_STEP;

        if self.phase < PHASE_MAX {
            return None;
        }
        self.phase %= PHASE_MAX;
        self.found_bits = (self.found_bits << 1) | Self::vote(self.sampled_bits) as u8;

        // NRZI: no transition is a one
        Some(!transition(self.found_bits))
    }

    /// Majority over the four most recent samples; two trailing ones also count
    fn vote(sampled: u8) -> bool {
        let window = sampled & 0x0f;
        window.count_ones() >= 3 || window == 0x03
    }
}

impl Default for ToneDemodulator {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Carrier detect on the energy in the 1200-2200 Hz band
#[derive(Debug, Clone)]
pub struct CarrierDetect {
    filter: Fir,
    level: f32,
    prev: bool,
    prev2: bool,
    active: bool,
}

impl CarrierDetect {
    pub fn new() -> Self {
        Self {
            filter: Fir::new(&BP_CARRIER),
            level: 0.0,
            prev: false,
            prev2: false,
            active: false,
        }
    }

    /// Feed one sample; the state only flips after three agreeing samples
    pub fn update(&mut self, sample: f32) -> bool {
        let f = self.filter.filter(sample);
        self.level = self.level * 0.5 + f * f * 0.5;
        let above = self.level > CARRIER_THRESHOLD;
        if !above && !self.prev && !self.prev2 {
            self.active = false;
        } else if above && self.prev && self.prev2 {
            self.active = true;
        }
        self.prev2 = self.prev;
        self.prev = above;
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Default for CarrierDetect {
    fn default() -> Self {
        Self::new()
    }
}

/// Phase-continuous AFSK tone generator
///
/// Bits are NRZI coded: a zero toggles between the mark and space tones, a
/// one keeps the current tone.
#[derive(Debug, Clone)]
pub struct AfskModulator {
    phase: f32,
    mark_tone: bool,
    amplitude: f32,
}

impl AfskModulator {
    pub fn new(amplitude: f32) -> Self {
        Self {
            phase: 0.0,
            mark_tone: true,
            amplitude,
        }
    }

    pub fn modulate_bit(&mut self, bit: bool, out: &mut Vec<f32>) {
        if !bit {
            self.mark_tone = !self.mark_tone;
        }
        let freq = if self.mark_tone { MARK_FREQ } else { SPACE_FREQ };
        let step = 2.0 * PI * freq / SAMPLE_RATE as f32;
        for _ in 0..SAMPLES_PER_BIT {
            out.push(self.amplitude * self.phase.sin());
            self.phase += step;
            if self.phase >= 2.0 * PI {
                self.phase -= 2.0 * PI;
            }
        }
    }

    /// Send one octet, least significant bit first
    pub fn modulate_octet(&mut self, octet: u8, out: &mut Vec<f32>) {
        for i in 0..8 {
            self.modulate_bit((octet >> i) & 1 != 0, out);
        }
    }

    pub fn modulate(&mut self, octets: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(octets.len() * 8 * SAMPLES_PER_BIT);
        for &o in octets {
            self.modulate_octet(o, &mut out);
        }
        out
    }
}

impl Default for AfskModulator {
    fn default() -> Self {
        Self::new(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demodulate(samples: &[f32]) -> Vec<bool> {
        let mut demod = ToneDemodulator::default();
        samples
            .iter()
            .filter_map(|&s| demod.process_sample(s))
            .collect()
    }

    #[test]
    fn test_fir_impulse_response() {
        let mut fir = Fir::new(&[64, 32, -64]);
        assert_eq!(fir.filter(1.0), 0.5);
        assert_eq!(fir.filter(0.0), 0.25);
        assert_eq!(fir.filter(0.0), -0.5);
        assert_eq!(fir.filter(0.0), 0.0);
    }

    #[test]
    fn test_vote() {
        assert!(ToneDemodulator::vote(0b0111));
        assert!(ToneDemodulator::vote(0b1011));
        assert!(ToneDemodulator::vote(0b0011));
        assert!(!ToneDemodulator::vote(0b0101));
        assert!(!ToneDemodulator::vote(0b1001));
        assert!(!ToneDemodulator::vote(0b0001));
    }

    #[test]
    fn test_modulator_length_and_amplitude() {
        let mut modem = AfskModulator::new(0.5);
        let samples = modem.modulate(&[0x7E, 0x00]);
        assert_eq!(samples.len(), 16 * SAMPLES_PER_BIT);
        assert!(samples.iter().all(|s| s.abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn test_one_bit_per_bit_period() {
        let mut modem = AfskModulator::default();
        let samples = modem.modulate(&[0x55; 32]);
        let bits = demodulate(&samples);
        let expected = 32 * 8;
        assert!(
            (bits.len() as i64 - expected as i64).abs() <= 1,
            "got {} bits",
            bits.len()
        );
    }

    #[test]
    fn test_recovers_flag_pattern() {
        let mut modem = AfskModulator::default();
        let samples = modem.modulate(&[0x7E; 24]);
        let bits = demodulate(&samples);

        // After settling, the stream is the flag repeated at some bit offset
        let tail: Vec<bool> = bits[64..].to_vec();
        let found = (0..8).any(|shift| {
            tail[shift..]
                .chunks_exact(8)
                .take(10)
                .all(|c| c.iter().enumerate().fold(0u8, |acc, (i, &b)| acc | ((b as u8) << i)) == 0x7E)
        });
        assert!(found);
    }

    #[test]
    fn test_carrier_detect() {
        let mut dcd = CarrierDetect::new();
        for _ in 0..500 {
            dcd.update(0.0);
        }
        assert!(!dcd.is_active());

        let mut modem = AfskModulator::default();
        let tone = modem.modulate(&[0x7E; 8]);
        for &s in &tone {
            dcd.update(s);
        }
        assert!(dcd.is_active());

        for _ in 0..100 {
            dcd.update(0.0);
        }
        assert!(!dcd.is_active());
    }

    #[test]
    fn test_prefilter_taps() {
        assert!(Prefilter::None.fir().is_none());
        let mut de = Prefilter::DeEmphasis.fir().unwrap();
        // Unity-ish DC gain for the de-emphasis low-pass
        let dc: f32 = (0..5).map(|_| de.filter(1.0)).last().unwrap();
        assert!((dc - 150.0 / 128.0).abs() < 1e-6);
    }
}
