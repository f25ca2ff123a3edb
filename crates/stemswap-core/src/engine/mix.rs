//! Render-side mix state and the diagnostic test tone

use std::f32::consts::TAU;

use super::interp::InterpolationMethod;
use crate::types::{Deck, Stem, StereoSample, NUM_DECKS, NUM_STEMS};

/// Default per-stem-type volume multipliers, in [`Stem`] slot order
pub const DEFAULT_STEM_VOLUMES: [f32; NUM_STEMS] = [0.8, 0.9, 0.8, 0.7, 0.6];

pub const DEFAULT_MASTER_VOLUME: f32 = 0.8;

pub const DEFAULT_BPM: f64 = 125.0;

/// Levels, gains and volumes all live in 0..=1
pub const MAX_LEVEL: f32 = 1.0;

/// Mix parameters owned by the render engine
///
/// Only `EngineCommand`s change these; the control context sees them
/// through [`EngineAtomics`](super::EngineAtomics).
#[derive(Debug, Clone)]
pub struct MixState {
    pub deck_levels: [f32; NUM_DECKS],
    pub master_volume: f32,
    pub stem_volumes: [f32; NUM_STEMS],
    pub global_bpm: f64,
    pub interpolation: InterpolationMethod,
}

impl Default for MixState {
    fn default() -> Self {
        Self {
            deck_levels: [1.0, 0.0],
            master_volume: DEFAULT_MASTER_VOLUME,
            stem_volumes: DEFAULT_STEM_VOLUMES,
            global_bpm: DEFAULT_BPM,
            interpolation: InterpolationMethod::default(),
        }
    }
}

impl MixState {
    #[inline]
    pub fn deck_level(&self, deck: Deck) -> f32 {
        self.deck_levels[deck.index()]
    }

    #[inline]
    pub fn stem_volume(&self, stem: Stem) -> f32 {
        self.stem_volumes[stem.index()]
    }

    pub fn set_deck_levels(&mut self, a: f32, b: f32) {
        self.deck_levels = [clamp_level(a), clamp_level(b)];
    }

    pub fn set_stem_volume(&mut self, stem: Stem, level: f32) {
        self.stem_volumes[stem.index()] = clamp_level(level);
    }

    pub fn set_master_volume(&mut self, level: f32) {
        self.master_volume = clamp_level(level);
    }
}

/// Deck levels for a crossfader position (0 = A only, 1 = B only)
pub fn crossfade_levels(position: f32) -> (f32, f32) {
    let x = if position.is_finite() { position.clamp(0.0, 1.0) } else { 0.0 };
    (1.0 - x, x)
}

#[inline]
pub fn clamp_level(level: f32) -> f32 {
    if level.is_finite() {
        level.clamp(0.0, MAX_LEVEL)
    } else {
        0.0
    }
}

/// Amplitude of the test tone before master volume
pub const TEST_TONE_AMPLITUDE: f32 = 0.2;

/// Sine generator for the `/test_tone` burst
#[derive(Debug, Clone, Default)]
pub struct TestTone {
    phase: f32,
    increment: f32,
    remaining: usize,
}

impl TestTone {
    /// Start a burst of `frames` frames at `frequency` Hz
    pub fn start(&mut self, frequency: f32, frames: usize, sample_rate: u32) {
        let nyquist = sample_rate as f32 / 2.0;
        let frequency = frequency.clamp(1.0, nyquist - 1.0);
        self.phase = 0.0;
        self.increment = frequency / sample_rate as f32;
        self.remaining = frames;
    }

    pub fn stop(&mut self) {
        self.remaining = 0;
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }

    /// Add the tone to `out` until the burst runs out
    pub fn render_into(&mut self, out: &mut [StereoSample]) {
        for sample in out.iter_mut() {
            if self.remaining == 0 {
                return;
            }
            *sample += StereoSample::mono((self.phase * TAU).sin() * TEST_TONE_AMPLITUDE);
            self.phase = (self.phase + self.increment).fract();
            self.remaining -= 1;
        }
    }
}
