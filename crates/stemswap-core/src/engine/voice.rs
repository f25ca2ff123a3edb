//! Stem voice - one playback unit
//!
//! A voice reads one decoded asset at a fractional cursor. It is built in
//! the control context, boxed, and handed to the render engine through the
//! command channel; from then on only the render thread touches it. When it
//! is retired the box travels back to the control context inside an
//! [`EngineEvent`](super::EngineEvent) so its cache reference can be
//! released there.

use basedrop::Shared;

use super::interp::{read_in_window, InterpolationMethod, ReadWindow};
use crate::asset::{AssetHandle, AudioAsset};
use crate::music::tempo_ratio;
use crate::types::StereoSample;

/// Slowest and fastest playback rate a voice accepts
pub const MIN_RATE: f64 = 0.25;
pub const MAX_RATE: f64 = 4.0;

/// Outcome of rendering one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceStatus {
    /// Still producing audio
    Playing,
    /// Reached the end of its window without looping
    Ended,
    /// Asset or window is unusable; the voice was stopped
    Fault,
}

pub struct StemVoice {
    asset: Shared<AudioAsset>,
    handle: AssetHandle,
    engine_rate: u32,
    /// Tempo the asset was recorded at, if known; drives re-rating
    base_bpm: Option<f64>,
    /// Tempo ratio (1.0 = original speed)
    rate: f64,
    /// Source frames consumed per output frame
    step: f64,
    gain: f32,
    current_gain: f32,
    gain_step: f32,
    looping: bool,
    cursor: f64,
    window_start: usize,
    window_end: usize,
    active: bool,
    pending_swap: Option<u64>,
}

impl StemVoice {
    /// New voice over the whole asset at unity rate and gain
    pub fn new(handle: AssetHandle, asset: Shared<AudioAsset>, engine_rate: u32) -> Self {
        let window_end = asset.frame_count();
        let mut voice = Self {
            asset,
            handle,
            engine_rate: engine_rate.max(1),
            base_bpm: None,
            rate: 1.0,
            step: 1.0,
            gain: 1.0,
            current_gain: 1.0,
            gain_step: 0.0,
            looping: false,
            cursor: 0.0,
            window_start: 0,
            window_end,
            active: true,
            pending_swap: None,
        };
        voice.set_rate(1.0);
        voice
    }

    /// Set the tempo ratio directly
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.set_rate(rate);
        self
    }

    /// Rate the voice from its recorded tempo against `global_bpm`
    pub fn with_tempo(mut self, base_bpm: f64, global_bpm: f64) -> Self {
        self.base_bpm = Some(base_bpm);
        self.set_rate(tempo_ratio(base_bpm, global_bpm));
        self
    }

    /// Start at `level` with no ramp
    pub fn with_gain(mut self, level: f32) -> Self {
        self.gain = level.max(0.0);
        self.current_gain = self.gain;
        self.gain_step = 0.0;
        self
    }

    /// Start silent; the render engine ramps it in
    pub fn silent(mut self) -> Self {
        self.current_gain = 0.0;
        self
    }

    pub fn with_loop(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Bound playback to `[start, end)` frames, clamped to the asset
    pub fn with_window(mut self, start: usize, end: usize) -> Self {
        let len = self.asset.frame_count();
        let end = end.min(len);
        let start = start.min(end);
        self.window_start = start;
        self.window_end = end;
        self.cursor = start as f64;
        self
    }

    pub fn with_start(mut self, frame: usize) -> Self {
        self.seek(frame);
        self
    }

    pub fn with_pending_swap(mut self, ticket: u64) -> Self {
        self.pending_swap = Some(ticket);
        self
    }

    // ─────────────────────────────────────────────────────────────
    // Parameter changes (applied by the render thread)
    // ─────────────────────────────────────────────────────────────

    pub fn set_rate(&mut self, rate: f64) {
        let rate = if rate.is_finite() { rate.clamp(MIN_RATE, MAX_RATE) } else { 1.0 };
        self.rate = rate;
        self.step = rate * self.asset.sample_rate() as f64 / self.engine_rate as f64;
    }

    /// Recompute the rate for a new global tempo
    ///
    /// Voices without a recorded tempo keep their explicit rate.
    pub fn retime(&mut self, global_bpm: f64) {
        if let Some(base) = self.base_bpm {
            self.set_rate(tempo_ratio(base, global_bpm));
        }
    }

    /// Move toward `level` over `ramp_frames` output frames
    pub fn set_gain(&mut self, level: f32, ramp_frames: usize) {
        let level = level.max(0.0);
        let distance = (level - self.current_gain).abs();
        self.ramp_to(level, distance / ramp_frames.max(1) as f32);
    }

    /// Move toward `level` by at most `step` per output frame
    pub fn ramp_to(&mut self, level: f32, step: f32) {
        self.gain = level.max(0.0);
        self.gain_step = step.max(f32::EPSILON);
    }

    /// Restart the gain envelope from silence toward the current target
    pub fn fade_in(&mut self, ramp_frames: usize) {
        let target = self.gain;
        self.current_gain = 0.0;
        self.set_gain(target, ramp_frames);
    }

    /// Silence the voice, returning the gain it was meant to play at
    pub fn hold_silent(&mut self) -> f32 {
        let target = self.gain;
        self.current_gain = 0.0;
        self.gain = 0.0;
        self.gain_step = 0.0;
        target
    }

    /// Reposition the cursor, clamped to the playback window
    pub fn seek(&mut self, frame: usize) {
        let last = self.window_end.saturating_sub(1).max(self.window_start);
        self.cursor = frame.clamp(self.window_start, last) as f64;
    }

    pub fn set_loop(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn set_pending_swap(&mut self, ticket: Option<u64>) {
        self.pending_swap = ticket;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    // ─────────────────────────────────────────────────────────────
    // Rendering
    // ─────────────────────────────────────────────────────────────

    /// Mix one block into `out` (additive), scaled by `stem_volume`
    ///
    /// Never allocates. The cursor advances by `out.len() × step` source
    /// frames, wrapping inside the window when looping.
    pub fn render_into(
        &mut self,
        out: &mut [StereoSample],
        stem_volume: f32,
        method: InterpolationMethod,
    ) -> VoiceStatus {
        if !self.active {
            return VoiceStatus::Ended;
        }
        if self.asset.frame_count() == 0 || self.window_start >= self.window_end {
            self.active = false;
            return VoiceStatus::Fault;
        }

        let data = self.asset.frames();
        let window = ReadWindow::new(self.window_start, self.window_end, self.looping);
        let start = self.window_start as f64;
        let end = self.window_end as f64;
        let window_len = end - start;

        for sample in out.iter_mut() {
            if self.cursor >= end {
                if !self.looping {
                    self.active = false;
                    return VoiceStatus::Ended;
                }
                self.cursor = start + (self.cursor - end) % window_len;
            }

            let value = read_in_window(data, self.cursor, window, method);
            *sample += value * (self.current_gain * stem_volume);

            // Field-level updates: `data` still borrows the asset
            self.current_gain = step_gain(self.current_gain, self.gain, self.gain_step);
            self.cursor += self.step;
        }

        VoiceStatus::Playing
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    pub fn handle(&self) -> AssetHandle {
        self.handle
    }

    pub fn asset(&self) -> &Shared<AudioAsset> {
        &self.asset
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn base_bpm(&self) -> Option<f64> {
        self.base_bpm
    }

    /// Target gain
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Gain applied to the next frame
    pub fn current_gain(&self) -> f32 {
        self.current_gain
    }

    pub fn gain_step(&self) -> f32 {
        self.gain_step
    }

    pub fn is_ramping(&self) -> bool {
        self.current_gain != self.gain
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn cursor_seconds(&self) -> f64 {
        self.cursor / self.asset.sample_rate().max(1) as f64
    }

    pub fn window(&self) -> (usize, usize) {
        (self.window_start, self.window_end)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pending_swap(&self) -> Option<u64> {
        self.pending_swap
    }
}

/// One frame of gain ramp toward `target`
#[inline]
fn step_gain(current: f32, target: f32, step: f32) -> f32 {
    if current < target {
        (current + step).min(target)
    } else if current > target {
        (current - step).max(target)
    } else {
        current
    }
}
