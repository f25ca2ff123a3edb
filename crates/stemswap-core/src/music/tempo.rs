//! Tempo matching
//!
//! Playback rate is a plain resampling ratio: a stem recorded at
//! `source_bpm` plays at `target_bpm / source_bpm` speed, which shifts its
//! pitch by the same factor.

use serde::{Deserialize, Serialize};

/// Rates further than this from 1.0 count as audible time adjustment
pub const TIME_ADJUSTMENT_THRESHOLD: f64 = 0.05;

/// How far apart two tempos may be and still be mixed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempoTolerance {
    /// ±5% of the source tempo
    Strict,
    /// ±15% of the source tempo; anything outside is rejected outright
    #[default]
    Relaxed,
}

impl TempoTolerance {
    /// Tolerance as a fraction of the source tempo
    pub fn fraction(&self) -> f64 {
        match self {
            Self::Strict => 0.05,
            Self::Relaxed => 0.15,
        }
    }
}

/// Playback rate that brings `source_bpm` to `target_bpm`
///
/// Returns 1.0 for a non-positive source tempo so a missing analysis
/// never produces an infinite or negative rate.
pub fn tempo_ratio(source_bpm: f64, target_bpm: f64) -> f64 {
    if source_bpm <= 0.0 || !source_bpm.is_finite() || !target_bpm.is_finite() {
        return 1.0;
    }
    target_bpm / source_bpm
}

/// Whether `target_bpm` is within `tolerance` of `source_bpm`
pub fn is_compatible(source_bpm: f64, target_bpm: f64, tolerance: TempoTolerance) -> bool {
    if source_bpm <= 0.0 || target_bpm <= 0.0 {
        return false;
    }
    (target_bpm - source_bpm).abs() <= source_bpm * tolerance.fraction()
}

/// Whether a playback rate changes tempo enough to be noticeable
pub fn needs_time_adjustment(ratio: f64) -> bool {
    (ratio - 1.0).abs() > TIME_ADJUSTMENT_THRESHOLD
}
