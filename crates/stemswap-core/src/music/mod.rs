//! Compatibility model: harmonic distance and tempo matching
//!
//! Pure functions only. The session consults these before any asset is
//! acquired, and the render engine uses [`tempo_ratio`] to re-rate voices
//! when the global BPM changes.

mod key;
mod tempo;

pub use key::{Key, KeyRelation};
pub use tempo::{
    is_compatible, needs_time_adjustment, tempo_ratio, TempoTolerance, TIME_ADJUSTMENT_THRESHOLD,
};
