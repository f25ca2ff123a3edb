//! Status snapshot returned by `Session::status` and `/get_status`

use serde::Serialize;

use crate::engine::SwapPhase;
use crate::types::{Deck, Stem};

/// One (deck, stem) slot as seen from the control context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStatus {
    pub deck: Deck,
    pub stem: Stem,
    /// Song (or buffer name) bound to the slot
    pub source: Option<String>,
    /// Protocol buffer driving the slot, if any
    pub buffer: Option<i32>,
    pub active: bool,
    /// Cursor in source frames
    pub cursor: f64,
    pub gain: f32,
    pub rate: f64,
    pub swap_phase: SwapPhase,
    pub swap_ticket: Option<u64>,
}

/// Point-in-time view of the session and the render engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub sample_rate: u32,
    pub global_bpm: f64,
    pub master_volume: f32,
    pub crossfade: f32,
    pub deck_levels: [f32; 2],
    pub stem_volumes: [f32; 5],
    /// Session key as a Camelot code
    pub key: Option<String>,
    pub active_voices: u32,
    pub underruns: u64,
    /// Engine events dropped while the control side was behind
    pub lost_events: u64,
    pub blocks_rendered: u64,
    pub test_tone: bool,
    pub device_lost: bool,
    pub resident_assets: usize,
    pub resident_bytes: usize,
    pub decode_count: u64,
    pub buffers: usize,
    pub swaps_in_flight: usize,
    pub queue: Vec<String>,
    /// Slots that are bound, playing or swapping
    pub slots: Vec<SlotStatus>,
}

impl StatusSnapshot {
    pub fn slot(&self, deck: Deck, stem: Stem) -> Option<&SlotStatus> {
        self.slots.iter().find(|s| s.deck == deck && s.stem == stem)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}
