//! Lock-free status shared by the render thread and the control context
//!
//! The render engine writes these after every block; status queries read
//! them without touching the engine. Floats are stored as their bit
//! patterns. All accesses are `Relaxed`: every field is an independent
//! display value and no reader relies on ordering between fields.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::command::SwapPhase;
use crate::types::{Deck, Stem, NUM_DECKS, NUM_STEMS};

#[inline]
fn load_f32(a: &AtomicU32) -> f32 {
    f32::from_bits(a.load(Ordering::Relaxed))
}

#[inline]
fn store_f32(a: &AtomicU32, value: f32) {
    a.store(value.to_bits(), Ordering::Relaxed);
}

#[inline]
fn load_f64(a: &AtomicU64) -> f64 {
    f64::from_bits(a.load(Ordering::Relaxed))
}

#[inline]
fn store_f64(a: &AtomicU64, value: f64) {
    a.store(value.to_bits(), Ordering::Relaxed);
}

/// Mirror of one (deck, stem) slot
pub struct SlotAtomics {
    active: AtomicBool,
    /// Cursor in source frames (f64 bits)
    cursor: AtomicU64,
    /// Gain applied to the last rendered frame (f32 bits)
    gain: AtomicU32,
    /// Playback rate (f64 bits)
    rate: AtomicU64,
    swap_phase: AtomicU8,
    swap_ticket: AtomicU64,
}

impl SlotAtomics {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            cursor: AtomicU64::new(0),
            gain: AtomicU32::new(0),
            rate: AtomicU64::new(1.0f64.to_bits()),
            swap_phase: AtomicU8::new(SwapPhase::Idle as u8),
            swap_ticket: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cursor(&self) -> f64 {
        load_f64(&self.cursor)
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        load_f32(&self.gain)
    }

    #[inline]
    pub fn rate(&self) -> f64 {
        load_f64(&self.rate)
    }

    #[inline]
    pub fn swap_phase(&self) -> SwapPhase {
        SwapPhase::from_u8(self.swap_phase.load(Ordering::Relaxed))
    }

    /// Ticket of the swap in flight (meaningless while idle)
    #[inline]
    pub fn swap_ticket(&self) -> u64 {
        self.swap_ticket.load(Ordering::Relaxed)
    }

    pub(crate) fn publish_voice(&self, active: bool, cursor: f64, gain: f32, rate: f64) {
        self.active.store(active, Ordering::Relaxed);
        store_f64(&self.cursor, cursor);
        store_f32(&self.gain, gain);
        store_f64(&self.rate, rate);
    }

    pub(crate) fn publish_swap(&self, phase: SwapPhase, ticket: u64) {
        self.swap_phase.store(phase as u8, Ordering::Relaxed);
        self.swap_ticket.store(ticket, Ordering::Relaxed);
    }
}

/// Engine-wide status
pub struct EngineAtomics {
    /// Blocks the output could not fill in time
    underruns: AtomicU64,
    blocks_rendered: AtomicU64,
    /// Engine events dropped because the control side fell behind
    lost_events: AtomicU64,
    active_voices: AtomicU32,
    deck_levels: [AtomicU32; NUM_DECKS],
    master_volume: AtomicU32,
    global_bpm: AtomicU64,
    stem_volumes: [AtomicU32; NUM_STEMS],
    test_tone: AtomicBool,
    /// Set by the output stream error callback; fatal
    device_lost: AtomicBool,
    slots: [[SlotAtomics; NUM_STEMS]; NUM_DECKS],
}

impl EngineAtomics {
    pub fn new() -> Self {
        Self {
            underruns: AtomicU64::new(0),
            blocks_rendered: AtomicU64::new(0),
            lost_events: AtomicU64::new(0),
            active_voices: AtomicU32::new(0),
            deck_levels: std::array::from_fn(|_| AtomicU32::new(0)),
            master_volume: AtomicU32::new(0),
            global_bpm: AtomicU64::new(0),
            stem_volumes: std::array::from_fn(|_| AtomicU32::new(0)),
            test_tone: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            slots: std::array::from_fn(|_| std::array::from_fn(|_| SlotAtomics::new())),
        }
    }

    pub fn slot(&self, deck: Deck, stem: Stem) -> &SlotAtomics {
        &self.slots[deck.index()][stem.index()]
    }

    // ─────────────────────────────────────────────────────────────
    // Counters
    // ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn blocks_rendered(&self) -> u64 {
        self.blocks_rendered.load(Ordering::Relaxed)
    }

    pub(crate) fn record_block(&self) {
        self.blocks_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_active_voices(&self, active_voices: u32) {
        self.active_voices.store(active_voices, Ordering::Relaxed);
    }

    #[inline]
    pub fn lost_events(&self) -> u64 {
        self.lost_events.load(Ordering::Relaxed)
    }

    pub(crate) fn record_lost_event(&self) {
        self.lost_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn active_voices(&self) -> u32 {
        self.active_voices.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────
    // Mix values
    // ─────────────────────────────────────────────────────────────

    pub fn deck_level(&self, deck: Deck) -> f32 {
        load_f32(&self.deck_levels[deck.index()])
    }

    pub fn master_volume(&self) -> f32 {
        load_f32(&self.master_volume)
    }

    pub fn global_bpm(&self) -> f64 {
        load_f64(&self.global_bpm)
    }

    pub fn stem_volume(&self, stem: Stem) -> f32 {
        load_f32(&self.stem_volumes[stem.index()])
    }

    pub fn test_tone_active(&self) -> bool {
        self.test_tone.load(Ordering::Relaxed)
    }

    pub(crate) fn publish_mix(&self, deck_levels: [f32; NUM_DECKS], master: f32, bpm: f64, stems: &[f32; NUM_STEMS]) {
        for (atomic, level) in self.deck_levels.iter().zip(deck_levels) {
            store_f32(atomic, level);
        }
        store_f32(&self.master_volume, master);
        store_f64(&self.global_bpm, bpm);
        for (atomic, level) in self.stem_volumes.iter().zip(stems) {
            store_f32(atomic, *level);
        }
    }

    pub(crate) fn set_test_tone(&self, active: bool) {
        self.test_tone.store(active, Ordering::Relaxed);
    }

    // ─────────────────────────────────────────────────────────────
    // Device state
    // ─────────────────────────────────────────────────────────────

    pub fn device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Relaxed)
    }

    pub fn mark_device_lost(&self) {
        self.device_lost.store(true, Ordering::Relaxed);
    }
}

impl Default for EngineAtomics {
    fn default() -> Self {
        Self::new()
    }
}
