//! Swap controller - control-side bookkeeping of stem swaps
//!
//! The render engine drives the crossfade itself once it receives
//! `BeginSwap`; this controller tracks everything around it:
//!
//! ```text
//!   swap_stem ─► Preparing ──(asset ready)──► BeginSwap sent
//!                   │                              │
//!                   │            SwapPhase events: CrossfadeOut ─► Armed ─► CrossfadeIn
//!                   │                              │
//!                   └──────── newer swap ──────────┴──► SwapCompleted ─► Idle
//! ```
//!
//! Every swap gets a fresh, monotonically increasing ticket. A newer swap on
//! the same slot supersedes the older one: its ticket stops being current,
//! so a late decode result or phase event for it is ignored.

use serde::Serialize;

use crate::engine::SwapPhase;
use crate::types::{Deck, Stem, NUM_DECKS, NUM_STEMS};

/// Summary of an accepted swap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapInfo {
    pub ticket: u64,
    pub deck: Deck,
    pub stem: Stem,
    pub song_id: String,
    /// Playback rate of the incoming stem
    pub rate: f64,
    /// Camelot distance from the session key, when both keys are known
    pub key_distance: Option<u32>,
    /// Smallest transposition to the session key (informational)
    pub semitones: Option<i8>,
}

/// Result of `Session::swap_stem`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SwapOutcome {
    /// Asset was resident; the crossfade has been sent to the engine
    Dispatched(SwapInfo),
    /// Waiting for the background loader
    Preparing(SwapInfo),
    /// Accepted, replacing a swap that was still in flight on the slot
    SlotBusy { swap: SwapInfo, superseded: u64 },
}

impl SwapOutcome {
    pub fn info(&self) -> &SwapInfo {
        match self {
            Self::Dispatched(info) | Self::Preparing(info) => info,
            Self::SlotBusy { swap, .. } => swap,
        }
    }

    pub fn ticket(&self) -> u64 {
        self.info().ticket
    }
}

#[derive(Debug, Clone, Default)]
struct SlotSwap {
    ticket: u64,
    phase: SwapPhase,
    song_id: String,
}

/// Per-slot swap state machines
#[derive(Debug)]
pub struct SwapController {
    slots: [[SlotSwap; NUM_STEMS]; NUM_DECKS],
    next_ticket: u64,
}

impl Default for SwapController {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapController {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            next_ticket: 1,
        }
    }

    fn slot(&self, deck: Deck, stem: Stem) -> &SlotSwap {
        &self.slots[deck.index()][stem.index()]
    }

    fn slot_mut(&mut self, deck: Deck, stem: Stem) -> &mut SlotSwap {
        &mut self.slots[deck.index()][stem.index()]
    }

    /// Start a swap in Preparing
    ///
    /// Returns the new ticket and the ticket it supersedes, if one was in
    /// flight.
    pub fn begin(&mut self, deck: Deck, stem: Stem, song_id: &str) -> (u64, Option<u64>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let slot = self.slot_mut(deck, stem);
        let superseded = (slot.phase != SwapPhase::Idle).then_some(slot.ticket);
        *slot = SlotSwap {
            ticket,
            phase: SwapPhase::Preparing,
            song_id: song_id.to_string(),
        };
        (ticket, superseded)
    }

    /// True while `ticket` is the swap in flight on the slot
    pub fn is_current(&self, deck: Deck, stem: Stem, ticket: u64) -> bool {
        let slot = self.slot(deck, stem);
        slot.phase != SwapPhase::Idle && slot.ticket == ticket
    }

    /// Record a phase reported by the render engine
    pub fn on_phase(&mut self, deck: Deck, stem: Stem, ticket: u64, phase: SwapPhase) -> bool {
        if !self.is_current(deck, stem, ticket) {
            return false;
        }
        self.slot_mut(deck, stem).phase = phase;
        true
    }

    /// Finish a swap; returns the song now playing in the slot
    pub fn complete(&mut self, deck: Deck, stem: Stem, ticket: u64) -> Option<String> {
        if !self.is_current(deck, stem, ticket) {
            return None;
        }
        let slot = self.slot_mut(deck, stem);
        slot.phase = SwapPhase::Idle;
        Some(std::mem::take(&mut slot.song_id))
    }

    /// Drop the swap in flight, if `ticket` is still current
    pub fn abandon(&mut self, deck: Deck, stem: Stem, ticket: u64) -> bool {
        if !self.is_current(deck, stem, ticket) {
            return false;
        }
        *self.slot_mut(deck, stem) = SlotSwap::default();
        true
    }

    /// Cancel whatever is in flight on the slot; returns its ticket
    pub fn cancel(&mut self, deck: Deck, stem: Stem) -> Option<u64> {
        let slot = self.slot_mut(deck, stem);
        if slot.phase == SwapPhase::Idle {
            return None;
        }
        let ticket = slot.ticket;
        *slot = SlotSwap::default();
        Some(ticket)
    }

    pub fn cancel_all(&mut self) {
        for deck in Deck::ALL {
            for stem in Stem::ALL {
                self.cancel(deck, stem);
            }
        }
    }

    pub fn phase(&self, deck: Deck, stem: Stem) -> SwapPhase {
        self.slot(deck, stem).phase
    }

    /// Ticket of the swap in flight on the slot
    pub fn ticket(&self, deck: Deck, stem: Stem) -> Option<u64> {
        let slot = self.slot(deck, stem);
        (slot.phase != SwapPhase::Idle).then_some(slot.ticket)
    }

    /// Song being swapped in on the slot
    pub fn incoming_song(&self, deck: Deck, stem: Stem) -> Option<&str> {
        let slot = self.slot(deck, stem);
        (slot.phase != SwapPhase::Idle).then_some(slot.song_id.as_str())
    }

    /// Number of slots with a swap in flight
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.phase != SwapPhase::Idle)
            .count()
    }
}
