//! Lock-free command and event queues between the control context and the
//! render thread
//!
//! The control context pushes [`EngineCommand`]s; the render engine drains
//! them at block boundaries, so no parameter ever changes mid-block. Going
//! the other way, the render engine pushes [`EngineEvent`]s: swap phase
//! transitions and retired voices.
//!
//! Both directions are `rtrb` single-producer single-consumer ring buffers,
//! allocated once at startup. Push and pop are wait-free, so neither side
//! can block the other.
//!
//! # Voice ownership
//!
//! A voice travels control → render inside `StartVoice`/`BeginSwap` and
//! comes back render → control inside `VoiceRetired`. The render thread
//! never drops a voice, so it never releases a cache reference and never
//! frees memory.

use std::fmt;

use serde::Serialize;

use super::interp::InterpolationMethod;
use super::voice::StemVoice;
use crate::types::{Deck, Stem};

/// Commands sent from the control context to the render thread
pub enum EngineCommand {
    // ─────────────────────────────────────────────────────────────
    // Voice lifecycle
    // ─────────────────────────────────────────────────────────────
    /// Bind a voice to a slot, replacing whatever was there
    ///
    /// The voice is boxed so the enum stays pointer-sized.
    StartVoice {
        deck: Deck,
        stem: Stem,
        voice: Box<StemVoice>,
    },
    /// Stop and retire the voice in a slot (and any swap in flight)
    StopVoice { deck: Deck, stem: Stem },
    /// Stop every slot on a deck
    StopDeck { deck: Deck },
    /// Stop everything, including the test tone
    StopAll,

    // ─────────────────────────────────────────────────────────────
    // Per-voice parameters
    // ─────────────────────────────────────────────────────────────
    /// Ramp a slot's voice gain over one block
    SetVoiceGain { deck: Deck, stem: Stem, gain: f32 },
    /// Set a slot's playback rate directly
    SetVoiceRate { deck: Deck, stem: Stem, rate: f64 },
    SeekVoice { deck: Deck, stem: Stem, frame: usize },
    SetVoiceLoop { deck: Deck, stem: Stem, looping: bool },

    // ─────────────────────────────────────────────────────────────
    // Stem swap
    // ─────────────────────────────────────────────────────────────
    /// Crossfade the slot's current voice out and `voice` in
    ///
    /// A swap already in flight on the same slot is superseded: its
    /// incoming voice is retired and this one takes its place.
    BeginSwap {
        deck: Deck,
        stem: Stem,
        ticket: u64,
        voice: Box<StemVoice>,
    },

    // ─────────────────────────────────────────────────────────────
    // Mix
    // ─────────────────────────────────────────────────────────────
    SetDeckLevels { a: f32, b: f32 },
    SetMasterVolume(f32),
    /// Level applied to every voice of one stem type on both decks
    SetStemTypeVolume { stem: Stem, level: f32 },
    /// Re-rate every voice that knows its recorded tempo
    SetGlobalBpm(f64),
    SetInterpolation(InterpolationMethod),

    // ─────────────────────────────────────────────────────────────
    // Diagnostics
    // ─────────────────────────────────────────────────────────────
    /// Play a sine for `frames` output frames on top of the mix
    StartTestTone { frequency: f32, frames: usize },
}

impl fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartVoice { deck, stem, .. } => write!(f, "StartVoice({}/{})", deck, stem),
            Self::StopVoice { deck, stem } => write!(f, "StopVoice({}/{})", deck, stem),
            Self::StopDeck { deck } => write!(f, "StopDeck({})", deck),
            Self::StopAll => f.write_str("StopAll"),
            Self::SetVoiceGain { deck, stem, gain } => write!(f, "SetVoiceGain({}/{}, {})", deck, stem, gain),
            Self::SetVoiceRate { deck, stem, rate } => write!(f, "SetVoiceRate({}/{}, {})", deck, stem, rate),
            Self::SeekVoice { deck, stem, frame } => write!(f, "SeekVoice({}/{}, {})", deck, stem, frame),
            Self::SetVoiceLoop { deck, stem, looping } => write!(f, "SetVoiceLoop({}/{}, {})", deck, stem, looping),
            Self::BeginSwap { deck, stem, ticket, .. } => write!(f, "BeginSwap({}/{}, #{})", deck, stem, ticket),
            Self::SetDeckLevels { a, b } => write!(f, "SetDeckLevels({}, {})", a, b),
            Self::SetMasterVolume(v) => write!(f, "SetMasterVolume({})", v),
            Self::SetStemTypeVolume { stem, level } => write!(f, "SetStemTypeVolume({}, {})", stem, level),
            Self::SetGlobalBpm(bpm) => write!(f, "SetGlobalBpm({})", bpm),
            Self::SetInterpolation(m) => write!(f, "SetInterpolation({:?})", m),
            Self::StartTestTone { frequency, frames } => write!(f, "StartTestTone({} Hz, {})", frequency, frames),
        }
    }
}

/// Phase of a stem swap on one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SwapPhase {
    #[default]
    Idle = 0,
    /// Waiting for the incoming asset to be decoded (control side only)
    Preparing = 1,
    /// Outgoing voice ramping to silence
    CrossfadeOut = 2,
    /// Outgoing voice silent; incoming voice is promoted on the next block
    Armed = 3,
    /// Incoming voice ramping up to its target gain
    CrossfadeIn = 4,
}

impl SwapPhase {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Preparing,
            2 => Self::CrossfadeOut,
            3 => Self::Armed,
            4 => Self::CrossfadeIn,
            _ => Self::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::CrossfadeOut => "crossfade_out",
            Self::Armed => "armed",
            Self::CrossfadeIn => "crossfade_in",
        }
    }
}

impl fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a voice left the render engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Explicit stop
    Stopped,
    /// A `StartVoice` took the slot
    Replaced,
    /// Reached the end of its window
    Ended,
    /// Unusable asset or window
    Fault,
    /// Incoming voice of a swap that a newer swap replaced
    Superseded,
    /// Outgoing voice of a completed crossfade
    Swapped,
}

/// Notifications from the render thread to the control context
pub enum EngineEvent {
    /// A voice was removed from a slot; the control side releases its asset
    VoiceRetired {
        deck: Deck,
        stem: Stem,
        voice: Box<StemVoice>,
        reason: RetireReason,
    },
    /// A swap entered a new phase
    SwapPhase {
        deck: Deck,
        stem: Stem,
        ticket: u64,
        phase: SwapPhase,
    },
    /// The incoming voice reached its target gain
    SwapCompleted { deck: Deck, stem: Stem, ticket: u64 },
    /// The swap was cancelled by a stop or a replacing start
    SwapAbandoned { deck: Deck, stem: Stem, ticket: u64 },
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VoiceRetired { deck, stem, reason, .. } => write!(f, "VoiceRetired({}/{}, {:?})", deck, stem, reason),
            Self::SwapPhase { deck, stem, ticket, phase } => {
                write!(f, "SwapPhase({}/{}, #{}, {})", deck, stem, ticket, phase)
            }
            Self::SwapCompleted { deck, stem, ticket } => write!(f, "SwapCompleted({}/{}, #{})", deck, stem, ticket),
            Self::SwapAbandoned { deck, stem, ticket } => write!(f, "SwapAbandoned({}/{}, #{})", deck, stem, ticket),
        }
    }
}

/// Capacity of the command queue
///
/// A plan replay sends a handful of commands per stem in one burst; 1024
/// leaves plenty of headroom.
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the event queue
///
/// Every retired voice produces one event, so this must cover a full
/// `StopAll` plus the swap traffic of one control poll interval.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Create the command channel (producer for control, consumer for render)
pub fn command_channel() -> (rtrb::Producer<EngineCommand>, rtrb::Consumer<EngineCommand>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}

/// Create the event channel (producer for render, consumer for control)
pub fn event_channel() -> (rtrb::Producer<EngineEvent>, rtrb::Consumer<EngineEvent>) {
    rtrb::RingBuffer::new(EVENT_QUEUE_CAPACITY)
}

/// Control-side sending half of the command channel
pub struct CommandSender {
    producer: rtrb::Producer<EngineCommand>,
}

impl CommandSender {
    pub fn new(producer: rtrb::Producer<EngineCommand>) -> Self {
        Self { producer }
    }

    /// Push one command without blocking
    ///
    /// A full queue hands the command back so the caller can decide what to
    /// do with any voice it carries.
    pub fn send(&mut self, command: EngineCommand) -> Result<(), EngineCommand> {
        self.producer.push(command).map_err(|e| match e {
            rtrb::PushError::Full(value) => value,
        })
    }

    /// Free slots left in the queue
    pub fn free_slots(&self) -> usize {
        self.producer.slots()
    }

    /// True once the render engine has been dropped
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }
}
