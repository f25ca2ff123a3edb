//! Render engine - sums stem voices into the master block
//!
//! ```text
//!   commands ─► slots[deck][stem] ─► deck buffers ─► × deck level
//!                                                    ─► × master ─► + test tone ─► soft limit ─► out
//! ```
//!
//! The engine runs on the render thread. Per block it drains the command
//! queue (bounded), renders every voice, mixes, limits and publishes its
//! state to [`EngineAtomics`]. It never allocates, locks or performs I/O
//! once constructed, and it never drops a voice: retired voices go back to
//! the control context as [`EngineEvent::VoiceRetired`].
//!
//! # Stem swap
//!
//! The crossfade of a swap is driven here, block by block:
//!
//! ```text
//!   BeginSwap ─► CrossfadeOut ─► Armed ─► CrossfadeIn ─► (idle)
//!                outgoing → 0    1 block   incoming 0 → target
//! ```
//!
//! While fading out, the incoming voice already co-renders at gain 0 so its
//! cursor keeps running. Every gain moves by at most one ramp step per
//! frame, so the slot envelope stays continuous even when a newer swap
//! lands mid-fade.

use std::sync::Arc;

use super::atomics::EngineAtomics;
use super::command::{
    command_channel, event_channel, CommandSender, EngineCommand, EngineEvent, RetireReason, SwapPhase,
};
use super::limiter;
use super::mix::{clamp_level, MixState, TestTone};
use super::voice::{StemVoice, VoiceStatus};
use crate::types::{Deck, Stem, StereoBuffer, StereoSample, NUM_DECKS, NUM_STEMS, SAMPLE_RATE};

/// Default render block size in frames
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Largest block the engine pre-allocates for
pub const MAX_BLOCK_SIZE: usize = 8192;

/// Commands applied per block at most; the rest wait for the next block
pub const MAX_COMMANDS_PER_BLOCK: usize = 64;

/// Default length of each crossfade phase of a swap
pub const DEFAULT_SWAP_FADE_SECONDS: f64 = 2.0;

/// Events held back while the event queue is full
const EVENT_BACKLOG: usize = 64;

/// Number of blocks that cover `seconds` (at least one)
pub fn fade_blocks_for(seconds: f64, sample_rate: u32, block_size: usize) -> usize {
    let frames = seconds.max(0.0) * sample_rate as f64;
    (frames / block_size.max(1) as f64).ceil().max(1.0) as usize
}

/// Construction parameters of a [`RenderEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Blocks per crossfade phase of a swap
    pub swap_fade_blocks: usize,
    /// Initial mix
    pub mix: MixState,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            swap_fade_blocks: fade_blocks_for(DEFAULT_SWAP_FADE_SECONDS, SAMPLE_RATE, DEFAULT_BLOCK_SIZE),
            mix: MixState::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event output
// ═══════════════════════════════════════════════════════════════════════════════

/// Render-side end of the event queue with a small pre-allocated backlog
struct EventSink {
    producer: rtrb::Producer<EngineEvent>,
    backlog: Vec<EngineEvent>,
    atomics: Arc<EngineAtomics>,
}

impl EventSink {
    fn new(producer: rtrb::Producer<EngineEvent>, atomics: Arc<EngineAtomics>) -> Self {
        Self {
            producer,
            backlog: Vec::with_capacity(EVENT_BACKLOG),
            atomics,
        }
    }

    fn emit(&mut self, event: EngineEvent) {
        self.flush();
        if !self.backlog.is_empty() {
            self.stash(event);
            return;
        }
        if let Err(rtrb::PushError::Full(event)) = self.producer.push(event) {
            self.stash(event);
        }
    }

    /// Keep order: nothing new is pushed while older events are waiting
    fn flush(&mut self) {
        while !self.backlog.is_empty() && self.producer.slots() > 0 {
            let event = self.backlog.remove(0);
            if let Err(rtrb::PushError::Full(event)) = self.producer.push(event) {
                self.backlog.insert(0, event);
                break;
            }
        }
    }

    fn stash(&mut self, event: EngineEvent) {
        // Past the backlog the event is lost. A retired voice inside it
        // still frees its asset through the collector, but the cache keeps
        // its count; the counter lets the control side notice.
        if self.backlog.len() < EVENT_BACKLOG {
            self.backlog.push(event);
        } else {
            self.atomics.record_lost_event();
        }
    }

    fn retire(&mut self, deck: Deck, stem: Stem, voice: Box<StemVoice>, reason: RetireReason) {
        self.emit(EngineEvent::VoiceRetired {
            deck,
            stem,
            voice,
            reason,
        });
    }

    fn phase(&mut self, deck: Deck, stem: Stem, ticket: u64, phase: SwapPhase) {
        self.emit(EngineEvent::SwapPhase {
            deck,
            stem,
            ticket,
            phase,
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Slots
// ═══════════════════════════════════════════════════════════════════════════════

struct SwapFade {
    ticket: u64,
    phase: SwapPhase,
    /// Co-rendering at gain 0 until promoted
    incoming: Option<Box<StemVoice>>,
    /// Gain the incoming voice ramps to once promoted
    target_gain: f32,
    /// Gain the outgoing voice had before the swap
    restore_gain: f32,
}

#[derive(Default)]
struct Slot {
    voice: Option<Box<StemVoice>>,
    swap: Option<SwapFade>,
}

impl Slot {
    /// Retire everything in the slot; an unfinished swap is abandoned
    fn clear(&mut self, events: &mut EventSink, deck: Deck, stem: Stem, reason: RetireReason) {
        if let Some(mut swap) = self.swap.take() {
            if let Some(incoming) = swap.incoming.take() {
                events.retire(deck, stem, incoming, RetireReason::Superseded);
            }
            events.emit(EngineEvent::SwapAbandoned {
                deck,
                stem,
                ticket: swap.ticket,
            });
        }
        if let Some(voice) = self.voice.take() {
            events.retire(deck, stem, voice, reason);
        }
    }

    fn voice_count(&self) -> u32 {
        let incoming = self.swap.as_ref().is_some_and(|s| s.incoming.is_some());
        self.voice.is_some() as u32 + incoming as u32
    }
}

fn retire_reason(status: VoiceStatus) -> RetireReason {
    match status {
        VoiceStatus::Fault => RetireReason::Fault,
        _ => RetireReason::Ended,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

pub struct RenderEngine {
    sample_rate: u32,
    block_size: usize,
    swap_fade_blocks: usize,
    mix: MixState,
    slots: [[Slot; NUM_STEMS]; NUM_DECKS],
    /// Per-deck sums of the last block, before deck levels
    deck_buffers: [StereoBuffer; NUM_DECKS],
    test_tone: TestTone,
    commands: rtrb::Consumer<EngineCommand>,
    events: EventSink,
    atomics: Arc<EngineAtomics>,
}

impl RenderEngine {
    pub fn new(
        config: EngineConfig,
        commands: rtrb::Consumer<EngineCommand>,
        events: rtrb::Producer<EngineEvent>,
        atomics: Arc<EngineAtomics>,
    ) -> Self {
        let block_size = config.block_size.clamp(1, MAX_BLOCK_SIZE);
        let engine = Self {
            sample_rate: config.sample_rate.max(1),
            block_size,
            swap_fade_blocks: config.swap_fade_blocks.max(1),
            mix: config.mix,
            slots: Default::default(),
            deck_buffers: std::array::from_fn(|_| StereoBuffer::silence(MAX_BLOCK_SIZE)),
            test_tone: TestTone::default(),
            commands,
            events: EventSink::new(events, atomics.clone()),
            atomics,
        };
        engine.publish();
        engine
    }

    /// Engine plus both ends of the queues the control context needs
    pub fn with_channels(
        config: EngineConfig,
        atomics: Arc<EngineAtomics>,
    ) -> (Self, CommandSender, rtrb::Consumer<EngineEvent>) {
        let (command_tx, command_rx) = command_channel();
        let (event_tx, event_rx) = event_channel();
        let engine = Self::new(config, command_rx, event_tx, atomics);
        (engine, CommandSender::new(command_tx), event_rx)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn swap_fade_blocks(&self) -> usize {
        self.swap_fade_blocks
    }

    /// Largest per-frame gain change during a swap crossfade
    pub fn ramp_step(&self) -> f32 {
        1.0 / (self.swap_fade_blocks * self.block_size) as f32
    }

    pub fn mix(&self) -> &MixState {
        &self.mix
    }

    pub fn atomics(&self) -> &Arc<EngineAtomics> {
        &self.atomics
    }

    pub fn voice(&self, deck: Deck, stem: Stem) -> Option<&StemVoice> {
        self.slots[deck.index()][stem.index()].voice.as_deref()
    }

    pub fn swap_phase(&self, deck: Deck, stem: Stem) -> SwapPhase {
        self.slots[deck.index()][stem.index()]
            .swap
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// Sum of one deck's voices in the last block, before its deck level
    pub fn deck_output(&self, deck: Deck) -> &StereoBuffer {
        &self.deck_buffers[deck.index()]
    }

    /// Render one block into `out`
    ///
    /// `out.len()` is the block length and must not exceed
    /// [`MAX_BLOCK_SIZE`].
    pub fn process(&mut self, out: &mut StereoBuffer) {
        let frames = out.len();
        debug_assert!(frames <= MAX_BLOCK_SIZE, "block of {} frames exceeds MAX_BLOCK_SIZE", frames);

        self.events.flush();
        self.drain_commands();

        for buffer in &mut self.deck_buffers {
            buffer.set_len_from_capacity(frames);
            buffer.fill_silence();
        }
        self.render_voices();

        let levels = self.mix.deck_levels;
        let master = self.mix.master_volume;
        for (i, sample) in out.as_mut_slice().iter_mut().enumerate() {
            let mut sum = StereoSample::silence();
            for (buffer, level) in self.deck_buffers.iter().zip(levels) {
                sum += buffer[i] * level;
            }
            *sample = sum * master;
        }
        self.test_tone.render_into(out.as_mut_slice());
        limiter::process(out);

        self.advance_swaps();
        self.publish();
        self.atomics.record_block();
    }

    // ─────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────

    fn drain_commands(&mut self) {
        for _ in 0..MAX_COMMANDS_PER_BLOCK {
            match self.commands.pop() {
                Ok(command) => self.apply(command),
                Err(_) => break,
            }
        }
    }

    fn apply(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::StartVoice { deck, stem, mut voice } => {
                let slot = &mut self.slots[deck.index()][stem.index()];
                slot.clear(&mut self.events, deck, stem, RetireReason::Replaced);
                voice.retime(self.mix.global_bpm);
                voice.fade_in(self.block_size);
                slot.voice = Some(voice);
            }
            EngineCommand::StopVoice { deck, stem } => {
                self.slots[deck.index()][stem.index()].clear(&mut self.events, deck, stem, RetireReason::Stopped);
            }
            EngineCommand::StopDeck { deck } => {
                for stem in Stem::ALL {
                    self.slots[deck.index()][stem.index()].clear(&mut self.events, deck, stem, RetireReason::Stopped);
                }
            }
            EngineCommand::StopAll => {
                for deck in Deck::ALL {
                    for stem in Stem::ALL {
                        self.slots[deck.index()][stem.index()].clear(
                            &mut self.events,
                            deck,
                            stem,
                            RetireReason::Stopped,
                        );
                    }
                }
                self.test_tone.stop();
            }
            EngineCommand::SetVoiceGain { deck, stem, gain } => {
                let gain = clamp_level(gain);
                let step = self.ramp_step();
                let slot = &mut self.slots[deck.index()][stem.index()];
                match slot.swap.as_mut() {
                    Some(swap) => {
                        swap.target_gain = gain;
                        if swap.phase == SwapPhase::CrossfadeIn {
                            if let Some(voice) = slot.voice.as_mut() {
                                voice.ramp_to(gain, step);
                            }
                        }
                    }
                    None => {
                        if let Some(voice) = slot.voice.as_mut() {
                            voice.set_gain(gain, self.block_size);
                        }
                    }
                }
            }
            EngineCommand::SetVoiceRate { deck, stem, rate } => {
                if let Some(voice) = self.slots[deck.index()][stem.index()].voice.as_mut() {
                    voice.set_rate(rate);
                }
            }
            EngineCommand::SeekVoice { deck, stem, frame } => {
                if let Some(voice) = self.slots[deck.index()][stem.index()].voice.as_mut() {
                    voice.seek(frame);
                }
            }
            EngineCommand::SetVoiceLoop { deck, stem, looping } => {
                if let Some(voice) = self.slots[deck.index()][stem.index()].voice.as_mut() {
                    voice.set_loop(looping);
                }
            }
            EngineCommand::BeginSwap {
                deck,
                stem,
                ticket,
                voice,
            } => self.begin_swap(deck, stem, ticket, voice),
            EngineCommand::SetDeckLevels { a, b } => self.mix.set_deck_levels(a, b),
            EngineCommand::SetMasterVolume(level) => self.mix.set_master_volume(level),
            EngineCommand::SetStemTypeVolume { stem, level } => self.mix.set_stem_volume(stem, level),
            EngineCommand::SetGlobalBpm(bpm) => {
                if bpm.is_finite() && bpm > 0.0 {
                    self.mix.global_bpm = bpm;
                    for slot in self.slots.iter_mut().flatten() {
                        if let Some(voice) = slot.voice.as_mut() {
                            voice.retime(bpm);
                        }
                        if let Some(incoming) = slot.swap.as_mut().and_then(|s| s.incoming.as_mut()) {
                            incoming.retime(bpm);
                        }
                    }
                }
            }
            EngineCommand::SetInterpolation(method) => self.mix.interpolation = method,
            EngineCommand::StartTestTone { frequency, frames } => {
                self.test_tone.start(frequency, frames, self.sample_rate);
            }
        }
    }

    fn begin_swap(&mut self, deck: Deck, stem: Stem, ticket: u64, mut voice: Box<StemVoice>) {
        let step = self.ramp_step();
        let slot = &mut self.slots[deck.index()][stem.index()];
        let events = &mut self.events;

        voice.retime(self.mix.global_bpm);
        voice.set_pending_swap(Some(ticket));
        let target_gain = voice.hold_silent();

        // Supersede: the older incoming voice goes, and a voice that was
        // fading in is now the one fading out
        if let Some(mut previous) = slot.swap.take() {
            if let Some(incoming) = previous.incoming.take() {
                events.retire(deck, stem, incoming, RetireReason::Superseded);
            }
        }

        match slot.voice.as_mut() {
            Some(outgoing) => {
                let restore_gain = outgoing.gain();
                outgoing.ramp_to(0.0, step);
                slot.swap = Some(SwapFade {
                    ticket,
                    phase: SwapPhase::CrossfadeOut,
                    incoming: Some(voice),
                    target_gain,
                    restore_gain,
                });
                events.phase(deck, stem, ticket, SwapPhase::CrossfadeOut);
            }
            None => {
                // Nothing to fade out
                voice.ramp_to(target_gain, step);
                slot.voice = Some(voice);
                slot.swap = Some(SwapFade {
                    ticket,
                    phase: SwapPhase::CrossfadeIn,
                    incoming: None,
                    target_gain,
                    restore_gain: 0.0,
                });
                events.phase(deck, stem, ticket, SwapPhase::CrossfadeIn);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Rendering
    // ─────────────────────────────────────────────────────────────

    fn render_voices(&mut self) {
        let method = self.mix.interpolation;
        let step = self.ramp_step();

        for deck in Deck::ALL {
            let buffer = &mut self.deck_buffers[deck.index()];
            for stem in Stem::ALL {
                let volume = self.mix.stem_volume(stem);
                let slot = &mut self.slots[deck.index()][stem.index()];

                if let Some(voice) = slot.voice.as_mut() {
                    let status = voice.render_into(buffer.as_mut_slice(), volume, method);
                    if status != VoiceStatus::Playing {
                        if let Some(voice) = slot.voice.take() {
                            self.events.retire(deck, stem, voice, retire_reason(status));
                        }
                        // A promoted voice that stops ends its swap
                        if slot.swap.as_ref().is_some_and(|s| s.phase == SwapPhase::CrossfadeIn) {
                            slot.clear(&mut self.events, deck, stem, RetireReason::Ended);
                        }
                    }
                }

                let incoming_status = slot
                    .swap
                    .as_mut()
                    .and_then(|s| s.incoming.as_mut())
                    .map(|incoming| incoming.render_into(buffer.as_mut_slice(), volume, method));
                if let Some(status) = incoming_status {
                    if status != VoiceStatus::Playing {
                        if let Some(mut swap) = slot.swap.take() {
                            if let Some(incoming) = swap.incoming.take() {
                                self.events.retire(deck, stem, incoming, retire_reason(status));
                            }
                            self.events.emit(EngineEvent::SwapAbandoned {
                                deck,
                                stem,
                                ticket: swap.ticket,
                            });
                            // Bring the outgoing voice back
                            if let Some(voice) = slot.voice.as_mut() {
                                voice.ramp_to(swap.restore_gain, step);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Move every in-flight swap forward after a block
    fn advance_swaps(&mut self) {
        let step = self.ramp_step();

        for deck in Deck::ALL {
            for stem in Stem::ALL {
                let slot = &mut self.slots[deck.index()][stem.index()];
                let Some(swap) = slot.swap.as_mut() else {
                    continue;
                };
                let ticket = swap.ticket;
                let mut finished = false;

                match swap.phase {
                    SwapPhase::CrossfadeOut => {
                        let silent = slot.voice.as_ref().map_or(true, |v| !v.is_ramping() && v.current_gain() == 0.0);
                        if silent {
                            swap.phase = SwapPhase::Armed;
                            self.events.phase(deck, stem, ticket, SwapPhase::Armed);
                        }
                    }
                    SwapPhase::Armed => {
                        if let Some(outgoing) = slot.voice.take() {
                            self.events.retire(deck, stem, outgoing, RetireReason::Swapped);
                        }
                        match swap.incoming.take() {
                            Some(mut incoming) => {
                                incoming.ramp_to(swap.target_gain, step);
                                slot.voice = Some(incoming);
                                swap.phase = SwapPhase::CrossfadeIn;
                                self.events.phase(deck, stem, ticket, SwapPhase::CrossfadeIn);
                            }
                            None => {
                                finished = true;
                                self.events.emit(EngineEvent::SwapAbandoned { deck, stem, ticket });
                            }
                        }
                    }
                    SwapPhase::CrossfadeIn => {
                        if slot.voice.as_ref().map_or(true, |v| !v.is_ramping()) {
                            if let Some(voice) = slot.voice.as_mut() {
                                voice.set_pending_swap(None);
                            }
                            finished = true;
                            self.events.emit(EngineEvent::SwapCompleted { deck, stem, ticket });
                        }
                    }
                    SwapPhase::Idle | SwapPhase::Preparing => finished = true,
                }

                if finished {
                    slot.swap = None;
                }
            }
        }
    }

    fn publish(&self) {
        let mut active = 0;
        for deck in Deck::ALL {
            for stem in Stem::ALL {
                let slot = &self.slots[deck.index()][stem.index()];
                let mirror = self.atomics.slot(deck, stem);
                match slot.voice.as_deref() {
                    Some(voice) => mirror.publish_voice(true, voice.cursor(), voice.current_gain(), voice.rate()),
                    None => mirror.publish_voice(false, 0.0, 0.0, 1.0),
                }
                match slot.swap.as_ref() {
                    Some(swap) => mirror.publish_swap(swap.phase, swap.ticket),
                    None => mirror.publish_swap(SwapPhase::Idle, 0),
                }
                active += slot.voice_count();
            }
        }

        self.atomics.publish_mix(
            self.mix.deck_levels,
            self.mix.master_volume,
            self.mix.global_bpm,
            &self.mix.stem_volumes,
        );
        self.atomics.set_test_tone(self.test_tone.is_active());
        self.atomics.set_active_voices(active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetCache;
    use crate::engine::limiter::soft_limit;
    use crate::engine::voice::tests::constant_voice;

    const BLOCK: usize = 64;

    fn unity_mix() -> MixState {
        MixState {
            deck_levels: [1.0, 0.0],
            master_volume: 1.0,
            stem_volumes: [1.0; NUM_STEMS],
            ..MixState::default()
        }
    }

    fn engine(swap_fade_blocks: usize) -> (RenderEngine, CommandSender, rtrb::Consumer<EngineEvent>) {
        let config = EngineConfig {
            block_size: BLOCK,
            swap_fade_blocks,
            mix: unity_mix(),
            ..EngineConfig::default()
        };
        RenderEngine::with_channels(config, Arc::new(EngineAtomics::new()))
    }

    fn run(engine: &mut RenderEngine, blocks: usize) -> Vec<StereoSample> {
        let mut out = StereoBuffer::silence(BLOCK);
        let mut rendered = Vec::with_capacity(blocks * BLOCK);
        for _ in 0..blocks {
            engine.process(&mut out);
            rendered.extend_from_slice(out.as_slice());
        }
        rendered
    }

    fn drain(events: &mut rtrb::Consumer<EngineEvent>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(event) = events.pop() {
            seen.push(format!("{:?}", event));
        }
        seen
    }

    fn max_jump(samples: &[StereoSample]) -> f32 {
        samples
            .windows(2)
            .map(|w| (w[1].left - w[0].left).abs())
            .fold(0.0, f32::max)
    }

    fn start(tx: &mut CommandSender, deck: Deck, stem: Stem, voice: StemVoice) {
        tx.send(EngineCommand::StartVoice {
            deck,
            stem,
            voice: Box::new(voice),
        })
        .unwrap();
    }

    fn swap(tx: &mut CommandSender, ticket: u64, voice: StemVoice) {
        tx.send(EngineCommand::BeginSwap {
            deck: Deck::A,
            stem: Stem::Bass,
            ticket,
            voice: Box::new(voice),
        })
        .unwrap();
    }

    #[test]
    fn test_fade_blocks_for() {
        assert_eq!(fade_blocks_for(2.0, 44100, 256), 345);
        assert_eq!(fade_blocks_for(0.0, 44100, 256), 1);
    }

    #[test]
    fn test_empty_engine_outputs_silence() {
        let (mut engine, _tx, _events) = engine(4);
        let out = run(&mut engine, 2);
        assert!(out.iter().all(|s| *s == StereoSample::silence()));
        assert_eq!(engine.atomics().blocks_rendered(), 2);
    }

    #[test]
    fn test_new_engine_has_rendered_nothing() {
        let (engine, _tx, _events) = engine(4);
        assert_eq!(engine.atomics().blocks_rendered(), 0);
        // Mix state is visible before the first block
        assert_eq!(engine.atomics().master_volume(), 1.0);
    }

    #[test]
    fn test_event_overflow_is_counted() {
        let atomics = Arc::new(EngineAtomics::new());
        let (tx, commands) = command_channel();
        let (events_tx, mut events) = rtrb::RingBuffer::new(1);
        let config = EngineConfig {
            block_size: BLOCK,
            mix: unity_mix(),
            ..EngineConfig::default()
        };
        let mut engine = RenderEngine::new(config, commands, events_tx, atomics.clone());
        let mut tx = CommandSender::new(tx);
        let mut cache = AssetCache::new();

        // Every start after the first replaces, and so retires, a voice
        for _ in 0..MAX_COMMANDS_PER_BLOCK {
            let voice = constant_voice(&mut cache, "a", 0.5, 16, 44100).with_loop(true);
            start(&mut tx, Deck::A, Stem::Bass, voice);
        }
        run(&mut engine, 1);
        assert_eq!(atomics.lost_events(), 0);

        for _ in 0..MAX_COMMANDS_PER_BLOCK {
            let voice = constant_voice(&mut cache, "a", 0.5, 16, 44100).with_loop(true);
            start(&mut tx, Deck::A, Stem::Bass, voice);
        }
        run(&mut engine, 1);
        // One event in the queue, the backlog full, the rest lost
        let lost = 2 * MAX_COMMANDS_PER_BLOCK as u64 - 1 - 1 - EVENT_BACKLOG as u64;
        assert_eq!(atomics.lost_events(), lost);
        assert_eq!(drain(&mut events).len(), 1);
    }

    #[test]
    fn test_voice_renders_through_master_chain() {
        let (mut engine, mut tx, _events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "a", 0.5, 44100, 44100));

        let out = run(&mut engine, 2);
        // First block fades in, second is steady
        assert_eq!(out[0].left, 0.0);
        assert!((out[BLOCK + 10].left - soft_limit(0.5)).abs() < 1e-6);
        assert!(engine.atomics().slot(Deck::A, Stem::Bass).is_active());
        assert_eq!(engine.atomics().active_voices(), 1);
    }

    #[test]
    fn test_levels_scale_output() {
        let (mut engine, mut tx, _events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Drums, constant_voice(&mut cache, "a", 0.5, 44100, 44100));
        tx.send(EngineCommand::SetStemTypeVolume {
            stem: Stem::Drums,
            level: 0.5,
        })
        .unwrap();
        tx.send(EngineCommand::SetMasterVolume(0.5)).unwrap();

        let out = run(&mut engine, 2);
        assert!((out[BLOCK + 1].left - soft_limit(0.125)).abs() < 1e-6);
        assert_eq!(engine.atomics().master_volume(), 0.5);
    }

    #[test]
    fn test_swap_runs_all_phases_without_jumps() {
        let (mut engine, mut tx, mut events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "old", 0.5, 44100, 44100));
        run(&mut engine, 2);
        drain(&mut events);

        let incoming = constant_voice(&mut cache, "new", 0.5, 44100, 44100);
        let incoming_handle = incoming.handle();
        swap(&mut tx, 1, incoming);

        let out = run(&mut engine, 16);
        let step = engine.ramp_step();
        assert!(max_jump(&out) <= step + 1e-6, "jump {} > step {}", max_jump(&out), step);

        let seen = drain(&mut events);
        assert_eq!(
            seen,
            vec![
                "SwapPhase(A/bass, #1, crossfade_out)",
                "SwapPhase(A/bass, #1, armed)",
                "VoiceRetired(A/bass, Swapped)",
                "SwapPhase(A/bass, #1, crossfade_in)",
                "SwapCompleted(A/bass, #1)",
            ]
        );

        let voice = engine.voice(Deck::A, Stem::Bass).unwrap();
        assert_eq!(voice.handle(), incoming_handle);
        assert_eq!(voice.pending_swap(), None);
        assert_eq!(engine.swap_phase(Deck::A, Stem::Bass), SwapPhase::Idle);
        assert!((out.last().unwrap().left - soft_limit(0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_incoming_cursor_runs_during_fade_out() {
        let (mut engine, mut tx, _events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "old", 0.5, 44100, 44100));
        run(&mut engine, 1);

        swap(&mut tx, 1, constant_voice(&mut cache, "new", 0.5, 44100, 44100));
        // 4 blocks fading out, 1 armed, then promoted
        run(&mut engine, 5);

        let voice = engine.voice(Deck::A, Stem::Bass).unwrap();
        assert_eq!(engine.swap_phase(Deck::A, Stem::Bass), SwapPhase::CrossfadeIn);
        assert_eq!(voice.cursor(), (5 * BLOCK) as f64);
    }

    #[test]
    fn test_newer_swap_supersedes_mid_fade_out() {
        let (mut engine, mut tx, mut events) = engine(8);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "base", 0.5, 44100, 44100));
        run(&mut engine, 2);
        drain(&mut events);

        swap(&mut tx, 7, constant_voice(&mut cache, "song7", 0.5, 44100, 44100));
        let mut out = run(&mut engine, 3);

        let latest = constant_voice(&mut cache, "song9", 0.5, 44100, 44100);
        let latest_handle = latest.handle();
        swap(&mut tx, 9, latest);
        out.extend(run(&mut engine, 30));

        assert!(max_jump(&out) <= engine.ramp_step() + 1e-6);

        let seen = drain(&mut events);
        assert!(seen.contains(&"VoiceRetired(A/bass, Superseded)".to_string()));
        assert!(seen.contains(&"SwapCompleted(A/bass, #9)".to_string()));
        assert!(!seen.iter().any(|e| e.starts_with("SwapCompleted(A/bass, #7)")));

        assert_eq!(engine.voice(Deck::A, Stem::Bass).unwrap().handle(), latest_handle);
        assert_eq!(engine.atomics().active_voices(), 1);
    }

    #[test]
    fn test_newer_swap_supersedes_mid_fade_in() {
        let (mut engine, mut tx, mut events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "base", 0.5, 44100, 44100));
        run(&mut engine, 2);

        swap(&mut tx, 1, constant_voice(&mut cache, "first", 0.5, 44100, 44100));
        let mut out = run(&mut engine, 7);
        assert_eq!(engine.swap_phase(Deck::A, Stem::Bass), SwapPhase::CrossfadeIn);
        drain(&mut events);

        let latest = constant_voice(&mut cache, "second", 0.5, 44100, 44100);
        let latest_handle = latest.handle();
        swap(&mut tx, 2, latest);
        out.extend(run(&mut engine, 20));

        assert!(max_jump(&out) <= engine.ramp_step() + 1e-6);
        let seen = drain(&mut events);
        assert_eq!(seen[0], "SwapPhase(A/bass, #2, crossfade_out)");
        assert!(seen.contains(&"VoiceRetired(A/bass, Swapped)".to_string()));
        assert!(seen.contains(&"SwapCompleted(A/bass, #2)".to_string()));
        assert_eq!(engine.voice(Deck::A, Stem::Bass).unwrap().handle(), latest_handle);
    }

    #[test]
    fn test_swap_into_empty_slot_fades_in() {
        let (mut engine, mut tx, mut events) = engine(2);
        let mut cache = AssetCache::new();
        swap(&mut tx, 3, constant_voice(&mut cache, "new", 0.5, 44100, 44100));

        let out = run(&mut engine, 4);
        assert!(max_jump(&out) <= engine.ramp_step() + 1e-6);
        assert_eq!(
            drain(&mut events),
            vec!["SwapPhase(A/bass, #3, crossfade_in)", "SwapCompleted(A/bass, #3)"]
        );
    }

    #[test]
    fn test_start_voice_abandons_swap() {
        let (mut engine, mut tx, mut events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "a", 0.5, 44100, 44100));
        swap(&mut tx, 4, constant_voice(&mut cache, "b", 0.5, 44100, 44100));
        run(&mut engine, 1);
        drain(&mut events);

        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "c", 0.5, 44100, 44100));
        run(&mut engine, 1);
        assert_eq!(
            drain(&mut events),
            vec![
                "VoiceRetired(A/bass, Superseded)",
                "SwapAbandoned(A/bass, #4)",
                "VoiceRetired(A/bass, Replaced)",
            ]
        );
        assert_eq!(engine.swap_phase(Deck::A, Stem::Bass), SwapPhase::Idle);
    }

    #[test]
    fn test_end_to_end_tempo_and_crossfade() {
        let (mut engine, mut tx, _events) = engine(4);
        let mut cache = AssetCache::new();
        tx.send(EngineCommand::SetGlobalBpm(140.0)).unwrap();
        start(
            &mut tx,
            Deck::A,
            Stem::Bass,
            constant_voice(&mut cache, "songA:bass", 0.3, 44100, 44100).with_tempo(140.0, 125.0),
        );
        start(
            &mut tx,
            Deck::A,
            Stem::Drums,
            constant_voice(&mut cache, "songB:drums", 0.3, 44100, 44100).with_tempo(143.0, 125.0),
        );
        tx.send(EngineCommand::SetDeckLevels { a: 0.5, b: 0.5 }).unwrap();

        let out = run(&mut engine, 3);
        let atomics = engine.atomics();
        assert!((atomics.slot(Deck::A, Stem::Drums).rate() - 140.0 / 143.0).abs() < 1e-9);
        assert_eq!(atomics.slot(Deck::A, Stem::Bass).rate(), 1.0);
        assert_eq!(engine.deck_output(Deck::B).rms(), 0.0);
        assert!(engine.deck_output(Deck::A).rms() > 0.0);
        assert!(out.iter().any(|s| s.left != 0.0));
    }

    #[test]
    fn test_global_bpm_retimes_voices() {
        let (mut engine, mut tx, _events) = engine(4);
        let mut cache = AssetCache::new();
        start(
            &mut tx,
            Deck::B,
            Stem::Vocals,
            constant_voice(&mut cache, "v", 0.3, 44100, 44100).with_tempo(140.0, 140.0),
        );
        tx.send(EngineCommand::SetGlobalBpm(143.0)).unwrap();
        run(&mut engine, 1);

        assert!((engine.atomics().slot(Deck::B, Stem::Vocals).rate() - 143.0 / 140.0).abs() < 1e-9);
        assert_eq!(engine.atomics().global_bpm(), 143.0);
    }

    #[test]
    fn test_finished_voice_is_retired() {
        let (mut engine, mut tx, mut events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Piano, constant_voice(&mut cache, "short", 0.5, 100, 44100));

        run(&mut engine, 2);
        assert_eq!(drain(&mut events), vec!["VoiceRetired(A/piano, Ended)"]);
        assert!(engine.voice(Deck::A, Stem::Piano).is_none());
        assert!(!engine.atomics().slot(Deck::A, Stem::Piano).is_active());
    }

    #[test]
    fn test_faulty_voice_stops_alone() {
        let (mut engine, mut tx, mut events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "ok", 0.5, 44100, 44100));
        start(
            &mut tx,
            Deck::A,
            Stem::Other,
            constant_voice(&mut cache, "broken", 0.5, 1000, 44100).with_window(500, 500),
        );

        let out = run(&mut engine, 2);
        assert_eq!(drain(&mut events), vec!["VoiceRetired(A/other, Fault)"]);
        assert!(engine.voice(Deck::A, Stem::Bass).is_some());
        assert!((out[BLOCK + 5].left - soft_limit(0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_stop_all_retires_everything() {
        let (mut engine, mut tx, mut events) = engine(4);
        let mut cache = AssetCache::new();
        start(&mut tx, Deck::A, Stem::Bass, constant_voice(&mut cache, "a", 0.5, 44100, 44100));
        start(&mut tx, Deck::B, Stem::Drums, constant_voice(&mut cache, "b", 0.5, 44100, 44100));
        tx.send(EngineCommand::StartTestTone {
            frequency: 440.0,
            frames: 44100,
        })
        .unwrap();
        run(&mut engine, 1);
        assert!(engine.atomics().test_tone_active());

        tx.send(EngineCommand::StopAll).unwrap();
        let out = run(&mut engine, 1);

        assert_eq!(drain(&mut events).len(), 2);
        assert_eq!(engine.atomics().active_voices(), 0);
        assert!(!engine.atomics().test_tone_active());
        assert!(out.iter().all(|s| s.left == 0.0));
    }

    #[test]
    fn test_tone_without_voices() {
        let (mut engine, mut tx, _events) = engine(4);
        tx.send(EngineCommand::StartTestTone {
            frequency: 440.0,
            frames: 44100,
        })
        .unwrap();
        let out = run(&mut engine, 1);
        assert!(out.iter().any(|s| s.left.abs() > 0.05));
    }

    #[test]
    fn test_command_drain_is_bounded_per_block() {
        let (mut engine, mut tx, _events) = engine(4);
        for i in 0..100 {
            tx.send(EngineCommand::SetMasterVolume(i as f32 / 100.0)).unwrap();
        }

        run(&mut engine, 1);
        assert_eq!(engine.mix().master_volume, 0.63);
        run(&mut engine, 1);
        assert_eq!(engine.mix().master_volume, 0.99);
    }
}
