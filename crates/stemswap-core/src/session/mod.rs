//! Session controller - the control-side façade of the mixer
//!
//! The session owns everything that may block or allocate: the song
//! catalog, the asset cache, the background loader and the swap
//! controller. It talks to the render engine only through the command
//! queue, and learns what happened from the event queue in [`Session::poll`].
//!
//! # Asset accounting
//!
//! Every voice handed to the engine carries exactly one cache acquisition,
//! and so does every loaded protocol buffer. A voice's acquisition is
//! released when the engine hands the voice back in
//! `EngineEvent::VoiceRetired`; a buffer's when it is stopped or cleaned up.

mod error;
mod random;
mod status;

pub use error::{SessionError, SessionResult};
pub use random::{RandomMix, RANDOM_BPM_RANGE};
pub use status::{SlotStatus, StatusSnapshot};

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::asset::{AssetCache, AssetError, AssetHandle, AssetLoader, LoadRequest, LoadResult};
use crate::catalog::{Song, SongCatalog};
use crate::engine::{
    clamp_level, crossfade_levels, CommandSender, EngineAtomics, EngineCommand, EngineEvent, InterpolationMethod,
    RetireReason, StemVoice, SwapPhase, DEFAULT_BPM,
};
use crate::music::{is_compatible, tempo_ratio, Key, TempoTolerance};
use crate::plan::RemixPlan;
use crate::swap::{SwapController, SwapInfo, SwapOutcome};
use crate::types::{Deck, Stem, NUM_DECKS, NUM_STEMS, SAMPLE_RATE};

/// Global tempo range accepted by [`Session::set_global_bpm`]
pub const MIN_BPM: f64 = 60.0;
pub const MAX_BPM: f64 = 200.0;

/// Length of the `/test_tone` burst
pub const TEST_TONE_SECONDS: f64 = 1.0;

/// Deck A level set after a plan section is loaded
pub const PLAN_DECK_LEVEL: f32 = 0.8;

/// Session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Rate the render engine runs at
    pub sample_rate: u32,
    /// Must match the render engine's initial global BPM
    pub global_bpm: f64,
    pub tempo_tolerance: TempoTolerance,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            global_bpm: DEFAULT_BPM,
            tempo_tolerance: TempoTolerance::Relaxed,
        }
    }
}

/// What a slot is playing, as far as the control side knows
#[derive(Debug, Clone)]
struct SlotBinding {
    /// Song id, or buffer name for protocol buffers
    source: String,
    handle: AssetHandle,
    buffer: Option<i32>,
    gain: f32,
}

/// A stem file loaded through `/load_buffer`
#[derive(Debug)]
struct BufferBinding {
    name: String,
    stem: Stem,
    deck: Deck,
    handle: AssetHandle,
}

/// Swap waiting for the background loader
#[derive(Debug)]
struct PendingSwap {
    deck: Deck,
    stem: Stem,
    song_id: String,
    base_bpm: f64,
    /// The slot's current binding is what keeps playing if this swap fails
    fallback_current: bool,
}

type SlotTable<T> = [[Option<T>; NUM_STEMS]; NUM_DECKS];

pub struct Session {
    catalog: SongCatalog,
    cache: AssetCache,
    loader: Option<AssetLoader>,
    swaps: SwapController,
    pending: HashMap<u64, PendingSwap>,
    commands: CommandSender,
    events: rtrb::Consumer<EngineEvent>,
    atomics: Arc<EngineAtomics>,
    config: SessionConfig,

    global_bpm: f64,
    crossfade: f32,
    key: Option<Key>,

    slots: SlotTable<SlotBinding>,
    /// Binding that keeps playing until the swap in flight completes
    displaced: SlotTable<SlotBinding>,
    buffers: HashMap<i32, BufferBinding>,
    queue: VecDeque<String>,
    /// Lost engine events already reported
    lost_events: u64,
}

impl Session {
    pub fn new(
        catalog: SongCatalog,
        commands: CommandSender,
        events: rtrb::Consumer<EngineEvent>,
        atomics: Arc<EngineAtomics>,
        config: SessionConfig,
    ) -> Self {
        Self {
            catalog,
            cache: AssetCache::new(),
            loader: None,
            swaps: SwapController::new(),
            pending: HashMap::new(),
            commands,
            events,
            atomics,
            global_bpm: config.global_bpm,
            config,
            crossfade: 0.0,
            key: None,
            slots: Default::default(),
            displaced: Default::default(),
            buffers: HashMap::new(),
            queue: VecDeque::new(),
            lost_events: 0,
        }
    }

    /// Decode swap assets off-thread instead of synchronously
    pub fn with_loader(mut self, loader: AssetLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn catalog(&self) -> &SongCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    pub fn atomics(&self) -> &Arc<EngineAtomics> {
        &self.atomics
    }

    pub fn swaps(&self) -> &SwapController {
        &self.swaps
    }

    pub fn global_bpm(&self) -> f64 {
        self.global_bpm
    }

    pub fn key(&self) -> Option<Key> {
        self.key
    }

    pub fn crossfade(&self) -> f32 {
        self.crossfade
    }

    /// Song or buffer name bound to a slot
    pub fn slot_source(&self, deck: Deck, stem: Stem) -> Option<&str> {
        self.slots[deck.index()][stem.index()]
            .as_ref()
            .map(|b| b.source.as_str())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_device_lost(&self) -> bool {
        self.atomics.device_lost()
    }

    // ─────────────────────────────────────────────────────────────
    // Stems from the catalog
    // ─────────────────────────────────────────────────────────────

    /// Bind `stem` of `song_id` to a slot, replacing what plays there
    ///
    /// The asset is decoded synchronously unless resident. With `section`
    /// the voice loops inside that section. Returns the playback rate.
    pub fn load_stem(&mut self, deck: Deck, stem: Stem, song_id: &str, section: Option<&str>) -> SessionResult<f64> {
        let song = self.song(song_id)?.clone();
        let path = stem_path(&song, stem)?;
        let window = match section {
            Some(label) => Some(song.section(label).cloned().ok_or_else(|| SessionError::UnknownSection {
                song: song.id.clone(),
                section: label.to_string(),
            })?),
            None => None,
        };

        if !is_compatible(song.bpm, self.global_bpm, self.config.tempo_tolerance) {
            log::warn!(
                "load_stem: {} at {:.1} BPM is far from the global {:.1} BPM",
                song.id,
                song.bpm,
                self.global_bpm
            );
        }

        let handle = self.cache.acquire(&song.asset_id(stem), &path)?;
        let mut voice = self
            .voice_for(handle)?
            .with_tempo(song.bpm, self.global_bpm)
            .with_loop(true);
        if let Some(section) = &window {
            let start = voice.asset().seconds_to_frame(section.start);
            let end = voice.asset().seconds_to_frame(section.end);
            voice = voice.with_window(start, end);
        }
        let gain = self.slot_gain(deck, stem);
        let voice = voice.with_gain(gain);
        let rate = voice.rate();

        let binding = SlotBinding {
            source: song.id.clone(),
            handle,
            buffer: None,
            gain,
        };
        self.start_voice(deck, stem, voice, binding)?;

        log::info!(
            "Loaded {}/{}: {}{} at rate {:.4}",
            deck,
            stem,
            song.id,
            window.map(|s| format!(" [{}]", s.label)).unwrap_or_default(),
            rate
        );
        Ok(rate)
    }

    /// Crossfade a slot over to `stem` of `song_id`
    ///
    /// Rejected with `IncompatibleTempo` when the song's tempo is outside
    /// the configured tolerance of the global BPM. A resident asset is
    /// dispatched immediately; otherwise the background loader decodes it
    /// and [`poll`](Self::poll) dispatches it when ready.
    pub fn swap_stem(&mut self, deck: Deck, stem: Stem, song_id: &str) -> SessionResult<SwapOutcome> {
        let song = self.song(song_id)?.clone();
        let path = stem_path(&song, stem)?;

        let target_bpm = self.global_bpm;
        let rate = tempo_ratio(song.bpm, target_bpm);
        if !is_compatible(song.bpm, target_bpm, self.config.tempo_tolerance) {
            return Err(SessionError::IncompatibleTempo {
                source_bpm: song.bpm,
                target_bpm,
                ratio: rate,
            });
        }

        // Once an older swap reached its fade-in, its voice is the one that
        // fades out for this swap
        let prior_phase = self.swaps.phase(deck, stem);
        let (ticket, superseded) = self.swaps.begin(deck, stem, &song.id);
        if let Some(old) = superseded {
            if self.pending.remove(&old).is_some() {
                log::debug!("Swap #{} superseded before its asset was ready", old);
            }
        }

        let (key_distance, semitones) = match (song.key, self.key) {
            (Some(from), Some(to)) => (Some(from.distance(&to)), Some(from.semitones_to(&to))),
            _ => (None, None),
        };
        let info = SwapInfo {
            ticket,
            deck,
            stem,
            song_id: song.id.clone(),
            rate,
            key_distance,
            semitones,
        };

        let asset_id = song.asset_id(stem);
        let pending = PendingSwap {
            deck,
            stem,
            song_id: song.id.clone(),
            base_bpm: song.bpm,
            fallback_current: matches!(prior_phase, SwapPhase::Idle | SwapPhase::CrossfadeIn),
        };

        let dispatched = if self.loader.is_some() && !self.cache.is_resident(&asset_id) {
            let request = LoadRequest {
                ticket,
                id: asset_id,
                path,
            };
            self.request_load(request, pending)?;
            false
        } else {
            let handle = match self.cache.acquire(&asset_id, &path) {
                Ok(handle) => handle,
                Err(e) => {
                    self.swaps.cancel(deck, stem);
                    return Err(e.into());
                }
            };
            self.dispatch_swap(ticket, pending, handle)?;
            true
        };

        log::info!(
            "Swap #{} on {}/{} -> {} (rate {:.4}{})",
            ticket,
            deck,
            stem,
            song.id,
            rate,
            if dispatched { "" } else { ", loading" }
        );

        Ok(match superseded {
            Some(old) => SwapOutcome::SlotBusy {
                swap: info,
                superseded: old,
            },
            None if dispatched => SwapOutcome::Dispatched(info),
            None => SwapOutcome::Preparing(info),
        })
    }

    /// Replace everything on `deck` with every stem `song_id` has
    ///
    /// Stems that fail to load are skipped. Returns the number loaded.
    pub fn load_song(&mut self, deck: Deck, song_id: &str) -> SessionResult<usize> {
        let song = self.song(song_id)?.clone();
        self.stop(deck, None)?;

        let mut loaded = 0;
        for stem in Stem::ALL.into_iter().filter(|s| song.stems.contains_key(s)) {
            match self.load_stem(deck, stem, &song.id, None) {
                Ok(_) => loaded += 1,
                Err(SessionError::QueueFull) => return Err(SessionError::QueueFull),
                Err(e) => log::warn!("load_song {}: skipping {}: {}", song.id, stem, e),
            }
        }
        log::info!("Deck {} <- {} ({} stems)", deck, song.id, loaded);
        Ok(loaded)
    }

    /// Loop a loaded catalog stem inside one section of its song
    ///
    /// The voice restarts at the section start with the slot's gain. A slot
    /// driven by a protocol buffer has no sections and is rejected.
    pub fn set_section(&mut self, deck: Deck, stem: Stem, label: &str) -> SessionResult<f64> {
        let source = match &self.slots[deck.index()][stem.index()] {
            Some(binding) if binding.buffer.is_none() => binding.source.clone(),
            _ => return Err(SessionError::EmptySlot { deck, stem }),
        };
        self.load_stem(deck, stem, &source, Some(label))
    }

    /// Stop one slot, or every slot of a deck when `stem` is None
    pub fn stop(&mut self, deck: Deck, stem: Option<Stem>) -> SessionResult<()> {
        match stem {
            Some(stem) => {
                self.send(EngineCommand::StopVoice { deck, stem })?;
                self.clear_slot(deck, stem);
            }
            None => {
                self.send(EngineCommand::StopDeck { deck })?;
                for stem in Stem::ALL {
                    self.clear_slot(deck, stem);
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Mix
    // ─────────────────────────────────────────────────────────────

    /// Crossfader position, 0 = deck A only, 1 = deck B only
    pub fn set_crossfade(&mut self, position: f32) -> SessionResult<()> {
        let (a, b) = crossfade_levels(position);
        self.send(EngineCommand::SetDeckLevels { a, b })?;
        self.crossfade = b;
        Ok(())
    }

    pub fn set_crossfade_levels(&mut self, a: f32, b: f32) -> SessionResult<()> {
        let (a, b) = (clamp_level(a), clamp_level(b));
        self.send(EngineCommand::SetDeckLevels { a, b })?;
        if a + b > 0.0 {
            self.crossfade = b / (a + b);
        }
        Ok(())
    }

    /// Set the global tempo; every voice bound from the catalog re-rates
    ///
    /// The value is clamped to [`MIN_BPM`]..=[`MAX_BPM`]. Returns the tempo
    /// actually applied.
    pub fn set_global_bpm(&mut self, bpm: f64) -> SessionResult<f64> {
        let bpm = if bpm.is_finite() {
            bpm.clamp(MIN_BPM, MAX_BPM)
        } else {
            self.global_bpm
        };
        self.send(EngineCommand::SetGlobalBpm(bpm))?;
        self.global_bpm = bpm;
        Ok(bpm)
    }

    pub fn set_master_volume(&mut self, level: f32) -> SessionResult<()> {
        self.send(EngineCommand::SetMasterVolume(clamp_level(level)))
    }

    pub fn set_stem_volume(&mut self, stem: Stem, level: f32) -> SessionResult<()> {
        self.send(EngineCommand::SetStemTypeVolume {
            stem,
            level: clamp_level(level),
        })
    }

    pub fn set_interpolation(&mut self, method: InterpolationMethod) -> SessionResult<()> {
        self.send(EngineCommand::SetInterpolation(method))
    }

    /// Set the session key reference (Camelot code or note name)
    pub fn set_key(&mut self, key: &str) -> SessionResult<Key> {
        let parsed = Key::parse(key).ok_or_else(|| SessionError::InvalidKey(key.to_string()))?;
        self.key = Some(parsed);
        log::info!("Session key: {} ({})", parsed, parsed.camelot_code());
        Ok(parsed)
    }

    /// One-second sine burst on top of the mix
    pub fn test_tone(&mut self, frequency: f32) -> SessionResult<()> {
        let frequency = if frequency.is_finite() {
            frequency.clamp(20.0, 20_000.0)
        } else {
            440.0
        };
        let frames = (self.config.sample_rate as f64 * TEST_TONE_SECONDS) as usize;
        self.send(EngineCommand::StartTestTone { frequency, frames })
    }

    // ─────────────────────────────────────────────────────────────
    // Queue and plans
    // ─────────────────────────────────────────────────────────────

    /// Replace the play queue with songs chosen by an external sequencer
    ///
    /// Fails on the first id the catalog doesn't know; the old queue is
    /// kept in that case.
    pub fn queue_order<I, S>(&mut self, ids: I) -> SessionResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut queue = VecDeque::new();
        for id in ids {
            queue.push_back(self.song(id.as_ref())?.id.clone());
        }
        self.queue = queue;
        Ok(self.queue.len())
    }

    /// Take the next song off the queue
    pub fn next_in_queue(&mut self) -> Option<&Song> {
        let id = self.queue.pop_front()?;
        self.catalog.get(&id)
    }

    pub fn queued(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(String::as_str)
    }

    /// Replay one section of a remix plan
    ///
    /// Stops everything, sets the plan's tempo and key, loads each of the
    /// section's stems on deck A and brings deck A up. A stem that fails to
    /// load is skipped. Returns the number of stems loaded.
    pub fn apply_plan_section(&mut self, plan: &RemixPlan, name: &str) -> SessionResult<usize> {
        let section = plan.section(name).ok_or_else(|| SessionError::UnknownSection {
            song: plan.theme.clone(),
            section: name.to_string(),
        })?;

        self.catalog.merge(plan.to_catalog());
        self.cleanup()?;
        if let Some(bpm) = plan.base_bpm {
            self.set_global_bpm(bpm)?;
        }
        if let Some(key) = plan.base_key() {
            self.key = Some(key);
        }

        let mut loaded = 0;
        for (&stem, entry) in &section.stems {
            if entry.needs_timestretch {
                log::debug!("Plan section {}: {} from {} plays resampled", name, stem, entry.song);
            }
            match self.load_stem(Deck::A, stem, entry.song_id(), None) {
                Ok(_) => loaded += 1,
                Err(SessionError::QueueFull) => return Err(SessionError::QueueFull),
                Err(e) => log::warn!("Plan section {}: skipping {} from {}: {}", name, stem, entry.song, e),
            }
        }

        self.set_crossfade_levels(PLAN_DECK_LEVEL, 0.0)?;
        log::info!(
            "Plan section {} ({}): {}/{} stems loaded",
            name,
            section.section_type,
            loaded,
            section.stems.len()
        );
        Ok(loaded)
    }

    // ─────────────────────────────────────────────────────────────
    // Protocol buffers
    // ─────────────────────────────────────────────────────────────

    /// Load a stem file under a numeric buffer id
    ///
    /// Buffer ids below 1100 play on deck A, the rest on deck B. The stem
    /// type is the suffix of `stem_name` after its last underscore.
    pub fn load_buffer(&mut self, id: i32, path: &Path, stem_name: &str) -> SessionResult<()> {
        let stem = Stem::from_stem_name(stem_name).ok_or_else(|| SessionError::InvalidStem(stem_name.to_string()))?;
        let asset_id = path.to_string_lossy().into_owned();
        let handle = self.cache.acquire(&asset_id, path)?;

        let binding = BufferBinding {
            name: stem_name.to_string(),
            stem,
            deck: Deck::for_buffer_id(id),
            handle,
        };
        log::info!("Buffer {} <- {:?} ({} on deck {})", id, path, stem, binding.deck);
        if let Some(old) = self.buffers.insert(id, binding) {
            self.cache.release(old.handle);
        }
        Ok(())
    }

    /// Start a loaded buffer on its slot
    ///
    /// With `duration` the voice is confined to
    /// `[start_seconds, start_seconds + duration)`.
    pub fn play_buffer(
        &mut self,
        id: i32,
        rate: f64,
        volume: f32,
        looping: bool,
        start_seconds: f64,
        duration: Option<f64>,
    ) -> SessionResult<()> {
        let buffer = self.buffers.get(&id).ok_or(SessionError::UnknownBuffer(id))?;
        let (handle, deck, stem, name) = (buffer.handle, buffer.deck, buffer.stem, buffer.name.clone());

        // Already playing without a window: update the running voice in place
        if duration.is_none() && self.slot_buffer(deck, stem) == Some(id) && self.atomics.slot(deck, stem).is_active() {
            let frame = match self.cache.get(handle) {
                Some(asset) => asset.seconds_to_frame(start_seconds.max(0.0)),
                None => return Err(SessionError::UnknownBuffer(id)),
            };
            let gain = clamp_level(volume);
            self.send(EngineCommand::SetVoiceRate { deck, stem, rate })?;
            self.send(EngineCommand::SetVoiceGain { deck, stem, gain })?;
            self.send(EngineCommand::SetVoiceLoop { deck, stem, looping })?;
            self.send(EngineCommand::SeekVoice { deck, stem, frame })?;
            if let Some(binding) = self.slots[deck.index()][stem.index()].as_mut() {
                binding.gain = gain;
            }
            return Ok(());
        }

        if !self.cache.retain(handle) {
            return Err(SessionError::UnknownBuffer(id));
        }
        let voice = self.voice_for(handle)?;
        let start = voice.asset().seconds_to_frame(start_seconds.max(0.0));
        let gain = clamp_level(volume);
        let mut voice = voice.with_rate(rate).with_gain(gain).with_loop(looping);
        voice = match duration {
            Some(seconds) => {
                let end = voice.asset().seconds_to_frame(start_seconds.max(0.0) + seconds.max(0.0));
                voice.with_window(start, end)
            }
            None => voice.with_start(start),
        };

        let binding = SlotBinding {
            source: name,
            handle,
            buffer: Some(id),
            gain,
        };
        self.start_voice(deck, stem, voice, binding)
    }

    /// Stop a buffer's voice and release the buffer
    pub fn stop_buffer(&mut self, id: i32) -> SessionResult<()> {
        let buffer = self.buffers.get(&id).ok_or(SessionError::UnknownBuffer(id))?;
        let (deck, stem) = (buffer.deck, buffer.stem);
        if self.slot_buffer(deck, stem) == Some(id) {
            self.send(EngineCommand::StopVoice { deck, stem })?;
            self.clear_slot(deck, stem);
        }
        if let Some(buffer) = self.buffers.remove(&id) {
            self.cache.release(buffer.handle);
        }
        Ok(())
    }

    pub fn set_buffer_volume(&mut self, id: i32, volume: f32) -> SessionResult<()> {
        let buffer = self.buffers.get(&id).ok_or(SessionError::UnknownBuffer(id))?;
        let (deck, stem) = (buffer.deck, buffer.stem);
        if self.slot_buffer(deck, stem) != Some(id) {
            return Ok(());
        }
        let gain = clamp_level(volume);
        self.send(EngineCommand::SetVoiceGain { deck, stem, gain })?;
        if let Some(binding) = self.slots[deck.index()][stem.index()].as_mut() {
            binding.gain = gain;
        }
        Ok(())
    }

    /// Stop every slot and release every protocol buffer
    ///
    /// Returns the number of buffers released.
    pub fn cleanup(&mut self) -> SessionResult<usize> {
        for deck in Deck::ALL {
            self.send(EngineCommand::StopDeck { deck })?;
            for stem in Stem::ALL {
                self.clear_slot(deck, stem);
            }
        }
        let released = self.buffers.len();
        for (_, buffer) in self.buffers.drain() {
            self.cache.release(buffer.handle);
        }
        log::info!("Cleanup: {} buffers released", released);
        Ok(released)
    }

    // ─────────────────────────────────────────────────────────────
    // Status and housekeeping
    // ─────────────────────────────────────────────────────────────

    pub fn status(&self) -> StatusSnapshot {
        let mut slots = Vec::new();
        for deck in Deck::ALL {
            for stem in Stem::ALL {
                let binding = self.slots[deck.index()][stem.index()].as_ref();
                let mirror = self.atomics.slot(deck, stem);
                let swap_phase = self.swaps.phase(deck, stem);
                if binding.is_none() && !mirror.is_active() && swap_phase == SwapPhase::Idle {
                    continue;
                }
                slots.push(SlotStatus {
                    deck,
                    stem,
                    source: binding.map(|b| b.source.clone()),
                    buffer: binding.and_then(|b| b.buffer),
                    active: mirror.is_active(),
                    cursor: mirror.cursor(),
                    gain: mirror.gain(),
                    rate: mirror.rate(),
                    swap_phase,
                    swap_ticket: self.swaps.ticket(deck, stem),
                });
            }
        }

        StatusSnapshot {
            sample_rate: self.config.sample_rate,
            global_bpm: self.global_bpm,
            master_volume: self.atomics.master_volume(),
            crossfade: self.crossfade,
            deck_levels: Deck::ALL.map(|d| self.atomics.deck_level(d)),
            stem_volumes: Stem::ALL.map(|s| self.atomics.stem_volume(s)),
            key: self.key.map(|k| k.camelot_code()),
            active_voices: self.atomics.active_voices(),
            underruns: self.atomics.underruns(),
            lost_events: self.atomics.lost_events(),
            blocks_rendered: self.atomics.blocks_rendered(),
            test_tone: self.atomics.test_tone_active(),
            device_lost: self.atomics.device_lost(),
            resident_assets: self.cache.len(),
            resident_bytes: self.cache.resident_bytes(),
            decode_count: self.cache.decode_count(),
            buffers: self.buffers.len(),
            swaps_in_flight: self.swaps.in_flight(),
            queue: self.queue.iter().cloned().collect(),
            slots,
        }
    }

    /// Handle finished loads and engine events
    ///
    /// Call regularly from the control loop. Returns the number of items
    /// handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(result) = self.loader.as_ref().and_then(AssetLoader::try_recv) {
            self.on_load_result(result);
            handled += 1;
        }
        while let Ok(event) = self.events.pop() {
            self.on_event(event);
            handled += 1;
        }

        let lost = self.atomics.lost_events();
        if lost > self.lost_events {
            log::warn!(
                "Render engine dropped {} events; some assets stay resident until shutdown",
                lost - self.lost_events
            );
            self.lost_events = lost;
        }
        handled
    }

    /// Stop all voices and release every asset
    ///
    /// Returns the number of assets evicted.
    pub fn shutdown(&mut self) -> usize {
        if let Err(e) = self.send(EngineCommand::StopAll) {
            log::warn!("Shutdown: {}", e);
        }
        self.poll();

        self.swaps.cancel_all();
        self.pending.clear();
        self.slots = Default::default();
        self.displaced = Default::default();
        self.buffers.clear();
        self.queue.clear();

        let evicted = self.cache.release_all();
        log::info!("Session shut down, {} assets released", evicted);
        evicted
    }

    // ─────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────

    fn song(&self, id: &str) -> SessionResult<&Song> {
        self.catalog
            .find(id)
            .ok_or_else(|| SessionError::UnknownSong(id.to_string()))
    }

    fn slot_gain(&self, deck: Deck, stem: Stem) -> f32 {
        self.slots[deck.index()][stem.index()]
            .as_ref()
            .map(|b| b.gain)
            .unwrap_or(1.0)
    }

    fn slot_buffer(&self, deck: Deck, stem: Stem) -> Option<i32> {
        self.slots[deck.index()][stem.index()]
            .as_ref()
            .and_then(|b| b.buffer)
    }

    /// New voice over an acquired asset; on failure the acquisition is released
    fn voice_for(&mut self, handle: AssetHandle) -> SessionResult<StemVoice> {
        match self.cache.get(handle) {
            Some(asset) => Ok(StemVoice::new(handle, asset.clone(), self.config.sample_rate)),
            None => {
                self.cache.release(handle);
                Err(SessionError::AssetNotFound { path: PathBuf::new() })
            }
        }
    }

    fn send(&mut self, command: EngineCommand) -> SessionResult<()> {
        match self.commands.send(command) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                log::warn!("Command queue full, dropping {:?}", rejected);
                if let EngineCommand::StartVoice { voice, .. } | EngineCommand::BeginSwap { voice, .. } = rejected {
                    self.cache.release(voice.handle());
                }
                Err(SessionError::QueueFull)
            }
        }
    }

    fn start_voice(&mut self, deck: Deck, stem: Stem, voice: StemVoice, binding: SlotBinding) -> SessionResult<()> {
        self.send(EngineCommand::StartVoice {
            deck,
            stem,
            voice: Box::new(voice),
        })?;
        self.clear_slot(deck, stem);
        self.slots[deck.index()][stem.index()] = Some(binding);
        Ok(())
    }

    /// Forget the slot's binding and cancel any swap in flight on it
    fn clear_slot(&mut self, deck: Deck, stem: Stem) {
        if let Some(ticket) = self.swaps.cancel(deck, stem) {
            self.pending.remove(&ticket);
            log::debug!("Swap #{} on {}/{} cancelled", ticket, deck, stem);
        }
        self.slots[deck.index()][stem.index()] = None;
        self.displaced[deck.index()][stem.index()] = None;
    }

    fn dispatch_swap(&mut self, ticket: u64, pending: PendingSwap, handle: AssetHandle) -> SessionResult<()> {
        let PendingSwap {
            deck,
            stem,
            song_id,
            base_bpm,
            fallback_current,
        } = pending;

        let voice = match self.voice_for(handle) {
            Ok(voice) => voice,
            Err(e) => {
                self.swaps.cancel(deck, stem);
                return Err(e);
            }
        };
        let gain = self.slot_gain(deck, stem);
        let voice = voice
            .with_tempo(base_bpm, self.global_bpm)
            .with_loop(true)
            .with_gain(gain)
            .with_pending_swap(ticket);

        let command = EngineCommand::BeginSwap {
            deck,
            stem,
            ticket,
            voice: Box::new(voice),
        };
        if let Err(e) = self.send(command) {
            self.swaps.cancel(deck, stem);
            return Err(e);
        }

        let (d, s) = (deck.index(), stem.index());
        let current = self.slots[d][s].take();
        if fallback_current || self.displaced[d][s].is_none() {
            self.displaced[d][s] = current;
        }
        self.slots[d][s] = Some(SlotBinding {
            source: song_id,
            handle,
            buffer: None,
            gain,
        });
        Ok(())
    }

    fn request_load(&mut self, request: LoadRequest, pending: PendingSwap) -> SessionResult<()> {
        let ticket = request.ticket;
        let sent = match &self.loader {
            Some(loader) => loader.request(request),
            None => Err(AssetError::LoaderDisconnected),
        };
        if let Err(e) = sent {
            self.swaps.cancel(pending.deck, pending.stem);
            return Err(e.into());
        }
        self.pending.insert(ticket, pending);
        Ok(())
    }

    fn on_load_result(&mut self, result: LoadResult) {
        let LoadResult { ticket, id, result } = result;
        let Some(pending) = self.pending.remove(&ticket) else {
            log::debug!("Discarding load result for stale swap #{} ({})", ticket, id);
            return;
        };
        if !self.swaps.is_current(pending.deck, pending.stem, ticket) {
            log::debug!("Discarding load result for stale swap #{} ({})", ticket, id);
            return;
        }

        match result {
            Ok(asset) => {
                let handle = self.cache.acquire_decoded(&id, asset);
                if let Err(e) = self.dispatch_swap(ticket, pending, handle) {
                    log::warn!("Swap #{} could not start: {}", ticket, e);
                }
            }
            Err(e) => {
                log::warn!("Swap #{} failed to load {}: {}", ticket, id, e);
                self.swaps.cancel(pending.deck, pending.stem);
            }
        }
    }

    fn on_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::VoiceRetired {
                deck,
                stem,
                voice,
                reason,
            } => {
                let handle = voice.handle();
                drop(voice);
                if self.cache.get(handle).is_some() {
                    self.cache.release(handle);
                }

                if matches!(reason, RetireReason::Ended | RetireReason::Fault) {
                    let (d, s) = (deck.index(), stem.index());
                    if self.slots[d][s].as_ref().is_some_and(|b| b.handle == handle) {
                        self.slots[d][s] = None;
                    }
                    if self.displaced[d][s].as_ref().is_some_and(|b| b.handle == handle) {
                        self.displaced[d][s] = None;
                    }
                }

                match reason {
                    RetireReason::Fault => log::warn!("Voice on {}/{} stopped: unusable asset", deck, stem),
                    _ => log::debug!("Voice on {}/{} retired ({:?})", deck, stem, reason),
                }
            }
            EngineEvent::SwapPhase {
                deck,
                stem,
                ticket,
                phase,
            } => {
                if self.swaps.on_phase(deck, stem, ticket, phase) {
                    log::debug!("Swap #{} on {}/{}: {}", ticket, deck, stem, phase);
                }
            }
            EngineEvent::SwapCompleted { deck, stem, ticket } => {
                if let Some(song) = self.swaps.complete(deck, stem, ticket) {
                    self.displaced[deck.index()][stem.index()] = None;
                    log::info!("Swap #{} on {}/{} complete, now playing {}", ticket, deck, stem, song);
                }
            }
            EngineEvent::SwapAbandoned { deck, stem, ticket } => {
                if self.swaps.abandon(deck, stem, ticket) {
                    let (d, s) = (deck.index(), stem.index());
                    if let Some(previous) = self.displaced[d][s].take() {
                        self.slots[d][s] = Some(previous);
                    }
                    log::warn!("Swap #{} on {}/{} abandoned", ticket, deck, stem);
                }
            }
        }
    }
}

fn stem_path(song: &Song, stem: Stem) -> SessionResult<PathBuf> {
    song.stem_path(stem)
        .map(Path::to_path_buf)
        .ok_or_else(|| SessionError::MissingStem {
            song: song.id.clone(),
            stem,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::write_tone;
    use crate::engine::{EngineConfig, MixState, RenderEngine};
    use crate::types::StereoBuffer;
    use tempfile::TempDir;

    const BLOCK: usize = 64;

    struct Rig {
        session: Session,
        engine: RenderEngine,
        _dir: TempDir,
    }

    impl Rig {
        fn run(&mut self, blocks: usize) -> StereoBuffer {
            let mut out = StereoBuffer::silence(BLOCK);
            for _ in 0..blocks {
                self.engine.process(&mut out);
                self.session.poll();
            }
            out
        }
    }

    fn catalog(dir: &Path) -> SongCatalog {
        let song = |id: &str, bpm: f64, freq: f32| {
            let mut song = Song::new(id, bpm).with_key(Key::parse("8A").unwrap());
            for stem in [Stem::Bass, Stem::Drums] {
                let path = write_tone(dir, &format!("{}_{}.wav", id, stem), freq, 0.5);
                song = song.with_stem(stem, path);
            }
            song.with_section("drop", 0.1, 0.2)
        };
        SongCatalog::from_songs([
            song("songA", 140.0, 110.0),
            song("songB", 143.0, 220.0),
            song("song7", 138.0, 330.0),
            song("song9", 141.0, 440.0),
            song("slow", 100.0, 550.0),
        ])
    }

    fn rig() -> Rig {
        rig_with(None)
    }

    fn rig_with(loader: Option<AssetLoader>) -> Rig {
        let dir = TempDir::new().unwrap();
        let atomics = Arc::new(EngineAtomics::new());
        let mix = MixState {
            master_volume: 1.0,
            stem_volumes: [1.0; NUM_STEMS],
            global_bpm: 140.0,
            ..MixState::default()
        };
        let config = EngineConfig {
            block_size: BLOCK,
            swap_fade_blocks: 2,
            mix,
            ..EngineConfig::default()
        };
        let (engine, tx, events) = RenderEngine::with_channels(config, atomics.clone());
        let session_config = SessionConfig {
            global_bpm: 140.0,
            ..SessionConfig::default()
        };
        let mut session = Session::new(catalog(dir.path()), tx, events, atomics, session_config);
        if let Some(loader) = loader {
            session = session.with_loader(loader);
        }
        Rig {
            session,
            engine,
            _dir: dir,
        }
    }

    #[test]
    fn test_load_stem_rates_against_global_bpm() {
        let mut rig = rig();
        let rate = rig.session.load_stem(Deck::A, Stem::Drums, "songB", None).unwrap();
        assert!((rate - 140.0 / 143.0).abs() < 1e-9);

        rig.run(2);
        let voice = rig.engine.voice(Deck::A, Stem::Drums).unwrap();
        assert!((voice.rate() - 140.0 / 143.0).abs() < 1e-9);
        assert_eq!(rig.session.slot_source(Deck::A, Stem::Drums), Some("songB"));
        assert_eq!(rig.session.cache().decode_count(), 1);
    }

    #[test]
    fn test_load_stem_errors() {
        let mut rig = rig();
        assert!(matches!(
            rig.session.load_stem(Deck::A, Stem::Bass, "nope", None),
            Err(SessionError::UnknownSong(_))
        ));
        assert!(matches!(
            rig.session.load_stem(Deck::A, Stem::Vocals, "songA", None),
            Err(SessionError::MissingStem { .. })
        ));
        assert!(matches!(
            rig.session.load_stem(Deck::A, Stem::Bass, "songA", Some("outro")),
            Err(SessionError::UnknownSection { .. })
        ));
        assert!(rig.session.cache().is_empty());
    }

    #[test]
    fn test_load_stem_with_section_window() {
        let mut rig = rig();
        rig.session.load_stem(Deck::A, Stem::Bass, "songA", Some("DROP")).unwrap();
        rig.run(1);
        let voice = rig.engine.voice(Deck::A, Stem::Bass).unwrap();
        assert_eq!(voice.window(), (4410, 8820));
        assert!(voice.cursor() >= 4410.0);
    }

    #[test]
    fn test_end_to_end_two_songs_on_deck_a() {
        let mut rig = rig();
        rig.session.load_stem(Deck::A, Stem::Bass, "songA", None).unwrap();
        rig.session.load_stem(Deck::A, Stem::Drums, "songB", None).unwrap();
        rig.session.set_crossfade_levels(1.0, 0.0).unwrap();
        rig.run(4);

        let drums = rig.engine.voice(Deck::A, Stem::Drums).unwrap();
        assert!((drums.rate() - 140.0 / 143.0).abs() < 1e-9);
        assert!(rig.engine.deck_output(Deck::A).rms() > 0.0);
        assert_eq!(rig.engine.deck_output(Deck::B).rms(), 0.0);

        rig.session.set_crossfade(0.5).unwrap();
        rig.run(1);
        assert_eq!(rig.engine.deck_output(Deck::B).rms(), 0.0);
        let status = rig.session.status();
        assert_eq!(status.deck_levels, [0.5, 0.5]);
        assert_eq!(status.active_voices, 2);
    }

    #[test]
    fn test_swap_of_resident_asset_is_dispatched_and_completes() {
        let mut rig = rig();
        rig.session.load_stem(Deck::A, Stem::Bass, "songA", None).unwrap();
        rig.session.load_stem(Deck::B, Stem::Bass, "song9", None).unwrap();
        rig.run(1);

        let outcome = rig.session.swap_stem(Deck::A, Stem::Bass, "song9").unwrap();
        assert!(matches!(outcome, SwapOutcome::Dispatched(_)));
        assert_eq!(rig.session.cache().decode_count(), 2);

        rig.run(10);
        assert_eq!(rig.session.swaps().phase(Deck::A, Stem::Bass), SwapPhase::Idle);
        assert_eq!(rig.session.slot_source(Deck::A, Stem::Bass), Some("song9"));
        // songA's only voice was swapped out and released
        assert!(!rig.session.cache().is_resident("songA_bass"));
        assert!(rig.session.cache().is_resident("song9_bass"));
    }

    #[test]
    fn test_swap_rejects_incompatible_tempo() {
        let mut rig = rig();
        match rig.session.swap_stem(Deck::A, Stem::Bass, "slow") {
            Err(SessionError::IncompatibleTempo {
                source_bpm,
                target_bpm,
                ratio,
            }) => {
                assert_eq!(source_bpm, 100.0);
                assert_eq!(target_bpm, 140.0);
                assert!((ratio - 1.4).abs() < 1e-9);
            }
            other => panic!("expected IncompatibleTempo, got {:?}", other),
        }
        assert_eq!(rig.session.swaps().in_flight(), 0);
    }

    #[test]
    fn test_superseded_swap_releases_its_asset() {
        let mut rig = rig();
        rig.session.load_stem(Deck::A, Stem::Bass, "songA", None).unwrap();
        rig.run(1);

        let first = rig.session.swap_stem(Deck::A, Stem::Bass, "song7").unwrap();
        let second = rig.session.swap_stem(Deck::A, Stem::Bass, "song9").unwrap();
        match second {
            SwapOutcome::SlotBusy { superseded, .. } => assert_eq!(superseded, first.ticket()),
            other => panic!("expected SlotBusy, got {:?}", other),
        }

        rig.run(12);
        assert!(!rig.session.cache().is_resident("song7_bass"));
        assert!(!rig.session.cache().is_resident("songA_bass"));
        assert!(rig.session.cache().is_resident("song9_bass"));
        assert_eq!(rig.session.cache().len(), 1);
        assert_eq!(rig.engine.atomics().active_voices(), 1);
        assert_eq!(rig.session.slot_source(Deck::A, Stem::Bass), Some("song9"));
    }

    #[test]
    fn test_swap_through_background_loader() {
        let mut rig = rig_with(Some(AssetLoader::spawn().unwrap()));

        rig.session.load_stem(Deck::A, Stem::Bass, "songA", None).unwrap();
        let outcome = rig.session.swap_stem(Deck::A, Stem::Bass, "song9").unwrap();
        assert!(matches!(outcome, SwapOutcome::Preparing(_)));
        assert_eq!(rig.session.status().slot(Deck::A, Stem::Bass).unwrap().swap_phase, SwapPhase::Preparing);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while rig.session.swaps().phase(Deck::A, Stem::Bass) != SwapPhase::Idle
            && std::time::Instant::now() < deadline
        {
            rig.run(1);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(rig.session.slot_source(Deck::A, Stem::Bass), Some("song9"));
        assert!(!rig.session.cache().is_resident("songA_bass"));
    }

    #[test]
    fn test_stale_loader_result_is_discarded() {
        let mut rig = rig_with(Some(AssetLoader::spawn().unwrap()));

        rig.session.swap_stem(Deck::A, Stem::Bass, "song7").unwrap();
        rig.session.swap_stem(Deck::A, Stem::Bass, "song9").unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while rig.session.swaps().phase(Deck::A, Stem::Bass) != SwapPhase::Idle
            && std::time::Instant::now() < deadline
        {
            rig.run(1);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        // song7 may have been decoded, but it never entered the cache
        assert!(!rig.session.cache().is_resident("song7_bass"));
        assert!(rig.session.cache().is_resident("song9_bass"));
        assert_eq!(rig.session.cache().len(), 1);
    }

    #[test]
    fn test_global_bpm_is_clamped_and_retimes() {
        let mut rig = rig();
        rig.session.load_stem(Deck::A, Stem::Bass, "songA", None).unwrap();
        assert_eq!(rig.session.set_global_bpm(500.0).unwrap(), MAX_BPM);
        assert_eq!(rig.session.set_global_bpm(f64::NAN).unwrap(), MAX_BPM);
        assert_eq!(rig.session.set_global_bpm(45.0).unwrap(), 60.0);
        assert_eq!(rig.session.set_global_bpm(147.0).unwrap(), 147.0);
        rig.run(1);

        let voice = rig.engine.voice(Deck::A, Stem::Bass).unwrap();
        assert!((voice.rate() - 147.0 / 140.0).abs() < 1e-9);
        assert_eq!(rig.session.status().global_bpm, 147.0);
    }

    #[test]
    fn test_stop_releases_after_retirement() {
        let mut rig = rig();
        rig.session.load_stem(Deck::A, Stem::Bass, "songA", None).unwrap();
        rig.session.load_stem(Deck::A, Stem::Drums, "songA", None).unwrap();
        rig.run(1);
        assert_eq!(rig.session.cache().len(), 2);

        rig.session.stop(Deck::A, Some(Stem::Bass)).unwrap();
        rig.run(1);
        assert!(!rig.session.cache().is_resident("songA_bass"));
        assert!(rig.session.slot_source(Deck::A, Stem::Bass).is_none());

        rig.session.stop(Deck::A, None).unwrap();
        rig.run(1);
        assert!(rig.session.cache().is_empty());
        assert_eq!(rig.engine.atomics().active_voices(), 0);
    }

    #[test]
    fn test_buffer_api() {
        let mut rig = rig();
        let dir = TempDir::new().unwrap();
        let path = write_tone(dir.path(), "loop.wav", 220.0, 0.5);

        assert!(matches!(
            rig.session.load_buffer(1000, &path, "Night Drive_kazoo"),
            Err(SessionError::InvalidStem(_))
        ));
        rig.session.load_buffer(1000, &path, "Night Drive_vocals").unwrap();
        rig.session.load_buffer(1100, &path, "Night Drive_drums").unwrap();
        assert_eq!(rig.session.cache().decode_count(), 1);
        assert_eq!(rig.session.buffer_count(), 2);

        rig.session.play_buffer(1000, 1.0, 0.8, true, 0.1, None).unwrap();
        rig.session.play_buffer(1100, 1.0, 0.5, false, 0.0, Some(0.2)).unwrap();
        rig.run(1);

        let vocals = rig.engine.voice(Deck::A, Stem::Vocals).unwrap();
        assert!(vocals.cursor() >= 4410.0);
        assert!(vocals.is_looping());
        let drums = rig.engine.voice(Deck::B, Stem::Drums).unwrap();
        assert_eq!(drums.window(), (0, 8820));

        rig.session.set_buffer_volume(1000, 0.3).unwrap();
        rig.run(2);
        assert!((rig.engine.voice(Deck::A, Stem::Vocals).unwrap().gain() - 0.3).abs() < 1e-6);

        // Playing a running buffer again updates the voice instead of restarting it
        let (refs, handle) = {
            let binding = rig.session.slots[Deck::A.index()][Stem::Vocals.index()].as_ref().unwrap();
            (rig.session.cache().refcount(binding.handle), binding.handle)
        };
        rig.session.play_buffer(1000, 0.5, 0.6, false, 0.0, None).unwrap();
        rig.run(2);
        let vocals = rig.engine.voice(Deck::A, Stem::Vocals).unwrap();
        assert_eq!(vocals.rate(), 0.5);
        assert!(!vocals.is_looping());
        assert!(vocals.cursor() < 4410.0);
        assert!((vocals.gain() - 0.6).abs() < 1e-6);
        assert_eq!(rig.session.cache().refcount(handle), refs);

        assert!(matches!(rig.session.play_buffer(1234, 1.0, 1.0, true, 0.0, None), Err(SessionError::UnknownBuffer(1234))));

        rig.session.stop_buffer(1000).unwrap();
        rig.run(1);
        assert!(rig.engine.voice(Deck::A, Stem::Vocals).is_none());
        assert_eq!(rig.session.buffer_count(), 1);
        assert!(rig.session.cache().is_resident(&path.to_string_lossy()));

        rig.session.cleanup().unwrap();
        rig.run(1);
        assert_eq!(rig.session.buffer_count(), 0);
        assert!(rig.session.cache().is_empty());
    }

    #[test]
    fn test_set_key_and_swap_reports_distance() {
        let mut rig = rig();
        assert!(matches!(rig.session.set_key("H#"), Err(SessionError::InvalidKey(_))));
        assert_eq!(rig.session.set_key("9A").unwrap().camelot_code(), "9A");

        let outcome = rig.session.swap_stem(Deck::A, Stem::Bass, "song9").unwrap();
        assert_eq!(outcome.info().key_distance, Some(1));
        assert_eq!(rig.session.status().key.as_deref(), Some("9A"));
    }

    #[test]
    fn test_set_interpolation_reaches_engine() {
        let mut rig = rig();
        rig.session.set_interpolation(InterpolationMethod::Linear).unwrap();
        rig.run(1);
        assert_eq!(rig.engine.mix().interpolation, InterpolationMethod::Linear);
    }

    #[test]
    fn test_queue_order() {
        let mut rig = rig();
        assert!(matches!(
            rig.session.queue_order(["song7", "missing"]),
            Err(SessionError::UnknownSong(_))
        ));
        assert_eq!(rig.session.queue_order(["song7", "song9"]).unwrap(), 2);
        assert_eq!(rig.session.next_in_queue().map(|s| s.id.clone()).as_deref(), Some("song7"));
        assert_eq!(rig.session.queued().collect::<Vec<_>>(), vec!["song9"]);
        assert_eq!(rig.session.next_in_queue().map(|s| s.id.clone()).as_deref(), Some("song9"));
        assert!(rig.session.next_in_queue().is_none());
    }

    #[test]
    fn test_apply_plan_section() {
        let mut rig = rig();
        let dir = TempDir::new().unwrap();
        let bass = write_tone(dir.path(), "bass.wav", 110.0, 0.3);
        let vocals = write_tone(dir.path(), "vocals.wav", 440.0, 0.3);
        let json = format!(
            r#"{{ "theme": "t", "base_bpm": 128.0, "base_key": "8A",
                 "sections": {{ "01_intro": {{ "type": "intro", "stems": {{
                    "bass": {{ "song": "Plan Bass (Mix)", "file": {:?}, "bpm": 128.0, "pitch_shift": 1.0 }},
                    "vocals": {{ "song": "Plan Vox", "file": {:?}, "bpm": 120.0, "pitch_shift": 1.0667 }},
                    "piano": {{ "song": "Gone", "file": "/does/not/exist.wav", "bpm": 128.0 }}
                 }} }} }} }}"#,
            bass, vocals
        );
        let plan = RemixPlan::from_json_str(&json).unwrap();

        rig.session.load_stem(Deck::B, Stem::Drums, "songA", None).unwrap();
        assert!(matches!(
            rig.session.apply_plan_section(&plan, "99_outro"),
            Err(SessionError::UnknownSection { .. })
        ));
        assert_eq!(rig.session.apply_plan_section(&plan, "01_intro").unwrap(), 2);
        rig.run(2);

        assert_eq!(rig.session.global_bpm(), 128.0);
        assert_eq!(rig.session.slot_source(Deck::A, Stem::Bass), Some("Plan Bass"));
        let vox = rig.engine.voice(Deck::A, Stem::Vocals).unwrap();
        assert!((vox.rate() - 128.0 / 120.0).abs() < 1e-9);
        assert!(rig.engine.voice(Deck::B, Stem::Drums).is_none());
        assert_eq!(rig.session.status().deck_levels, [0.8, 0.0]);
    }

    #[test]
    fn test_test_tone_and_shutdown() {
        let mut rig = rig();
        rig.session.test_tone(440.0).unwrap();
        rig.session.load_stem(Deck::A, Stem::Bass, "songA", None).unwrap();
        rig.run(1);
        assert!(rig.session.status().test_tone);

        assert_eq!(rig.session.shutdown(), 1);
        rig.run(1);
        assert!(rig.session.cache().is_empty());
        assert!(!rig.session.status().test_tone);
        assert_eq!(rig.engine.atomics().active_voices(), 0);
    }

    #[test]
    fn test_full_queue_releases_voice_acquisition() {
        let mut rig = rig();
        // Nothing drains the queue: fill it with cheap commands
        while rig.session.set_master_volume(1.0).is_ok() {}
        assert!(matches!(
            rig.session.load_stem(Deck::A, Stem::Bass, "songA", None),
            Err(SessionError::QueueFull)
        ));
        assert!(rig.session.cache().is_empty());
        assert!(rig.session.slot_source(Deck::A, Stem::Bass).is_none());
    }

    #[test]
    fn test_levels_never_exceed_unity() {
        let mut rig = rig();
        let dir = TempDir::new().unwrap();
        let path = write_tone(dir.path(), "hot.wav", 220.0, 0.5);
        rig.session.load_buffer(1000, &path, "Hot_bass").unwrap();
        rig.session.play_buffer(1000, 1.0, 1.7, true, 0.0, None).unwrap();
        rig.session.set_crossfade_levels(1.9, 0.0).unwrap();
        rig.session.set_stem_volume(Stem::Bass, 3.0).unwrap();
        rig.session.set_master_volume(1.2).unwrap();
        rig.run(2);

        assert!(rig.engine.voice(Deck::A, Stem::Bass).unwrap().gain() <= 1.0);
        let status = rig.session.status();
        assert_eq!(status.deck_levels[0], 1.0);
        assert_eq!(status.stem_volumes[Stem::Bass.index()], 1.0);
        assert_eq!(status.master_volume, 1.0);

        rig.session.set_buffer_volume(1000, 4.0).unwrap();
        rig.run(1);
        assert!(rig.engine.voice(Deck::A, Stem::Bass).unwrap().gain() <= 1.0);
    }

    #[test]
    fn test_load_song_fills_deck() {
        let mut rig = rig();
        rig.session.load_stem(Deck::B, Stem::Bass, "songA", None).unwrap();
        rig.run(1);

        assert!(matches!(rig.session.load_song(Deck::B, "nope"), Err(SessionError::UnknownSong(_))));
        assert_eq!(rig.session.load_song(Deck::B, "song9").unwrap(), 2);
        rig.run(2);

        assert_eq!(rig.session.slot_source(Deck::B, Stem::Bass), Some("song9"));
        assert_eq!(rig.session.slot_source(Deck::B, Stem::Drums), Some("song9"));
        assert!(rig.session.slot_source(Deck::B, Stem::Vocals).is_none());
        assert!(!rig.session.cache().is_resident("songA_bass"));
        assert_eq!(rig.engine.atomics().active_voices(), 2);
    }

    #[test]
    fn test_set_section_rewindows_loaded_stem() {
        let mut rig = rig();
        assert!(matches!(
            rig.session.set_section(Deck::A, Stem::Bass, "drop"),
            Err(SessionError::EmptySlot { .. })
        ));

        rig.session.load_stem(Deck::A, Stem::Bass, "songA", None).unwrap();
        rig.run(1);
        assert_eq!(rig.engine.voice(Deck::A, Stem::Bass).unwrap().window(), (0, 22050));

        assert!(matches!(
            rig.session.set_section(Deck::A, Stem::Bass, "bridge"),
            Err(SessionError::UnknownSection { .. })
        ));
        rig.session.set_section(Deck::A, Stem::Bass, "drop").unwrap();
        rig.run(1);
        let voice = rig.engine.voice(Deck::A, Stem::Bass).unwrap();
        assert_eq!(voice.window(), (4410, 8820));
        assert!(voice.is_looping());
        assert_eq!(rig.session.cache().decode_count(), 1);
        let handle = rig.session.slots[Deck::A.index()][Stem::Bass.index()].as_ref().unwrap().handle;
        assert_eq!(rig.session.cache().refcount(handle), 1);

        // Buffers carry no sections
        let dir = TempDir::new().unwrap();
        let path = write_tone(dir.path(), "loop.wav", 220.0, 0.5);
        rig.session.load_buffer(1000, &path, "Loop_drums").unwrap();
        rig.session.play_buffer(1000, 1.0, 1.0, true, 0.0, None).unwrap();
        assert!(matches!(
            rig.session.set_section(Deck::A, Stem::Drums, "drop"),
            Err(SessionError::EmptySlot { .. })
        ));
    }
}
