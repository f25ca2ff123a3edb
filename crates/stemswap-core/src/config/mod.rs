//! Mixer configuration
//!
//! Stored as YAML (see [`default_config_path`]). Every section and field has
//! a default, so a partial file only overrides what it names:
//!
//! ```yaml
//! audio:
//!   block_size: 128
//! mixing:
//!   swap_fade_seconds: 4.0
//!   stem_volumes: { drums: 1.0 }
//! network:
//!   listen: 0.0.0.0:57120
//! ```

mod io;
mod paths;

pub use io::{load_config, save_config};
pub use paths::{config_dir, default_catalog_path, default_config_path};

use serde::{Deserialize, Serialize};

use crate::audio::AudioConfig;
use crate::engine::{
    fade_blocks_for, EngineConfig, InterpolationMethod, MixState, DEFAULT_BPM, DEFAULT_MASTER_VOLUME,
    DEFAULT_STEM_VOLUMES, DEFAULT_SWAP_FADE_SECONDS,
};
use crate::music::TempoTolerance;
use crate::types::Stem;

/// Default UDP address of the control protocol
pub const DEFAULT_LISTEN: &str = "127.0.0.1:57120";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    pub audio: AudioConfig,
    pub mixing: MixingConfig,
    pub network: NetworkConfig,
}

impl MixerConfig {
    /// Render engine parameters at the rate the device actually runs at
    pub fn engine_config(&self, sample_rate: u32) -> EngineConfig {
        let block_size = self.audio.effective_block_size();
        EngineConfig {
            sample_rate,
            block_size,
            swap_fade_blocks: fade_blocks_for(self.mixing.swap_fade_seconds, sample_rate, block_size),
            mix: self.mixing.initial_mix(),
        }
    }
}

/// Per-stem-type volume multipliers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StemVolumes {
    pub bass: f32,
    pub drums: f32,
    pub vocals: f32,
    pub piano: f32,
    pub other: f32,
}

impl Default for StemVolumes {
    fn default() -> Self {
        Self::from_array(DEFAULT_STEM_VOLUMES)
    }
}

impl StemVolumes {
    pub fn from_array(levels: [f32; 5]) -> Self {
        Self {
            bass: levels[0],
            drums: levels[1],
            vocals: levels[2],
            piano: levels[3],
            other: levels[4],
        }
    }

    /// Levels in [`Stem`] slot order
    pub fn to_array(&self) -> [f32; 5] {
        [self.bass, self.drums, self.vocals, self.piano, self.other]
    }

    pub fn get(&self, stem: Stem) -> f32 {
        self.to_array()[stem.index()]
    }
}

/// Mixing behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixingConfig {
    /// Length of each crossfade phase of a stem swap
    pub swap_fade_seconds: f64,
    pub stem_volumes: StemVolumes,
    pub master_volume: f32,
    pub initial_bpm: f64,
    pub interpolation: InterpolationMethod,
    /// Tempo window a swap must fall in
    pub tempo_tolerance: TempoTolerance,
}

impl Default for MixingConfig {
    fn default() -> Self {
        Self {
            swap_fade_seconds: DEFAULT_SWAP_FADE_SECONDS,
            stem_volumes: StemVolumes::default(),
            master_volume: DEFAULT_MASTER_VOLUME,
            initial_bpm: DEFAULT_BPM,
            interpolation: InterpolationMethod::default(),
            tempo_tolerance: TempoTolerance::Relaxed,
        }
    }
}

impl MixingConfig {
    /// Mix state the render engine starts with (deck A up, deck B down)
    pub fn initial_mix(&self) -> MixState {
        let mut mix = MixState {
            global_bpm: self.initial_bpm,
            interpolation: self.interpolation,
            ..MixState::default()
        };
        mix.set_master_volume(self.master_volume);
        for stem in Stem::ALL {
            mix.set_stem_volume(stem, self.stem_volumes.get(stem));
        }
        mix
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address the OSC server binds
    pub listen: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}
