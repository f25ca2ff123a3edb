//! Audio output configuration

use serde::{Deserialize, Serialize};

use crate::engine::{DEFAULT_BLOCK_SIZE, DEFAULT_RING_BLOCKS, MAX_BLOCK_SIZE};
use crate::types::SAMPLE_RATE;

/// Device buffer sizes outside this range are clamped
pub const MIN_DEVICE_BUFFER: u32 = 64;
pub const MAX_DEVICE_BUFFER: u32 = 8192;

/// Configuration of the output device and render block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output device name (None = system default)
    pub device: Option<String>,

    /// Requested sample rate; the device may force another one
    pub sample_rate: u32,

    /// Render block size in frames
    pub block_size: usize,

    /// Device callback buffer in frames (None = let the host choose)
    pub device_buffer: Option<u32>,

    /// Blocks of audio buffered between the render thread and the device
    pub ring_blocks: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            device_buffer: None,
            ring_blocks: DEFAULT_RING_BLOCKS,
        }
    }
}

impl AudioConfig {
    /// Block size clamped to what the engine pre-allocates
    pub fn effective_block_size(&self) -> usize {
        self.block_size.clamp(32, MAX_BLOCK_SIZE)
    }

    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.device = Some(name.into());
        self
    }

    /// Output latency of the sample ring in milliseconds
    pub fn ring_latency_ms(&self, sample_rate: u32) -> f32 {
        let frames = self.effective_block_size() * self.ring_blocks.max(2);
        frames as f32 / sample_rate.max(1) as f32 * 1000.0
    }
}
