//! cpal output stream fed by the output pump
//!
//! Opening happens in two steps so the render engine can be built at the
//! rate the device actually runs at:
//!
//! ```ignore
//! let output = AudioOutput::open(&config.audio)?;
//! let engine = RenderEngine::new(EngineConfig { sample_rate: output.sample_rate(), .. }, ..);
//! let (pump, reader) = output_pump(engine, config.audio.ring_blocks);
//! let handle = output.start(reader, atomics)?;
//! ```

use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, SampleRate, Stream, StreamConfig};

use super::config::{AudioConfig, MAX_DEVICE_BUFFER, MIN_DEVICE_BUFFER};
use super::device::{default_device, find_device};
use super::error::{AudioError, AudioResult};
use crate::engine::{EngineAtomics, OutputReader};

/// An opened but not yet running output device
pub struct AudioOutput {
    device: cpal::Device,
    device_name: String,
    stream_config: StreamConfig,
}

impl AudioOutput {
    /// Pick the device and negotiate an f32 stereo configuration
    pub fn open(config: &AudioConfig) -> AudioResult<Self> {
        let device = match &config.device {
            Some(name) => find_device(name)?,
            None => default_device()?,
        };
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using audio device: {}", device_name);

        let supported = negotiate(&device, config.sample_rate)?;
        let buffer_size = match config.device_buffer {
            Some(frames) => CpalBufferSize::Fixed(frames.clamp(MIN_DEVICE_BUFFER, MAX_DEVICE_BUFFER)),
            None => CpalBufferSize::Default,
        };
        let stream_config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size,
        };

        log::info!(
            "Audio config: {} channels, {}Hz, buffer {:?}",
            stream_config.channels,
            stream_config.sample_rate.0,
            stream_config.buffer_size
        );

        Ok(Self {
            device,
            device_name,
            stream_config,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.stream_config.sample_rate.0
    }

    pub fn channels(&self) -> u16 {
        self.stream_config.channels
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Build and start the stream
    ///
    /// A stream error reporting the device as gone marks `atomics` as
    /// device-lost; the control context treats that as fatal.
    pub fn start(self, mut reader: OutputReader, atomics: Arc<EngineAtomics>) -> AudioResult<AudioHandle> {
        let channels = self.stream_config.channels as usize;

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    reader.fill_interleaved(data, channels);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                        atomics.mark_device_lost();
                    }
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream.play().map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
        log::info!("Audio stream started on {}", self.device_name);

        Ok(AudioHandle {
            _stream: stream,
            device_name: self.device_name,
            sample_rate: self.stream_config.sample_rate.0,
            channels: self.stream_config.channels,
        })
    }
}

/// Keeps the stream alive; drop it to stop audio
pub struct AudioHandle {
    _stream: Stream,
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

impl AudioHandle {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

/// Best f32 configuration, at `target_rate` when the device allows it
fn negotiate(device: &cpal::Device, target_rate: u32) -> AudioResult<cpal::SupportedStreamConfig> {
    let configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    let in_range = |c: &&cpal::SupportedStreamConfigRange| {
        target_rate >= c.min_sample_rate().0 && target_rate <= c.max_sample_rate().0
    };

    let best = configs
        .iter()
        .filter(|c| c.channels() >= 2)
        .find(in_range)
        .or_else(|| configs.iter().find(in_range))
        .or_else(|| configs.iter().find(|c| c.channels() >= 2))
        .or_else(|| configs.first())
        .ok_or_else(|| AudioError::UnsupportedFormat("device offers no f32 output".to_string()))?;

    let rate = if in_range(&best) {
        SampleRate(target_rate)
    } else {
        let fallback = best.max_sample_rate();
        log::warn!(
            "Audio device doesn't support {}Hz, falling back to {}Hz (stems will be resampled)",
            target_rate,
            fallback.0
        );
        fallback
    };

    Ok(best.clone().with_sample_rate(rate))
}
