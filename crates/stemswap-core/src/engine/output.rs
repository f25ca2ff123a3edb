//! Output pump - sample ring between the render thread and the device
//!
//! ```text
//!   ┌────────────────┐  push()  ┌──────────────────┐  pop()  ┌─────────────────┐
//!   │ render thread  │─────────►│ StereoSample ring│────────►│ device callback │
//!   │ RenderPump     │          │ (rtrb, N blocks) │         │ OutputReader    │
//!   └────────────────┘          └──────────────────┘         └─────────────────┘
//! ```
//!
//! The render thread keeps the ring topped up a whole block at a time. The
//! device callback consumes the ring block by block, whatever its own buffer
//! size: a block that is not fully available when the reader reaches it is
//! played as a block of silence and counted as one underrun.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::atomics::EngineAtomics;
use super::priority::elevate_current_thread;
use super::render::RenderEngine;
use crate::types::{StereoBuffer, StereoSample};

/// Default ring size in blocks
pub const DEFAULT_RING_BLOCKS: usize = 4;

/// Connect a render engine to a new sample ring of `ring_blocks` blocks
pub fn output_pump(engine: RenderEngine, ring_blocks: usize) -> (RenderPump, OutputReader) {
    let block_size = engine.block_size();
    let (producer, consumer) = rtrb::RingBuffer::new(block_size * ring_blocks.max(2));
    let reader = OutputReader {
        consumer,
        block_size,
        block_pos: 0,
        silent: false,
        atomics: engine.atomics().clone(),
    };
    let pump = RenderPump {
        block: StereoBuffer::silence(block_size),
        engine,
        producer,
    };
    (pump, reader)
}

/// Render side of the pump; owns the engine
pub struct RenderPump {
    engine: RenderEngine,
    producer: rtrb::Producer<StereoSample>,
    block: StereoBuffer,
}

impl RenderPump {
    /// Render blocks while the ring has room for a whole one
    ///
    /// Returns the number of blocks rendered.
    pub fn pump(&mut self) -> usize {
        let block_size = self.engine.block_size();
        let mut rendered = 0;
        while self.producer.slots() >= block_size {
            self.engine.process(&mut self.block);
            for sample in self.block.iter() {
                if self.producer.push(*sample).is_err() {
                    break;
                }
            }
            rendered += 1;
        }
        rendered
    }

    pub fn engine(&self) -> &RenderEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut RenderEngine {
        &mut self.engine
    }

    /// Duration of one block
    pub fn block_period(&self) -> Duration {
        Duration::from_secs_f64(self.engine.block_size() as f64 / self.engine.sample_rate() as f64)
    }
}

/// Device side of the pump
pub struct OutputReader {
    consumer: rtrb::Consumer<StereoSample>,
    block_size: usize,
    /// Frames of the current block already handed to the device
    block_pos: usize,
    /// The current block is a silent stand-in for a missed one
    silent: bool,
    atomics: Arc<EngineAtomics>,
}

impl OutputReader {
    /// Fill `out` from the ring
    ///
    /// Block boundaries carry over between calls, so a missed block counts
    /// once however the device slices its buffers.
    pub fn fill(&mut self, out: &mut [StereoSample]) {
        for frame in out.iter_mut() {
            *frame = self.next_frame();
        }
    }

    #[inline]
    fn next_frame(&mut self) -> StereoSample {
        if self.block_pos == 0 {
            self.silent = self.consumer.slots() < self.block_size;
            if self.silent {
                self.atomics.record_underrun();
            }
        }
        self.block_pos = (self.block_pos + 1) % self.block_size;
        if self.silent {
            StereoSample::silence()
        } else {
            self.consumer.pop().unwrap_or_default()
        }
    }

    /// Fill an interleaved device buffer with `channels` channels
    ///
    /// Channels beyond the first two are silent; a mono device gets left.
    pub fn fill_interleaved(&mut self, data: &mut [f32], channels: usize) {
        if channels == 2 {
            if let Ok(frames) = bytemuck::try_cast_slice_mut::<f32, StereoSample>(data) {
                self.fill(frames);
                return;
            }
        }
        let channels = channels.max(1);
        for frame in data.chunks_mut(channels) {
            let sample = self.next_frame();
            frame[0] = sample.left;
            if channels > 1 {
                frame[1] = sample.right;
            }
            for ch in frame.iter_mut().skip(2) {
                *ch = 0.0;
            }
        }
    }

    /// Frames ready to be played
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

/// Handle to the running render thread
pub struct RenderThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<RenderPump>>,
}

impl RenderThread {
    /// Start `stemswap-render` under real-time scheduling when the OS allows
    ///
    /// The thread pumps, then sleeps a quarter block period.
    pub fn spawn(mut pump: RenderPump) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let nap = pump.block_period() / 4;

        let handle = thread::Builder::new().name("stemswap-render".to_string()).spawn(move || {
            elevate_current_thread();
            log::info!("Render thread started ({} frames/block)", pump.engine().block_size());
            while flag.load(Ordering::Acquire) {
                pump.pump();
                thread::sleep(nap);
            }
            log::info!("Render thread stopped");
            pump
        })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the thread and get the pump (and its engine) back
    pub fn stop(mut self) -> Option<RenderPump> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<RenderPump> {
        self.running.store(false, Ordering::Release);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(pump) => Some(pump),
            Err(_) => {
                log::error!("Render thread panicked");
                None
            }
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetCache;
    use crate::engine::command::EngineCommand;
    use crate::engine::render::EngineConfig;
    use crate::engine::voice::tests::constant_voice;
    use crate::types::{Deck, Stem};

    const BLOCK: usize = 64;

    fn pump_with_voice() -> (RenderPump, OutputReader, Arc<EngineAtomics>) {
        let atomics = Arc::new(EngineAtomics::new());
        let config = EngineConfig {
            block_size: BLOCK,
            ..EngineConfig::default()
        };
        let (engine, mut tx, _events) = RenderEngine::with_channels(config, atomics.clone());
        let mut cache = AssetCache::new();
        let voice = constant_voice(&mut cache, "tone", 0.5, 44100, 44100).with_loop(true);
        tx.send(EngineCommand::StartVoice {
            deck: Deck::A,
            stem: Stem::Bass,
            voice: Box::new(voice),
        })
        .unwrap();

        let (pump, reader) = output_pump(engine, 2);
        (pump, reader, atomics)
    }

    #[test]
    fn test_pump_fills_ring_in_whole_blocks() {
        let (mut pump, reader, _atomics) = pump_with_voice();
        assert_eq!(pump.pump(), 2);
        assert_eq!(reader.available(), 2 * BLOCK);
        assert_eq!(pump.pump(), 0);
    }

    #[test]
    fn test_underrun_yields_silence_and_recovers() {
        let (mut pump, mut reader, atomics) = pump_with_voice();
        let mut out = vec![StereoSample::silence(); 2 * BLOCK];

        pump.pump();
        reader.fill(&mut out);
        assert_eq!(atomics.underruns(), 0);
        assert!(out[BLOCK + 1].left > 0.0);

        // Render thread stalls for three blocks
        let mut stalled = vec![StereoSample::mono(1.0); 3 * BLOCK];
        reader.fill(&mut stalled);
        assert!(stalled.iter().all(|s| *s == StereoSample::silence()));
        assert_eq!(atomics.underruns(), 3);

        pump.pump();
        reader.fill(&mut out);
        assert!(out.iter().all(|s| s.left > 0.0));
        assert_eq!(atomics.underruns(), 3);
    }

    #[test]
    fn test_missed_block_counts_once_for_odd_device_buffers() {
        let (mut pump, mut reader, atomics) = pump_with_voice();
        // 48-frame device buffers against 64-frame blocks
        let mut out = vec![StereoSample::mono(1.0); 48];

        // Nothing rendered: 4 × 48 = 3 whole missed blocks
        for _ in 0..4 {
            reader.fill(&mut out);
            assert!(out.iter().all(|s| *s == StereoSample::silence()));
        }
        assert_eq!(atomics.underruns(), 3);

        pump.pump();
        reader.fill(&mut out);
        // The voice fades in from silence over its first block
        assert!(out[1..].iter().all(|s| s.left > 0.0));
        reader.fill(&mut out);
        assert!(out.iter().all(|s| s.left > 0.0));
        // 96 of 128 frames consumed; the next call crosses into an empty ring
        reader.fill(&mut out);
        assert!(out[..32].iter().all(|s| s.left > 0.0));
        assert!(out[32..].iter().all(|s| *s == StereoSample::silence()));
        assert_eq!(atomics.underruns(), 4);
    }

    #[test]
    fn test_interleaved_fill() {
        let (mut pump, mut reader, atomics) = pump_with_voice();
        pump.pump();
        pump.pump();

        let mut data = vec![9.0f32; BLOCK * 4];
        reader.fill_interleaved(&mut data, 4);
        assert_eq!(atomics.underruns(), 0);
        assert_eq!(data[2], 0.0);
        assert_eq!(data[3], 0.0);
        assert_eq!(pump.pump(), 1);

        let mut more = vec![9.0f32; BLOCK * 2 * 2];
        reader.fill_interleaved(&mut more, 2);
        assert_eq!(atomics.underruns(), 0);
        assert!(more[BLOCK * 2 + 2] > 0.0);

        reader.fill_interleaved(&mut more, 2);
        assert_eq!(atomics.underruns(), 2);
        assert!(more.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_render_thread_keeps_ring_full() {
        let (pump, reader, atomics) = pump_with_voice();
        let thread = RenderThread::spawn(pump).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reader.available() < 2 * BLOCK && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(reader.available(), 2 * BLOCK);
        assert!(atomics.blocks_rendered() >= 2);

        let pump = thread.stop().expect("pump returned");
        assert!(pump.engine().voice(Deck::A, Stem::Bass).is_some());
    }
}
