//! Asset cache - decoded stem audio keyed by stable identifier
//!
//! The cache is an arena of slots addressed by [`AssetHandle`]
//! (index + generation). Every `acquire` must be matched by exactly one
//! `release`; when the reference count reaches zero the entry is removed
//! and the slot generation is bumped, so stale handles resolve to nothing.
//!
//! # Ownership across threads
//!
//! Decoded audio lives in a `basedrop::Shared<AudioAsset>`. Voices handed to
//! the render engine hold their own clone of that pointer, so evicting an
//! entry never waits for a block that is still reading it: the cache drops
//! its reference immediately and the memory is reclaimed on the
//! `audio-gc` thread once the last voice lets go.
//!
//! The cache itself is owned by the control context and is never touched
//! by the render thread.

mod decode;
mod error;
mod loader;

use std::collections::HashMap;
use std::path::Path;

use basedrop::Shared;

use crate::engine::gc::gc_handle;
use crate::types::{StereoBuffer, StereoSample};

pub use decode::decode_file;
pub use error::{AssetError, AssetResult};
pub use loader::{AssetLoader, LoadRequest, LoadResult};

/// Decoded PCM for one stem file
#[derive(Debug)]
pub struct AudioAsset {
    frames: StereoBuffer,
    sample_rate: u32,
    channels: u16,
}

impl AudioAsset {
    /// Wrap decoded stereo frames
    ///
    /// `channels` records the source channel count; the frames are always
    /// stereo.
    pub fn new(frames: StereoBuffer, sample_rate: u32, channels: u16) -> Self {
        Self {
            frames,
            sample_rate,
            channels,
        }
    }

    #[inline]
    pub fn frames(&self) -> &[StereoSample] {
        self.frames.as_slice()
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames.len() as f64 / self.sample_rate as f64
    }

    /// Convert a time in seconds to a frame index in this asset
    pub fn seconds_to_frame(&self, seconds: f64) -> usize {
        (seconds.max(0.0) * self.sample_rate as f64).round() as usize
    }

    pub fn byte_size(&self) -> usize {
        self.frames.byte_size()
    }
}

/// Stable reference to a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetHandle {
    index: u32,
    generation: u32,
}

impl AssetHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Entry {
    id: String,
    asset: Shared<AudioAsset>,
    refcount: u32,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Arena cache of decoded assets with explicit acquire/release
#[derive(Default)]
pub struct AssetCache {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_id: HashMap<String, usize>,
    decode_count: u64,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `id`, decoding `path` synchronously if it is not resident
    ///
    /// A resident asset is returned without touching the file system.
    pub fn acquire(&mut self, id: &str, path: &Path) -> AssetResult<AssetHandle> {
        if let Some(handle) = self.retain_id(id) {
            return Ok(handle);
        }

        let asset = decode_file(path)?;
        self.decode_count += 1;
        log::info!(
            "AssetCache: decoded {} ({:.1}s, {:.1} MB)",
            id,
            asset.duration_seconds(),
            asset.byte_size() as f64 / (1024.0 * 1024.0)
        );
        Ok(self.insert(id, asset))
    }

    /// Acquire `id` with an asset that was decoded off-thread
    ///
    /// If `id` became resident while the decode was running, the new copy
    /// is dropped and the resident entry is shared instead.
    pub fn acquire_decoded(&mut self, id: &str, asset: AudioAsset) -> AssetHandle {
        if let Some(handle) = self.retain_id(id) {
            log::debug!("AssetCache: {} already resident, dropping duplicate decode", id);
            return handle;
        }
        self.decode_count += 1;
        self.insert(id, asset)
    }

    /// Take an extra reference on a live handle
    ///
    /// Returns false for a stale handle.
    pub fn retain(&mut self, handle: AssetHandle) -> bool {
        match self.entry_mut(handle) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one reference; the entry is evicted when none remain
    ///
    /// Returns true if this release evicted the asset. Releasing a stale
    /// handle is a logged no-op.
    pub fn release(&mut self, handle: AssetHandle) -> bool {
        let index = handle.index as usize;
        let Some(entry) = self.entry_mut(handle) else {
            log::warn!("AssetCache: release of stale handle {:?}", handle);
            return false;
        };

        entry.refcount -= 1;
        if entry.refcount > 0 {
            return false;
        }

        let slot = &mut self.slots[index];
        if let Some(entry) = slot.entry.take() {
            self.by_id.remove(&entry.id);
            log::info!("AssetCache: evicted {}", entry.id);
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        true
    }

    /// Shared pointer to the decoded audio behind `handle`
    pub fn get(&self, handle: AssetHandle) -> Option<&Shared<AudioAsset>> {
        self.entry(handle).map(|e| &e.asset)
    }

    /// Identifier behind `handle`
    pub fn id_of(&self, handle: AssetHandle) -> Option<&str> {
        self.entry(handle).map(|e| e.id.as_str())
    }

    pub fn refcount(&self, handle: AssetHandle) -> u32 {
        self.entry(handle).map(|e| e.refcount).unwrap_or(0)
    }

    pub fn is_resident(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Number of resident assets
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Total decodes performed since the cache was created
    pub fn decode_count(&self) -> u64 {
        self.decode_count
    }

    /// Bytes of sample data currently resident
    pub fn resident_bytes(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .map(|e| e.asset.byte_size())
            .sum()
    }

    /// Evict everything regardless of reference counts (session teardown)
    pub fn release_all(&mut self) -> usize {
        let mut evicted = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
                evicted += 1;
            }
        }
        self.by_id.clear();
        evicted
    }

    fn retain_id(&mut self, id: &str) -> Option<AssetHandle> {
        let index = *self.by_id.get(id)?;
        let slot = &mut self.slots[index];
        let entry = slot.entry.as_mut()?;
        entry.refcount += 1;
        Some(AssetHandle {
            index: index as u32,
            generation: slot.generation,
        })
    }

    fn insert(&mut self, id: &str, asset: AudioAsset) -> AssetHandle {
        let entry = Entry {
            id: id.to_string(),
            asset: Shared::new(&gc_handle(), asset),
            refcount: 1,
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.entry = Some(entry);
        self.by_id.insert(id.to_string(), index);

        AssetHandle {
            index: index as u32,
            generation: slot.generation,
        }
    }

    fn entry(&self, handle: AssetHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: AssetHandle) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }
}
