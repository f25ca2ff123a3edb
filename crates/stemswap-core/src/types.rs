//! Common types for stemswap
//!
//! Stem and deck identifiers plus the stereo sample/buffer types shared by
//! the asset cache, the render engine and the audio output.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default engine sample rate (44.1kHz, the rate stems are usually delivered at)
pub const SAMPLE_RATE: u32 = 44100;

/// Number of decks (A and B)
pub const NUM_DECKS: usize = 2;

/// Number of stem types per deck (Bass, Drums, Vocals, Piano, Other)
pub const NUM_STEMS: usize = 5;

/// Audio sample type
pub type Sample = f32;

/// Stem identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(usize)]
pub enum Stem {
    Bass = 0,
    Drums = 1,
    Vocals = 2,
    Piano = 3,
    Other = 4,
}

impl Stem {
    /// All stems in slot order
    pub const ALL: [Stem; NUM_STEMS] = [Stem::Bass, Stem::Drums, Stem::Vocals, Stem::Piano, Stem::Other];

    /// Slot index of this stem
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name, as used in file names and the control protocol
    pub fn name(&self) -> &'static str {
        match self {
            Stem::Bass => "bass",
            Stem::Drums => "drums",
            Stem::Vocals => "vocals",
            Stem::Piano => "piano",
            Stem::Other => "other",
        }
    }

    /// Resolve the stem type from a buffer name like `"Song Title_drums"`
    ///
    /// The stem type is the suffix after the last underscore. A bare stem
    /// name (`"drums"`) is accepted as well.
    pub fn from_stem_name(stem_name: &str) -> Option<Self> {
        let suffix = stem_name.rsplit('_').next().unwrap_or(stem_name);
        suffix.parse().ok()
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bass" => Ok(Stem::Bass),
            "drums" | "drum" => Ok(Stem::Drums),
            "vocals" | "vocal" | "vox" => Ok(Stem::Vocals),
            "piano" | "keys" => Ok(Stem::Piano),
            "other" => Ok(Stem::Other),
            other => Err(format!("unknown stem type '{}'", other)),
        }
    }
}

/// Deck identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum Deck {
    A = 0,
    B = 1,
}

impl Deck {
    pub const ALL: [Deck; NUM_DECKS] = [Deck::A, Deck::B];

    /// Buffer ids at or above this value bind to deck B
    pub const DECK_B_BUFFER_BASE: i32 = 1100;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Deck a raw protocol buffer id plays on
    pub fn for_buffer_id(buffer_id: i32) -> Self {
        if buffer_id < Self::DECK_B_BUFFER_BASE {
            Deck::A
        } else {
            Deck::B
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Deck::A => "A",
            Deck::B => "B",
        }
    }
}

impl fmt::Display for Deck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Deck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" | "0" => Ok(Deck::A),
            "B" | "1" => Ok(Deck::B),
            other => Err(format!("unknown deck '{}'", other)),
        }
    }
}

/// A single stereo sample (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This enables zero-copy conversion between `&[StereoSample]` and `&[f32]`
/// (interleaved format) using bytemuck.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Same value in both channels
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Peak amplitude (max of abs(left), abs(right))
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// A buffer of stereo samples
///
/// Used both for decoded stem audio and for the render engine's
/// pre-allocated block buffers.
#[derive(Debug, Clone, Default)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Create an empty buffer with the specified capacity (in stereo samples)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Create a buffer filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Create a buffer from interleaved samples with any channel count
    ///
    /// Mono is duplicated to both sides; for more than two channels only the
    /// first two are kept.
    pub fn from_interleaved(interleaved: &[Sample], channels: usize) -> Self {
        let channels = channels.max(1);
        let samples = interleaved
            .chunks_exact(channels)
            .map(|frame| match frame {
                [mono] => StereoSample::mono(*mono),
                [left, right, ..] => StereoSample::new(*left, *right),
                [] => StereoSample::silence(),
            })
            .collect();
        Self { samples }
    }

    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Set the working length of a pre-allocated buffer (real-time safe)
    ///
    /// Fills any newly exposed elements with silence. Never allocates as
    /// long as `new_len <= capacity`.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        let current_len = self.samples.len();
        if new_len > current_len {
            debug_assert!(new_len <= self.samples.capacity(), "set_len_from_capacity called with len > capacity");
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }

    /// Peak amplitude in the buffer
    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.peak()).fold(0.0, Sample::max)
    }

    /// RMS over both channels
    pub fn rms(&self) -> Sample {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|s| (s.left as f64).powi(2) + (s.right as f64).powi(2))
            .sum();
        (sum / (self.samples.len() * 2) as f64).sqrt() as Sample
    }

    /// Size of the sample data in bytes
    pub fn byte_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<StereoSample>()
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}
