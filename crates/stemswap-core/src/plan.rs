//! Remix plans - pre-computed section-by-section stem assignments
//!
//! A plan is a JSON document produced by an offline planner:
//!
//! ```json
//! {
//!   "theme": "sunset",
//!   "base_song": "Night Drive (Extended)",
//!   "base_bpm": 128.0,
//!   "base_key": "8A",
//!   "structure": ["intro", "verse", "chorus"],
//!   "sections": {
//!     "01_intro": {
//!       "type": "intro",
//!       "stems": {
//!         "bass": { "song": "Night Drive (Extended)", "file": "stems/nd/bass.wav",
//!                   "bpm": 128.0, "key": "8A", "pitch_shift": 1.0, "needs_timestretch": false }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Sections are replayed in the sorted order of their names. The session
//! turns each plan stem into a regular `load_stem`, so the plan is first
//! folded into a [`SongCatalog`] with [`RemixPlan::to_catalog`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::{Song, SongCatalog};
use crate::music::Key;
use crate::types::Stem;

/// One stem assignment inside a plan section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStem {
    /// Song label; anything from the first `(` on is decoration
    pub song: String,
    pub file: PathBuf,
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default)]
    pub key: Option<String>,
    /// Playback rate the planner chose for this stem
    #[serde(default = "unity")]
    pub pitch_shift: f64,
    #[serde(default)]
    pub needs_timestretch: bool,
}

fn unity() -> f64 {
    1.0
}

impl PlanStem {
    /// Catalog id of the song this stem comes from
    pub fn song_id(&self) -> &str {
        self.song.split('(').next().unwrap_or(&self.song).trim()
    }

    pub fn parsed_key(&self) -> Option<Key> {
        self.key.as_deref().and_then(Key::parse)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanSection {
    #[serde(rename = "type", default)]
    pub section_type: String,
    #[serde(default)]
    pub stems: BTreeMap<Stem, PlanStem>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemixPlan {
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub base_song: String,
    #[serde(default)]
    pub base_bpm: Option<f64>,
    #[serde(default)]
    pub base_key: Option<String>,
    #[serde(default)]
    pub structure: Vec<String>,
    #[serde(default)]
    pub sections: BTreeMap<String, PlanSection>,
}

impl RemixPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read plan {:?}", path))?;
        let plan = Self::from_json_str(&contents).with_context(|| format!("Invalid plan {:?}", path))?;
        log::info!(
            "Loaded plan '{}' from {:?}: {} sections, structure {}",
            plan.theme,
            path,
            plan.sections.len(),
            plan.structure.join(" -> ")
        );
        Ok(plan)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse remix plan")
    }

    pub fn base_key(&self) -> Option<Key> {
        self.base_key.as_deref().and_then(Key::parse)
    }

    /// Section names in playback order
    pub fn section_names(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }

    pub fn section(&self, name: &str) -> Option<&PlanSection> {
        self.sections.get(name)
    }

    /// Section played after `current`
    pub fn next_section(&self, current: &str) -> Option<&str> {
        use std::ops::Bound;
        self.sections
            .range::<str, _>((Bound::Excluded(current), Bound::Unbounded))
            .next()
            .map(|(name, _)| name.as_str())
    }

    /// Fold every plan stem into catalog songs keyed by [`PlanStem::song_id`]
    ///
    /// A song's BPM is taken from its stems, or derived from the plan's base
    /// BPM and the chosen rate when the plan leaves it out.
    pub fn to_catalog(&self) -> SongCatalog {
        let mut songs: BTreeMap<String, Song> = BTreeMap::new();

        for section in self.sections.values() {
            for (&stem, entry) in &section.stems {
                let id = entry.song_id().to_string();
                let bpm = entry
                    .bpm
                    .or_else(|| self.base_bpm.map(|base| base / entry.pitch_shift.max(f64::EPSILON)))
                    .unwrap_or(crate::engine::DEFAULT_BPM);

                let song = songs.entry(id.clone()).or_insert_with(|| Song::new(id, bpm));
                if song.key.is_none() {
                    song.key = entry.parsed_key();
                }
                song.stems.entry(stem).or_insert_with(|| entry.file.clone());
            }
        }

        SongCatalog::from_songs(songs.into_values())
    }
}
