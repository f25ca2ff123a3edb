//! Song catalog - read-only manifest of songs and their stem files
//!
//! The manifest is produced by an external analysis step and read once at
//! startup. YAML and JSON are both accepted:
//!
//! ```yaml
//! songs:
//!   - id: song7
//!     name: Night Drive
//!     key: 8A
//!     bpm: 128
//!     stems:
//!       bass: stems/night_drive/bass.wav
//!       drums: stems/night_drive/drums.wav
//!     sections:
//!       - { label: intro, start: 0.0, end: 15.0 }
//!       - { label: drop, start: 45.0, end: 75.0 }
//! ```
//!
//! Relative stem paths are resolved against the manifest's directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::music::Key;
use crate::types::Stem;

/// A named, time-bounded region of a song (seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub label: String,
    pub start: f64,
    pub end: f64,
}

impl Section {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Catalog entry for one song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: Option<Key>,
    pub bpm: f64,
    #[serde(default)]
    pub stems: HashMap<Stem, PathBuf>,
    /// Beat grid in seconds
    #[serde(default)]
    pub beats: Vec<f64>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Song {
    pub fn new(id: impl Into<String>, bpm: f64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            key: None,
            bpm,
            stems: HashMap::new(),
            beats: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_stem(mut self, stem: Stem, path: impl Into<PathBuf>) -> Self {
        self.stems.insert(stem, path.into());
        self
    }

    pub fn with_section(mut self, label: impl Into<String>, start: f64, end: f64) -> Self {
        self.sections.push(Section {
            label: label.into(),
            start,
            end,
        });
        self
    }

    /// First section with this label (case-insensitive)
    pub fn section(&self, label: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.label.eq_ignore_ascii_case(label))
    }

    pub fn stem_path(&self, stem: Stem) -> Option<&Path> {
        self.stems.get(&stem).map(PathBuf::as_path)
    }

    /// Cache identifier of one of this song's stems
    pub fn asset_id(&self, stem: Stem) -> String {
        format!("{}_{}", self.id, stem.name())
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in self.stems.values_mut() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    songs: Vec<Song>,
}

/// Read-only map of song id to [`Song`]
#[derive(Debug, Clone, Default)]
pub struct SongCatalog {
    songs: HashMap<String, Song>,
}

impl SongCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a manifest; `.json` files are read as JSON, anything else as YAML
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read catalog {:?}", path))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let mut catalog = if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
        .with_context(|| format!("Invalid catalog {:?}", path))?;

        if let Some(base) = path.parent() {
            for song in catalog.songs.values_mut() {
                song.resolve_paths(base);
            }
        }

        log::info!("Loaded {} songs from {:?}", catalog.len(), path);
        Ok(catalog)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(yaml).context("Failed to parse YAML catalog")?;
        Ok(Self::from_songs(manifest.songs))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(json).context("Failed to parse JSON catalog")?;
        Ok(Self::from_songs(manifest.songs))
    }

    /// Build from songs; a later duplicate id replaces an earlier one
    pub fn from_songs(songs: impl IntoIterator<Item = Song>) -> Self {
        let mut catalog = Self::new();
        for song in songs {
            catalog.insert(song);
        }
        catalog
    }

    pub fn insert(&mut self, song: Song) {
        if let Some(previous) = self.songs.insert(song.id.clone(), song) {
            log::warn!("Duplicate catalog id '{}', keeping the later entry", previous.id);
        }
    }

    /// Add songs from `other` that this catalog doesn't know yet
    pub fn merge(&mut self, other: SongCatalog) {
        for (id, song) in other.songs {
            self.songs.entry(id).or_insert(song);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Song> {
        self.songs.get(id)
    }

    /// Look up by id, falling back to a case-insensitive name match
    pub fn find(&self, id_or_name: &str) -> Option<&Song> {
        self.get(id_or_name).or_else(|| {
            self.songs
                .values()
                .find(|song| song.name.eq_ignore_ascii_case(id_or_name))
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.songs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    /// Song ids in sorted order
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.songs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn songs(&self) -> impl Iterator<Item = &Song> {
        self.songs.values()
    }
}
