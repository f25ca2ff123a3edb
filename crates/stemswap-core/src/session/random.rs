//! Random mixes for auditioning a catalog

use std::ops::Range;

use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use serde::Serialize;

use super::{Session, SessionError, SessionResult};
use crate::types::{Deck, Stem};

/// Tempo range a random mix picks from
pub const RANDOM_BPM_RANGE: Range<f64> = 90.0..160.0;

/// What [`Session::random_mix`] chose
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RandomMix {
    pub bpm: f64,
    pub crossfade: f32,
    pub deck_a: Option<String>,
    pub deck_b: Option<String>,
    pub stems: Vec<Stem>,
    /// Stems actually started across both decks
    pub loaded: usize,
}

impl Session {
    /// Pick a tempo, a crossfader position and two songs at random
    ///
    /// Two to four stem types are loaded on both decks, deck A from one song
    /// and deck B from the other. Each stem loops a random section of the
    /// deck A song; deck B uses the same section when its song has it and
    /// the whole song otherwise. With fewer than two songs in the catalog
    /// only tempo and crossfader change.
    pub fn random_mix<R: Rng + ?Sized>(&mut self, rng: &mut R) -> SessionResult<RandomMix> {
        let bpm = self.set_global_bpm(rng.random_range(RANDOM_BPM_RANGE))?;
        let crossfade = rng.random_range(0.0..=1.0f32);
        self.set_crossfade(crossfade)?;

        let ids: Vec<String> = self.catalog.ids().into_iter().map(str::to_string).collect();
        let mut mix = RandomMix {
            bpm,
            crossfade: self.crossfade,
            deck_a: None,
            deck_b: None,
            stems: Vec::new(),
            loaded: 0,
        };
        if ids.len() < 2 {
            log::info!("Random mix: {:.0} BPM, catalog too small for songs", bpm);
            return Ok(mix);
        }

        let (Some(song_a), Some(song_b)) = (ids.choose(rng).cloned(), ids.choose(rng).cloned()) else {
            return Ok(mix);
        };
        let mut stems = Stem::ALL;
        stems.shuffle(rng);
        let count = rng.random_range(2..=4);
        mix.stems = stems[..count].to_vec();

        let labels = self.section_labels(&song_a);
        for &stem in &mix.stems {
            let section = labels.choose(rng).cloned();
            for (deck, song_id) in [(Deck::A, &song_a), (Deck::B, &song_b)] {
                let section = section.as_deref().filter(|label| self.has_section(song_id, label));
                match self.load_stem(deck, stem, song_id, section) {
                    Ok(_) => mix.loaded += 1,
                    Err(SessionError::QueueFull) => return Err(SessionError::QueueFull),
                    Err(e) => log::debug!("Random mix: skipping {}/{} from {}: {}", deck, stem, song_id, e),
                }
            }
        }

        log::info!(
            "Random mix: {:.0} BPM, A = {}, B = {}, {} stems started",
            bpm,
            song_a,
            song_b,
            mix.loaded
        );
        mix.deck_a = Some(song_a);
        mix.deck_b = Some(song_b);
        Ok(mix)
    }

    /// Distinct section labels of a song, in song order
    fn section_labels(&self, song_id: &str) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        if let Some(song) = self.catalog.get(song_id) {
            for section in &song.sections {
                if !labels.iter().any(|l| l.eq_ignore_ascii_case(&section.label)) {
                    labels.push(section.label.clone());
                }
            }
        }
        labels
    }

    fn has_section(&self, song_id: &str, label: &str) -> bool {
        self.catalog
            .get(song_id)
            .is_some_and(|song| song.section(label).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::write_tone;
    use crate::catalog::{Song, SongCatalog};
    use crate::engine::{EngineAtomics, EngineConfig, RenderEngine};
    use crate::session::{SessionConfig, MAX_BPM, MIN_BPM};
    use crate::types::StereoBuffer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn session(catalog: SongCatalog) -> (Session, RenderEngine) {
        let atomics = Arc::new(EngineAtomics::new());
        let (engine, tx, events) = RenderEngine::with_channels(EngineConfig::default(), atomics.clone());
        let session = Session::new(catalog, tx, events, atomics, SessionConfig::default());
        (session, engine)
    }

    fn full_song(dir: &TempDir, id: &str, freq: f32) -> Song {
        let mut song = Song::new(id, 128.0);
        for stem in Stem::ALL {
            let path = write_tone(dir.path(), &format!("{}_{}.wav", id, stem), freq, 0.5);
            song = song.with_stem(stem, path);
        }
        song.with_section("verse", 0.0, 0.2).with_section("chorus", 0.2, 0.4)
    }

    #[test]
    fn test_random_mix_loads_both_decks() {
        let dir = TempDir::new().unwrap();
        let catalog = SongCatalog::from_songs([full_song(&dir, "one", 220.0), full_song(&dir, "two", 330.0)]);
        let (mut session, mut engine) = session(catalog);

        let mix = session.random_mix(&mut StdRng::seed_from_u64(11)).unwrap();
        assert!(RANDOM_BPM_RANGE.contains(&mix.bpm));
        assert!((0.0..=1.0).contains(&mix.crossfade));
        assert!((2..=4).contains(&mix.stems.len()));
        assert_eq!(mix.loaded, mix.stems.len() * 2);

        let mut out = StereoBuffer::silence(256);
        engine.process(&mut out);
        session.poll();
        for &stem in &mix.stems {
            assert_eq!(session.slot_source(Deck::A, stem), mix.deck_a.as_deref());
            assert_eq!(session.slot_source(Deck::B, stem), mix.deck_b.as_deref());
            // Every stem loops one of the sections
            let (start, end) = engine.voice(Deck::A, stem).unwrap().window();
            assert!(matches!((start, end), (0, 8820) | (8820, 17640)), "{:?}", (start, end));
        }
        assert_eq!(session.global_bpm(), mix.bpm);
    }

    #[test]
    fn test_random_mix_is_reproducible_from_a_seed() {
        let dir = TempDir::new().unwrap();
        let songs = [full_song(&dir, "one", 220.0), full_song(&dir, "two", 330.0), full_song(&dir, "three", 440.0)];

        let (mut first, _e1) = session(SongCatalog::from_songs(songs.clone()));
        let (mut second, _e2) = session(SongCatalog::from_songs(songs));
        assert_eq!(
            first.random_mix(&mut StdRng::seed_from_u64(5)).unwrap(),
            second.random_mix(&mut StdRng::seed_from_u64(5)).unwrap()
        );
    }

    #[test]
    fn test_random_mix_with_small_catalog_only_moves_the_mix() {
        let dir = TempDir::new().unwrap();
        let (mut session, _engine) = session(SongCatalog::from_songs([full_song(&dir, "solo", 220.0)]));

        let mix = session.random_mix(&mut StdRng::seed_from_u64(1)).unwrap();
        assert!(mix.bpm >= MIN_BPM && mix.bpm <= MAX_BPM);
        assert!(mix.deck_a.is_none());
        assert_eq!(mix.loaded, 0);
        assert_eq!(session.cache().len(), 0);
    }
}
