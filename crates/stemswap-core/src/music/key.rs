//! Musical keys on the Camelot wheel
//!
//! A key is stored as root + mode; the Camelot position (1-12, A/B) is
//! derived from it. All harmonic distance math happens on wheel positions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Camelot numbers for major keys, indexed by root (0=C, 1=C#, ...)
const CAMELOT_MAJOR: [u8; 12] = [8, 3, 10, 5, 12, 7, 2, 9, 4, 11, 6, 1];
/// Camelot numbers for minor keys, indexed by root
const CAMELOT_MINOR: [u8; 12] = [5, 12, 7, 2, 9, 4, 11, 6, 1, 8, 3, 10];

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// How two keys relate on the wheel, ordered from most to least compatible
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRelation {
    Same,
    /// Same letter, number ±1
    Adjacent,
    /// Same number, other letter (relative major/minor)
    Relative,
    /// Same letter, number ±7
    Fifth,
    Unrelated,
}

/// Musical key with root note and mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key {
    /// Root note as semitone offset from C (0=C, 1=C#, ..., 11=B)
    pub root: u8,
    /// true = minor (Camelot A), false = major (Camelot B)
    pub minor: bool,
}

impl Key {
    pub const fn new(root: u8, minor: bool) -> Self {
        Self {
            root: root % 12,
            minor,
        }
    }

    /// Build a key from its Camelot position (`number` 1-12, `letter` A or B)
    pub fn from_camelot(number: u8, letter: char) -> Option<Self> {
        if !(1..=12).contains(&number) {
            return None;
        }
        let (table, minor) = match letter.to_ascii_uppercase() {
            'A' => (&CAMELOT_MINOR, true),
            'B' => (&CAMELOT_MAJOR, false),
            _ => return None,
        };
        let root = table.iter().position(|&n| n == number)? as u8;
        Some(Self { root, minor })
    }

    /// Parse either a Camelot code ("8A", "12B") or a note name
    /// ("Am", "C#", "Bb", "F#m", "Dbmin", "E minor")
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        if s.starts_with(|c: char| c.is_ascii_digit()) {
            let letter = s.chars().last()?;
            let number: u8 = s[..s.len() - letter.len_utf8()].parse().ok()?;
            return Self::from_camelot(number, letter);
        }

        let mut chars = s.chars().peekable();
        let base_root = match chars.next()?.to_ascii_uppercase() {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };

        let root = match chars.peek() {
            Some('#') => {
                chars.next();
                (base_root + 1) % 12
            }
            Some('b') => {
                chars.next();
                (base_root + 11) % 12
            }
            _ => base_root,
        };

        let remaining = chars.collect::<String>().trim().to_lowercase();
        let minor = remaining.starts_with('m') && !remaining.starts_with("maj");

        Some(Self { root, minor })
    }

    /// Camelot wheel position (1-12, 'A' for minor / 'B' for major)
    pub fn camelot(&self) -> (u8, char) {
        if self.minor {
            (CAMELOT_MINOR[self.root as usize], 'A')
        } else {
            (CAMELOT_MAJOR[self.root as usize], 'B')
        }
    }

    /// Camelot code string, e.g. "8A"
    pub fn camelot_code(&self) -> String {
        let (number, letter) = self.camelot();
        format!("{}{}", number, letter)
    }

    /// Relative major/minor (same Camelot number, other letter)
    pub fn relative(&self) -> Self {
        if self.minor {
            Self::new(self.root + 3, false)
        } else {
            Self::new(self.root + 9, true)
        }
    }

    /// Classify the relation between two keys
    pub fn relation(&self, other: &Key) -> KeyRelation {
        if self == other {
            return KeyRelation::Same;
        }
        let (na, la) = self.camelot();
        let (nb, lb) = other.camelot();
        let steps = wheel_steps(na, nb);

        if la == lb {
            match steps {
                1 => KeyRelation::Adjacent,
                // ±7 on a 12-slot wheel is 5 steps the short way round
                5 => KeyRelation::Fifth,
                _ => KeyRelation::Unrelated,
            }
        } else if steps == 0 {
            KeyRelation::Relative
        } else {
            KeyRelation::Unrelated
        }
    }

    /// Harmonic distance; 0 only for identical keys, smaller is closer
    ///
    /// Adjacent = 1, relative = 2, fifth = 3. Anything else scores
    /// `4 + wheel steps (+1 across letters)`, so it always ranks behind
    /// the named relations.
    pub fn distance(&self, other: &Key) -> u32 {
        match self.relation(other) {
            KeyRelation::Same => 0,
            KeyRelation::Adjacent => 1,
            KeyRelation::Relative => 2,
            KeyRelation::Fifth => 3,
            KeyRelation::Unrelated => {
                let (na, la) = self.camelot();
                let (nb, lb) = other.camelot();
                4 + wheel_steps(na, nb) as u32 + u32::from(la != lb)
            }
        }
    }

    /// Keys that mix without transposition: same, adjacent, relative, fifths
    pub fn compatible_keys(&self) -> Vec<Key> {
        let (number, letter) = self.camelot();
        let other_letter = if letter == 'A' { 'B' } else { 'A' };
        let wrap = |n: i32| ((n - 1).rem_euclid(12) + 1) as u8;
        let n = number as i32;

        [
            (number, letter),
            (wrap(n - 1), letter),
            (wrap(n + 1), letter),
            (number, other_letter),
            (wrap(n + 7), letter),
            (wrap(n - 7), letter),
        ]
        .into_iter()
        .filter_map(|(num, l)| Key::from_camelot(num, l))
        .fold(Vec::new(), |mut keys, key| {
            if !keys.contains(&key) {
                keys.push(key);
            }
            keys
        })
    }

    /// Semitones to transpose `self` so it matches `target`
    ///
    /// Returns 0 for same or relative keys, otherwise the smallest
    /// interval in -6..=6. Informational only: playback never shifts pitch
    /// independently of tempo.
    pub fn semitones_to(&self, target: &Key) -> i8 {
        if self == target || self.relative() == *target {
            return 0;
        }

        let target_root = if self.minor == target.minor {
            target.root
        } else {
            target.relative().root
        };

        let diff = target_root as i8 - self.root as i8;
        if diff > 6 {
            diff - 12
        } else if diff < -6 {
            diff + 12
        } else {
            diff
        }
    }
}

/// Shortest distance between two Camelot numbers around the wheel
fn wheel_steps(a: u8, b: u8) -> u8 {
    let d = (a as i16 - b as i16).rem_euclid(12) as u8;
    d.min(12 - d)
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let note = NOTE_NAMES[self.root as usize];
        if self.minor {
            write!(f, "{}m", note)
        } else {
            write!(f, "{}", note)
        }
    }
}

impl TryFrom<String> for Key {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Key::parse(&value).ok_or_else(|| format!("invalid key '{}'", value))
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_string()
    }
}
