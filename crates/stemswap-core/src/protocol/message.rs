//! Control messages parsed from OSC
//!
//! Every address the server understands maps to one [`ControlMessage`]
//! variant. Parsing validates argument count and types up front, so a
//! malformed message is rejected before it reaches the session.

use std::path::PathBuf;

use rosc::{OscMessage, OscType};
use thiserror::Error;

use crate::types::{Deck, Stem};

/// Errors for messages that cannot be turned into a [`ControlMessage`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Unknown address {0}")]
    UnknownAddress(String),

    #[error("{address}: missing argument {index} ({name})")]
    MissingArgument {
        address: String,
        index: usize,
        name: &'static str,
    },

    #[error("{address}: argument {index} ({name}) must be {expected}, got {got}")]
    WrongType {
        address: String,
        index: usize,
        name: &'static str,
        expected: &'static str,
        got: String,
    },

    #[error("{address}: {reason}")]
    InvalidValue { address: String, reason: String },

    #[error("Malformed packet: {0}")]
    Malformed(String),
}

/// A request from a control client
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    // Raw buffer API
    LoadBuffer {
        buffer_id: i32,
        path: PathBuf,
        stem_name: String,
    },
    PlayStem {
        buffer_id: i32,
        rate: f64,
        volume: f32,
        looping: bool,
        start: f64,
    },
    PlayStemSection {
        buffer_id: i32,
        rate: f64,
        volume: f32,
        looping: bool,
        start: f64,
        duration: f64,
    },
    StopStem {
        buffer_id: i32,
    },
    StemVolume {
        buffer_id: i32,
        volume: f32,
    },
    CrossfadeLevels {
        deck_a: f32,
        deck_b: f32,
    },
    SetKey {
        key: String,
    },
    GetStatus,
    MixerCleanup,
    TestTone {
        frequency: f32,
    },

    // Catalog API
    LoadStem {
        deck: Deck,
        stem: Stem,
        song_id: String,
        section: Option<String>,
    },
    SwapStem {
        deck: Deck,
        stem: Stem,
        song_id: String,
    },
    Stop {
        deck: Deck,
        stem: Option<Stem>,
    },
    Bpm {
        bpm: f64,
    },
    Crossfade {
        position: f32,
    },
    Volume {
        level: f32,
    },
    StemTypeVolume {
        stem: Stem,
        level: f32,
    },
    /// Every stem of a song onto one deck
    LoadSong {
        deck: Deck,
        song_id: String,
    },
    /// Re-window a loaded catalog stem to one of its song's sections
    SetSection {
        deck: Deck,
        stem: Stem,
        section: String,
    },
    /// Random tempo, crossfade and stems; a seed makes it reproducible
    RandomMix {
        seed: Option<i32>,
    },
}

impl ControlMessage {
    /// OSC address this message is sent to
    pub fn address(&self) -> &'static str {
        match self {
            Self::LoadBuffer { .. } => "/load_buffer",
            Self::PlayStem { .. } => "/play_stem",
            Self::PlayStemSection { .. } => "/play_stem_section",
            Self::StopStem { .. } => "/stop_stem",
            Self::StemVolume { .. } => "/stem_volume",
            Self::CrossfadeLevels { .. } => "/crossfade_levels",
            Self::SetKey { .. } => "/set_key",
            Self::GetStatus => "/get_status",
            Self::MixerCleanup => "/mixer_cleanup",
            Self::TestTone { .. } => "/test_tone",
            Self::LoadStem { .. } => "/load_stem",
            Self::SwapStem { .. } => "/swap_stem",
            Self::Stop { .. } => "/stop",
            Self::Bpm { .. } => "/bpm",
            Self::Crossfade { .. } => "/crossfade",
            Self::Volume { .. } => "/volume",
            Self::StemTypeVolume { .. } => "/stem_type_volume",
            Self::LoadSong { .. } => "/load_song",
            Self::SetSection { .. } => "/set_section",
            Self::RandomMix { .. } => "/random",
        }
    }

    /// Parse an OSC message
    pub fn parse(msg: &OscMessage) -> Result<Self, ProtocolError> {
        let args = Args::new(msg);
        let message = match msg.addr.as_str() {
            "/load_buffer" => Self::LoadBuffer {
                buffer_id: args.int(0, "bufferId")?,
                path: PathBuf::from(args.string(1, "filePath")?),
                stem_name: args.string(2, "stemName")?,
            },
            "/play_stem" => Self::PlayStem {
                buffer_id: args.int(0, "bufferId")?,
                rate: args.float(1, "rate")?,
                volume: args.float(2, "volume")? as f32,
                looping: args.flag(3, "loop")?,
                start: args.float(4, "startPos")?,
            },
            "/play_stem_section" => Self::PlayStemSection {
                buffer_id: args.int(0, "bufferId")?,
                rate: args.float(1, "rate")?,
                volume: args.float(2, "volume")? as f32,
                looping: args.flag(3, "loop")?,
                start: args.float(4, "start")?,
                duration: args.float(5, "duration")?,
            },
            "/stop_stem" => Self::StopStem {
                buffer_id: args.int(0, "bufferId")?,
            },
            "/stem_volume" => Self::StemVolume {
                buffer_id: args.int(0, "bufferId")?,
                volume: args.float(1, "volume")? as f32,
            },
            "/crossfade_levels" => Self::CrossfadeLevels {
                deck_a: args.float(0, "deckAVol")? as f32,
                deck_b: args.float(1, "deckBVol")? as f32,
            },
            "/set_key" => Self::SetKey {
                key: args.string(0, "key")?,
            },
            "/get_status" => Self::GetStatus,
            "/mixer_cleanup" => Self::MixerCleanup,
            "/test_tone" => Self::TestTone {
                frequency: args.optional_float(0, "frequency")?.unwrap_or(440.0) as f32,
            },
            "/load_stem" => Self::LoadStem {
                deck: args.deck(0)?,
                stem: args.stem(1)?,
                song_id: args.string(2, "songId")?,
                section: args.optional_string(3, "section")?,
            },
            "/swap_stem" => Self::SwapStem {
                deck: args.deck(0)?,
                stem: args.stem(1)?,
                song_id: args.string(2, "songId")?,
            },
            "/stop" => Self::Stop {
                deck: args.deck(0)?,
                stem: match args.optional_string(1, "stem")? {
                    Some(_) => Some(args.stem(1)?),
                    None => None,
                },
            },
            "/bpm" => Self::Bpm {
                bpm: args.float(0, "bpm")?,
            },
            "/crossfade" => Self::Crossfade {
                position: args.float(0, "x")? as f32,
            },
            "/volume" => Self::Volume {
                level: args.float(0, "v")? as f32,
            },
            "/stem_type_volume" => Self::StemTypeVolume {
                stem: args.stem(0)?,
                level: args.float(1, "level")? as f32,
            },
            "/load_song" => Self::LoadSong {
                deck: args.deck(0)?,
                song_id: args.string(1, "songId")?,
            },
            "/set_section" => Self::SetSection {
                deck: args.deck(0)?,
                stem: args.stem(1)?,
                section: args.string(2, "section")?,
            },
            "/random" => Self::RandomMix {
                seed: match args.args.first() {
                    None | Some(OscType::Nil) => None,
                    Some(_) => Some(args.int(0, "seed")?),
                },
            },
            other => return Err(ProtocolError::UnknownAddress(other.to_string())),
        };
        Ok(message)
    }

    /// Encode as an OSC message
    pub fn to_osc(&self) -> OscMessage {
        let args = match self {
            Self::LoadBuffer {
                buffer_id,
                path,
                stem_name,
            } => vec![
                OscType::Int(*buffer_id),
                OscType::String(path.to_string_lossy().into_owned()),
                OscType::String(stem_name.clone()),
            ],
            Self::PlayStem {
                buffer_id,
                rate,
                volume,
                looping,
                start,
            } => vec![
                OscType::Int(*buffer_id),
                OscType::Float(*rate as f32),
                OscType::Float(*volume),
                OscType::Int(*looping as i32),
                OscType::Float(*start as f32),
            ],
            Self::PlayStemSection {
                buffer_id,
                rate,
                volume,
                looping,
                start,
                duration,
            } => vec![
                OscType::Int(*buffer_id),
                OscType::Float(*rate as f32),
                OscType::Float(*volume),
                OscType::Int(*looping as i32),
                OscType::Float(*start as f32),
                OscType::Float(*duration as f32),
            ],
            Self::StopStem { buffer_id } => vec![OscType::Int(*buffer_id)],
            Self::StemVolume { buffer_id, volume } => vec![OscType::Int(*buffer_id), OscType::Float(*volume)],
            Self::CrossfadeLevels { deck_a, deck_b } => vec![OscType::Float(*deck_a), OscType::Float(*deck_b)],
            Self::SetKey { key } => vec![OscType::String(key.clone())],
            Self::GetStatus | Self::MixerCleanup => Vec::new(),
            Self::TestTone { frequency } => vec![OscType::Float(*frequency)],
            Self::LoadStem {
                deck,
                stem,
                song_id,
                section,
            } => {
                let mut args = vec![
                    OscType::String(deck.to_string()),
                    OscType::String(stem.to_string()),
                    OscType::String(song_id.clone()),
                ];
                if let Some(section) = section {
                    args.push(OscType::String(section.clone()));
                }
                args
            }
            Self::SwapStem { deck, stem, song_id } => vec![
                OscType::String(deck.to_string()),
                OscType::String(stem.to_string()),
                OscType::String(song_id.clone()),
            ],
            Self::Stop { deck, stem } => {
                let mut args = vec![OscType::String(deck.to_string())];
                if let Some(stem) = stem {
                    args.push(OscType::String(stem.to_string()));
                }
                args
            }
            Self::Bpm { bpm } => vec![OscType::Double(*bpm)],
            Self::Crossfade { position } => vec![OscType::Float(*position)],
            Self::Volume { level } => vec![OscType::Float(*level)],
            Self::StemTypeVolume { stem, level } => vec![OscType::String(stem.to_string()), OscType::Float(*level)],
            Self::LoadSong { deck, song_id } => vec![OscType::String(deck.to_string()), OscType::String(song_id.clone())],
            Self::SetSection { deck, stem, section } => vec![
                OscType::String(deck.to_string()),
                OscType::String(stem.to_string()),
                OscType::String(section.clone()),
            ],
            Self::RandomMix { seed } => seed.iter().map(|s| OscType::Int(*s)).collect(),
        };
        OscMessage {
            addr: self.address().to_string(),
            args,
        }
    }
}

/// Typed access to message arguments
struct Args<'a> {
    address: &'a str,
    args: &'a [OscType],
}

impl<'a> Args<'a> {
    fn new(msg: &'a OscMessage) -> Self {
        Self {
            address: &msg.addr,
            args: &msg.args,
        }
    }

    fn get(&self, index: usize, name: &'static str) -> Result<&'a OscType, ProtocolError> {
        self.args.get(index).ok_or_else(|| ProtocolError::MissingArgument {
            address: self.address.to_string(),
            index,
            name,
        })
    }

    fn wrong_type(&self, index: usize, name: &'static str, expected: &'static str, got: &OscType) -> ProtocolError {
        ProtocolError::WrongType {
            address: self.address.to_string(),
            index,
            name,
            expected,
            got: format!("{:?}", got),
        }
    }

    fn invalid(&self, reason: String) -> ProtocolError {
        ProtocolError::InvalidValue {
            address: self.address.to_string(),
            reason,
        }
    }

    /// Any numeric argument as f64
    fn float(&self, index: usize, name: &'static str) -> Result<f64, ProtocolError> {
        let arg = self.get(index, name)?;
        let value = match arg {
            OscType::Float(v) => *v as f64,
            OscType::Double(v) => *v,
            OscType::Int(v) => *v as f64,
            OscType::Long(v) => *v as f64,
            other => return Err(self.wrong_type(index, name, "a number", other)),
        };
        if !value.is_finite() {
            return Err(self.invalid(format!("{} must be finite", name)));
        }
        Ok(value)
    }

    fn optional_float(&self, index: usize, name: &'static str) -> Result<Option<f64>, ProtocolError> {
        match self.args.get(index) {
            None | Some(OscType::Nil) => Ok(None),
            Some(_) => self.float(index, name).map(Some),
        }
    }

    /// Any numeric argument as i32; floats must be whole
    fn int(&self, index: usize, name: &'static str) -> Result<i32, ProtocolError> {
        let arg = self.get(index, name)?;
        match arg {
            OscType::Int(v) => Ok(*v),
            OscType::Long(v) => i32::try_from(*v).map_err(|_| self.invalid(format!("{} out of range", name))),
            OscType::Float(_) | OscType::Double(_) => {
                let value = self.float(index, name)?;
                if value.fract() != 0.0 || value < i32::MIN as f64 || value > i32::MAX as f64 {
                    return Err(self.invalid(format!("{} must be a whole number", name)));
                }
                Ok(value as i32)
            }
            other => Err(self.wrong_type(index, name, "an integer", other)),
        }
    }

    fn flag(&self, index: usize, name: &'static str) -> Result<bool, ProtocolError> {
        match self.get(index, name)? {
            OscType::Bool(v) => Ok(*v),
            _ => Ok(self.float(index, name)? != 0.0),
        }
    }

    fn string(&self, index: usize, name: &'static str) -> Result<String, ProtocolError> {
        match self.get(index, name)? {
            OscType::String(s) => Ok(s.clone()),
            other => Err(self.wrong_type(index, name, "a string", other)),
        }
    }

    fn optional_string(&self, index: usize, name: &'static str) -> Result<Option<String>, ProtocolError> {
        match self.args.get(index) {
            None | Some(OscType::Nil) => Ok(None),
            Some(OscType::String(s)) if s.is_empty() => Ok(None),
            Some(_) => self.string(index, name).map(Some),
        }
    }

    fn deck(&self, index: usize) -> Result<Deck, ProtocolError> {
        let raw = self.string(index, "deck")?;
        raw.parse().map_err(|e: String| self.invalid(e))
    }

    fn stem(&self, index: usize) -> Result<Stem, ProtocolError> {
        let raw = self.string(index, "stem")?;
        raw.parse().map_err(|e: String| self.invalid(e))
    }
}
