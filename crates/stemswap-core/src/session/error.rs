//! Session error types

use std::path::PathBuf;

use thiserror::Error;

use crate::asset::AssetError;
use crate::types::{Deck, Stem};

/// Errors returned by session operations
///
/// Every failure leaves the session and the render engine unchanged.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Asset not found: {path:?}")]
    AssetNotFound { path: PathBuf },

    #[error("Failed to decode {path:?}: {reason}")]
    DecodeError { path: PathBuf, reason: String },

    #[error("Tempo {source_bpm:.1} BPM is too far from {target_bpm:.1} BPM (ratio {ratio:.3})")]
    IncompatibleTempo {
        source_bpm: f64,
        target_bpm: f64,
        ratio: f64,
    },

    #[error("Unknown song '{0}'")]
    UnknownSong(String),

    #[error("Song '{song}' has no section '{section}'")]
    UnknownSection { song: String, section: String },

    /// The song exists but has no file for this stem type
    #[error("Song '{song}' has no {stem} stem")]
    MissingStem { song: String, stem: Stem },

    /// Nothing from the catalog is bound to the slot
    #[error("No catalog stem loaded on {deck}/{stem}")]
    EmptySlot { deck: Deck, stem: Stem },

    #[error("Unknown buffer {0}")]
    UnknownBuffer(i32),

    #[error("Invalid stem '{0}'")]
    InvalidStem(String),

    #[error("Invalid deck '{0}'")]
    InvalidDeck(String),

    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    #[error("Command queue full")]
    QueueFull,
}

impl From<AssetError> for SessionError {
    fn from(err: AssetError) -> Self {
        match err {
            AssetError::NotFound { path, .. } => Self::AssetNotFound { path },
            AssetError::Decode { path, reason } => Self::DecodeError { path, reason },
            AssetError::LoaderDisconnected => Self::DecodeError {
                path: PathBuf::new(),
                reason: "asset loader is not running".to_string(),
            },
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
