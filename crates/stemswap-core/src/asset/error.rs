//! Asset acquisition error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while acquiring a stem asset
#[derive(Error, Debug)]
pub enum AssetError {
    /// File is missing or unreadable
    #[error("Asset not found: {path:?}: {source}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File exists but is not decodable audio
    #[error("Failed to decode {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// Background loader thread is gone
    #[error("Asset loader disconnected")]
    LoaderDisconnected,
}

impl AssetError {
    pub(crate) fn decode(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::Decode {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Result type for asset operations
pub type AssetResult<T> = Result<T, AssetError>;
