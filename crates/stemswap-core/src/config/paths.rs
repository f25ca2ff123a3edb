//! Standard locations of stemswap files

use std::path::PathBuf;

/// Directory holding stemswap configuration
///
/// Returns: `<config dir>/stemswap` (e.g. `~/.config/stemswap` on Linux)
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stemswap")
}

/// Default mixer configuration file
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

/// Default catalog manifest, next to the configuration
pub fn default_catalog_path() -> PathBuf {
    config_dir().join("catalog.yaml")
}
