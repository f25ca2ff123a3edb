//! Stemswap Core - live stem remixing engine
//!
//! Two decks of five stems each, mixed in real time. Stems can be loaded,
//! stopped and swapped for the same stem of another song while the mix
//! keeps playing; a swap fades the old source out and the new one in.

pub mod asset;
pub mod audio;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod music;
pub mod plan;
pub mod protocol;
pub mod session;
pub mod swap;
pub mod types;

pub use types::*;
