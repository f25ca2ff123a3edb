//! Render engine - stem voices, swap crossfades, master chain
//!
//! This module contains everything that runs on (or feeds) the render
//! thread:
//! - StemVoice: one asset played at a tempo ratio and gain
//! - RenderEngine: sums voices per deck, applies levels and the soft limiter,
//!   drives swap crossfades
//! - Command/event queues between the control context and the engine
//! - Output pump between the render thread and the audio device

mod atomics;
mod command;
pub mod gc;
mod interp;
pub mod limiter;
mod mix;
mod output;
mod priority;
mod render;
mod voice;

pub use atomics::*;
pub use command::*;
pub use interp::*;
pub use mix::*;
pub use output::*;
pub use priority::*;
pub use render::*;
pub use voice::*;
