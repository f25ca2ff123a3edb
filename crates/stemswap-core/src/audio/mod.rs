//! Audio output through cpal
//!
//! The render engine never runs inside the device callback. A dedicated
//! render thread fills the output pump, and the callback only copies frames
//! out of it:
//!
//! - **Control context**: sends commands through the lock-free queue
//! - **Render thread**: owns the `RenderEngine`, renders whole blocks
//! - **Device callback**: drains the sample ring, silence on underrun
//! - **Atomics**: status and the device-lost flag, read without locks

mod config;
mod device;
mod error;
mod stream;

pub use config::{AudioConfig, MAX_DEVICE_BUFFER, MIN_DEVICE_BUFFER};
pub use device::{default_device, find_device, output_device_names};
pub use error::{AudioError, AudioResult};
pub use stream::{AudioHandle, AudioOutput};
