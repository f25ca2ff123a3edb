//! OSC control protocol
//!
//! Clients talk to the mixer with OSC messages over UDP. Each message is
//! parsed into a [`ControlMessage`], applied to the [`Session`](crate::session::Session)
//! and answered with `/reply [address, "ok"|"error", detail]`.

mod dispatch;
mod message;
mod server;

pub use dispatch::{dispatch, Reply, REPLY_ADDRESS, STATUS_ADDRESS};
pub use message::{ControlMessage, ProtocolError};
pub use server::{handle, ControlServer, ServerExit, DEFAULT_POLL_INTERVAL};
