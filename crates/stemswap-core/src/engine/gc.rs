//! Deferred deallocation for decoded stem audio
//!
//! A decoded stem is tens of megabytes. Freeing it can stall for far longer
//! than one 5.8 ms block, so the last reference must never be dropped on
//! the render thread. Assets are wrapped in `basedrop::Shared<T>`: dropping
//! one only enqueues the pointer, and a background `audio-gc` thread does
//! the actual free.
//!
//! ```ignore
//! use basedrop::Shared;
//! use crate::engine::gc::gc_handle;
//!
//! let asset = Shared::new(&gc_handle(), decoded);
//! let for_voice = asset.clone();
//! drop(asset);
//! drop(for_voice); // queued for the collector, not freed here
//! ```

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Collection interval of the GC thread
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn init_gc() -> Handle {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("audio-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it is created on the thread that runs it
            let mut collector = Collector::new();
            tx.send(collector.handle()).expect("Failed to send GC handle");

            log::info!("Audio GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        })
        .expect("Failed to spawn audio GC thread");

    rx.recv().expect("Failed to receive GC handle")
}

/// Handle for creating `Shared<T>` allocations
///
/// The collector thread is started on first use.
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(init_gc).clone()
}
