//! Background asset loader
//!
//! Decodes stem files on a dedicated thread so swap preparation never
//! blocks the control loop, let alone the render thread. Every request
//! carries a ticket; the session compares the ticket of each result against
//! the swap it is still waiting for and drops results nobody wants any more.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use super::decode::decode_file;
use super::error::{AssetError, AssetResult};
use super::AudioAsset;

/// Request to decode one stem file
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub ticket: u64,
    /// Cache identifier the result will be inserted under
    pub id: String,
    pub path: PathBuf,
}

/// Outcome of a [`LoadRequest`]
#[derive(Debug)]
pub struct LoadResult {
    pub ticket: u64,
    pub id: String,
    pub result: AssetResult<AudioAsset>,
}

/// Handle to the loader thread
///
/// Dropping the loader closes the request channel, which ends the thread.
pub struct AssetLoader {
    request_tx: Option<Sender<LoadRequest>>,
    result_rx: Receiver<LoadResult>,
    handle: Option<JoinHandle<()>>,
}

impl AssetLoader {
    /// Spawn the loader thread
    pub fn spawn() -> std::io::Result<Self> {
        let (request_tx, request_rx) = channel::unbounded::<LoadRequest>();
        let (result_tx, result_rx) = channel::unbounded::<LoadResult>();

        let handle = thread::Builder::new()
            .name("asset-loader".to_string())
            .spawn(move || loader_thread(request_rx, result_tx))?;

        Ok(Self {
            request_tx: Some(request_tx),
            result_rx,
            handle: Some(handle),
        })
    }

    /// Queue a decode (non-blocking)
    pub fn request(&self, request: LoadRequest) -> AssetResult<()> {
        let tx = self.request_tx.as_ref().ok_or(AssetError::LoaderDisconnected)?;
        tx.send(request).map_err(|_| AssetError::LoaderDisconnected)
    }

    /// Take one finished result if there is one
    pub fn try_recv(&self) -> Option<LoadResult> {
        match self.result_rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                log::error!("AssetLoader: loader thread has exited");
                None
            }
        }
    }

    /// Block until a result arrives or `timeout` passes
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<LoadResult> {
        self.result_rx.recv_timeout(timeout).ok()
    }
}

impl Drop for AssetLoader {
    fn drop(&mut self) {
        self.request_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("AssetLoader: loader thread panicked");
            }
        }
    }
}

fn loader_thread(rx: Receiver<LoadRequest>, tx: Sender<LoadResult>) {
    log::info!("Asset loader thread started");

    while let Ok(request) = rx.recv() {
        let start = std::time::Instant::now();
        let result = decode_file(&request.path);

        match &result {
            Ok(asset) => log::info!(
                "AssetLoader: ticket {} decoded {} ({:.1}s of audio) in {:?}",
                request.ticket,
                request.id,
                asset.duration_seconds(),
                start.elapsed()
            ),
            Err(e) => log::warn!("AssetLoader: ticket {} failed: {}", request.ticket, e),
        }

        let message = LoadResult {
            ticket: request.ticket,
            id: request.id,
            result,
        };
        if tx.send(message).is_err() {
            break;
        }
    }

    log::info!("Asset loader thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::tests::write_tone;
    use std::time::Duration;

    #[test]
    fn test_loader_decodes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tone(dir.path(), "piano.wav", 261.6, 0.1);
        let loader = AssetLoader::spawn().unwrap();

        loader
            .request(LoadRequest {
                ticket: 7,
                id: "song:piano".to_string(),
                path,
            })
            .unwrap();

        let result = loader.recv_timeout(Duration::from_secs(5)).expect("loader result");
        assert_eq!(result.ticket, 7);
        assert_eq!(result.id, "song:piano");
        assert_eq!(result.result.unwrap().frame_count(), 4410);
    }

    #[test]
    fn test_loader_reports_missing_file() {
        let loader = AssetLoader::spawn().unwrap();
        loader
            .request(LoadRequest {
                ticket: 1,
                id: "ghost:bass".to_string(),
                path: PathBuf::from("/nonexistent/ghost.wav"),
            })
            .unwrap();

        let result = loader.recv_timeout(Duration::from_secs(5)).expect("loader result");
        assert!(matches!(result.result, Err(AssetError::NotFound { .. })));
    }

    #[test]
    fn test_results_arrive_in_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_tone(dir.path(), "a.wav", 100.0, 0.05);
        let b = write_tone(dir.path(), "b.wav", 200.0, 0.05);
        let loader = AssetLoader::spawn().unwrap();

        for (ticket, path) in [(1, a), (2, b)] {
            loader
                .request(LoadRequest {
                    ticket,
                    id: format!("t{}", ticket),
                    path,
                })
                .unwrap();
        }

        let first = loader.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = loader.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first.ticket, second.ticket), (1, 2));
    }
}
