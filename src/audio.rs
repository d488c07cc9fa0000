//! Audio output used by the player.

use anyhow::{Context, Result, anyhow};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A started playback. `finished` resolves when the audio ran to its end or
/// was stopped; the sender is dropped if the output goes away first.
pub struct Playback {
    pub finished: oneshot::Receiver<()>,
}

pub trait AudioOutput: Send + Sync {
    /// Start playing `path`, replacing whatever was playing.
    fn start(&self, path: &Path) -> Result<Playback>;
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
}

/// Plays through the default output device.
///
/// `OutputStream` must stay on the thread that created it, so a dedicated
/// thread owns it for the lifetime of this value and only the handle is
/// shared.
pub struct RodioOutput {
    handle: OutputStreamHandle,
    volume: f32,
    current: Mutex<Option<Arc<Sink>>>,
    _keepalive: std_mpsc::Sender<()>,
}

impl RodioOutput {
    pub fn open(volume: f32) -> Result<Self> {
        let (handle_tx, handle_rx) = std_mpsc::channel();
        let (keepalive_tx, keepalive_rx) = std_mpsc::channel::<()>();
        thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // Blocks until the owning RodioOutput is dropped.
                    let _ = keepalive_rx.recv();
                    drop(stream);
                }
                Err(err) => {
                    let _ = handle_tx.send(Err(anyhow!("Opening audio output: {err}")));
                }
            })
            .context("Spawning audio output thread")?;
        let handle = handle_rx
            .recv()
            .context("Audio output thread exited before opening the device")??;
        info!(volume, "Opened audio output");
        Ok(Self {
            handle,
            volume: volume.clamp(0.0, 2.0),
            current: Mutex::new(None),
            _keepalive: keepalive_tx,
        })
    }

    fn current(&self) -> Option<Arc<Sink>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AudioOutput for RodioOutput {
    fn start(&self, path: &Path) -> Result<Playback> {
        let file = File::open(path).with_context(|| format!("Opening audio {}", path.display()))?;
        let source = Decoder::new(BufReader::new(file))
            .with_context(|| format!("Decoding audio {}", path.display()))?;
        let sink = Arc::new(Sink::try_new(&self.handle).context("Creating sink")?);
        sink.set_volume(self.volume);
        sink.append(source);

        let previous = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(Arc::clone(&sink));
        if let Some(previous) = previous {
            previous.stop();
        }

        let (tx, rx) = oneshot::channel();
        let waiter = Arc::clone(&sink);
        thread::Builder::new()
            .name("audio-watch".into())
            .spawn(move || {
                waiter.sleep_until_end();
                let _ = tx.send(());
            })
            .context("Spawning playback watcher")?;
        debug!(path = %path.display(), "Started playback");
        Ok(Playback { finished: rx })
    }

    fn pause(&self) {
        if let Some(sink) = self.current() {
            debug!("Pausing playback");
            sink.pause();
        }
    }

    fn resume(&self) {
        match self.current() {
            Some(sink) => {
                debug!("Resuming playback");
                sink.play();
            }
            None => warn!("Resume requested with nothing loaded"),
        }
    }

    fn stop(&self) {
        let sink = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sink) = sink {
            debug!("Stopping playback");
            sink.stop();
        }
    }
}
