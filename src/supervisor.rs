use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{info, warn, error, debug};

use crate::config::{CameraConfig, StreamConfig};
use crate::errors::Result;
use crate::frame::FrameExtractor;
use crate::hub::FrameHub;
use crate::producer::{ProducerExit, ProducerLauncher, ProducerProcess};
use crate::settings::StreamSettings;
use crate::utils::lossy_prefix;

/// Owns the one producer process and its extraction task.
///
/// Not synchronised on its own: the stream manager keeps it behind its mutex,
/// which is what guarantees a single live producer.
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProducerLauncher>,
    hub: Arc<FrameHub>,
    camera: CameraConfig,
    stop_grace: Duration,
    kill_grace: Duration,
    diagnostic_bytes: usize,
    current: Option<RunningProducer>,
}

struct RunningProducer {
    process: Box<dyn ProducerProcess>,
    reader: JoinHandle<()>,
    generation: u64,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn ProducerLauncher>,
        hub: Arc<FrameHub>,
        camera: CameraConfig,
        stream: &StreamConfig,
    ) -> Self {
        Self {
            launcher,
            hub,
            camera,
            stop_grace: stream.stop_grace,
            kill_grace: stream.kill_grace,
            diagnostic_bytes: stream.diagnostic_bytes,
            current: None,
        }
    }

    pub fn program(&self) -> &str {
        &self.camera.stream_command
    }

    #[cfg(test)]
    pub fn has_process(&self) -> bool {
        self.current.is_some()
    }

    pub fn generation(&self) -> Option<u64> {
        self.current.as_ref().map(|p| p.generation)
    }

    /// Replace any running producer with one built from `settings`.
    ///
    /// Returns as soon as the process is spawned; the caller watches the hub
    /// for the first frame. The new generation is marked live before the old
    /// process is torn down so stream clients ride through a restart.
    pub async fn launch(&mut self, settings: &StreamSettings) -> Result<u64> {
        let generation = self.hub.begin_generation();
        self.teardown().await;
        self.hub.clear_frame();

        let program = self.camera.stream_command.clone();
        let args = settings.stream_args(&self.camera);
        info!("Launching {} {}", program, args.join(" "));

        let spawned = match self.launcher.launch(&program, &args) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("{}", e);
                self.hub.mark_down();
                return Err(e);
            }
        };

        debug!("{} generation {} has pid {:?}", program, generation, spawned.process.id());
        let reader = tokio::spawn(extract_frames(
            spawned.output,
            self.hub.clone(),
            generation,
            self.camera.chunk_read_size,
        ));

        self.current = Some(RunningProducer {
            process: spawned.process,
            reader,
            generation,
        });
        Ok(generation)
    }

    /// Stop the producer, if any. Returns whether there was one.
    pub async fn stop(&mut self) -> bool {
        let stopped = self.teardown().await;
        self.hub.mark_down();
        stopped
    }

    /// Exit status of the current producer if it has already died.
    pub fn poll_exit(&mut self) -> Option<ProducerExit> {
        let running = self.current.as_mut()?;
        match running.process.try_wait() {
            Ok(exit) => exit,
            Err(e) => {
                warn!("Could not poll {}: {}", self.camera.stream_command, e);
                None
            }
        }
    }

    /// Leading stderr of the current producer, decoded leniently.
    pub async fn diagnostics(&mut self) -> String {
        match self.current.as_mut() {
            Some(running) => lossy_prefix(&running.process.diagnostics().await, self.diagnostic_bytes),
            None => String::new(),
        }
    }

    // Graceful stop, then forced, then drop the handle and the reader
    async fn teardown(&mut self) -> bool {
        let Some(mut running) = self.current.take() else {
            return false;
        };
        let program = &self.camera.stream_command;

        match running.process.try_wait() {
            Ok(Some(exit)) => {
                debug!("{} (generation {}) had already exited ({})", program, running.generation, exit);
            }
            _ => {
                if let Err(e) = running.process.terminate() {
                    warn!("Failed to signal {}: {}", program, e);
                }
                match tokio::time::timeout(self.stop_grace, running.process.wait()).await {
                    Ok(Ok(exit)) => info!("{} stopped (exit {})", program, exit),
                    Ok(Err(e)) => warn!("Error waiting for {}: {}", program, e),
                    Err(_) => {
                        warn!("{} ignored SIGTERM for {:?}, killing", program, self.stop_grace);
                        if let Err(e) = running.process.kill() {
                            warn!("Failed to kill {}: {}", program, e);
                        }
                        match tokio::time::timeout(self.kill_grace, running.process.wait()).await {
                            Ok(Ok(exit)) => info!("{} killed (exit {})", program, exit),
                            Ok(Err(e)) => warn!("Error waiting for killed {}: {}", program, e),
                            Err(_) => error!("{} still alive {:?} after SIGKILL", program, self.kill_grace),
                        }
                    }
                }
            }
        }

        running.reader.abort();
        let _ = running.reader.await;
        true
    }
}

/// Read producer output until it closes or the generation is retired,
/// publishing every complete frame. Errors just end the task; process death
/// is noticed by the supervisor's own polling.
async fn extract_frames(
    mut output: Box<dyn AsyncRead + Send + Unpin>,
    hub: Arc<FrameHub>,
    generation: u64,
    chunk_size: usize,
) {
    let mut extractor = FrameExtractor::new();
    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut frame_count = 0u64;

    while hub.is_current(generation) {
        let n = match output.read(&mut chunk).await {
            Ok(0) => {
                debug!("Producer output closed (generation {})", generation);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Producer output read failed (generation {}): {}", generation, e);
                break;
            }
        };

        for data in extractor.push(&chunk[..n]) {
            frame_count += 1;
            if frame_count == 1 {
                info!("First frame from producer generation {} ({} bytes)", generation, data.len());
            } else if frame_count % 100 == 0 {
                debug!("Extracted {} frames from generation {} ({} bytes pending)",
                       frame_count, generation, extractor.buffered());
            }
            hub.publish(data);
        }
    }

    if hub.producer_exited(generation) {
        info!("Producer generation {} ended after {} frames", generation, frame_count);
    }
}
