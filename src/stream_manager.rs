use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn, debug};

use crate::arbiter::ResourceArbiter;
use crate::config::Config;
use crate::errors::{Result, StreamError};
use crate::hub::{FrameHub, FrameSubscription};
use crate::producer::{ProducerExit, ProducerLauncher};
use crate::settings::StreamSettings;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub running: bool,
    pub clients: usize,
    pub settings: StreamSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Producer restarted and delivered a frame.
    Restarted,
    /// Producer restarted and is alive but has not delivered a frame yet.
    Pending,
    /// Stream not running; settings saved for the next start.
    Stored,
}

enum Readiness {
    FirstFrame,
    Exited { exit: ProducerExit, diagnostics: String },
    Silent { diagnostics: String },
    Superseded,
}

/// Single owner of the live-view producer.
///
/// Every transition that creates, replaces or tears down the producer runs
/// under `supervisor`'s mutex, so at most one producer exists at a time and a
/// stop always completes before the next spawn. Status, frames and the client
/// count are read without that lock.
///
/// Transitions run on their own task: a caller that stops waiting (a dropped
/// request, a timeout) does not stop the transition, and the camera handback
/// that ends it still happens.
pub struct StreamManager {
    supervisor: Mutex<ProcessSupervisor>,
    hub: Arc<FrameHub>,
    arbiter: Arc<dyn ResourceArbiter>,
    running: AtomicBool,
    readiness_timeout: Duration,
    readiness_poll_interval: Duration,
}

impl StreamManager {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn ProducerLauncher>,
        arbiter: Arc<dyn ResourceArbiter>,
    ) -> Self {
        let hub = Arc::new(FrameHub::new(config.stream.client_poll_interval));
        let supervisor = ProcessSupervisor::new(launcher, hub.clone(), config.camera.clone(), &config.stream);
        Self {
            supervisor: Mutex::new(supervisor),
            hub,
            arbiter,
            running: AtomicBool::new(false),
            readiness_timeout: config.stream.readiness_timeout,
            readiness_poll_interval: config.stream.readiness_poll_interval,
        }
    }

    pub fn hub(&self) -> &Arc<FrameHub> {
        &self.hub
    }

    /// Stream session active and its producer alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.hub.is_live()
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            running: self.is_running(),
            clients: self.hub.client_count(),
            settings: self.hub.latest_settings(),
        }
    }

    pub fn frames(&self) -> FrameSubscription {
        self.hub.subscribe()
    }

    /// Launch the producer with `settings` (replacing any running one) and
    /// wait for its first frame.
    pub async fn start(self: &Arc<Self>, settings: StreamSettings) -> Result<()> {
        let manager = self.clone();
        detached(async move { manager.run_start(settings).await }).await
    }

    /// Merge `partial` into the current settings and, if streaming, restart the
    /// producer with the result. A restarted producer that is alive but quiet
    /// is accepted; one that dies is not.
    pub async fn update_settings(self: &Arc<Self>, partial: &StreamSettings) -> Result<UpdateOutcome> {
        let manager = self.clone();
        let partial = partial.clone();
        detached(async move { manager.run_update(&partial).await }).await
    }

    /// End the stream session and hand the camera back. Returns false (and
    /// does nothing) when there was no session to end.
    pub async fn stop(self: &Arc<Self>) -> bool {
        let manager = self.clone();
        match detached(async move { Ok(manager.run_stop().await) }).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Run a one-off capture with the camera taken from the always-on service.
    ///
    /// Holds the lifecycle lock throughout so no stream can start meanwhile,
    /// and hands the camera back whatever the capture returns. `Ok(None)` means
    /// a stream owns the camera and the capture did not run.
    pub async fn with_released_camera<T, F>(self: &Arc<Self>, capture: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let manager = self.clone();
        detached(async move {
            let _supervisor = manager.supervisor.lock().await;
            if manager.is_running() {
                return Ok(None);
            }

            manager.release_camera().await;
            let result = capture.await;
            manager.reacquire_camera().await;
            result.map(Some)
        })
        .await
    }

    async fn run_start(&self, settings: StreamSettings) -> Result<()> {
        let (generation, program) = {
            let mut supervisor = self.supervisor.lock().await;
            supervisor.stop().await;
            self.release_camera().await;
            self.hub.set_settings(settings.clone());

            match supervisor.launch(&settings).await {
                Ok(generation) => {
                    self.running.store(true, Ordering::SeqCst);
                    (generation, supervisor.program().to_string())
                }
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    self.reacquire_camera().await;
                    return Err(e);
                }
            }
        };

        match self.await_readiness(generation).await {
            Readiness::FirstFrame => {
                info!("Stream started (generation {})", generation);
                Ok(())
            }
            Readiness::Exited { exit, diagnostics } => {
                self.abandon(generation).await;
                Err(early_exit(program, exit, diagnostics))
            }
            Readiness::Silent { diagnostics } => {
                warn!("{} produced no frames within {:?}, stopping it", program, self.readiness_timeout);
                self.abandon(generation).await;
                Err(StreamError::NoFrames {
                    program,
                    secs: self.readiness_timeout.as_secs(),
                    diagnostics: or_empty(diagnostics),
                })
            }
            Readiness::Superseded => Err(StreamError::Superseded),
        }
    }

    async fn run_update(&self, partial: &StreamSettings) -> Result<UpdateOutcome> {
        let (generation, program) = {
            let mut supervisor = self.supervisor.lock().await;
            let mut merged = self.hub.latest_settings();
            merged.merge(partial);
            self.hub.set_settings(merged.clone());

            if !self.running.load(Ordering::SeqCst) {
                debug!("Stream idle, settings stored for next start");
                return Ok(UpdateOutcome::Stored);
            }

            info!("Restarting {} with updated settings", supervisor.program());
            match supervisor.launch(&merged).await {
                Ok(generation) => (generation, supervisor.program().to_string()),
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    self.reacquire_camera().await;
                    return Err(e);
                }
            }
        };

        match self.await_readiness(generation).await {
            Readiness::FirstFrame => Ok(UpdateOutcome::Restarted),
            Readiness::Silent { .. } => {
                warn!("{} restarted but has not produced a frame yet", program);
                Ok(UpdateOutcome::Pending)
            }
            Readiness::Exited { exit, diagnostics } => {
                self.abandon(generation).await;
                Err(early_exit(program, exit, diagnostics))
            }
            Readiness::Superseded => Err(StreamError::Superseded),
        }
    }

    async fn run_stop(&self) -> bool {
        let mut supervisor = self.supervisor.lock().await;
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let had_process = supervisor.stop().await;

        if was_running || had_process {
            info!("Stream stopped");
            self.reacquire_camera().await;
            true
        } else {
            debug!("Stream already stopped");
            false
        }
    }

    /// Wait up to `wait` for a running stream that has produced a frame.
    pub async fn wait_for_stream(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.is_running() && self.hub.has_frame() {
                return true;
            }
            if Instant::now() >= deadline {
                return self.is_running();
            }
            tokio::time::sleep(self.readiness_poll_interval).await;
        }
    }

    async fn await_readiness(&self, generation: u64) -> Readiness {
        let deadline = Instant::now() + self.readiness_timeout;
        loop {
            if self.hub.has_frame() && self.hub.is_current(generation) {
                return Readiness::FirstFrame;
            }

            {
                let mut supervisor = self.supervisor.lock().await;
                if supervisor.generation() != Some(generation) {
                    return Readiness::Superseded;
                }
                if let Some(exit) = supervisor.poll_exit() {
                    let diagnostics = supervisor.diagnostics().await;
                    return Readiness::Exited { exit, diagnostics };
                }
                if Instant::now() >= deadline {
                    let diagnostics = supervisor.diagnostics().await;
                    return Readiness::Silent { diagnostics };
                }
            }

            tokio::time::sleep(self.readiness_poll_interval).await;
        }
    }

    // Tear down a producer that failed its readiness wait, unless another
    // request has already replaced it
    async fn abandon(&self, generation: u64) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.generation() != Some(generation) {
            return;
        }
        supervisor.stop().await;
        self.running.store(false, Ordering::SeqCst);
        self.reacquire_camera().await;
    }

    async fn release_camera(&self) {
        if let Err(e) = self.arbiter.release().await {
            warn!("Camera release incomplete: {}", e);
        }
    }

    async fn reacquire_camera(&self) {
        if self.is_running() {
            debug!("Stream owns the camera, not handing it back");
            return;
        }
        if let Err(e) = self.arbiter.reacquire().await {
            warn!("Camera handback incomplete: {}", e);
        }
    }
}

// Panics in the task resurface in the caller
async fn detached<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(StreamError::Interrupted { message: e.to_string() }),
    }
}

fn or_empty(diagnostics: String) -> String {
    if diagnostics.is_empty() { "empty".to_string() } else { diagnostics }
}

fn early_exit(program: String, exit: ProducerExit, diagnostics: String) -> StreamError {
    StreamError::EarlyExit {
        program,
        code: exit.to_string(),
        diagnostics: if diagnostics.is_empty() { "no output".to_string() } else { diagnostics },
    }
}
