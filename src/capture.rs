use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn, debug};

use crate::config::{CameraConfig, Config};
use crate::errors::{Result, StreamError};
use crate::settings::StreamSettings;
use crate::stream_manager::StreamManager;
use crate::utils::lossy_prefix;

pub const CAPTURE_FILE: &str = "capture_one.jpg";
pub const LIVE_FRAME_FILE: &str = "live_frame.jpg";

/// Runs the single-shot capture binary.
#[async_trait]
pub trait StillCapture: Send + Sync {
    async fn capture(&self, args: &[String], output: &Path, timeout: Duration) -> Result<()>;
}

pub struct CommandStillCapture {
    program: String,
    diagnostic_bytes: usize,
}

impl CommandStillCapture {
    pub fn new(camera: &CameraConfig, diagnostic_bytes: usize) -> Self {
        Self {
            program: camera.still_command.clone(),
            diagnostic_bytes,
        }
    }
}

#[async_trait]
impl StillCapture for CommandStillCapture {
    async fn capture(&self, args: &[String], output: &Path, timeout: Duration) -> Result<()> {
        info!("Running {} {}", self.program, args.join(" "));
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::launch(format!("Failed to launch {}: {}", self.program, e)))?;

        // dropping the future on timeout kills the child
        let result = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(StreamError::CaptureTimeout { secs: timeout.as_secs() }),
        };

        if result.status.success() {
            debug!("{} wrote {}", self.program, output.display());
            Ok(())
        } else {
            let stderr = lossy_prefix(&result.stderr, self.diagnostic_bytes);
            Err(StreamError::capture(if stderr.is_empty() {
                format!("{} failed ({})", self.program, result.status)
            } else {
                stderr
            }))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    Stream,
    Still,
}

#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub path: PathBuf,
    pub source: CaptureSource,
}

impl CaptureOutcome {
    pub fn message(&self) -> &'static str {
        match self.source {
            CaptureSource::Stream => "Captured from stream",
            CaptureSource::Still => "Captured",
        }
    }
}

/// One-off captures: from the running stream when there is one, otherwise
/// from the still binary with the camera borrowed from the always-on service.
pub struct CaptureService {
    manager: Arc<StreamManager>,
    still: Arc<dyn StillCapture>,
    camera: CameraConfig,
    frame_wait: Duration,
    still_timeout: Duration,
}

impl CaptureService {
    pub fn new(config: &Config, manager: Arc<StreamManager>, still: Arc<dyn StillCapture>) -> Self {
        Self {
            manager,
            still,
            camera: config.camera.clone(),
            frame_wait: config.stream.frame_wait,
            still_timeout: config.stream.still_timeout,
        }
    }

    pub fn images_directory(&self) -> &Path {
        &self.camera.images_directory
    }

    pub async fn capture_one(&self, settings: &StreamSettings) -> Result<CaptureOutcome> {
        let output = self.camera.images_directory.join(CAPTURE_FILE);
        tokio::fs::create_dir_all(&self.camera.images_directory).await?;

        if self.manager.is_running() {
            return self.save_stream_frame(output).await;
        }

        let args = settings.still_args(&self.camera, &output);
        let still = self.still.clone();
        let target = output.clone();
        let timeout = self.still_timeout;
        let capture = async move { still.capture(&args, &target, timeout).await };

        match self.manager.with_released_camera(capture).await {
            Ok(Some(())) => {
                info!("Still captured to {}", output.display());
                Ok(CaptureOutcome { path: output, source: CaptureSource::Still })
            }
            // a stream came up while we waited for the camera
            Ok(None) => self.save_stream_frame(output).await,
            Err(e) => {
                warn!("Still capture failed: {}", e);
                Err(e)
            }
        }
    }

    /// Save the latest stream frame for the legacy live endpoint.
    pub async fn live_frame(&self) -> Result<CaptureOutcome> {
        if !self.manager.is_running() {
            return Err(StreamError::NotRunning);
        }
        tokio::fs::create_dir_all(&self.camera.images_directory).await?;
        self.save_stream_frame(self.camera.images_directory.join(LIVE_FRAME_FILE)).await
    }

    async fn save_stream_frame(&self, output: PathBuf) -> Result<CaptureOutcome> {
        let frame = self.manager.hub()
            .await_frame(self.frame_wait)
            .await
            .ok_or(StreamError::NoFrame)?;
        if frame.is_empty() {
            return Err(StreamError::NoFrame);
        }
        tokio::fs::write(&output, &frame.data).await?;
        debug!("Saved frame {} ({} bytes) to {}", frame.seq, frame.len(), output.display());
        Ok(CaptureOutcome { path: output, source: CaptureSource::Stream })
    }
}
