use std::process::{Output, Stdio};
use std::time::Duration;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn, debug};

use crate::config::{ArbiterConfig, CameraConfig};
use crate::errors::{Result, StreamError};

/// Hands the camera back and forth with the always-on capture service.
///
/// Both calls are best-effort: an error is reported to the caller, who logs
/// it and carries on. Whether a reacquire is appropriate at all (the stream
/// may still own the camera) is decided by the stream manager, not here.
#[async_trait]
pub trait ResourceArbiter: Send + Sync {
    /// Stop the always-on service and wait for the camera to become free.
    async fn release(&self) -> Result<()>;

    /// Give the camera back to the always-on service.
    async fn reacquire(&self) -> Result<()>;
}

/// Drives the always-on service through `systemctl --user`.
pub struct SystemdArbiter {
    config: ArbiterConfig,
    list_command: String,
    sensor: String,
    systemctl: String,
}

impl SystemdArbiter {
    pub fn new(config: ArbiterConfig, camera: &CameraConfig) -> Self {
        Self {
            config,
            list_command: camera.still_command.clone(),
            sensor: camera.sensor.to_lowercase(),
            systemctl: "systemctl".to_string(),
        }
    }

    #[cfg(test)]
    fn with_systemctl(mut self, program: &str) -> Self {
        self.systemctl = program.to_string();
        self
    }

    #[cfg(test)]
    pub fn lock_file(&self) -> &std::path::Path {
        &self.config.lock_file
    }

    async fn systemctl(&self, action: &str, unit: &str) -> Result<()> {
        let output = run_command(
            &self.systemctl,
            &["--user", action, unit],
            self.config.command_timeout,
        ).await?;

        if output.status.success() {
            debug!("systemctl --user {} {} ok", action, unit);
            Ok(())
        } else {
            Err(StreamError::arbiter(format!(
                "systemctl --user {} {} failed: {}",
                action, unit, String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    // Camera is free once the capture binary lists the sensor again
    async fn camera_listed(&self) -> bool {
        match run_command(&self.list_command, &["--list-cameras"], self.config.list_timeout).await {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .to_lowercase()
                .contains(&self.sensor),
            Err(e) => {
                debug!("Camera listing failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl ResourceArbiter for SystemdArbiter {
    async fn release(&self) -> Result<()> {
        info!("Stopping {} and {} to free the camera", self.config.timer, self.config.service);
        for unit in [&self.config.timer, &self.config.service] {
            if let Err(e) = self.systemctl("stop", unit).await {
                warn!("{}", e);
            }
        }

        let mut listed = false;
        for attempt in 1..=self.config.release_attempts {
            tokio::time::sleep(self.config.release_poll_interval).await;
            if self.camera_listed().await {
                debug!("Camera '{}' available after {} listing(s)", self.sensor, attempt);
                listed = true;
                break;
            }
        }

        if let Err(e) = tokio::fs::write(&self.config.lock_file, std::process::id().to_string()).await {
            warn!("Could not write lock file {}: {}", self.config.lock_file.display(), e);
        }

        if listed || self.config.release_attempts == 0 {
            Ok(())
        } else {
            Err(StreamError::arbiter(format!(
                "camera '{}' not listed after {} attempts",
                self.sensor, self.config.release_attempts
            )))
        }
    }

    async fn reacquire(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.config.lock_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove lock file {}: {}", self.config.lock_file.display(), e),
        }

        info!("Restarting {} and {}", self.config.timer, self.config.service);
        let mut failures = Vec::new();
        for unit in [&self.config.timer, &self.config.service] {
            if let Err(e) = self.systemctl("start", unit).await {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StreamError::arbiter(failures.join("; ")))
        }
    }
}

/// Used when no always-on service shares the camera.
pub struct NoopArbiter;

#[async_trait]
impl ResourceArbiter for NoopArbiter {
    async fn release(&self) -> Result<()> {
        debug!("No camera service configured, nothing to release");
        Ok(())
    }

    async fn reacquire(&self) -> Result<()> {
        debug!("No camera service configured, nothing to reacquire");
        Ok(())
    }
}

async fn run_command(program: &str, args: &[&str], limit: Duration) -> Result<Output> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StreamError::arbiter(format!("Failed to run {}: {}", program, e)))?;

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(StreamError::arbiter(format!("{} timed out after {:?}", program, limit))),
    }
}
