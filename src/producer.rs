use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::errors::{Result, StreamError};

// Enough stderr for any diagnostic we report; the rest is only logged
const STDERR_CAPTURE_LIMIT: usize = 4096;
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// How a producer process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerExit {
    pub code: Option<i32>,
}

impl fmt::Display for ProducerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}", code),
            None => write!(f, "signal"),
        }
    }
}

/// A freshly spawned producer: the process handle plus its stdout.
pub struct SpawnedProducer {
    pub process: Box<dyn ProducerProcess>,
    pub output: Box<dyn AsyncRead + Send + Unpin>,
}

/// Starts producer processes. Swapped for an in-memory fake in tests.
pub trait ProducerLauncher: Send + Sync {
    fn launch(&self, program: &str, args: &[String]) -> Result<SpawnedProducer>;
}

#[async_trait]
pub trait ProducerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> std::io::Result<Option<ProducerExit>>;

    /// Ask the process to shut down (SIGTERM).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Force the process down (SIGKILL).
    fn kill(&mut self) -> std::io::Result<()>;

    async fn wait(&mut self) -> std::io::Result<ProducerExit>;

    /// Whatever the process has written to stderr so far (bounded). Once the
    /// process has exited this waits briefly for the remaining output.
    async fn diagnostics(&mut self) -> Vec<u8>;
}

/// Launches real binaries through `tokio::process`.
pub struct CommandLauncher;

impl ProducerLauncher for CommandLauncher {
    fn launch(&self, program: &str, args: &[String]) -> Result<SpawnedProducer> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::launch(format!("Failed to launch {}: {}", program, e)))?;

        let stdout = child.stdout.take()
            .ok_or_else(|| StreamError::launch(format!("Failed to get {} stdout", program)))?;

        let stderr = Arc::new(Mutex::new(Vec::new()));
        let drain = child.stderr.take()
            .map(|pipe| tokio::spawn(drain_stderr(program.to_string(), pipe, stderr.clone())));

        info!("Started {} (pid {:?})", program, child.id());
        Ok(SpawnedProducer {
            process: Box::new(ChildProcess { child, stderr, drain }),
            output: Box::new(stdout),
        })
    }
}

struct ChildProcess {
    child: Child,
    stderr: Arc<Mutex<Vec<u8>>>,
    drain: Option<JoinHandle<()>>,
}

#[async_trait]
impl ProducerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ProducerExit>> {
        Ok(self.child.try_wait()?.map(|status| ProducerExit { code: status.code() }))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(()); // already reaped
        };
        let pid = i32::try_from(pid).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> std::io::Result<ProducerExit> {
        let status = self.child.wait().await?;
        Ok(ProducerExit { code: status.code() })
    }

    async fn diagnostics(&mut self) -> Vec<u8> {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            if let Some(drain) = self.drain.take() {
                let _ = tokio::time::timeout(DRAIN_GRACE, drain).await;
            }
        }
        self.stderr.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

// Keep reading stderr so the pipe never fills and stalls the producer
async fn drain_stderr(program: String, pipe: ChildStderr, captured: Arc<Mutex<Vec<u8>>>) {
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                debug!("{}: {}", program, String::from_utf8_lossy(&line).trim_end());
                let mut buf = captured.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let room = STDERR_CAPTURE_LIMIT.saturating_sub(buf.len());
                buf.extend_from_slice(&line[..line.len().min(room)]);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_missing_binary_is_a_launch_error() {
        let err = CommandLauncher
            .launch("/nonexistent/rpicam-vid", &[])
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Launch { .. }));
        assert!(err.to_string().contains("Failed to launch /nonexistent/rpicam-vid"));
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_are_captured() {
        let args = vec!["-c".to_string(), "printf frame; printf 'oops\\n' >&2; exit 3".to_string()];
        let mut spawned = CommandLauncher.launch("sh", &args).unwrap();

        let mut out = Vec::new();
        spawned.output.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"frame");

        let exit = spawned.process.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert_eq!(spawned.process.diagnostics().await, b"oops\n");
    }

    #[tokio::test]
    async fn test_terminate_stops_a_sleeping_process() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let mut spawned = CommandLauncher.launch("sh", &args).unwrap();
        assert!(spawned.process.try_wait().unwrap().is_none());

        spawned.process.terminate().unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.process.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, None);
    }
}
