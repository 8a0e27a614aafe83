//! In-memory stand-ins for the producer binary, the always-on capture
//! service and the still-capture binary.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use crate::arbiter::ResourceArbiter;
use crate::capture::StillCapture;
use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::errors::{Result, StreamError};
use crate::producer::{ProducerExit, ProducerLauncher, ProducerProcess, SpawnedProducer};

pub fn jpeg(body: &[u8]) -> Bytes {
    let mut v = vec![0xFF, 0xD8];
    v.extend_from_slice(body);
    v.extend_from_slice(&[0xFF, 0xD9]);
    Bytes::from(v)
}

/// Production defaults with every wait shrunk to test scale.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.camera.chunk_read_size = 4096;
    config.stream.readiness_timeout = Duration::from_millis(300);
    config.stream.readiness_poll_interval = Duration::from_millis(10);
    config.stream.stop_grace = Duration::from_millis(100);
    config.stream.kill_grace = Duration::from_millis(100);
    config.stream.frame_wait = Duration::from_millis(500);
    config.stream.feed_wait = Duration::from_millis(300);
    config.stream.client_poll_interval = Duration::from_millis(5);
    config.stream.still_timeout = Duration::from_millis(200);
    config.arbiter.enabled = false;
    config
}

/// Shared ordered record of collaborator calls.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| e.as_str() == event).count()
    }
}

pub enum FakeBehavior {
    /// Write these frames once, then stay alive and quiet.
    Frames(Vec<Bytes>),
    /// Write a fresh frame every few milliseconds until stopped.
    Streaming,
    /// Stay alive without writing anything.
    Silent,
    /// Like `Silent`, and only a kill gets rid of it.
    IgnoresTerm,
    /// Exit straight away with this code and stderr.
    Exits { code: i32, stderr: String },
    SpawnFails,
}

#[derive(Default)]
struct Ledger {
    live: AtomicUsize,
    max_live: AtomicUsize,
    kills: AtomicUsize,
    launches: Mutex<Vec<Vec<String>>>,
}

/// Launcher whose processes are tasks writing into a `tokio::io::duplex`.
/// Unscripted launches behave as `Streaming`.
pub struct FakeLauncher {
    script: Mutex<VecDeque<FakeBehavior>>,
    ledger: Arc<Ledger>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            ledger: Arc::new(Ledger::default()),
        }
    }

    pub fn push(&self, behavior: FakeBehavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    pub fn live_count(&self) -> usize {
        self.ledger.live.load(Ordering::SeqCst)
    }

    /// Highest number of producers ever alive at the same time.
    pub fn max_live(&self) -> usize {
        self.ledger.max_live.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.ledger.kills.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> Vec<Vec<String>> {
        self.ledger.launches.lock().unwrap().clone()
    }
}

impl ProducerLauncher for FakeLauncher {
    fn launch(&self, program: &str, args: &[String]) -> Result<SpawnedProducer> {
        let behavior = self.script.lock().unwrap().pop_front().unwrap_or(FakeBehavior::Streaming);
        if let FakeBehavior::SpawnFails = behavior {
            return Err(StreamError::launch(format!("Failed to launch {}: No such file or directory", program)));
        }
        self.ledger.launches.lock().unwrap().push(args.to_vec());

        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        let alive = Arc::new(AtomicBool::new(true));
        let mut process = FakeProcess {
            alive: alive.clone(),
            code: None,
            stderr: Vec::new(),
            ignores_term: false,
            ledger: self.ledger.clone(),
        };

        match behavior {
            FakeBehavior::Exits { code, stderr } => {
                alive.store(false, Ordering::SeqCst);
                process.code = Some(code);
                process.stderr = stderr.into_bytes();
                drop(writer);
            }
            behavior => {
                let live = self.ledger.live.fetch_add(1, Ordering::SeqCst) + 1;
                self.ledger.max_live.fetch_max(live, Ordering::SeqCst);
                process.ignores_term = matches!(behavior, FakeBehavior::IgnoresTerm);

                tokio::spawn(async move {
                    let mut n = 0u64;
                    if let FakeBehavior::Frames(frames) = &behavior {
                        for frame in frames {
                            if writer.write_all(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    while alive.load(Ordering::SeqCst) {
                        if let FakeBehavior::Streaming = behavior {
                            n += 1;
                            let frame = jpeg(format!("frame-{}", n).as_bytes());
                            if writer.write_all(&frame).await.is_err() {
                                return;
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    // dropping the writer closes the output like a dead process would
                });
            }
        }

        Ok(SpawnedProducer {
            process: Box::new(process),
            output: Box::new(reader),
        })
    }
}

struct FakeProcess {
    alive: Arc<AtomicBool>,
    code: Option<i32>,
    stderr: Vec<u8>,
    ignores_term: bool,
    ledger: Arc<Ledger>,
}

impl FakeProcess {
    fn die(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.ledger.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ProducerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ProducerExit>> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(ProducerExit { code: self.code }))
        }
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        if !self.ignores_term {
            self.die();
        }
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.ledger.kills.fetch_add(1, Ordering::SeqCst);
        self.die();
        Ok(())
    }

    async fn wait(&mut self) -> std::io::Result<ProducerExit> {
        while self.alive.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(ProducerExit { code: self.code })
    }

    async fn diagnostics(&mut self) -> Vec<u8> {
        self.stderr.clone()
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        // mirrors kill_on_drop
        self.die();
    }
}

/// Arbiter that only records what it was asked to do.
#[derive(Clone, Default)]
pub struct RecordingArbiter {
    pub log: EventLog,
}

impl RecordingArbiter {
    pub fn releases(&self) -> usize {
        self.log.count("release")
    }

    pub fn reacquires(&self) -> usize {
        self.log.count("reacquire")
    }
}

#[async_trait]
impl ResourceArbiter for RecordingArbiter {
    async fn release(&self) -> Result<()> {
        self.log.push("release");
        Ok(())
    }

    async fn reacquire(&self) -> Result<()> {
        self.log.push("reacquire");
        Ok(())
    }
}

pub enum StillBehavior {
    Writes(Bytes),
    Fails(String),
    TimesOut,
    /// Writes the bytes after sleeping this long.
    Slow(Duration, Bytes),
}

/// Still capture that writes canned bytes, fails, or reports a timeout.
pub struct FakeStillCapture {
    behavior: StillBehavior,
    log: EventLog,
    calls: AtomicUsize,
}

impl FakeStillCapture {
    pub fn new(behavior: StillBehavior, log: EventLog) -> Self {
        Self { behavior, log, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StillCapture for FakeStillCapture {
    async fn capture(&self, args: &[String], output: &Path, _timeout: Duration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.push("still");
        assert!(args.iter().any(|a| a == "--immediate"));
        match &self.behavior {
            StillBehavior::Writes(data) => {
                tokio::fs::write(output, data).await?;
                Ok(())
            }
            StillBehavior::Fails(stderr) => Err(StreamError::capture(stderr.clone())),
            StillBehavior::TimesOut => Err(StreamError::CaptureTimeout { secs: 30 }),
            StillBehavior::Slow(delay, data) => {
                tokio::time::sleep(*delay).await;
                tokio::fs::write(output, data).await?;
                Ok(())
            }
        }
    }
}

/// Config store held in memory, keeping every saved version with its note.
#[derive(Clone, Default)]
pub struct MemoryConfigStore {
    versions: Arc<Mutex<Vec<(String, Map<String, Value>)>>>,
}

impl MemoryConfigStore {
    pub fn with(config: Value) -> Self {
        let store = Self::default();
        if let Value::Object(map) = config {
            store.versions.lock().unwrap().push(("initial".to_string(), map));
        }
        store
    }

    pub fn notes(&self) -> Vec<String> {
        self.versions.lock().unwrap().iter().map(|(note, _)| note.clone()).collect()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<Map<String, Value>> {
        Ok(self.versions.lock().unwrap().last().map(|(_, config)| config.clone()).unwrap_or_default())
    }

    async fn save(&self, config: &Map<String, Value>, note: &str) -> Result<()> {
        self.versions.lock().unwrap().push((note.to_string(), config.clone()));
        Ok(())
    }
}
