use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::frame::Frame;
use crate::settings::StreamSettings;

/// Holds the newest frame and hands it out to any number of readers.
///
/// The extraction task is the only writer. Readers never block it: the latest
/// frame sits in a `watch` channel, whose internal version doubles as the
/// broadcast-and-reset gate for `await_frame`. Older frames are replaced, not
/// queued, so slow readers skip frames instead of falling behind.
///
/// The hub also carries the producer liveness word that subscribers poll:
/// `generation << 1 | live`. The supervisor bumps the generation for every
/// process it launches; an extraction task may only clear the live bit of its
/// own generation, so a task that outlives its process cannot mark the
/// replacement dead.
pub struct FrameHub {
    latest: watch::Sender<Option<Frame>>,
    settings: watch::Sender<StreamSettings>,
    next_seq: AtomicU64,
    clients: AtomicUsize,
    liveness: AtomicU64,
    poll_interval: Duration,
}

impl FrameHub {
    pub fn new(poll_interval: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        let (settings, _) = watch::channel(StreamSettings::default());
        Self {
            latest,
            settings,
            next_seq: AtomicU64::new(0),
            clients: AtomicUsize::new(0),
            liveness: AtomicU64::new(0),
            poll_interval,
        }
    }

    /// Store `data` as the latest frame and wake everyone waiting for one.
    pub fn publish(&self, data: Bytes) -> Frame {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Frame { seq, data };
        self.latest.send_replace(Some(frame.clone()));
        frame
    }

    /// Forget the latest frame so readiness waits only see the next producer's output.
    pub fn clear_frame(&self) {
        self.latest.send_replace(None);
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest.borrow().clone()
    }

    pub fn has_frame(&self) -> bool {
        self.latest.borrow().is_some()
    }

    /// Latest frame right away if there is one, otherwise the next one published
    /// within `wait`.
    pub async fn await_frame(&self, wait: Duration) -> Option<Frame> {
        let mut rx = self.latest.subscribe();
        // bound first: the Ref borrows `rx` and must be gone before it is
        let frame = match tokio::time::timeout(wait, rx.wait_for(Option::is_some)).await {
            Ok(Ok(frame)) => (*frame).clone(),
            _ => None,
        };
        frame
    }

    /// Start a per-client frame sequence. The client count stays raised until
    /// the returned subscription is dropped.
    pub fn subscribe(self: &Arc<Self>) -> FrameSubscription {
        let id = Uuid::new_v4();
        let clients = self.clients.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Stream client {} subscribed ({} active)", id, clients);
        FrameSubscription {
            id,
            hub: Arc::clone(self),
            rx: self.latest.subscribe(),
            last_seq: None,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn latest_settings(&self) -> StreamSettings {
        self.settings.borrow().clone()
    }

    pub fn set_settings(&self, settings: StreamSettings) {
        self.settings.send_replace(settings);
    }

    /// Mark a new producer generation live and return its number.
    pub fn begin_generation(&self) -> u64 {
        let previous = self.liveness
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| Some((((word >> 1) + 1) << 1) | 1))
            .unwrap_or_else(|word| word);
        (previous >> 1) + 1
    }

    /// Clear the live bit whatever the generation (explicit stop).
    pub fn mark_down(&self) {
        self.liveness.fetch_and(!1, Ordering::SeqCst);
    }

    /// Clear the live bit only if `generation` is still the current one.
    pub fn producer_exited(&self, generation: u64) -> bool {
        let live = (generation << 1) | 1;
        self.liveness
            .compare_exchange(live, generation << 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_live(&self) -> bool {
        self.liveness.load(Ordering::SeqCst) & 1 == 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.liveness.load(Ordering::SeqCst) == (generation << 1) | 1
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.liveness.load(Ordering::SeqCst) >> 1
    }
}

/// A lazy, unbounded sequence of frames for one stream client.
///
/// Each step re-checks producer liveness, hands out the latest frame if it is
/// newer than the last one delivered, or sleeps for the poll interval (waking
/// early on publish). Dropping it, on any path, decrements the client count.
pub struct FrameSubscription {
    id: Uuid,
    hub: Arc<FrameHub>,
    rx: watch::Receiver<Option<Frame>>,
    last_seq: Option<u64>,
}

impl FrameSubscription {
    /// Next unseen frame, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            if !self.hub.is_live() {
                return None;
            }

            let latest = self.rx.borrow_and_update().clone();
            if let Some(frame) = latest {
                if self.last_seq != Some(frame.seq) {
                    self.last_seq = Some(frame.seq);
                    return Some(frame);
                }
            }

            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep(self.hub.poll_interval) => {}
            }
        }
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        let remaining = self.hub.clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .map(|previous| previous - 1)
            .unwrap_or(0);
        debug!("Stream client {} unsubscribed ({} active)", self.id, remaining);
    }
}
