//! Channel pollers
//!
//! A [`Poller`] owns exactly one [`CaptureChannel`] and drains it from a
//! dedicated background thread: sleep until the next tick, read the channel,
//! filter implausible raw values, run the consumer's transform, swap the
//! published snapshot. Control is asynchronous: pause/resume/stop are
//! non-blocking signals, every transition is idempotent, and no lock is
//! ever held across a remote read. A remote-read failure is "no data this
//! tick", logged at a rate-limited level; this is monitoring infrastructure
//! and must degrade, not crash.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;

use tapwire_memory::{plausible_address, RemoteProcess};

use crate::channel::CaptureChannel;

/// Minimum spacing between remote-read failure warnings
const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// How long `stop` waits for the loop to acknowledge before joining anyway
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Control signals for the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollControl {
    Pause,
    Resume,
    Stop,
}

/// Shared snapshot storage; the write lock is held only for the swap
type Snapshot<R> = Arc<RwLock<Arc<Vec<R>>>>;

/// Background drain task for one capture channel
pub struct Poller<R: Send + Sync + 'static> {
    control: Sender<PollControl>,
    ack: Receiver<()>,
    snapshot: Snapshot<R>,
    handle: Option<JoinHandle<()>>,
}

impl<R: Send + Sync + 'static> Poller<R> {
    /// Spawn the poll loop.
    ///
    /// `transform` resolves one plausible raw word into a domain record, or
    /// `None` to drop it; it runs on the poll thread. `min_raw` is the
    /// lowest raw value considered a plausible capture (zero is always
    /// filtered).
    pub fn spawn<P, F>(
        process: Arc<P>,
        channel: CaptureChannel,
        tick: Duration,
        min_raw: u64,
        transform: F,
    ) -> Self
    where
        P: RemoteProcess + Send + Sync + 'static,
        F: Fn(u64) -> Option<R> + Send + 'static,
    {
        // Control must be lossless: an unbounded queue means a Resume can
        // never be shed behind a burst of Pauses. The loop handles every
        // signal idempotently, so redundant entries only cost a recv.
        let (control_tx, control_rx) = unbounded();
        let (ack_tx, ack_rx) = bounded(1);
        let snapshot: Snapshot<R> = Arc::new(RwLock::new(Arc::new(Vec::new())));
        let loop_snapshot = snapshot.clone();

        let handle = std::thread::spawn(move || {
            poll_loop(
                &*process,
                channel,
                tick,
                min_raw,
                transform,
                loop_snapshot,
                control_rx,
            );
            let _ = ack_tx.try_send(());
        });

        Self {
            control: control_tx,
            ack: ack_rx,
            snapshot,
            handle: Some(handle),
        }
    }

    /// Current published snapshot (cheap Arc clone)
    pub fn snapshot(&self) -> Arc<Vec<R>> {
        self.snapshot.read().clone()
    }

    /// Ask the loop to pause: the snapshot is cleared once, then frozen
    /// until [`resume`](Self::resume). Duplicate signals are harmless.
    pub fn pause(&self) {
        self.signal(PollControl::Pause);
    }

    /// Ask the loop to resume ticking; the snapshot refreshes within one tick
    pub fn resume(&self) {
        self.signal(PollControl::Resume);
    }

    /// Stop the loop and join the thread. Idempotent; safe to call from
    /// shutdown, error-recovery and user-toggle paths alike.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.control.send(PollControl::Stop);
        // Wait briefly for acknowledgment so hook removal that follows is
        // serialized against the loop's last remote read.
        if self.ack.recv_timeout(STOP_ACK_TIMEOUT).is_err() {
            tracing::warn!("poll loop did not acknowledge stop in time");
        }
        if handle.join().is_err() {
            tracing::error!("poll thread panicked");
        }
    }

    fn signal(&self, ctl: PollControl) {
        // Only fails once the loop has exited; pause/resume after stop is
        // a no-op.
        if let Err(TrySendError::Disconnected(ctl)) = self.control.try_send(ctl) {
            tracing::trace!("poll control signal {:?} after loop exit", ctl);
        }
    }
}

impl<R: Send + Sync + 'static> Drop for Poller<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop<P, R, F>(
    process: &P,
    channel: CaptureChannel,
    tick: Duration,
    min_raw: u64,
    transform: F,
    snapshot: Snapshot<R>,
    control: Receiver<PollControl>,
) where
    P: RemoteProcess + ?Sized,
    F: Fn(u64) -> Option<R>,
{
    let mut paused = false;
    let mut last_warn: Option<Instant> = None;

    loop {
        match control.recv_timeout(tick) {
            Ok(PollControl::Pause) => {
                if !paused {
                    paused = true;
                    // Clear once so a paused consumer never acts on a view
                    // that silently went stale.
                    *snapshot.write() = Arc::new(Vec::new());
                }
            }
            Ok(PollControl::Resume) => {
                if paused {
                    paused = false;
                    poll_once(process, &channel, min_raw, &transform, &snapshot, &mut last_warn);
                }
            }
            Ok(PollControl::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !paused {
                    poll_once(process, &channel, min_raw, &transform, &snapshot, &mut last_warn);
                }
            }
        }
    }
}

fn poll_once<P, R, F>(
    process: &P,
    channel: &CaptureChannel,
    min_raw: u64,
    transform: &F,
    snapshot: &Snapshot<R>,
    last_warn: &mut Option<Instant>,
) where
    P: RemoteProcess + ?Sized,
    F: Fn(u64) -> Option<R>,
{
    let raw = match channel.drain(process) {
        Ok(raw) => raw,
        Err(e) => {
            // No data this tick; the previous snapshot stays published.
            let now = Instant::now();
            if last_warn.map_or(true, |t| now.duration_since(t) >= WARN_INTERVAL) {
                tracing::warn!("channel read at {:x} failed: {}", channel.base(), e);
                *last_warn = Some(now);
            }
            return;
        }
    };

    let records: Vec<R> = raw
        .into_iter()
        .filter(|&v| plausible_address(v, min_raw))
        .filter_map(transform)
        .collect();

    *snapshot.write() = Arc::new(records);
}
