//! Delivery of engine output to the outside world.
//!
//! Pipelines never call a sink directly. They push `SinkMessage`s into an
//! `Outbox`; a single `SinkWorker` thread drains it and hands each message
//! to every configured sink in turn. The queue is bounded: while sinks fall
//! behind, progress updates are shed and violations wait for room.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::event::{ProgressUpdate, SinkMessage, VideoInfo, VideoStatus, ViolationEvent};
use crate::metrics::PipelineMetrics;

/// Destination for violations and video lifecycle records.
///
/// Delivery is at-least-once: the same event may be emitted again after a
/// failed attempt, so implementations must tolerate repeats (the
/// `event_id` is the de-duplication key).
pub trait EventSink: Send {
    fn name(&self) -> &str;

    fn emit(&mut self, event: &ViolationEvent) -> Result<()>;

    fn video_started(&mut self, _info: &VideoInfo) -> Result<()> {
        Ok(())
    }

    fn progress(&mut self, _update: &ProgressUpdate) -> Result<()> {
        Ok(())
    }

    fn video_finished(
        &mut self,
        _video_id: &str,
        _status: VideoStatus,
        _violations: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn deliver(&mut self, message: &SinkMessage) -> Result<()> {
        match message {
            SinkMessage::VideoStarted(info) => self.video_started(info),
            SinkMessage::Violation(event) => self.emit(event),
            SinkMessage::Progress(update) => self.progress(update),
            SinkMessage::VideoFinished {
                video_id,
                status,
                violations,
            } => self.video_finished(video_id, *status, *violations),
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the wait after failed attempt `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    /// Wait drawn uniformly from the upper half of the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }
}

/// Wraps a sink and retries each delivery according to a `RetryPolicy`.
pub struct RetryingSink<S> {
    inner: S,
    policy: RetryPolicy,
    sleep: fn(Duration),
}

impl<S: EventSink> RetryingSink<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            sleep: std::thread::sleep,
        }
    }

    /// Replace the sleep function (tests use a no-op).
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn attempt<F>(&mut self, what: &str, mut op: F) -> Result<()>
    where
        F: FnMut(&mut S) -> Result<()>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match op(&mut self.inner) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt < attempts {
                        let wait = self.policy.delay(attempt);
                        log::warn!(
                            "{}: {} failed (attempt {}/{}): {}; retrying in {:?}",
                            self.inner.name(),
                            what,
                            attempt,
                            attempts,
                            e,
                            wait
                        );
                        (self.sleep)(wait);
                    }
                    last_err = Some(e);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no delivery attempt made"));
        Err(err.context(format!(
            "{}: {} failed after {} attempts",
            self.inner.name(),
            what,
            attempts
        )))
    }
}

impl<S: EventSink> EventSink for RetryingSink<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn emit(&mut self, event: &ViolationEvent) -> Result<()> {
        self.attempt("violation", |sink| sink.emit(event))
    }

    fn deliver(&mut self, message: &SinkMessage) -> Result<()> {
        let what = match message {
            SinkMessage::VideoStarted(_) => "video start",
            SinkMessage::Violation(_) => "violation",
            SinkMessage::Progress(_) => "progress",
            SinkMessage::VideoFinished { .. } => "video finish",
        };
        self.attempt(what, |sink| sink.deliver(message))
    }
}

/// Messages the outbox holds before progress updates start being dropped.
pub const DEFAULT_OUTBOX_DEPTH: usize = 1024;

/// Sending half of the sink queue. Cheap to clone.
///
/// The queue is bounded. Progress updates are dropped when it is full (a
/// later update supersedes them); violations and lifecycle messages wait
/// for room instead.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::SyncSender<SinkMessage>,
    metrics: Arc<PipelineMetrics>,
}

impl Outbox {
    pub fn send(&self, message: SinkMessage) {
        if let SinkMessage::Progress(update) = &message {
            match self.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::TrySendError::Full(_)) => {
                    self.metrics.inc(&self.metrics.progress_dropped);
                    log::debug!(
                        "outbox full; dropping progress for video {} at frame {}",
                        update.video_id,
                        update.frames_processed
                    );
                }
                Err(mpsc::TrySendError::Disconnected(_)) => {
                    log::warn!("sink worker gone; dropping outbound message");
                }
            }
            return;
        }
        if self.tx.send(message).is_err() {
            log::warn!("sink worker gone; dropping outbound message");
        }
    }

    pub fn send_all(&self, messages: impl IntoIterator<Item = SinkMessage>) {
        for message in messages {
            self.send(message);
        }
    }
}

/// Background thread delivering outbox messages to every sink.
pub struct SinkWorker {
    handle: JoinHandle<()>,
}

impl SinkWorker {
    pub fn spawn(sinks: Vec<Box<dyn EventSink>>, metrics: Arc<PipelineMetrics>) -> (Outbox, Self) {
        Self::with_capacity(sinks, metrics, DEFAULT_OUTBOX_DEPTH)
    }

    pub fn with_capacity(
        sinks: Vec<Box<dyn EventSink>>,
        metrics: Arc<PipelineMetrics>,
        capacity: usize,
    ) -> (Outbox, Self) {
        let (tx, rx) = mpsc::sync_channel::<SinkMessage>(capacity);
        let worker_metrics = Arc::clone(&metrics);
        let handle = std::thread::spawn(move || run_sinks(rx, sinks, worker_metrics));
        (Outbox { tx, metrics }, Self { handle })
    }

    /// Wait for the queue to drain. Returns once every `Outbox` clone has
    /// been dropped and the last message delivered.
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| anyhow!("sink worker panicked"))
    }
}

fn run_sinks(
    rx: mpsc::Receiver<SinkMessage>,
    mut sinks: Vec<Box<dyn EventSink>>,
    metrics: Arc<PipelineMetrics>,
) {
    for message in rx {
        for sink in sinks.iter_mut() {
            match sink.deliver(&message) {
                Ok(()) => metrics.inc(&metrics.sink_deliveries),
                Err(e) => {
                    metrics.inc(&metrics.sink_failures);
                    log::error!(
                        "{}: giving up on message for video {}: {:#}",
                        sink.name(),
                        message.video_id(),
                        e
                    );
                }
            }
        }
    }
    log::debug!("sink worker: outbox closed");
}

/// Keeps every message in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct CollectingSink {
    messages: Arc<Mutex<Vec<SinkMessage>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<SinkMessage> {
        self.messages
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn violations(&self) -> Vec<ViolationEvent> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                SinkMessage::Violation(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn push(&self, message: SinkMessage) -> Result<()> {
        self.messages
            .lock()
            .map_err(|_| anyhow!("collecting sink lock poisoned"))?
            .push(message);
        Ok(())
    }
}

impl EventSink for CollectingSink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&mut self, event: &ViolationEvent) -> Result<()> {
        self.push(SinkMessage::Violation(event.clone()))
    }

    fn deliver(&mut self, message: &SinkMessage) -> Result<()> {
        self.push(message.clone())
    }
}

/// Writes each violation as one JSON line.
pub struct JsonLinesSink<W> {
    out: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn emit(&mut self, event: &ViolationEvent) -> Result<()> {
        let line = serde_json::to_string(event).context("serialize violation")?;
        writeln!(self.out, "{}", line).context("write violation")?;
        self.out.flush().context("flush violation output")?;
        Ok(())
    }
}
