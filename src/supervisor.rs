//! Routes frames to per-video workers.
//!
//! Every video gets its own thread owning its `VideoPipeline`. Inboxes are
//! bounded and dispatch never waits on them: a frame for a video whose inbox
//! is full is dropped and counted, so one slow video cannot hold up intake
//! for the others. A worker that fails is reported and reaped, other videos
//! keep running.

use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::detect::{DetectionAdapter, FrameDetections};
use crate::engine::{EngineConfig, VideoPipeline};
use crate::event::{SinkMessage, VideoInfo, VideoStatus};
use crate::metrics::PipelineMetrics;
use crate::roi::RoiRegistry;
use crate::sink::Outbox;
use crate::transport::FrameMessage;

enum WorkerCommand {
    Frame(FrameDetections),
    Complete,
    Stop,
}

struct Worker {
    tx: SyncSender<WorkerCommand>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// What a dispatched frame turned into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    /// The video's inbox was full; the frame was discarded.
    Dropped,
    /// The video was completed, cancelled or failed earlier.
    Closed,
}

pub struct Supervisor {
    config: EngineConfig,
    adapter: DetectionAdapter,
    registry: Arc<RoiRegistry>,
    metrics: Arc<PipelineMetrics>,
    outbox: Outbox,
    queue_depth: usize,
    workers: HashMap<String, Worker>,
    retired: Vec<(String, JoinHandle<()>)>,
    closed: HashSet<String>,
}

impl Supervisor {
    pub fn new(
        config: EngineConfig,
        registry: Arc<RoiRegistry>,
        metrics: Arc<PipelineMetrics>,
        outbox: Outbox,
        queue_depth: usize,
    ) -> Self {
        Self {
            adapter: DetectionAdapter::new(config.confidence_floor, config.fps),
            config,
            registry,
            metrics,
            outbox,
            queue_depth: queue_depth.max(1),
            workers: HashMap::new(),
            retired: Vec::new(),
            closed: HashSet::new(),
        }
    }

    pub fn active_videos(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_closed(&self, video_id: &str) -> bool {
        self.closed.contains(video_id)
    }

    /// Normalize a frame and hand it to its video's worker, starting one if
    /// needed. Never blocks.
    pub fn dispatch(&mut self, message: FrameMessage) -> Result<Dispatch> {
        self.reap();
        crate::validate_video_id(&message.video_id)?;
        let video_id = message.video_id.clone();
        if self.closed.contains(&video_id) {
            log::warn!(
                "video {}: frame {} arrived after the video was closed, ignoring",
                video_id,
                message.frame_number
            );
            return Ok(Dispatch::Closed);
        }

        if !self.workers.contains_key(&video_id) {
            let worker = self.spawn_worker(message.video_info())?;
            self.workers.insert(video_id.clone(), worker);
            self.metrics.inc(&self.metrics.videos_started);
            log::info!("video {}: processing started", video_id);
        }

        let adapted = self.adapter.normalize_frame(&message.into_raw());
        self.metrics
            .add(&self.metrics.detections_rejected, adapted.rejected.len() as u64);

        let frame_number = adapted.frame.frame_number;
        let Some(worker) = self.workers.get(&video_id) else {
            return Err(anyhow!("video {}: no worker", video_id));
        };
        match worker.tx.try_send(WorkerCommand::Frame(adapted.frame)) {
            Ok(()) => Ok(Dispatch::Queued),
            Err(TrySendError::Full(_)) => {
                self.metrics.inc(&self.metrics.frames_dropped);
                log::warn!(
                    "video {}: inbox full, dropping frame {}",
                    video_id,
                    frame_number
                );
                Ok(Dispatch::Dropped)
            }
            Err(TrySendError::Disconnected(_)) => {
                // The worker exited between reaping and sending: it failed.
                if let Some(worker) = self.workers.remove(&video_id) {
                    self.retire(video_id.clone(), worker.handle);
                }
                self.closed.insert(video_id.clone());
                Err(anyhow!("video {}: worker is gone", video_id))
            }
        }
    }

    /// Flush buffered frames and mark the video completed.
    pub fn complete(&mut self, video_id: &str) -> bool {
        self.close(video_id, WorkerCommand::Complete)
    }

    /// Halt intake and discard the video's tracks without resolving them.
    pub fn cancel(&mut self, video_id: &str) -> bool {
        match self.workers.get(video_id) {
            Some(worker) => worker.stop.store(true, Ordering::Release),
            None => return false,
        }
        self.close(video_id, WorkerCommand::Stop)
    }

    /// Control commands wait for room in the inbox; they are never dropped.
    fn close(&mut self, video_id: &str, command: WorkerCommand) -> bool {
        let Some(worker) = self.workers.remove(video_id) else {
            log::debug!("video {}: no active worker", video_id);
            return false;
        };
        if worker.tx.send(command).is_err() {
            log::warn!("video {}: worker exited before it could be closed", video_id);
        }
        self.closed.insert(video_id.to_string());
        self.retire(video_id.to_string(), worker.handle);
        true
    }

    /// Close every inbox and wait for the workers. Open videos flush their
    /// buffered frames but stay in `processing`.
    pub fn shutdown(mut self) -> Result<()> {
        let workers: Vec<(String, Worker)> = self.workers.drain().collect();
        for (video_id, worker) in workers {
            drop(worker.tx);
            self.retired.push((video_id, worker.handle));
        }
        let mut panicked = 0usize;
        for (video_id, handle) in self.retired.drain(..) {
            if handle.join().is_err() {
                log::error!("video {}: worker panicked", video_id);
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow!("{} video worker(s) panicked", panicked));
        }
        Ok(())
    }

    fn retire(&mut self, video_id: String, handle: JoinHandle<()>) {
        self.retired.push((video_id, handle));
    }

    /// Join finished workers and close videos whose worker died on its own.
    fn reap(&mut self) {
        let dead: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(video_id, _)| video_id.clone())
            .collect();
        for video_id in dead {
            if let Some(worker) = self.workers.remove(&video_id) {
                self.closed.insert(video_id.clone());
                self.retire(video_id, worker.handle);
            }
        }

        let (done, pending): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|(_, handle)| handle.is_finished());
        self.retired = pending;
        for (video_id, handle) in done {
            if handle.join().is_err() {
                self.metrics.inc(&self.metrics.videos_failed);
                log::error!("video {}: worker panicked", video_id);
            }
        }
    }

    fn spawn_worker(&self, info: VideoInfo) -> Result<Worker> {
        let video_id = info.video_id.clone();
        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        let stop = Arc::new(AtomicBool::new(false));
        let pipeline = VideoPipeline::new(
            video_id.as_str(),
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );
        let ctx = WorkerContext {
            info,
            pipeline,
            rx,
            stop: Arc::clone(&stop),
            outbox: self.outbox.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        let handle = std::thread::Builder::new()
            .name(format!("video-{}", video_id))
            .spawn(move || ctx.run())
            .with_context(|| format!("spawn worker for video {}", video_id))?;
        Ok(Worker { tx, stop, handle })
    }
}

struct WorkerContext {
    info: VideoInfo,
    pipeline: VideoPipeline,
    rx: Receiver<WorkerCommand>,
    stop: Arc<AtomicBool>,
    outbox: Outbox,
    metrics: Arc<PipelineMetrics>,
}

impl WorkerContext {
    fn run(mut self) {
        self.outbox
            .send(SinkMessage::VideoStarted(std::mem::take(&mut self.info)));
        while let Ok(command) = self.rx.recv() {
            let stopping = self.stop.load(Ordering::Acquire);
            match command {
                WorkerCommand::Frame(_) if stopping => {}
                WorkerCommand::Frame(frame) => {
                    let frame_number = frame.frame_number;
                    match self.pipeline.push(frame) {
                        Ok(messages) => self.outbox.send_all(messages),
                        Err(e) => {
                            self.metrics.inc(&self.metrics.videos_failed);
                            log::error!(
                                "video {}: failed at frame {}: {:#}",
                                self.pipeline.video_id(),
                                frame_number,
                                e
                            );
                            self.finished(VideoStatus::Failed);
                            return;
                        }
                    }
                }
                WorkerCommand::Complete => {
                    let messages = self.pipeline.finish();
                    self.outbox.send_all(messages);
                    log::info!(
                        "video {}: completed ({} frames, {} violations)",
                        self.pipeline.video_id(),
                        self.pipeline.frames_processed(),
                        self.pipeline.violations()
                    );
                    self.finished(VideoStatus::Completed);
                    return;
                }
                WorkerCommand::Stop => {
                    self.pipeline.cancel();
                    self.finished(VideoStatus::Cancelled);
                    return;
                }
            }
        }

        // Inbox closed by shutdown.
        let messages = self.pipeline.finish();
        self.outbox.send_all(messages);
        log::info!(
            "video {}: worker stopped at shutdown after {} frames",
            self.pipeline.video_id(),
            self.pipeline.frames_processed()
        );
    }

    fn finished(&self, status: VideoStatus) {
        self.outbox.send(SinkMessage::VideoFinished {
            video_id: self.pipeline.video_id().to_string(),
            status,
            violations: self.pipeline.violations(),
        });
    }
}
