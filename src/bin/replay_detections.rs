//! replay_detections - run recorded detector output through the engine.
//!
//! Reads one `FrameMessage` JSON object per line and writes every violation
//! as one JSON line on stdout. With `--db`, videos and violations are also
//! persisted the same way the daemon persists them.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use hygiene_kernel::config::parse_roi_coords;
use hygiene_kernel::sink::JsonLinesSink;
use hygiene_kernel::transport::FrameMessage;
use hygiene_kernel::{
    DetectionAdapter, EventSink, MonitorConfig, PipelineMetrics, Roi, RoiRegistry, SinkMessage,
    SqliteViolationStore, VideoPipeline, VideoStatus,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay recorded detections through the hygiene engine")]
struct Args {
    /// JSONL file with one frame message per line.
    input: PathBuf,
    /// Also persist videos and violations to this SQLite database.
    #[arg(long, env = "HYGIENE_REPLAY_DB")]
    db: Option<String>,
    /// ROI as x1,y1,x2,y2; repeatable. Replaces the configured ROIs.
    #[arg(long = "roi", value_name = "X1,Y1,X2,Y2")]
    rois: Vec<String>,
    /// Print the metrics summary as JSON on stderr when done.
    #[arg(long)]
    summary: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(&args.ui, is_tty, !stdout_is_tty);

    let mut cfg = MonitorConfig::load()?;
    if !args.rois.is_empty() {
        cfg.rois = args
            .rois
            .iter()
            .enumerate()
            .map(|(idx, coords)| {
                let rect = parse_roi_coords(coords)?;
                Ok(Roi::new(idx as i64 + 1, &format!("roi-{}", idx + 1), rect))
            })
            .collect::<Result<Vec<_>>>()?;
    }

    let input = {
        let _stage = ui.stage("Read detections");
        std::fs::read_to_string(&args.input)
            .with_context(|| format!("failed to read {}", args.input.display()))?
    };
    let lines: Vec<(usize, &str)> = input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let mut sinks: Vec<Box<dyn EventSink>> =
        vec![Box::new(JsonLinesSink::new(std::io::stdout()))];
    let rois = match args.db.as_deref() {
        Some(db) => {
            let _stage = ui.stage("Open database");
            let mut store = SqliteViolationStore::open(&hygiene_kernel::resolve_db_path(db))?;
            if args.rois.is_empty() {
                store.seed_rois(&cfg.rois)?;
                let rois = store.active_rois()?;
                sinks.push(Box::new(store));
                rois
            } else {
                sinks.push(Box::new(store));
                cfg.rois.clone()
            }
        }
        None => cfg.rois.clone(),
    };
    let registry = Arc::new(RoiRegistry::with_rois(rois));
    if registry.snapshot(None).is_empty() {
        log::warn!("no usable ROI configured; no violations can be raised");
    }

    let metrics = Arc::new(PipelineMetrics::new());
    let adapter = DetectionAdapter::new(cfg.engine.confidence_floor, cfg.engine.fps);
    let mut pipelines: HashMap<String, VideoPipeline> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    {
        let _stage = ui.stage("Replay frames");
        let mut progress = ui.frames(lines.len() as u64, 1000);
        for (idx, line) in &lines {
            let message = match FrameMessage::parse(line.as_bytes(), None) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("line {}: skipped: {:#}", idx + 1, e);
                    continue;
                }
            };
            if !pipelines.contains_key(&message.video_id) {
                deliver(&mut sinks, &SinkMessage::VideoStarted(message.video_info()));
                metrics.inc(&metrics.videos_started);
                order.push(message.video_id.clone());
                pipelines.insert(
                    message.video_id.clone(),
                    VideoPipeline::new(
                        message.video_id.clone(),
                        cfg.engine.clone(),
                        Arc::clone(&registry),
                        Arc::clone(&metrics),
                    ),
                );
            }
            let adapted = adapter.normalize_frame(&message.into_raw());
            metrics.add(&metrics.detections_rejected, adapted.rejected.len() as u64);
            let pipeline = pipelines
                .get_mut(&adapted.frame.video_id)
                .ok_or_else(|| anyhow!("no pipeline for video {}", adapted.frame.video_id))?;
            for out in pipeline.push(adapted.frame)? {
                deliver(&mut sinks, &out);
            }
            progress.tick(metrics.violations.load(Ordering::Relaxed));
        }
        progress.finish();
    }

    {
        let _stage = ui.stage("Flush pipelines");
        for video_id in &order {
            let Some(pipeline) = pipelines.get_mut(video_id) else {
                continue;
            };
            for out in pipeline.finish() {
                deliver(&mut sinks, &out);
            }
            deliver(
                &mut sinks,
                &SinkMessage::VideoFinished {
                    video_id: video_id.clone(),
                    status: VideoStatus::Completed,
                    violations: pipeline.violations(),
                },
            );
            eprintln!(
                "{}: {} frames, {} dropped, {} violations",
                video_id,
                pipeline.frames_processed(),
                pipeline.frames_dropped(),
                pipeline.violations()
            );
        }
    }

    if args.summary {
        eprintln!("{}", serde_json::to_string_pretty(&metrics.summary())?);
    }
    Ok(())
}

fn deliver(sinks: &mut [Box<dyn EventSink>], message: &SinkMessage) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.deliver(message) {
            log::error!("{}: {:#}", sink.name(), e);
        }
    }
}
