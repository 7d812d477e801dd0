//! Hygiene Kernel
//!
//! Watches the detections coming off a pizza line and flags every hand that
//! takes ingredients out of a monitored container (ROI) without a scooper and
//! then touches a pizza.
//!
//! # Architecture
//!
//! Each video is processed by its own single-writer `VideoPipeline`:
//!
//! 1. **Detection adapter**: raw detector output becomes typed `Detection`s;
//!    unknown labels, malformed boxes and low-confidence boxes are dropped.
//! 2. **Reorder buffer**: frames are applied strictly in frame-number order.
//! 3. **Association**: hands are matched to tracks by greedy IoU.
//! 4. **State machine**: every track moves IDLE -> IN_ROI -> LEFT_ROI and is
//!    judged once, at pizza contact, by the violation evaluator.
//! 5. **Track table**: stale tracks are evicted; open episodes die with them.
//!
//! Violations and progress leave through an outbox to the sink worker,
//! which persists them in SQLite and publishes them over MQTT.
//!
//! # Module Structure
//!
//! - `detect`, `geometry`, `roi`: inputs and shared value types
//! - `engine`: association, state machine, evaluator, track table, pipeline
//! - `supervisor`: one worker thread per video
//! - `sink`, `storage`, `transport`: delivery, persistence, MQTT
//! - `config`, `metrics`: ambient service plumbing

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod engine;
pub mod event;
pub mod geometry;
pub mod metrics;
pub mod roi;
pub mod sink;
pub mod storage;
pub mod supervisor;
pub mod transport;

pub use config::MonitorConfig;
pub use detect::{
    DetectionAdapter, Detection, FrameDetections, ObjectClass, RawDetection, RawFrameDetections,
};
pub use engine::{EngineConfig, Track, TrackState, Verdict, VideoPipeline};
pub use event::{ProgressUpdate, SinkMessage, VideoInfo, VideoStatus, ViolationEvent};
pub use geometry::BBox;
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use roi::{Roi, RoiRegistry, RoiSnapshot};
pub use sink::{EventSink, Outbox, RetryPolicy, RetryingSink, SinkWorker};
pub use storage::SqliteViolationStore;
pub use supervisor::{Dispatch, Supervisor};

/// Unique shared-cache URI for an in-memory database.
///
/// Every connection opened on the returned URI sees the same database for as
/// long as at least one of them stays open.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:hygiene_kernel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

/// Map `:memory:` to a shared in-memory URI; leave file paths untouched.
pub fn resolve_db_path(db_path: &str) -> String {
    if db_path == ":memory:" {
        shared_memory_uri()
    } else {
        db_path.to_string()
    }
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Video ids end up in MQTT topics and database keys.
pub fn validate_video_id(video_id: &str) -> Result<()> {
    static VIDEO_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = VIDEO_ID_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_.-]{1,128}$").expect("static pattern"));
    if !re.is_match(video_id) {
        return Err(anyhow!(
            "video_id must match ^[A-Za-z0-9_.-]{{1,128}}$ (got '{}')",
            video_id
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_ids_are_topic_safe() {
        assert!(validate_video_id("line-1_cam.2").is_ok());
        assert!(validate_video_id("").is_err());
        assert!(validate_video_id("a/b").is_err());
        assert!(validate_video_id("a+").is_err());
        assert!(validate_video_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn memory_path_maps_to_distinct_shared_uris() {
        let a = resolve_db_path(":memory:");
        let b = resolve_db_path(":memory:");
        assert!(a.starts_with("file:hygiene_kernel_"));
        assert_ne!(a, b);
        assert_eq!(resolve_db_path("/tmp/x.db"), "/tmp/x.db");
    }
}
