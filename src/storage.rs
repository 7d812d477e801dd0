use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::event::{ProgressUpdate, VideoInfo, VideoStatus, ViolationBoxes, ViolationEvent};
use crate::geometry::BBox;
use crate::roi::Roi;
use crate::sink::EventSink;
use crate::{now_s, open_db_connection};

/// Row of the `videos` table.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoRecord {
    pub id: String,
    pub filename: Option<String>,
    pub status: String,
    pub total_frames: Option<u64>,
    pub fps: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub processed_frames: u64,
    pub total_violations: u64,
}

/// SQLite persistence for videos, violations and ROI configuration.
pub struct SqliteViolationStore {
    conn: Connection,
}

impl SqliteViolationStore {
    /// Open (creating if needed) the database at `db_path`. Pass a path from
    /// `resolve_db_path` so `:memory:` databases are shared between
    /// connections.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("failed to open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA busy_timeout=5000;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS videos (
              id TEXT PRIMARY KEY,
              filename TEXT,
              status TEXT NOT NULL DEFAULT 'processing',
              total_frames INTEGER,
              fps REAL,
              width INTEGER,
              height INTEGER,
              processed_frames INTEGER NOT NULL DEFAULT 0,
              total_violations INTEGER NOT NULL DEFAULT 0,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_id TEXT NOT NULL UNIQUE,
              video_id TEXT NOT NULL REFERENCES videos(id) ON DELETE CASCADE,
              frame_number INTEGER NOT NULL,
              timestamp REAL NOT NULL,
              track_id INTEGER NOT NULL,
              roi_id INTEGER NOT NULL,
              roi_enter_frame INTEGER NOT NULL,
              frame_path TEXT,
              bbox_data TEXT NOT NULL,
              description TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS roi_configs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              coordinates TEXT NOT NULL,
              color TEXT NOT NULL DEFAULT '#00FF00',
              is_active INTEGER NOT NULL DEFAULT 1,
              video_id TEXT,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_violations_video ON violations(video_id, frame_number);
            "#,
        )?;
        Ok(())
    }

    /// Record a video as processing. Re-registering keeps counters and
    /// fills in metadata that was missing.
    pub fn create_video(&mut self, info: &VideoInfo) -> Result<()> {
        let now = now_s()? as i64;
        self.conn.execute(
            r#"
            INSERT INTO videos(id, filename, status, total_frames, fps, width, height, created_at, updated_at)
            VALUES (?1, ?2, 'processing', ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(id) DO UPDATE SET
              filename = COALESCE(excluded.filename, videos.filename),
              total_frames = COALESCE(excluded.total_frames, videos.total_frames),
              fps = COALESCE(excluded.fps, videos.fps),
              width = COALESCE(excluded.width, videos.width),
              height = COALESCE(excluded.height, videos.height),
              status = 'processing',
              updated_at = excluded.updated_at
            "#,
            params![
                info.video_id,
                info.filename,
                info.total_frames.map(|n| n as i64),
                info.fps,
                info.width,
                info.height,
                now
            ],
        )?;
        Ok(())
    }

    pub fn update_progress(&mut self, update: &ProgressUpdate) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE videos SET processed_frames = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                update.video_id,
                update.frames_processed as i64,
                now_s()? as i64
            ],
        )?;
        if changed == 0 {
            log::debug!("progress for unknown video {}", update.video_id);
        }
        Ok(())
    }

    pub fn finish_video(&mut self, video_id: &str, status: VideoStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE videos SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![video_id, status.as_str(), now_s()? as i64],
        )?;
        Ok(())
    }

    /// Persist `event`. Returns false when the `event_id` was already stored;
    /// the video's violation count only moves on first insert. A video that
    /// was never registered gets a bare `processing` row.
    pub fn save_violation(&mut self, event: &ViolationEvent) -> Result<bool> {
        let bbox_data = serde_json::to_string(&event.boxes)?;
        let now = now_s()? as i64;
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO videos(id, status, created_at, updated_at)
            VALUES (?1, 'processing', ?2, ?2)
            "#,
            params![event.video_id, now],
        )?;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO violations(
              event_id, video_id, frame_number, timestamp, track_id, roi_id,
              roi_enter_frame, bbox_data, description, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                event.event_id,
                event.video_id,
                event.frame_number as i64,
                event.timestamp,
                event.track_id as i64,
                event.roi_id,
                event.roi_enter_frame as i64,
                bbox_data,
                event.description,
                now
            ],
        )?;
        if inserted > 0 {
            tx.execute(
                "UPDATE videos SET total_violations = total_violations + 1, updated_at = ?2 WHERE id = ?1",
                params![event.video_id, now],
            )?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    pub fn video(&self, video_id: &str) -> Result<Option<VideoRecord>> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT id, filename, status, total_frames, fps, width, height,
                       processed_frames, total_violations
                FROM videos WHERE id = ?1
                "#,
                params![video_id],
                |row| {
                    Ok(VideoRecord {
                        id: row.get(0)?,
                        filename: row.get(1)?,
                        status: row.get(2)?,
                        total_frames: row.get::<_, Option<i64>>(3)?.map(|n| n as u64),
                        fps: row.get(4)?,
                        width: row.get(5)?,
                        height: row.get(6)?,
                        processed_frames: row.get::<_, i64>(7)? as u64,
                        total_violations: row.get::<_, i64>(8)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Violations of one video in frame order.
    pub fn violations_for_video(&self, video_id: &str) -> Result<Vec<ViolationEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT event_id, video_id, frame_number, timestamp, track_id, roi_id,
                   roi_enter_frame, bbox_data, description
            FROM violations WHERE video_id = ?1 ORDER BY frame_number ASC, id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![video_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (event_id, video_id, frame, ts, track, roi, enter, bbox_data, description) = row?;
            let boxes: ViolationBoxes = serde_json::from_str(&bbox_data)
                .with_context(|| format!("corrupt bbox_data for violation {}", event_id))?;
            out.push(ViolationEvent {
                event_id,
                video_id,
                frame_number: frame as u64,
                timestamp: ts,
                track_id: track as u64,
                roi_id: roi,
                roi_enter_frame: enter as u64,
                boxes,
                description,
            });
        }
        Ok(out)
    }

    /// Active ROI rows. Rows whose coordinates do not parse are skipped with
    /// a warning.
    pub fn active_rois(&self) -> Result<Vec<Roi>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, coordinates, color, video_id FROM roi_configs WHERE is_active = 1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, name, coordinates, color, video_id) = row?;
            let rect: BBox = match serde_json::from_str(&coordinates) {
                Ok(rect) => rect,
                Err(e) => {
                    log::warn!("ignoring ROI {} '{}': bad coordinates: {}", id, name, e);
                    continue;
                }
            };
            out.push(Roi {
                id,
                name,
                rect,
                active: true,
                video_id,
                color,
            });
        }
        Ok(out)
    }

    pub fn roi_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM roi_configs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Insert `roi` and return its row id. A non-positive `roi.id` lets
    /// SQLite choose one.
    pub fn insert_roi(&mut self, roi: &Roi) -> Result<i64> {
        let coordinates = serde_json::to_string(&roi.rect)?;
        let id = if roi.id > 0 { Some(roi.id) } else { None };
        self.conn.execute(
            r#"
            INSERT INTO roi_configs(id, name, coordinates, color, is_active, video_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                id,
                roi.name,
                coordinates,
                roi.color,
                roi.active,
                roi.video_id,
                now_s()? as i64
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_roi_active(&mut self, roi_id: i64, active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE roi_configs SET is_active = ?2 WHERE id = ?1",
            params![roi_id, active],
        )?;
        if changed == 0 {
            return Err(anyhow!("no ROI with id {}", roi_id));
        }
        Ok(())
    }

    /// Insert `rois` when the table is empty. Returns how many were written.
    pub fn seed_rois(&mut self, rois: &[Roi]) -> Result<usize> {
        if self.roi_count()? > 0 {
            return Ok(0);
        }
        for roi in rois {
            self.insert_roi(roi)?;
        }
        Ok(rois.len())
    }
}

impl EventSink for SqliteViolationStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn emit(&mut self, event: &ViolationEvent) -> Result<()> {
        if !self.save_violation(event)? {
            log::debug!("violation {} already stored", event.event_id);
        }
        Ok(())
    }

    fn video_started(&mut self, info: &VideoInfo) -> Result<()> {
        self.create_video(info)
    }

    fn progress(&mut self, update: &ProgressUpdate) -> Result<()> {
        self.update_progress(update)
    }

    fn video_finished(
        &mut self,
        video_id: &str,
        status: VideoStatus,
        _violations: u64,
    ) -> Result<()> {
        self.finish_video(video_id, status)
    }
}
