use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::geometry::BBox;
use crate::roi::{Roi, DEFAULT_ROI_COLOR};
use crate::sink::RetryPolicy;

const DEFAULT_DB_PATH: &str = "hygiene.db";
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_TOPIC_PREFIX: &str = "hygiene";
const DEFAULT_CLIENT_ID: &str = "hygiene_monitord";
const DEFAULT_ROI: [f32; 4] = [100.0, 150.0, 400.0, 400.0];
const DEFAULT_ROI_NAME: &str = "default";
const DEFAULT_WORKER_QUEUE_DEPTH: usize = 256;
const DEFAULT_ROI_REFRESH_SECS: u64 = 5;
const DEFAULT_HEALTH_LOG_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    db_path: Option<String>,
    mqtt: Option<MqttConfigFile>,
    engine: Option<EngineConfig>,
    rois: Option<Vec<RoiConfigFile>>,
    sink: Option<SinkConfigFile>,
    service: Option<ServiceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    allow_remote: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RoiConfigFile {
    id: Option<i64>,
    name: Option<String>,
    coordinates: BBox,
    color: Option<String>,
    video_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkConfigFile {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    worker_queue_depth: Option<usize>,
    roi_refresh_secs: Option<u64>,
    health_log_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub db_path: String,
    pub mqtt: MqttSettings,
    pub engine: EngineConfig,
    /// Seeded into the store when its ROI table is empty.
    pub rois: Vec<Roi>,
    pub retry: RetryPolicy,
    pub worker_queue_depth: usize,
    pub roi_refresh: Duration,
    pub health_log_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub allow_remote: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        // Defaults are always valid.
        Self::from_file(MonitorConfigFile::default())
    }
}

impl MonitorConfig {
    /// File named by `HYGIENE_CONFIG` (if any), then environment overrides,
    /// then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("HYGIENE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            broker: mqtt_file
                .broker
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            topic_prefix: mqtt_file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            allow_remote: mqtt_file.allow_remote.unwrap_or(false),
        };
        let rois = match file.rois {
            Some(rois) if !rois.is_empty() => rois
                .into_iter()
                .enumerate()
                .map(|(idx, roi)| Roi {
                    id: roi.id.unwrap_or(idx as i64 + 1),
                    name: roi.name.unwrap_or_else(|| format!("roi-{}", idx + 1)),
                    rect: roi.coordinates,
                    active: true,
                    video_id: roi.video_id,
                    color: roi.color.unwrap_or_else(|| DEFAULT_ROI_COLOR.to_string()),
                })
                .collect(),
            _ => vec![default_roi(BBox::from_tlbr(DEFAULT_ROI))],
        };
        let sink = file.sink.unwrap_or_default();
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: sink.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: sink
                .initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: sink
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        };
        let service = file.service.unwrap_or_default();
        Self {
            db_path,
            mqtt,
            engine: file.engine.unwrap_or_default(),
            rois,
            retry,
            worker_queue_depth: service
                .worker_queue_depth
                .unwrap_or(DEFAULT_WORKER_QUEUE_DEPTH),
            roi_refresh: Duration::from_secs(
                service.roi_refresh_secs.unwrap_or(DEFAULT_ROI_REFRESH_SECS),
            ),
            health_log_interval: Duration::from_secs(
                service.health_log_secs.unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("HYGIENE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(broker) = env_string("HYGIENE_MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(prefix) = env_string("HYGIENE_TOPIC_PREFIX") {
            self.mqtt.topic_prefix = prefix;
        }
        if let Some(floor) = env_parse::<f32>("HYGIENE_CONFIDENCE_FLOOR")? {
            self.engine.confidence_floor = floor;
        }
        if let Some(fps) = env_parse::<f64>("HYGIENE_FPS")? {
            self.engine.fps = fps;
        }
        if let Some(frames) = env_parse::<u64>("HYGIENE_LEFT_ROI_WINDOW_FRAMES")? {
            self.engine.left_roi_window_frames = frames;
        }
        if let Some(frames) = env_parse::<u64>("HYGIENE_TRACK_TTL_FRAMES")? {
            self.engine.track_ttl_frames = frames;
        }
        if let Some(coords) = env_string("HYGIENE_DEFAULT_ROI") {
            self.rois = vec![default_roi(parse_roi_coords(&coords)?)];
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.engine.validate()?;

        self.mqtt.topic_prefix = self.mqtt.topic_prefix.trim_matches('/').to_string();
        if self.mqtt.topic_prefix.is_empty() {
            return Err(anyhow!("mqtt topic_prefix must not be empty"));
        }
        if self.mqtt.topic_prefix.contains(['+', '#']) {
            return Err(anyhow!(
                "mqtt topic_prefix must not contain wildcards (got '{}')",
                self.mqtt.topic_prefix
            ));
        }

        for roi in &self.rois {
            if !roi.rect.is_well_formed() {
                return Err(anyhow!(
                    "ROI {} '{}' has malformed coordinates {:?}",
                    roi.id,
                    roi.name,
                    roi.rect.to_tlbr()
                ));
            }
        }

        if self.worker_queue_depth == 0 {
            return Err(anyhow!("worker_queue_depth must be greater than zero"));
        }
        if self.roi_refresh.is_zero() || self.health_log_interval.is_zero() {
            return Err(anyhow!(
                "roi_refresh_secs and health_log_secs must be greater than zero"
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("sink max_attempts must be at least 1"));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(anyhow!(
                "sink initial_backoff_ms must not exceed max_backoff_ms"
            ));
        }
        Ok(())
    }
}

fn default_roi(rect: BBox) -> Roi {
    Roi::new(1, DEFAULT_ROI_NAME, rect)
}

/// `x1,y1,x2,y2` in pixels.
pub fn parse_roi_coords(value: &str) -> Result<BBox> {
    let parts: Vec<f32> = value
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| anyhow!("ROI coordinates must be numbers: '{}'", value))?;
    let [x1, y1, x2, y2] = parts[..] else {
        return Err(anyhow!(
            "ROI coordinates must be x1,y1,x2,y2 (got '{}')",
            value
        ));
    };
    let rect = BBox::new(x1, y1, x2, y2);
    if !rect.is_well_formed() {
        return Err(anyhow!("ROI coordinates are not a valid rectangle: '{}'", value));
    }
    Ok(rect)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, raw)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
