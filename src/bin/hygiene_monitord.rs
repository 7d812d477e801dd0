//! hygiene_monitord - watch detector output over MQTT and record scooper
//! violations.
//!
//! 1. Subscribes to `{prefix}/detections/+` and `{prefix}/control/+`
//! 2. Runs one engine pipeline per video
//! 3. Persists videos and violations to SQLite
//! 4. Publishes violations and progress back to MQTT

use anyhow::{Context, Result};
use clap::Parser;
use rumqttc::v5::{mqttbytes::QoS, Client, Event, Incoming};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hygiene_kernel::sink::EventSink;
use hygiene_kernel::transport::{
    ClientSettings, ControlAction, ControlMessage, FrameMessage, InboundTopic, MqttEndpoint,
    MqttPublisher, TlsMaterials, Topics,
};
use hygiene_kernel::{
    MonitorConfig, PipelineMetrics, RetryingSink, RoiRegistry, SinkWorker, SqliteViolationStore,
    Supervisor,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Scooper hygiene monitor")]
struct Args {
    /// Allow non-loopback MQTT brokers (also `mqtt.allow_remote` in the config file).
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT (implied by mqtts:// brokers).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = MonitorConfig::load()?;

    let endpoint = MqttEndpoint::parse(&cfg.mqtt.broker, args.mqtt_use_tls)?;
    endpoint.ensure_allowed(args.allow_remote_mqtt || cfg.mqtt.allow_remote)?;
    let tls = TlsMaterials::load(
        args.mqtt_tls_ca_path.as_ref(),
        args.mqtt_tls_client_cert_path.as_ref(),
        args.mqtt_tls_client_key_path.as_ref(),
    )?;
    let settings = ClientSettings {
        endpoint,
        tls,
        client_id: cfg.mqtt.client_id.clone(),
        username: args.mqtt_username,
        password: args.mqtt_password,
    };
    let topics = Topics::new(&cfg.mqtt.topic_prefix);

    log::info!("hygiene_monitord starting");
    log::info!("  MQTT broker: {}", settings.endpoint);
    log::info!("  Topic prefix: {}", topics.prefix());
    log::info!("  Database: {}", cfg.db_path);
    log::info!(
        "  Confidence floor: {}, left-ROI window: {} frames, track TTL: {} frames",
        cfg.engine.confidence_floor,
        cfg.engine.left_roi_window_frames,
        cfg.engine.track_ttl_frames
    );

    let db_path = hygiene_kernel::resolve_db_path(&cfg.db_path);
    let mut store = SqliteViolationStore::open(&db_path)?;
    let seeded = store.seed_rois(&cfg.rois)?;
    if seeded > 0 {
        log::info!("seeded {} ROI(s) from configuration", seeded);
    }
    let registry = Arc::new(RoiRegistry::with_rois(store.active_rois()?));
    log::info!("  Active ROIs: {}", registry.snapshot(None).len());

    let metrics = Arc::new(PipelineMetrics::new());
    let (refresh_stop, refresher) =
        spawn_roi_refresher(&db_path, Arc::clone(&registry), cfg.roi_refresh)?;

    let publisher = MqttPublisher::connect(
        &settings.with_client_id(format!("{}_pub", cfg.mqtt.client_id)),
        topics.clone(),
    )?;
    let sinks: Vec<Box<dyn EventSink>> = vec![
        Box::new(RetryingSink::new(store, cfg.retry)),
        Box::new(RetryingSink::new(publisher, cfg.retry)),
    ];
    let (outbox, sink_worker) = SinkWorker::spawn(sinks, Arc::clone(&metrics));

    let supervisor = Supervisor::new(
        cfg.engine.clone(),
        Arc::clone(&registry),
        Arc::clone(&metrics),
        outbox,
        cfg.worker_queue_depth,
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let current_client: Arc<Mutex<Option<Client>>> = Arc::new(Mutex::new(None));
    let subscriber = {
        let shutdown = Arc::clone(&shutdown);
        let current_client = Arc::clone(&current_client);
        let topics = topics.clone();
        std::thread::Builder::new()
            .name("mqtt-subscriber".to_string())
            .spawn(move || run_subscriber(settings, topics, supervisor, current_client, shutdown))
            .context("spawn MQTT subscriber")?
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("hygiene_monitord running (Ctrl-C to stop)");
    loop {
        match rx.recv_timeout(cfg.health_log_interval) {
            Err(RecvTimeoutError::Timeout) => log_health(&metrics),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("shutdown signal received, draining pipelines...");
    shutdown.store(true, Ordering::Release);
    if let Ok(guard) = current_client.lock() {
        if let Some(client) = guard.as_ref() {
            let _ = client.try_disconnect();
        }
    }
    let supervisor = subscriber
        .join()
        .map_err(|_| anyhow::anyhow!("MQTT subscriber panicked"))?;
    supervisor.shutdown()?;
    sink_worker.join()?;
    drop(refresh_stop);
    if refresher.join().is_err() {
        log::error!("ROI refresher panicked");
    }
    log_health(&metrics);
    log::info!("hygiene_monitord stopped");
    Ok(())
}

fn log_health(metrics: &PipelineMetrics) {
    match serde_json::to_string(&metrics.summary()) {
        Ok(summary) => log::info!("health: {}", summary),
        Err(e) => log::warn!("failed to serialize metrics: {}", e),
    }
}

/// Re-reads the active ROIs on its own connection every `interval` until the
/// returned sender is dropped.
fn spawn_roi_refresher(
    db_path: &str,
    registry: Arc<RoiRegistry>,
    interval: Duration,
) -> Result<(mpsc::Sender<()>, JoinHandle<()>)> {
    let store = SqliteViolationStore::open(db_path)?;
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("roi-refresh".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => match store.active_rois() {
                    Ok(rois) => {
                        if !registry.is_current(&rois) {
                            let accepted = registry.replace(rois);
                            log::info!("ROI set changed: {} active ROI(s)", accepted);
                        }
                    }
                    Err(e) => log::warn!("failed to reload ROIs: {:#}", e),
                },
                _ => break,
            }
        })
        .context("spawn ROI refresher")?;
    Ok((stop_tx, handle))
}

fn run_subscriber(
    settings: ClientSettings,
    topics: Topics,
    mut supervisor: Supervisor,
    current_client: Arc<Mutex<Option<Client>>>,
    shutdown: Arc<AtomicBool>,
) -> Supervisor {
    while !shutdown.load(Ordering::Acquire) {
        let (client, mut connection) = match settings.connect(None) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("MQTT setup failed: {:#}", e);
                std::thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        if let Err(e) = subscribe(&client, &topics) {
            log::error!("MQTT subscribe failed: {:#}", e);
        }
        if let Ok(mut guard) = current_client.lock() {
            *guard = Some(client.clone());
        }

        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic.to_string(),
                        Err(e) => {
                            log::warn!("Skipping publish with invalid topic: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = process_message(&topic, &publish.payload, &topics, &mut supervisor)
                    {
                        log::warn!("Failed to process message on {}: {:#}", topic, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if !shutdown.load(Ordering::Acquire) {
                        log::error!("MQTT connection error: {}. Reconnecting...", e);
                    }
                    break;
                }
            }
        }

        if let Ok(mut guard) = current_client.lock() {
            *guard = None;
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        std::thread::sleep(RECONNECT_DELAY);
    }
    supervisor
}

fn subscribe(client: &Client, topics: &Topics) -> Result<()> {
    for filter in [topics.detections_filter(), topics.control_filter()] {
        client
            .subscribe(filter.as_str(), QoS::AtLeastOnce)
            .with_context(|| format!("subscribe to {}", filter))?;
        log::info!("Subscribed to {}", filter);
    }
    Ok(())
}

fn process_message(
    topic: &str,
    payload: &[u8],
    topics: &Topics,
    supervisor: &mut Supervisor,
) -> Result<()> {
    match topics.classify(topic) {
        Some(InboundTopic::Detections(video_id)) => {
            let frame = FrameMessage::parse(payload, Some(video_id))?;
            supervisor.dispatch(frame)?;
        }
        Some(InboundTopic::Control(video_id)) => {
            let control = ControlMessage::parse(payload)?;
            let handled = match control.action {
                ControlAction::Stop => supervisor.cancel(video_id),
                ControlAction::Complete => supervisor.complete(video_id),
            };
            if !handled {
                log::warn!(
                    "video {}: {:?} for a video that is not running",
                    video_id,
                    control.action
                );
            }
        }
        None => log::debug!("ignoring message on {}", topic),
    }
    Ok(())
}
