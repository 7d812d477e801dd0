//! Live stream of violations and progress over MQTT.

use anyhow::{Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::event::{ProgressUpdate, VideoStatus, ViolationEvent};
use crate::sink::EventSink;

use super::endpoint::{ClientSettings, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use super::messages::{Topics, VideoStatusPayload};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Owns a client and the thread driving its connection.
///
/// The connection thread announces `online` on the availability topic after
/// every (re)connect and keeps retrying until `disconnect`.
pub struct MqttRuntime {
    client: Client,
    availability_topic: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttRuntime {
    pub fn new(client: Client, mut connection: Connection, availability_topic: String) -> Self {
        let stopping = Arc::new(AtomicBool::new(false));
        let announce = client.clone();
        let stop = Arc::clone(&stopping);
        let topic = availability_topic.clone();
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        log::info!("MQTT publisher connected");
                        if let Err(e) = announce.try_publish(
                            topic.as_str(),
                            QoS::AtLeastOnce,
                            true,
                            PAYLOAD_ONLINE.as_bytes().to_vec(),
                        ) {
                            log::warn!("failed to announce availability: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        log::warn!("MQTT publisher connection error: {}. Reconnecting...", e);
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
        });

        Self {
            client,
            availability_topic,
            stopping,
            connection_handle: Some(handle),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.connection_handle.take() else {
            return Ok(());
        };
        self.stopping.store(true, Ordering::Release);
        // A clean disconnect suppresses the last will.
        if let Err(e) = self.client.try_publish(
            self.availability_topic.as_str(),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
        ) {
            log::warn!("failed to announce shutdown: {}", e);
        }
        let result = self.client.try_disconnect();
        let _ = handle.join();
        result.context("disconnect MQTT publisher")?;
        Ok(())
    }
}

impl Drop for MqttRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::debug!("{:#}", e);
        }
    }
}

/// `EventSink` publishing JSON payloads with QoS 1.
pub struct MqttPublisher {
    runtime: MqttRuntime,
    topics: Topics,
}

impl MqttPublisher {
    pub fn connect(settings: &ClientSettings, topics: Topics) -> Result<Self> {
        let availability = topics.status();
        let (client, connection) = settings.connect(Some(&availability))?;
        Ok(Self {
            runtime: MqttRuntime::new(client, connection, availability),
            topics,
        })
    }

    pub fn disconnect(self) -> Result<()> {
        self.runtime.disconnect()
    }

    fn publish_json<T: serde::Serialize>(&self, topic: &str, value: &T, retain: bool) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.runtime
            .client()
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .with_context(|| format!("publish to {}", topic))?;
        Ok(())
    }
}

impl EventSink for MqttPublisher {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn emit(&mut self, event: &ViolationEvent) -> Result<()> {
        self.publish_json(&self.topics.violations(&event.video_id), event, false)
    }

    fn progress(&mut self, update: &ProgressUpdate) -> Result<()> {
        self.publish_json(&self.topics.progress(&update.video_id), update, true)
    }

    fn video_finished(
        &mut self,
        video_id: &str,
        status: VideoStatus,
        violations: u64,
    ) -> Result<()> {
        let payload = VideoStatusPayload {
            video_id: video_id.to_string(),
            status,
            violations,
        };
        self.publish_json(&self.topics.progress(video_id), &payload, true)
    }
}
