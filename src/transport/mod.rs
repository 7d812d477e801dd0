//! MQTT transport: broker endpoints and TLS, the topic layout and payloads,
//! and the live-stream publisher sink.

mod endpoint;
pub mod messages;
mod publisher;

pub use endpoint::{ClientSettings, MqttEndpoint, TlsMaterials, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
pub use messages::{
    ControlAction, ControlMessage, FrameMessage, InboundTopic, Topics, VideoStatusPayload,
};
pub use publisher::{MqttPublisher, MqttRuntime};
