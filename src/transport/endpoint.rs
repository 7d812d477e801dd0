//! Broker addressing, TLS materials and client options for MQTT links.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, MqttOptions};
use rumqttc::Transport;
use std::path::PathBuf;
use std::time::Duration;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// PEM material for TLS. `ca` of `None` means the system roots.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    /// `(cert, key)`; both or neither.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let ca = ca_path
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))
            })
            .transpose()?;

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT TLS client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// Accepts `host:port`, `[v6]:port`, and the `mqtt://`, `tcp://`,
    /// `mqtts://`, `ssl://` schemes. `tls_override` forces TLS on.
    pub fn parse(addr: &str, tls_override: bool) -> Result<Self> {
        let mut use_tls = tls_override;
        let mut remainder = addr.trim();

        if let Some((scheme, rest)) = remainder.split_once("://") {
            match scheme.to_ascii_lowercase().as_str() {
                "mqtt" | "tcp" => {}
                "mqtts" | "ssl" => use_tls = true,
                other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
            }
            remainder = rest;
        }

        let (host, port) = split_host_port(remainder)?;
        if host.is_empty() {
            return Err(anyhow!("missing MQTT host in {}", addr));
        }
        Ok(Self {
            host,
            port,
            use_tls,
        })
    }

    pub fn is_loopback(&self) -> bool {
        let host = self.host.as_str();
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        host.parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }

    /// Refuse remote brokers unless explicitly allowed.
    pub fn ensure_allowed(&self, allow_remote: bool) -> Result<()> {
        if self.is_loopback() {
            return Ok(());
        }
        if allow_remote {
            log::warn!(
                "Remote MQTT broker {}:{} enabled - ensure it is on a trusted network",
                self.host,
                self.port
            );
            return Ok(());
        }
        Err(anyhow!(
            "MQTT broker must be loopback: {}:{} (use --allow-remote-mqtt to override)",
            self.host,
            self.port
        ))
    }

    pub fn transport(&self, tls: &TlsMaterials) -> Result<Transport> {
        if !self.use_tls {
            if tls.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled (use --mqtt-use-tls or mqtts://)"
                ));
            }
            return Ok(Transport::tcp());
        }
        if !tls.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = tls.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, tls.client_auth.clone(), None))
    }
}

impl std::fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Everything needed to open one client connection.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ClientSettings {
    /// Build a client. With `availability_topic`, the broker publishes
    /// `offline` (retained) there if this connection dies.
    pub fn connect(&self, availability_topic: Option<&str>) -> Result<(Client, Connection)> {
        let mut options =
            MqttOptions::new(self.client_id.as_str(), self.endpoint.host.as_str(), self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        if let Some(user) = self.username.as_deref() {
            options.set_credentials(user, self.password.as_deref().unwrap_or_default());
        }
        if let Some(topic) = availability_topic {
            options.set_last_will(LastWill::new(
                topic,
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
                None,
            ));
        }
        options.set_transport(self.endpoint.transport(&self.tls)?);

        let (client, connection) = Client::new(options, 64);
        log::info!(
            "MQTT client {} -> {} (auth: {})",
            self.client_id,
            self.endpoint,
            self.username.is_some()
        );
        Ok((client, connection))
    }

    /// Same settings under a different client id.
    pub fn with_client_id(&self, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..self.clone()
        }
    }
}
