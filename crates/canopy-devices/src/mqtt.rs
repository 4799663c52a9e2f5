//! MQTT transport: relay commands out, sensor topics and vent faults in.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use canopy_core::command::CommandSink;
use canopy_core::error::{Error, Result};
use canopy_core::metrics::{Metric, SharedSnapshot};

fn d_port() -> u16 {
    1883
}

fn d_client_id() -> String {
    "canopy".to_string()
}

fn d_keepalive_s() -> u64 {
    30
}

/// Broker connection and topic routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_client_id")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "d_keepalive_s")]
    pub keepalive_s: u64,
    /// Inbound sensor topics mapped to the metric they carry.
    #[serde(default)]
    pub sensor_topics: BTreeMap<String, Metric>,
    /// Inbound relay fault topics mapped to the vent they belong to.
    #[serde(default)]
    pub vent_error_topics: BTreeMap<String, u32>,
}

/// A relay module reporting a drive fault for one vent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VentFault {
    pub vent: u32,
    pub faulted: bool,
}

/// Connected MQTT client plus its ingestion task.
pub struct MqttClient {
    client: AsyncClient,
    ingest_task: JoinHandle<()>,
}

impl MqttClient {
    /// Connect, subscribe to every inbound topic and start the ingestion
    /// loop. Sensor payloads land in `snapshot`; relay faults go to `faults`.
    pub fn connect(
        config: &MqttConfig,
        snapshot: SharedSnapshot,
        faults: mpsc::Sender<VentFault>,
    ) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_s));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }
        let (client, eventloop) = AsyncClient::new(options, 64);

        let sensor_topics = config.sensor_topics.clone();
        let error_topics = config.vent_error_topics.clone();
        let subscribe_client = client.clone();
        info!(
            host = %config.host,
            port = config.port,
            sensors = sensor_topics.len(),
            "connecting to mqtt broker"
        );
        let ingest_task = tokio::spawn(ingest_loop(
            eventloop,
            subscribe_client,
            sensor_topics,
            error_topics,
            snapshot,
            faults,
        ));

        Self {
            client,
            ingest_task,
        }
    }

    /// Sink handle for actuators.
    pub fn command_sink(&self) -> MqttCommandSink {
        MqttCommandSink {
            client: self.client.clone(),
        }
    }

    pub fn shutdown(&self) {
        self.ingest_task.abort();
    }
}

/// Outbound publisher implementing the actuator command seam.
#[derive(Clone)]
pub struct MqttCommandSink {
    client: AsyncClient,
}

#[async_trait]
impl CommandSink for MqttCommandSink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        // At-most-once: a drive command replayed by the broker after a
        // reconnect would run an open-loop motor past its computed move time.
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| Error::Transport(format!("publish to '{topic}': {e}")))
    }
}

async fn ingest_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    sensor_topics: BTreeMap<String, Metric>,
    error_topics: BTreeMap<String, u32>,
    snapshot: SharedSnapshot,
    faults: mpsc::Sender<VentFault>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // (Re)subscribe after every connect; the broker forgets
                // clean-session subscriptions.
                for topic in sensor_topics.keys().chain(error_topics.keys()) {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        warn!(topic = %topic, error = %e, "subscribe failed");
                    }
                }
                info!("mqtt connected, subscriptions refreshed");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                if let Some(metric) = sensor_topics.get(&publish.topic) {
                    match parse_measurement(&payload) {
                        Some(value) => snapshot.add(*metric, value).await,
                        None => {
                            debug!(topic = %publish.topic, payload = %payload, "unparseable measurement")
                        }
                    }
                } else if let Some(vent) = error_topics.get(&publish.topic) {
                    let fault = VentFault {
                        vent: *vent,
                        faulted: parse_flag(&payload),
                    };
                    if faults.send(fault).await.is_err() {
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt connection error, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Parse a sensor payload. Numbers pass through; boolean spellings map to
/// 1.0/0.0 so rain contact sensors work on the same path.
pub fn parse_measurement(payload: &str) -> Option<f64> {
    let trimmed = payload.trim();
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() {
            return Some(value);
        }
        return None;
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" => Some(1.0),
        "false" | "off" | "no" => Some(0.0),
        _ => None,
    }
}

/// Parse a relay fault flag.
pub fn parse_flag(payload: &str) -> bool {
    matches!(
        payload.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}
