//! Device transports: Modbus-RTU sensor buses and MQTT.
//!
//! The serial side polls register-mapped sensors and overlays their readings
//! on top of whatever arrives over MQTT; the MQTT side carries both inbound
//! sensor topics and outbound relay commands.

pub mod mqtt;
pub mod serial;

pub use mqtt::{MqttClient, MqttConfig, VentFault};
pub use serial::config::{BusConfig, DeviceConfig, DriverConfig};
pub use serial::manager::{SerialManager, SerialOverlay};
