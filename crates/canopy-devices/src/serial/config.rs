//! Configuration for serial buses and the devices attached to them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use canopy_core::error::{Error, Result};
use canopy_core::metrics::Metric;

fn d_baud() -> u32 {
    9600
}

fn d_data_bits() -> u8 {
    8
}

fn d_stop_bits() -> u8 {
    1
}

fn d_timeout_ms() -> u64 {
    1000
}

fn d_poll_interval_s() -> f64 {
    5.0
}

/// Serial line parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// One RS-485 bus and the devices polled on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub id: String,
    /// Serial device path, e.g. /dev/ttyUSB0.
    pub port: String,
    #[serde(default = "d_baud")]
    pub baud_rate: u32,
    #[serde(default = "d_data_bits")]
    pub data_bits: u8,
    #[serde(default = "d_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    /// Per-request timeout.
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
    /// Seconds between poll cycles.
    #[serde(default = "d_poll_interval_s")]
    pub poll_interval_s: f64,
    pub devices: Vec<DeviceConfig>,
}

/// One sensor device on a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    /// Modbus unit (slave) address.
    pub unit_id: u8,
    #[serde(flatten)]
    pub driver: DriverConfig,
}

/// The closed set of register decoders.
///
/// Unknown driver names fail deserialization; there is no generic escape
/// hatch, a new sensor family means a new variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DriverConfig {
    /// One register, linear conversion.
    Linear(LinearConfig),
    /// CO2/temperature/humidity combo sensor, three consecutive registers.
    GasCombo(GasComboConfig),
    /// Multi-block weather station with 32-bit values.
    WeatherStation(WeatherStationConfig),
}

/// Modbus function used to read a register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterFunction {
    #[default]
    Holding,
    Input,
}

/// Single-register linear sensor: `raw * scale + offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearConfig {
    pub register: u16,
    #[serde(default)]
    pub function: RegisterFunction,
    #[serde(default = "d_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub signed: bool,
    /// Round the converted value to this many decimals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u32>,
    pub output: Metric,
}

fn d_scale() -> f64 {
    1.0
}

/// Combo gas sensor register block (CO2, temperature, humidity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasComboConfig {
    #[serde(default)]
    pub register: u16,
    #[serde(default)]
    pub function: RegisterFunction,
    #[serde(default = "GasComboOutputs::default")]
    pub outputs: GasComboOutputs,
}

/// Metric targets of the combo sensor's three channels. A `None` drops the
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GasComboOutputs {
    pub co2: Option<Metric>,
    pub temperature: Option<Metric>,
    pub humidity: Option<Metric>,
}

impl Default for GasComboOutputs {
    fn default() -> Self {
        Self {
            co2: Some(Metric::InternalCo2),
            temperature: None,
            humidity: None,
        }
    }
}

/// Channels a weather station can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherChannel {
    AirTemperature,
    AirHumidity,
    BarometricPressure,
    WindDirectionMin,
    WindDirectionMax,
    WindDirectionAvg,
    WindSpeedMin,
    WindSpeedMax,
    WindSpeedAvg,
    RainAccumulation,
    RainDuration,
    RainIntensity,
}

impl WeatherChannel {
    /// Whether the channel lives in the rain register block.
    pub fn is_rain(&self) -> bool {
        matches!(
            self,
            WeatherChannel::RainAccumulation
                | WeatherChannel::RainDuration
                | WeatherChannel::RainIntensity
        )
    }
}

/// Weather station mapping: channel to metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherStationConfig {
    #[serde(default = "default_weather_outputs")]
    pub outputs: BTreeMap<WeatherChannel, Metric>,
}

/// Default channel mapping for a station reporting external conditions.
pub fn default_weather_outputs() -> BTreeMap<WeatherChannel, Metric> {
    let mut outputs = BTreeMap::new();
    outputs.insert(WeatherChannel::AirTemperature, Metric::ExternalTemp);
    outputs.insert(WeatherChannel::AirHumidity, Metric::ExternalHum);
    outputs.insert(WeatherChannel::BarometricPressure, Metric::ExternalPressure);
    outputs.insert(WeatherChannel::WindDirectionAvg, Metric::WindDirection);
    outputs.insert(WeatherChannel::WindSpeedMax, Metric::WindGust);
    outputs.insert(WeatherChannel::WindSpeedAvg, Metric::WindSpeed);
    outputs
}

impl DeviceConfig {
    /// Metrics this device is expected to produce on a successful read.
    pub fn expected_metrics(&self) -> Vec<Metric> {
        match &self.driver {
            DriverConfig::Linear(cfg) => vec![cfg.output],
            DriverConfig::GasCombo(cfg) => [cfg.outputs.co2, cfg.outputs.temperature, cfg.outputs.humidity]
                .into_iter()
                .flatten()
                .collect(),
            DriverConfig::WeatherStation(cfg) => cfg.outputs.values().copied().collect(),
        }
    }
}

/// Validate the bus list: unique ids, unique unit addresses per bus.
pub fn validate_buses(buses: &[BusConfig]) -> Result<()> {
    let mut bus_ids = BTreeSet::new();
    for bus in buses {
        if !bus_ids.insert(bus.id.as_str()) {
            return Err(Error::config(
                format!("buses[{}].id", bus.id),
                "duplicate bus id",
            ));
        }
        if bus.port.trim().is_empty() {
            return Err(Error::config(
                format!("buses[{}].port", bus.id),
                "a serial port path is required",
            ));
        }
        let mut units = BTreeSet::new();
        let mut device_ids = BTreeSet::new();
        for device in &bus.devices {
            if !device_ids.insert(device.id.as_str()) {
                return Err(Error::config(
                    format!("buses[{}].devices[{}].id", bus.id, device.id),
                    "duplicate device id",
                ));
            }
            if !units.insert(device.unit_id) {
                return Err(Error::config(
                    format!("buses[{}].devices[{}].unit_id", bus.id, device.id),
                    format!("unit address {} already in use on this bus", device.unit_id),
                ));
            }
        }
    }
    Ok(())
}
