//! Daemon configuration file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use canopy_control::ControllerSettings;
use canopy_core::config::{
    ControlConfig, GroupConfig, HeatingConfig, PlanConfig, VentConfig, VentDefaults,
};
use canopy_core::metrics::DEFAULT_AVG_WINDOW;
use canopy_devices::serial::config::{validate_buses, BusConfig};
use canopy_devices::MqttConfig;

fn d_avg_window() -> usize {
    DEFAULT_AVG_WINDOW
}

fn d_db_path() -> String {
    "canopy.redb".to_string()
}

/// Where the state database lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: d_db_path() }
    }
}

/// The full daemon configuration, loaded from one YAML file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub buses: Vec<BusConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub heating: HeatingConfig,
    #[serde(default)]
    pub vent_defaults: VentDefaults,
    pub vents: Vec<VentConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub plan: PlanConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Moving-average window, in samples, for sensor readings.
    #[serde(default = "d_avg_window")]
    pub avg_window: usize,
}

impl AppConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validate_buses(&self.buses).context("invalid serial bus configuration")?;
        self.controller_settings()
            .validate()
            .context("invalid controller configuration")?;
        // Fault topics must point at configured vents.
        let vent_ids: BTreeSet<u32> = self.vents.iter().map(|v| v.id).collect();
        for (topic, vent) in &self.mqtt.vent_error_topics {
            if !vent_ids.contains(vent) {
                anyhow::bail!("mqtt.vent_error_topics['{topic}'] names unknown vent {vent}");
            }
        }
        Ok(())
    }

    /// The controller's slice of the configuration.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            control: self.control.clone(),
            heating: self.heating.clone(),
            vent_defaults: self.vent_defaults.clone(),
            vents: self.vents.clone(),
            groups: self.groups.clone(),
            plan: self.plan.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
mqtt:
  host: broker.local
  sensor_topics:
    greenhouse/temp: internal_temp
vents:
  - id: 1
    name: Roof east
    travel_time_s: 120
    topics:
      up: relay/1/up
      down: relay/1/down
"#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: AppConfig = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.avg_window, DEFAULT_AVG_WINDOW);
        assert_eq!(config.storage.path, "canopy.redb");
        assert_eq!(config.control.wind_crit_ms, 20.0);
    }

    #[test]
    fn test_unknown_fault_vent_rejected() {
        let mut config: AppConfig = serde_yaml::from_str(MINIMAL).unwrap();
        config
            .mqtt
            .vent_error_topics
            .insert("relay/9/error".to_string(), 9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_full_config_round_trip() {
        let raw = r#"
mqtt:
  host: broker.local
  username: canopy
  password: secret
  vent_error_topics:
    relay/1/error: 1
control:
  target_temp_c: 24
  co2_thr_ppm: 800
  min_open_co2_percent: 50
  flush_hour: 7
heating:
  enabled: true
  topic: heating/switch
  day_target_c: 18
vents:
  - id: 1
    name: Roof east
    travel_time_s: 120
    topics:
      up: relay/1/up
      down: relay/1/down
  - id: 2
    name: Roof west
    travel_time_s: 120
    topics:
      up: relay/2/up
      down: relay/2/down
groups:
  - id: east
    vents: [1]
    wind_upwind_deg: [[350, 10]]
plan:
  close_strategy: lifo
  stages:
    - id: roof
      mode: parallel
      step_percent: 20
      groups: [east]
buses:
  - id: bus0
    port: /dev/ttyUSB0
    devices:
      - id: climate
        unit_id: 11
        driver: gas_combo
"#;
        let config: AppConfig = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.control.flush_hour, Some(7));
        assert!(config.heating.enabled);
        assert_eq!(config.buses[0].devices[0].unit_id, 11);
        assert_eq!(config.groups[0].wind_upwind_deg[0].start, 350.0);
    }
}
