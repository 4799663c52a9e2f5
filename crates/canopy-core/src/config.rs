//! Typed configuration for the controller, actuators and movement plan.
//!
//! Configuration faults are rejected at configuration time with a
//! field-qualified message; nothing is silently coerced. Runtime overrides go
//! through [`ControlConfig::apply_value`], the single mutation point.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::schedule::TimeOfDay;

fn d_true() -> bool {
    true
}

/// Thresholds, gains and loop timings for the environment controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// Fallback setpoint when no day/night split is configured.
    pub target_temp_c: f64,
    pub day_target_temp_c: Option<f64>,
    pub night_target_temp_c: Option<f64>,
    /// Proportional gain: percent of opening per degree of error.
    pub temp_diff_percent: f64,
    pub humidity_thr: f64,
    pub min_open_hum_percent: f64,
    pub co2_thr_ppm: Option<f64>,
    pub min_open_co2_percent: Option<f64>,
    pub wind_risk_ms: f64,
    pub wind_crit_ms: f64,
    pub risk_open_limit_percent: f64,
    pub rain_threshold: f64,
    pub allow_humidity_override: bool,
    pub crit_hum_crack_percent: f64,
    pub night_max_open_percent: f64,
    pub day_start: Option<TimeOfDay>,
    pub night_start: Option<TimeOfDay>,
    pub wind_lock_enabled: bool,
    pub step_percent: f64,
    pub step_delay_s: f64,
    pub controller_loop_s: f64,
    pub ignore_delta_percent: f64,
    /// Hour of the daily full-open flush; disabled when unset.
    pub flush_hour: Option<u8>,
    /// Hour of the daily calibration close; disabled when unset.
    pub calibration_hour: Option<u8>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            target_temp_c: 25.0,
            day_target_temp_c: None,
            night_target_temp_c: None,
            temp_diff_percent: 5.0,
            humidity_thr: 70.0,
            min_open_hum_percent: 20.0,
            co2_thr_ppm: None,
            min_open_co2_percent: None,
            wind_risk_ms: 10.0,
            wind_crit_ms: 20.0,
            risk_open_limit_percent: 50.0,
            rain_threshold: 0.5,
            allow_humidity_override: false,
            crit_hum_crack_percent: 10.0,
            night_max_open_percent: 40.0,
            day_start: None,
            night_start: None,
            wind_lock_enabled: true,
            step_percent: 10.0,
            step_delay_s: 0.0,
            controller_loop_s: 1.0,
            ignore_delta_percent: 0.5,
            flush_hour: None,
            calibration_hour: None,
        }
    }
}

fn coerce_bool(field: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(Error::config(field, format!("'{other}' is not a boolean"))),
        },
        _ => Err(Error::config(field, "expected a boolean")),
    }
}

fn coerce_f64(field: &str, value: &Value, min: f64, max: f64) -> Result<f64> {
    let num = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::config(field, "expected a number"))?,
        Value::String(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::config(field, format!("'{s}' is not a number")))?,
        _ => return Err(Error::config(field, "expected a number")),
    };
    if num < min {
        return Err(Error::config(field, format!("must be at least {min}")));
    }
    if num > max {
        return Err(Error::config(field, format!("must be at most {max}")));
    }
    Ok(num)
}

fn coerce_opt_f64(field: &str, value: &Value, min: f64, max: f64) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        _ => coerce_f64(field, value, min, max).map(Some),
    }
}

fn coerce_opt_time(field: &str, value: &Value) -> Result<Option<TimeOfDay>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .parse::<TimeOfDay>()
            .map(Some)
            .map_err(|_| Error::config(field, "must be in HH:MM form")),
        _ => Err(Error::config(field, "must be in HH:MM form")),
    }
}

fn coerce_opt_hour(field: &str, value: &Value) -> Result<Option<u8>> {
    match coerce_opt_f64(field, value, 0.0, 23.0)? {
        None => Ok(None),
        Some(h) => Ok(Some(h as u8)),
    }
}

impl ControlConfig {
    /// Apply one named override, validating its type and bounds.
    ///
    /// This is the only mutation path for runtime control changes; both the
    /// reconfiguration entrypoint and persisted `control.<name>` overrides go
    /// through it.
    pub fn apply_value(&mut self, field: &str, value: &Value) -> Result<()> {
        match field {
            "target_temp_c" => self.target_temp_c = coerce_f64(field, value, -20.0, 50.0)?,
            "day_target_temp_c" => {
                self.day_target_temp_c = coerce_opt_f64(field, value, -20.0, 50.0)?
            }
            "night_target_temp_c" => {
                self.night_target_temp_c = coerce_opt_f64(field, value, -20.0, 50.0)?
            }
            "temp_diff_percent" => self.temp_diff_percent = coerce_f64(field, value, 0.1, 100.0)?,
            "humidity_thr" => self.humidity_thr = coerce_f64(field, value, 0.0, 100.0)?,
            "min_open_hum_percent" => {
                self.min_open_hum_percent = coerce_f64(field, value, 0.0, 100.0)?
            }
            "co2_thr_ppm" => self.co2_thr_ppm = coerce_opt_f64(field, value, 0.0, 5000.0)?,
            "min_open_co2_percent" => {
                self.min_open_co2_percent = coerce_opt_f64(field, value, 0.0, 100.0)?
            }
            "wind_risk_ms" => self.wind_risk_ms = coerce_f64(field, value, 0.0, 50.0)?,
            "wind_crit_ms" => self.wind_crit_ms = coerce_f64(field, value, 0.0, 60.0)?,
            "risk_open_limit_percent" => {
                self.risk_open_limit_percent = coerce_f64(field, value, 0.0, 100.0)?
            }
            "rain_threshold" => self.rain_threshold = coerce_f64(field, value, 0.0, 10.0)?,
            "allow_humidity_override" => {
                self.allow_humidity_override = coerce_bool(field, value)?
            }
            "crit_hum_crack_percent" => {
                self.crit_hum_crack_percent = coerce_f64(field, value, 0.0, 100.0)?
            }
            "night_max_open_percent" => {
                self.night_max_open_percent = coerce_f64(field, value, 0.0, 100.0)?
            }
            "day_start" => self.day_start = coerce_opt_time(field, value)?,
            "night_start" => self.night_start = coerce_opt_time(field, value)?,
            "wind_lock_enabled" => self.wind_lock_enabled = coerce_bool(field, value)?,
            "step_percent" => self.step_percent = coerce_f64(field, value, 1.0, 100.0)?,
            "step_delay_s" => self.step_delay_s = coerce_f64(field, value, 0.0, 600.0)?,
            "controller_loop_s" => self.controller_loop_s = coerce_f64(field, value, 0.1, 60.0)?,
            "ignore_delta_percent" => {
                self.ignore_delta_percent = coerce_f64(field, value, 0.0, 100.0)?
            }
            "flush_hour" => self.flush_hour = coerce_opt_hour(field, value)?,
            "calibration_hour" => self.calibration_hour = coerce_opt_hour(field, value)?,
            other => {
                return Err(Error::config(
                    format!("control.{other}"),
                    "unknown control field",
                ))
            }
        }
        Ok(())
    }

    /// Movement dead-band, floored so repeated float noise cannot zero it.
    pub fn tolerance(&self) -> f64 {
        if self.ignore_delta_percent > 0.0 {
            self.ignore_delta_percent
        } else {
            0.5
        }
    }

    /// Day or night temperature setpoint for the given moment.
    pub fn environment_target(&self, daytime: bool) -> f64 {
        let day = self.day_target_temp_c.unwrap_or(self.target_temp_c);
        let night = self.night_target_temp_c.unwrap_or(self.target_temp_c);
        if daytime {
            day
        } else {
            night
        }
    }
}

/// MQTT topics of one vent's drive relays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VentTopics {
    pub up: String,
    pub down: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_in: Option<String>,
}

/// Fallback tunables applied to vents that do not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VentDefaults {
    pub reverse_pause_s: f64,
    pub min_move_s: f64,
    pub calibration_buffer_s: f64,
    pub ignore_delta_percent: f64,
}

impl Default for VentDefaults {
    fn default() -> Self {
        Self {
            reverse_pause_s: 1.0,
            min_move_s: 0.5,
            calibration_buffer_s: 0.5,
            ignore_delta_percent: 0.5,
        }
    }
}

/// One motor-driven vent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VentConfig {
    pub id: u32,
    pub name: String,
    /// Seconds of continuous drive for a full 0→100% travel.
    pub travel_time_s: f64,
    pub topics: VentTopics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_pause_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_move_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_buffer_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_delta_percent: Option<f64>,
}

/// Validate a vent list: unique ids, positive travel, topics present.
pub fn validate_vents(vents: &[VentConfig]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for (index, vent) in vents.iter().enumerate() {
        if !seen.insert(vent.id) {
            return Err(Error::config(
                format!("vents[{index}].id"),
                format!("duplicate vent id {}", vent.id),
            ));
        }
        if vent.travel_time_s <= 0.0 {
            return Err(Error::config(
                format!("vents[{}].travel_time_s", vent.id),
                "travel time must be positive",
            ));
        }
        if vent.topics.up.trim().is_empty() || vent.topics.down.trim().is_empty() {
            return Err(Error::config(
                format!("vents[{}].topics", vent.id),
                "both 'up' and 'down' topics are required",
            ));
        }
    }
    Ok(())
}

/// An angular wind range `[start, end)` in degrees; may wrap past north.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct WindRange {
    pub start: f64,
    pub end: f64,
}

impl WindRange {
    /// Wrap-aware containment. Equal boundaries match every direction.
    pub fn contains(&self, direction: f64) -> bool {
        let dir = direction.rem_euclid(360.0);
        let start = self.start.rem_euclid(360.0);
        let end = self.end.rem_euclid(360.0);
        if start == end {
            true
        } else if start <= end {
            (start..=end).contains(&dir)
        } else {
            dir >= start || dir <= end
        }
    }
}

impl From<[f64; 2]> for WindRange {
    fn from(v: [f64; 2]) -> Self {
        Self {
            start: v[0],
            end: v[1],
        }
    }
}

impl From<WindRange> for [f64; 2] {
    fn from(r: WindRange) -> Self {
        [r.start, r.end]
    }
}

/// A zone of vents moved together, with an optional wind lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub vents: Vec<u32>,
    #[serde(default)]
    pub wind_upwind_deg: Vec<WindRange>,
    #[serde(default = "d_true")]
    pub wind_lock_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_lock_close_percent: Option<f64>,
}

/// Validate groups against the known vent ids.
pub fn validate_groups(groups: &[GroupConfig], vent_ids: &BTreeSet<u32>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for group in groups {
        if !seen.insert(group.id.as_str()) {
            return Err(Error::config(
                format!("groups[{}].id", group.id),
                "duplicate group id",
            ));
        }
        if group.vents.is_empty() {
            return Err(Error::config(
                format!("groups[{}].vents", group.id),
                "a group needs at least one vent",
            ));
        }
        for vid in &group.vents {
            if !vent_ids.contains(vid) {
                return Err(Error::config(
                    format!("groups[{}].vents", group.id),
                    format!("vent {vid} does not exist"),
                ));
            }
        }
        for range in &group.wind_upwind_deg {
            if !(0.0..=360.0).contains(&range.start) || !(0.0..=360.0).contains(&range.end) {
                return Err(Error::config(
                    format!("groups[{}].wind_upwind_deg", group.id),
                    "wind angles must be within 0-360",
                ));
            }
        }
        if let Some(pct) = group.wind_lock_close_percent {
            if !(0.0..=100.0).contains(&pct) {
                return Err(Error::config(
                    format!("groups[{}].wind_lock_close_percent", group.id),
                    "lock position must be within 0-100%",
                ));
            }
        }
    }
    Ok(())
}

/// How a stage walks its groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    Serial,
    Parallel,
}

impl Default for StageMode {
    fn default() -> Self {
        StageMode::Serial
    }
}

/// Whether zones opened first also close first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseStrategy {
    Fifo,
    Lifo,
}

impl Default for CloseStrategy {
    fn default() -> Self {
        CloseStrategy::Fifo
    }
}

impl fmt::Display for CloseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseStrategy::Fifo => f.write_str("fifo"),
            CloseStrategy::Lifo => f.write_str("lifo"),
        }
    }
}

// Installer payloads historically encoded this as "fifo"/"lifo", a 0/1 flag
// or a bare boolean; all spellings remain accepted.
impl<'de> Deserialize<'de> for CloseStrategy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        CloseStrategy::from_value(&value).map_err(serde::de::Error::custom)
    }
}

impl CloseStrategy {
    /// Normalize the legacy spellings; anything unrecognized is an error.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(true) => Ok(CloseStrategy::Lifo),
            Value::Bool(false) => Ok(CloseStrategy::Fifo),
            Value::Number(n) => Ok(if n.as_i64() == Some(1) {
                CloseStrategy::Lifo
            } else {
                CloseStrategy::Fifo
            }),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "fifo" | "0" | "false" | "no" => Ok(CloseStrategy::Fifo),
                "lifo" | "1" | "true" | "yes" => Ok(CloseStrategy::Lifo),
                other => Err(Error::config(
                    "close_strategy",
                    format!("'{other}' is not a close strategy"),
                )),
            },
            _ => Err(Error::config("close_strategy", "expected fifo or lifo")),
        }
    }
}

/// One stage of the movement plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: StageMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_percent: Option<f64>,
    #[serde(default)]
    pub delay_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_strategy: Option<CloseStrategy>,
    pub groups: Vec<String>,
}

/// The whole movement plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_strategy: Option<CloseStrategy>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Validate a plan against the known group ids.
pub fn validate_plan(plan: &PlanConfig, group_ids: &BTreeSet<String>) -> Result<()> {
    for (index, stage) in plan.stages.iter().enumerate() {
        let sid = if stage.id.is_empty() {
            format!("{}", index + 1)
        } else {
            stage.id.clone()
        };
        if let Some(step) = stage.step_percent {
            if step <= 0.0 || step > 100.0 {
                return Err(Error::config(
                    format!("plan.stages[{sid}].step_percent"),
                    "step must be within 0-100%",
                ));
            }
        }
        if stage.delay_s < 0.0 {
            return Err(Error::config(
                format!("plan.stages[{sid}].delay_s"),
                "delay cannot be negative",
            ));
        }
        if stage.groups.is_empty() {
            return Err(Error::config(
                format!("plan.stages[{sid}].groups"),
                "a stage needs at least one group",
            ));
        }
        for gid in &stage.groups {
            if !group_ids.contains(gid) {
                return Err(Error::config(
                    format!("plan.stages[{sid}].groups"),
                    format!("group '{gid}' does not exist"),
                ));
            }
        }
    }
    Ok(())
}

/// Heating driven either by a switch topic or a three-way mixing valve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeatingConfig {
    pub enabled: bool,
    pub topic: Option<String>,
    pub payload_on: Option<String>,
    pub payload_off: Option<String>,
    pub day_target_c: Option<f64>,
    pub night_target_c: Option<f64>,
    pub hysteresis_c: Option<f64>,
    pub day_start: Option<TimeOfDay>,
    pub night_start: Option<TimeOfDay>,
    pub valve: Option<HeatingValveConfig>,
}

impl HeatingConfig {
    /// Hysteresis band, clamped to be non-negative.
    pub fn hysteresis(&self) -> f64 {
        self.hysteresis_c.unwrap_or(5.0).max(0.0)
    }
}

/// Three-way valve wiring for heating circuits with mixed supply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeatingValveConfig {
    pub open_topic: String,
    pub close_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_topic: Option<String>,
    #[serde(default = "d_on")]
    pub open_payload: String,
    #[serde(default = "d_on")]
    pub close_payload: String,
    #[serde(default = "d_off")]
    pub stop_payload: String,
    #[serde(default = "d_valve_travel")]
    pub travel_time_s: f64,
    #[serde(default = "d_valve_pause")]
    pub reverse_pause_s: f64,
    #[serde(default = "d_valve_min_move")]
    pub min_move_s: f64,
    #[serde(default = "d_valve_deadband")]
    pub ignore_delta_percent: f64,
}

fn d_on() -> String {
    "ON".to_string()
}

fn d_off() -> String {
    "OFF".to_string()
}

fn d_valve_travel() -> f64 {
    30.0
}

fn d_valve_pause() -> f64 {
    1.0
}

fn d_valve_min_move() -> f64 {
    0.5
}

fn d_valve_deadband() -> f64 {
    1.0
}

/// Validate a heating payload.
pub fn validate_heating(heating: &HeatingConfig) -> Result<()> {
    for (field, value) in [
        ("heating.day_target_c", heating.day_target_c),
        ("heating.night_target_c", heating.night_target_c),
        ("heating.hysteresis_c", heating.hysteresis_c),
    ] {
        if let Some(v) = value {
            if v < 0.0 {
                return Err(Error::config(field, "cannot be negative"));
            }
        }
    }
    if let Some(valve) = &heating.valve {
        if valve.travel_time_s <= 0.0 {
            return Err(Error::config(
                "heating.valve.travel_time_s",
                "travel time must be positive",
            ));
        }
    }
    Ok(())
}
