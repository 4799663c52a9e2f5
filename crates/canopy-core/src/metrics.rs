//! Sensor metrics and moving-average aggregation.
//!
//! Readings arrive from two independent writers (the MQTT ingestion task and
//! the serial poll loop) and are read concurrently by the control loop, so
//! the shared snapshot lives behind [`SharedSnapshot`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Error;

/// Default averaging window (number of samples).
pub const DEFAULT_AVG_WINDOW: usize = 5;

/// The closed set of metrics the controller understands.
///
/// Decoder and topic mappings resolve to these at configuration time;
/// unknown names are a configuration fault, not a runtime surprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    InternalTemp,
    ExternalTemp,
    InternalHum,
    ExternalHum,
    InternalCo2,
    ExternalPressure,
    WindSpeed,
    WindGust,
    WindDirection,
    Rain,
}

impl Metric {
    /// All known metrics, in a stable order.
    pub const ALL: [Metric; 10] = [
        Metric::InternalTemp,
        Metric::ExternalTemp,
        Metric::InternalHum,
        Metric::ExternalHum,
        Metric::InternalCo2,
        Metric::ExternalPressure,
        Metric::WindSpeed,
        Metric::WindGust,
        Metric::WindDirection,
        Metric::Rain,
    ];

    /// Metrics the auto tick cannot run without.
    pub const REQUIRED: [Metric; 4] = [
        Metric::InternalTemp,
        Metric::ExternalTemp,
        Metric::InternalHum,
        Metric::WindSpeed,
    ];

    /// Stable configuration-facing name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::InternalTemp => "internal_temp",
            Metric::ExternalTemp => "external_temp",
            Metric::InternalHum => "internal_hum",
            Metric::ExternalHum => "external_hum",
            Metric::InternalCo2 => "internal_co2",
            Metric::ExternalPressure => "external_pressure",
            Metric::WindSpeed => "wind_speed",
            Metric::WindGust => "wind_gust",
            Metric::WindDirection => "wind_direction",
            Metric::Rain => "rain",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::config("metric", format!("unknown metric '{s}'")))
    }
}

/// Bounded moving average over the newest `window` samples.
///
/// An empty averager reports `None`, never `0.0`; zero is a legitimate
/// reading (calm wind, freezing temperature).
#[derive(Debug, Clone)]
pub struct SensorAverager {
    window: usize,
    samples: VecDeque<f64>,
}

impl Default for SensorAverager {
    fn default() -> Self {
        Self::new(DEFAULT_AVG_WINDOW)
    }
}

impl SensorAverager {
    /// Create an averager with the given window (clamped to at least 1).
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn add(&mut self, value: f64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Mean of the buffered samples, or `None` when no data has arrived.
    pub fn avg(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Resize the window, keeping only the newest `window` samples.
    pub fn set_window(&mut self, window: usize) {
        let window = window.max(1);
        self.window = window;
        while self.samples.len() > window {
            self.samples.pop_front();
        }
    }

    /// Current window size.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One averager per known metric.
#[derive(Debug, Clone)]
pub struct SensorSnapshot {
    averagers: BTreeMap<Metric, SensorAverager>,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self::new(DEFAULT_AVG_WINDOW)
    }
}

impl SensorSnapshot {
    /// Create a snapshot with the same window for every metric.
    pub fn new(window: usize) -> Self {
        let averagers = Metric::ALL
            .iter()
            .map(|m| (*m, SensorAverager::new(window)))
            .collect();
        Self { averagers }
    }

    /// Append a sample for a metric.
    pub fn add(&mut self, metric: Metric, value: f64) {
        if let Some(avg) = self.averagers.get_mut(&metric) {
            avg.add(value);
        }
    }

    /// Current average for one metric.
    pub fn avg(&self, metric: Metric) -> Option<f64> {
        self.averagers.get(&metric).and_then(|a| a.avg())
    }

    /// Resize every metric's window.
    pub fn set_window(&mut self, window: usize) {
        for avg in self.averagers.values_mut() {
            avg.set_window(window);
        }
    }

    /// Resize the windows of selected metrics.
    pub fn set_windows(&mut self, windows: &BTreeMap<Metric, usize>) {
        for (metric, window) in windows {
            if let Some(avg) = self.averagers.get_mut(metric) {
                avg.set_window(*window);
            }
        }
    }

    /// Averages for every metric; metrics without data report `None`.
    pub fn averages(&self) -> BTreeMap<Metric, Option<f64>> {
        self.averagers.iter().map(|(m, a)| (*m, a.avg())).collect()
    }
}

/// Snapshot shared between writer tasks and the control loop.
#[derive(Debug, Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<SensorSnapshot>>,
}

impl SharedSnapshot {
    /// Create a shared snapshot with the given window for every metric.
    pub fn new(window: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SensorSnapshot::new(window))),
        }
    }

    /// Append a sample for a metric.
    pub async fn add(&self, metric: Metric, value: f64) {
        self.inner.write().await.add(metric, value);
    }

    /// Averages for every metric.
    pub async fn averages(&self) -> BTreeMap<Metric, Option<f64>> {
        self.inner.read().await.averages()
    }

    /// Resize every metric's window.
    pub async fn set_window(&self, window: usize) {
        self.inner.write().await.set_window(window);
    }

    /// Resize the windows of selected metrics.
    pub async fn set_windows(&self, windows: &BTreeMap<Metric, usize>) {
        self.inner.write().await.set_windows(windows);
    }
}
