//! Poll-loop owner for every configured serial bus.
//!
//! Serial readings do not feed the MQTT snapshot directly; they live in an
//! overlay the controller consults after the MQTT averages. `Some` overrides
//! the MQTT value, `None` marks a metric whose device is currently failing
//! so its stale serial average must not be used either.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

use canopy_core::error::Result;
use canopy_core::metrics::{Metric, SensorSnapshot};

use super::bus::{ModbusSource, SerialBus};
use super::config::BusConfig;
use super::decode::RegisterSource;

/// Serial readings overlaid on the MQTT averages.
pub type SerialOverlay = Arc<RwLock<BTreeMap<Metric, Option<f64>>>>;

/// Owns the poll tasks and the shared overlay.
pub struct SerialManager {
    overlay: SerialOverlay,
    snapshot: Arc<RwLock<SensorSnapshot>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SerialManager {
    /// Create a manager averaging serial samples over `avg_window` cycles.
    pub fn new(avg_window: usize) -> Self {
        Self {
            overlay: Arc::new(RwLock::new(BTreeMap::new())),
            snapshot: Arc::new(RwLock::new(SensorSnapshot::new(avg_window))),
            tasks: Vec::new(),
        }
    }

    /// Handle the controller reads the overlay through.
    pub fn overlay(&self) -> SerialOverlay {
        self.overlay.clone()
    }

    /// Open the serial port for `config` and start its poll loop.
    pub fn open_and_spawn(&mut self, config: &BusConfig) -> Result<()> {
        let source = ModbusSource::open(config)?;
        self.spawn_bus(config, source);
        Ok(())
    }

    /// Start a poll loop over an arbitrary register source.
    pub fn spawn_bus<S>(&mut self, config: &BusConfig, source: S)
    where
        S: RegisterSource + 'static,
    {
        let mut bus = SerialBus::new(config, source);
        let interval = Duration::from_secs_f64(config.poll_interval_s.max(0.1));
        let overlay = self.overlay.clone();
        let snapshot = self.snapshot.clone();
        info!(bus = %config.id, devices = config.devices.len(), "starting serial poll loop");
        let task = tokio::spawn(async move {
            loop {
                let readings = bus.poll_cycle().await;
                apply_readings(&overlay, &snapshot, readings).await;
                tokio::time::sleep(interval).await;
            }
        });
        self.tasks.push(task);
    }

    /// Stop every poll loop.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SerialManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn apply_readings(
    overlay: &SerialOverlay,
    snapshot: &Arc<RwLock<SensorSnapshot>>,
    readings: BTreeMap<Metric, Option<f64>>,
) {
    if readings.is_empty() {
        return;
    }
    let mut snap = snapshot.write().await;
    let mut overlay = overlay.write().await;
    for (metric, value) in readings {
        match value {
            Some(v) => {
                snap.add(metric, v);
                overlay.insert(metric, snap.avg(metric));
            }
            None => {
                overlay.insert(metric, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overlay_averages_fresh_readings() {
        let manager = SerialManager::new(2);
        let overlay = manager.overlay();

        let mut first = BTreeMap::new();
        first.insert(Metric::InternalTemp, Some(20.0));
        apply_readings(&manager.overlay, &manager.snapshot, first).await;

        let mut second = BTreeMap::new();
        second.insert(Metric::InternalTemp, Some(22.0));
        apply_readings(&manager.overlay, &manager.snapshot, second).await;

        assert_eq!(
            overlay.read().await.get(&Metric::InternalTemp),
            Some(&Some(21.0))
        );
    }

    #[tokio::test]
    async fn test_failed_device_masks_its_metric() {
        let manager = SerialManager::new(2);
        let overlay = manager.overlay();

        let mut ok = BTreeMap::new();
        ok.insert(Metric::WindSpeed, Some(4.0));
        ok.insert(Metric::InternalTemp, Some(20.0));
        apply_readings(&manager.overlay, &manager.snapshot, ok).await;

        let mut partial = BTreeMap::new();
        partial.insert(Metric::WindSpeed, None);
        partial.insert(Metric::InternalTemp, Some(21.0));
        apply_readings(&manager.overlay, &manager.snapshot, partial).await;

        let map = overlay.read().await;
        // The failing device's metric is masked, the healthy one still reads.
        assert_eq!(map.get(&Metric::WindSpeed), Some(&None));
        assert_eq!(map.get(&Metric::InternalTemp), Some(&Some(20.5)));
    }

    #[tokio::test]
    async fn test_untouched_metrics_stay_absent() {
        let manager = SerialManager::new(2);
        let overlay = manager.overlay();
        apply_readings(&manager.overlay, &manager.snapshot, BTreeMap::new()).await;
        assert!(overlay.read().await.is_empty());
    }
}
