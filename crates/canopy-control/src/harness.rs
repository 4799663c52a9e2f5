//! Diagnostics harness: forced sensor values for commissioning.
//!
//! An override wins over every real source, so an installer can feed the
//! controller a storm or a heatwave from the bench and watch the vents
//! respond without touching the sensors.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use canopy_core::metrics::Metric;

/// Shared set of forced metric values.
#[derive(Debug, Clone, Default)]
pub struct HarnessOverrides {
    inner: Arc<RwLock<BTreeMap<Metric, f64>>>,
}

impl HarnessOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force one metric.
    pub async fn set(&self, metric: Metric, value: f64) {
        info!(metric = %metric, value, "harness override set");
        self.inner.write().await.insert(metric, value);
    }

    /// Release one metric back to the real sources.
    pub async fn clear(&self, metric: Metric) {
        info!(metric = %metric, "harness override cleared");
        self.inner.write().await.remove(&metric);
    }

    /// Release everything.
    pub async fn clear_all(&self) {
        self.inner.write().await.clear();
    }

    /// Whether any override is active.
    pub async fn is_active(&self) -> bool {
        !self.inner.read().await.is_empty()
    }

    /// Overlay the overrides onto merged readings.
    pub async fn apply(&self, readings: &mut BTreeMap<Metric, Option<f64>>) {
        for (metric, value) in self.inner.read().await.iter() {
            readings.insert(*metric, Some(*value));
        }
    }
}
