//! Three-way mixing valve for heating circuits.
//!
//! Same time-based position model as the vents, but with configurable
//! payloads and an optional dedicated stop topic for drives that take a
//! single combined command channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use canopy_core::command::CommandSink;
use canopy_core::config::HeatingValveConfig;
use canopy_core::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValveDirection {
    Opening,
    Closing,
}

/// A motorized three-way valve, position simulated from drive time.
pub struct ThreeWayValve {
    config: HeatingValveConfig,
    sink: Arc<dyn CommandSink>,
    position: f64,
    last_direction: Option<ValveDirection>,
}

impl ThreeWayValve {
    pub fn new(config: HeatingValveConfig, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            config,
            sink,
            position: 0.0,
            last_direction: None,
        }
    }

    /// Simulated position, percent open toward the hot supply.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Drive toward `target` percent. Returns `Ok(false)` inside the
    /// dead-band.
    pub async fn move_to(&mut self, target: f64) -> Result<bool> {
        let target = target.clamp(0.0, 100.0);
        let delta = target - self.position;
        if delta.abs() < self.config.ignore_delta_percent {
            return Ok(false);
        }
        let direction = if delta > 0.0 {
            ValveDirection::Opening
        } else {
            ValveDirection::Closing
        };
        if let Some(last) = self.last_direction {
            if last != direction && self.config.reverse_pause_s > 0.0 {
                self.stop().await?;
                sleep(Duration::from_secs_f64(self.config.reverse_pause_s)).await;
            }
        }
        let seconds = (delta.abs() / 100.0 * self.config.travel_time_s)
            .max(self.config.min_move_s);
        debug!(from = self.position, to = target, seconds, "moving valve");
        let topic = match direction {
            ValveDirection::Opening => &self.config.open_topic,
            ValveDirection::Closing => &self.config.close_topic,
        };
        let payload = match direction {
            ValveDirection::Opening => &self.config.open_payload,
            ValveDirection::Closing => &self.config.close_payload,
        };
        self.sink.publish(topic, payload).await?;
        self.last_direction = Some(direction);
        sleep(Duration::from_secs_f64(seconds)).await;
        if let Err(e) = self.stop().await {
            warn!(error = %e, "failed to stop valve after move");
        }
        self.position = target;
        Ok(true)
    }

    /// Stop the drive. Uses the dedicated stop topic when configured,
    /// otherwise sends the stop payload on both direction topics.
    pub async fn stop(&self) -> Result<()> {
        match &self.config.stop_topic {
            Some(topic) => self.sink.publish(topic, &self.config.stop_payload).await,
            None => {
                self.sink
                    .publish(&self.config.open_topic, &self.config.stop_payload)
                    .await?;
                self.sink
                    .publish(&self.config.close_topic, &self.config.stop_payload)
                    .await
            }
        }
    }
}
