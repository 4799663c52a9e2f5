//! Motor-driven vent with simulated position.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use canopy_core::command::CommandSink;
use canopy_core::config::{VentConfig, VentDefaults};
use canopy_core::error::Result;

const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";

/// Drive direction of the vent motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// One vent. Position is a simulation: the motor runs for a fraction of the
/// configured full travel time and the model assumes it arrived.
pub struct Vent {
    id: u32,
    name: String,
    topic_up: String,
    topic_down: String,
    travel_time_s: f64,
    reverse_pause_s: f64,
    min_move_s: f64,
    calibration_buffer_s: f64,
    ignore_delta_percent: f64,
    sink: Arc<dyn CommandSink>,
    position: f64,
    last_direction: Option<Direction>,
    available: bool,
}

impl Vent {
    /// Build a vent from its config, falling back to the shared defaults for
    /// tunables the vent does not override.
    pub fn new(config: &VentConfig, defaults: &VentDefaults, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            topic_up: config.topics.up.clone(),
            topic_down: config.topics.down.clone(),
            travel_time_s: config.travel_time_s,
            reverse_pause_s: config.reverse_pause_s.unwrap_or(defaults.reverse_pause_s),
            min_move_s: config.min_move_s.unwrap_or(defaults.min_move_s),
            calibration_buffer_s: config
                .calibration_buffer_s
                .unwrap_or(defaults.calibration_buffer_s),
            ignore_delta_percent: config
                .ignore_delta_percent
                .unwrap_or(defaults.ignore_delta_percent),
            sink,
            position: 0.0,
            last_direction: None,
            available: true,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulated position, percent open.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Restore a persisted position without driving the motor.
    pub fn restore_position(&mut self, position: f64) {
        self.position = position.clamp(0.0, 100.0);
    }

    /// Whether the drive is believed healthy. Cleared when the relay module
    /// reports a fault on the vent's error topic.
    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Movement dead-band in percent.
    pub fn tolerance(&self) -> f64 {
        self.ignore_delta_percent
    }

    /// Drive toward `target` percent. Returns `Ok(false)` when the request
    /// falls inside the dead-band and nothing was published.
    ///
    /// A failed relay publish leaves the simulated position unchanged.
    pub async fn move_to(&mut self, target: f64) -> Result<bool> {
        let target = target.clamp(0.0, 100.0);
        let delta = target - self.position;
        if delta.abs() < self.ignore_delta_percent {
            return Ok(false);
        }
        let direction = if delta > 0.0 {
            Direction::Up
        } else {
            Direction::Down
        };
        let move_time = (delta.abs() / 100.0 * self.travel_time_s).max(self.min_move_s);
        debug!(
            vent = self.id,
            from = self.position,
            to = target,
            seconds = move_time,
            "moving vent"
        );
        self.drive(direction, move_time).await?;
        self.position = target;
        Ok(true)
    }

    /// Re-zero the position by over-driving closed past the full travel time.
    pub async fn calibrate_close(&mut self) -> Result<()> {
        let seconds = self.travel_time_s + self.calibration_buffer_s;
        debug!(vent = self.id, seconds, "calibrating vent closed");
        self.drive(Direction::Down, seconds).await?;
        self.position = 0.0;
        Ok(())
    }

    /// Release both relays.
    pub async fn stop(&self) -> Result<()> {
        self.sink.publish(&self.topic_up, PAYLOAD_OFF).await?;
        self.sink.publish(&self.topic_down, PAYLOAD_OFF).await?;
        Ok(())
    }

    async fn drive(&mut self, direction: Direction, seconds: f64) -> Result<()> {
        if let Some(last) = self.last_direction {
            if last != direction && self.reverse_pause_s > 0.0 {
                self.stop().await?;
                sleep(Duration::from_secs_f64(self.reverse_pause_s)).await;
            }
        }
        let (on_topic, off_topic) = match direction {
            Direction::Up => (&self.topic_up, &self.topic_down),
            Direction::Down => (&self.topic_down, &self.topic_up),
        };
        // The opposite relay must be released before the drive relay engages.
        self.sink.publish(off_topic, PAYLOAD_OFF).await?;
        self.sink.publish(on_topic, PAYLOAD_ON).await?;
        self.last_direction = Some(direction);
        sleep(Duration::from_secs_f64(seconds)).await;
        // The motor has already run; a failed release must not lose the
        // position we reached.
        if let Err(e) = self.stop().await {
            warn!(vent = self.id, error = %e, "failed to release vent relays");
        }
        Ok(())
    }
}
