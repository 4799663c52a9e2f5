//! Core types for Canopy.
//!
//! This crate defines the foundational abstractions shared across the
//! project: the metric/averaging model, typed configuration, the outbound
//! command seam and day/night scheduling helpers.

pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod schedule;

pub use command::{CommandSink, RecordingSink};
pub use error::{Error, Result};
pub use metrics::{Metric, SensorAverager, SensorSnapshot, SharedSnapshot};
pub use schedule::{is_daytime, TimeOfDay};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::command::CommandSink;
    pub use crate::config::{
        CloseStrategy, ControlConfig, GroupConfig, HeatingConfig, PlanConfig, StageConfig,
        StageMode, VentConfig, VentDefaults,
    };
    pub use crate::error::{Error, Result};
    pub use crate::metrics::{Metric, SensorAverager, SensorSnapshot, SharedSnapshot};
    pub use crate::schedule::{is_daytime, TimeOfDay};
}
