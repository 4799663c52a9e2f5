//! The Canopy control loop: staged vent movement, safety interlocks,
//! wind locks, heating and the daily schedule.

pub mod command;
pub mod controller;
pub mod harness;
pub mod plan;
pub mod scheduler;

pub use command::{Command, ConfigUpdate, ControllerHandle};
pub use controller::{Controller, ControllerDeps, ControllerSettings};
pub use harness::HarnessOverrides;
pub use plan::{infer_closing, MovementPlan, SharedVent, ZoneInfo};
pub use scheduler::{DailySchedule, DailyTask};
