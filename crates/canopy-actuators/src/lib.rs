//! Actuator models.
//!
//! Greenhouse vents and mixing valves have no position feedback; position is
//! simulated by driving a relay for a computed fraction of the full travel
//! time. The models here own that simulation and publish relay commands
//! through [`canopy_core::command::CommandSink`].

pub mod valve;
pub mod vent;

pub use valve::ThreeWayValve;
pub use vent::Vent;
