//! Persistent state for the climate controller.
//!
//! A thin key-value backend (redb on disk, a BTreeMap in tests) carries three
//! typed layers: [`state::StateStore`] for mode, vent positions and control
//! overrides, [`events::EventLog`] for the audit trail, and notification
//! preferences.

pub mod backend;
pub mod backends;
pub mod error;
pub mod events;
pub mod state;

pub use backend::KvBackend;
pub use backends::{MemoryBackend, RedbBackend, RedbBackendConfig};
pub use error::{Error, Result};
pub use events::{EventKind, EventLog, EventRecord};
pub use state::{Mode, StateStore, VentState};
