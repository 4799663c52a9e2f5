//! Command channel into the controller task.
//!
//! The controller owns all mutable state; everything else talks to it
//! through this channel and gets a reply over a oneshot.

use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};

use canopy_core::config::{GroupConfig, HeatingConfig, PlanConfig, VentConfig};
use canopy_storage::Mode;

/// Replacement configuration sections. Every `Some` section is validated
/// against the others and applied together between ticks; `None` sections
/// keep their current values.
#[derive(Debug, Default)]
pub struct ConfigUpdate {
    pub control: Option<BTreeMap<String, Value>>,
    pub heating: Option<HeatingConfig>,
    pub vents: Option<Vec<VentConfig>>,
    pub groups: Option<Vec<GroupConfig>>,
    pub plan: Option<PlanConfig>,
}

/// Requests the controller accepts.
#[derive(Debug)]
pub enum Command {
    SetMode {
        mode: Mode,
        reply: oneshot::Sender<bool>,
    },
    /// Manual target for one vent, percent open.
    SetVent {
        id: u32,
        percent: f64,
        reply: oneshot::Sender<bool>,
    },
    /// Manual target for every vent in one group.
    SetGroup {
        group: String,
        percent: f64,
        reply: oneshot::Sender<bool>,
    },
    /// Manual target for every vent, moved through the staged plan.
    SetAll {
        percent: f64,
        reply: oneshot::Sender<bool>,
    },
    /// Mark a vent's drive faulted or healthy, as a relay error topic would.
    MarkError {
        id: u32,
        faulted: bool,
        reply: oneshot::Sender<bool>,
    },
    /// Drive every vent through a full calibration close.
    CalibrateAll {
        reply: oneshot::Sender<bool>,
    },
    /// Validated runtime overrides of control fields.
    UpdateControl {
        values: BTreeMap<String, Value>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Replace whole configuration sections, rebuilding the vent and zone
    /// model while carrying positions and lock state over by id.
    UpdateConfig {
        update: ConfigUpdate,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Notification delivery switches per category.
    SetNotificationPreferences {
        prefs: BTreeMap<String, bool>,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle for sending commands.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
        fallback: T,
    ) -> T {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(build(reply)).await.is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }

    /// Switch operating mode. Returns whether the switch was applied.
    pub async fn set_mode(&self, mode: Mode) -> bool {
        self.request(|reply| Command::SetMode { mode, reply }, false)
            .await
    }

    /// Set a manual target for one vent. `false` for unknown vent ids.
    pub async fn set_vent(&self, id: u32, percent: f64) -> bool {
        self.request(|reply| Command::SetVent { id, percent, reply }, false)
            .await
    }

    /// Set a manual target for one group. `false` for unknown group ids.
    pub async fn set_group(&self, group: impl Into<String>, percent: f64) -> bool {
        let group = group.into();
        self.request(
            |reply| Command::SetGroup {
                group,
                percent,
                reply,
            },
            false,
        )
        .await
    }

    /// Set a manual target for every vent.
    pub async fn set_all(&self, percent: f64) -> bool {
        self.request(|reply| Command::SetAll { percent, reply }, false)
            .await
    }

    /// Mark a vent faulted or healthy. `false` for unknown vent ids.
    pub async fn mark_error(&self, id: u32, faulted: bool) -> bool {
        self.request(|reply| Command::MarkError { id, faulted, reply }, false)
            .await
    }

    /// Run a calibration close on every vent.
    pub async fn calibrate_all(&self) -> bool {
        self.request(|reply| Command::CalibrateAll { reply }, false)
            .await
    }

    /// Apply control overrides. All values are validated before any is
    /// applied; the error names the offending field.
    pub async fn update_control(&self, values: BTreeMap<String, Value>) -> Result<(), String> {
        self.request(
            |reply| Command::UpdateControl { values, reply },
            Err("controller unavailable".to_string()),
        )
        .await
    }

    /// Apply a reconfiguration. Sections are validated together and applied
    /// all-or-nothing; the error names the offending field.
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<(), String> {
        self.request(
            |reply| Command::UpdateConfig { update, reply },
            Err("controller unavailable".to_string()),
        )
        .await
    }

    /// Persist notification preferences.
    pub async fn set_notification_preferences(&self, prefs: BTreeMap<String, bool>) -> bool {
        self.request(
            |reply| Command::SetNotificationPreferences { prefs, reply },
            false,
        )
        .await
    }
}
