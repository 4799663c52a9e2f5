//! Typed persistent state on top of the key-value backend.
//!
//! Everything the controller must survive a restart with lives here: the
//! operating mode, per-vent positions and targets, and runtime control
//! overrides. Values are JSON so the database stays inspectable.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::backend::KvBackend;
use crate::error::{Error, Result};

const KEY_MODE: &str = "state:mode";
const PREFIX_VENT: &str = "state:vent.";
const PREFIX_CONTROL: &str = "control:";
const KEY_NOTIFICATION_PREFS: &str = "notifications:preferences";

/// Operating mode of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Auto => f.write_str("auto"),
            Mode::Manual => f.write_str("manual"),
        }
    }
}

/// Persisted runtime state of one vent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VentState {
    /// Last simulated position, percent open.
    pub position: f64,
    /// Last requested target, percent open.
    pub user_target: f64,
}

/// Typed facade over the backend.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KvBackend>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.put(key, &bytes)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Serialization(format!("{key}: {e}"))),
        }
    }

    /// Stored operating mode, if any run has persisted one.
    pub fn mode(&self) -> Result<Option<Mode>> {
        self.get_json(KEY_MODE)
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.put_json(KEY_MODE, &mode)
    }

    /// Stored runtime state for one vent.
    pub fn vent_state(&self, id: u32) -> Result<Option<VentState>> {
        self.get_json(&format!("{PREFIX_VENT}{id}"))
    }

    pub fn set_vent_state(&self, id: u32, state: VentState) -> Result<()> {
        self.put_json(&format!("{PREFIX_VENT}{id}"), &state)
    }

    /// All persisted control overrides, by field name.
    pub fn control_overrides(&self) -> Result<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();
        for (key, bytes) in self.backend.scan_prefix(PREFIX_CONTROL)? {
            let name = key[PREFIX_CONTROL.len()..].to_string();
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("{key}: {e}")))?;
            out.insert(name, value);
        }
        Ok(out)
    }

    /// Persist one control override. The caller validates before storing.
    pub fn set_control_override(&self, name: &str, value: &Value) -> Result<()> {
        self.put_json(&format!("{PREFIX_CONTROL}{name}"), value)
    }

    pub fn clear_control_override(&self, name: &str) -> Result<()> {
        self.backend.delete(&format!("{PREFIX_CONTROL}{name}"))
    }

    /// Notification delivery switches per category; absent means all on.
    pub fn notification_preferences(&self) -> Result<BTreeMap<String, bool>> {
        Ok(self.get_json(KEY_NOTIFICATION_PREFS)?.unwrap_or_default())
    }

    pub fn set_notification_preferences(&self, prefs: &BTreeMap<String, bool>) -> Result<()> {
        self.put_json(KEY_NOTIFICATION_PREFS, prefs)
    }

    /// Raw backend handle, shared with the event log.
    pub fn backend(&self) -> Arc<dyn KvBackend> {
        self.backend.clone()
    }
}
