//! Append-only audit log of controller events.
//!
//! Every record gets a monotonic sequence number and a UTC timestamp.
//! Records are stored under zero-padded keys so a prefix scan returns them
//! in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::backend::KvBackend;
use crate::error::{Error, Result};

const KEY_SEQ: &str = "events:seq";
const PREFIX_RECORD: &str = "events:rec:";

/// Kinds of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ModeChange,
    ManualAction,
    WindLockOn,
    WindLockOff,
    Co2High,
    Co2Normal,
    HeatingOn,
    HeatingOff,
}

impl EventKind {
    /// Notification category the kind belongs to.
    pub fn category(&self) -> &'static str {
        match self {
            EventKind::ModeChange | EventKind::ManualAction => "mode",
            EventKind::WindLockOn | EventKind::WindLockOff => "wind",
            EventKind::Co2High
            | EventKind::Co2Normal
            | EventKind::HeatingOn
            | EventKind::HeatingOff => "environment",
        }
    }

    /// All notification categories, for preference defaults.
    pub const CATEGORIES: [&'static str; 4] = ["mode", "wind", "environment", "system"];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ModeChange => "mode_change",
            EventKind::ManualAction => "manual_action",
            EventKind::WindLockOn => "wind_lock_on",
            EventKind::WindLockOff => "wind_lock_off",
            EventKind::Co2High => "co2_high",
            EventKind::Co2Normal => "co2_normal",
            EventKind::HeatingOn => "heating_on",
            EventKind::HeatingOff => "heating_off",
        };
        f.write_str(name)
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
}

/// Append-only log over the shared backend.
#[derive(Clone)]
pub struct EventLog {
    backend: Arc<dyn KvBackend>,
}

impl EventLog {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    fn next_seq(&self) -> Result<u64> {
        let next = match self.backend.get(KEY_SEQ)? {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                text.parse::<u64>()
                    .map_err(|e| Error::Serialization(e.to_string()))?
                    + 1
            }
            None => 1,
        };
        self.backend.put(KEY_SEQ, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Append one event and return the stored record.
    pub fn append(&self, kind: EventKind, message: impl Into<String>) -> Result<EventRecord> {
        let record = EventRecord {
            seq: self.next_seq()?,
            ts: Utc::now(),
            kind,
            message: message.into(),
        };
        let key = format!("{PREFIX_RECORD}{:020}", record.seq);
        self.backend.put(&key, &serde_json::to_vec(&record)?)?;
        tracing::debug!(
            kind = %record.kind,
            seq = record.seq,
            "event recorded: {}",
            record.message
        );
        Ok(record)
    }

    /// The newest `limit` records, oldest first, optionally filtered by
    /// notification category.
    pub fn recent(&self, limit: usize, categories: Option<&[&str]>) -> Result<Vec<EventRecord>> {
        let mut records = Vec::new();
        for (key, bytes) in self.backend.scan_prefix(PREFIX_RECORD)? {
            let record: EventRecord = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("{key}: {e}")))?;
            if let Some(wanted) = categories {
                if !wanted.contains(&record.kind.category()) {
                    continue;
                }
            }
            records.push(record);
        }
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }
}
