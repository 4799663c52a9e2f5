//! Outbound command seam.
//!
//! Actuators drive relays by publishing to topics; delivery is fire-and-forget
//! and at-most-once. A failed publish is reported to the caller (which must
//! not advance its simulated position) but is never retried here.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Sink for outbound actuation commands.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Publish one payload to one topic.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
}

/// In-memory sink recording every publish, for tests and the diagnostics
/// harness. Can be switched into a failing mode to exercise transport-fault
/// paths.
#[derive(Debug, Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, String)>>,
    failing: Mutex<bool>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All publishes so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    /// Publishes to one topic, in order.
    pub fn payloads_for(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    /// Make subsequent publishes fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(Error::Transport(format!("publish to '{topic}' refused")));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}
