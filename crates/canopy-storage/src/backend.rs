//! Key-value backend abstraction.
//!
//! Keys are namespaced strings ("state:mode", "events:00000000000000000042").
//! Values are opaque bytes; the typed layers above serialize with JSON.

use crate::error::Result;

/// A flat, ordered key-value store.
///
/// Methods are synchronous; redb transactions are short and the controller
/// calls them from its own task.
pub trait KvBackend: Send + Sync {
    /// Write one key. Overwrites silently.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read one key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete one key. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}
