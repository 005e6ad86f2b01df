//! Deletion times shared by every outbound tunnel and the inbound server.
//!
//! Deletes must survive reconnects: a peer that was offline when a path was
//! removed still has to hear about it, with the original deletion time so
//! the last-writer-wins comparison stays correct. Entries live for the
//! process lifetime and are dropped only when the path reappears locally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe table of deletion times by relative path. Cloning shares the
/// underlying table; the wiring creates one and hands it to every tunnel
/// and the server.
#[derive(Clone, Default)]
pub struct TombstoneTable {
    inner: Arc<Mutex<HashMap<String, i64>>>,
}

impl TombstoneTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `del_time` for `rel` unless an earlier observation already
    /// exists; returns the time that ends up associated with the path.
    pub fn record(&self, rel: &str, del_time: i64) -> i64 {
        *self.lock().entry(rel.to_string()).or_insert(del_time)
    }

    /// Overwrite the deletion time for `rel` (peer-applied deletes carry
    /// the originator's timestamp).
    pub fn insert(&self, rel: &str, del_time: i64) {
        self.lock().insert(rel.to_string(), del_time);
    }

    /// Forget `rel`; called when the path reappears locally.
    pub fn remove(&self, rel: &str) {
        self.lock().remove(rel);
    }

    pub fn get(&self, rel: &str) -> Option<i64> {
        self.lock().get(rel).copied()
    }

    /// Stable snapshot for bootstrap replay.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        self.lock().iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
