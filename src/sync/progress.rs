//! Short-lived progress snapshots for in-flight transfers.
//!
//! Readers treat a missing entry as "use the persisted progress".

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::model::Millis;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub progress: i64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Average throughput since the transfer started.
    pub speed_bps: u64,
    pub updated_at: Millis,
}

pub struct ProgressCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, ProgressSnapshot)>>,
}

impl Default for ProgressCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ProgressCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Instant, ProgressSnapshot)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, task_id: &str, snapshot: ProgressSnapshot) {
        self.lock()
            .insert(task_id.to_string(), (Instant::now(), snapshot));
    }

    /// Fresh snapshot, if any. Expired entries are evicted on read.
    pub fn get(&self, task_id: &str) -> Option<ProgressSnapshot> {
        let mut entries = self.lock();
        match entries.get(task_id) {
            Some((at, snap)) if at.elapsed() < self.ttl => Some(*snap),
            Some(_) => {
                entries.remove(task_id);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    /// Drop every expired entry; returns how many remain.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        entries.retain(|_, (at, _)| at.elapsed() < self.ttl);
        entries.len()
    }
}
