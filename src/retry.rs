//! Per-key retry bookkeeping with a fixed exponential backoff table. Keys
//! are step identities (`app:service`, `app:network:name`, ...), so one
//! failing service backs off on its own while the rest of the target state
//! keeps converging.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Backoff delays in seconds, indexed by `min(count - 1, len - 1)`.
pub const BACKOFF_TABLE_SECS: [i64; 6] = [10, 20, 40, 80, 160, 300];

/// Attempts after which a key is terminal and needs external intervention.
pub const MAX_RETRIES: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryState {
    pub count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
}

/// Tracks failure counts and computes when each key may be attempted again.
/// State lives in memory only: a process restart starts every key from a
/// clean slate.
#[derive(Clone, Default)]
pub struct RetryManager {
    records: Arc<RwLock<HashMap<String, RetryState>>>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn should_retry(&self, key: &str) -> bool {
        self.should_retry_at(key, Utc::now()).await
    }

    pub async fn should_retry_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let records = self.records.read().await;
        match records.get(key) {
            None => true,
            Some(state) if state.count >= MAX_RETRIES => false,
            Some(state) => now >= state.next_retry_at,
        }
    }

    pub async fn record_failure(&self, key: &str, error: &str) {
        self.record_failure_at(key, error, Utc::now()).await;
    }

    pub async fn record_failure_at(&self, key: &str, error: &str, now: DateTime<Utc>) {
        let mut records = self.records.write().await;
        let count = records.get(key).map(|s| s.count).unwrap_or(0) + 1;
        let delay_idx = ((count - 1) as usize).min(BACKOFF_TABLE_SECS.len() - 1);
        let delay = Duration::seconds(BACKOFF_TABLE_SECS[delay_idx]);
        let state = RetryState {
            count,
            next_retry_at: now + delay,
            last_error: error.to_string(),
        };
        if count >= MAX_RETRIES {
            warn!(key, count, "max retries reached, giving up until target changes");
        } else {
            debug!(key, count, delay_secs = delay.num_seconds(), "recorded failure");
        }
        records.insert(key.to_string(), state);
    }

    /// A success wipes the key entirely; the next failure starts the backoff
    /// table from the beginning.
    pub async fn record_success(&self, key: &str) {
        let mut records = self.records.write().await;
        if records.remove(key).is_some() {
            debug!(key, "cleared retry state after success");
        }
    }

    pub async fn is_max_retries_exceeded(&self, key: &str) -> bool {
        let records = self.records.read().await;
        records
            .get(key)
            .map(|s| s.count >= MAX_RETRIES)
            .unwrap_or(false)
    }

    pub async fn get(&self, key: &str) -> Option<RetryState> {
        let records = self.records.read().await;
        records.get(key).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, RetryState> {
        self.records.read().await.clone()
    }
}
