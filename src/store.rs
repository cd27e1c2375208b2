use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::state::SimpleState;

const KIND_TARGET: &str = "target";
const KIND_CURRENT: &str = "current";

/// Persistence boundary for state snapshots. The Reconciler loads the target
/// on startup and saves snapshots after step batches; no transactional
/// multi-row guarantee, last write wins.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_target(&self) -> Result<Option<SimpleState>>;
    async fn save_target(&self, state: &SimpleState) -> Result<()>;
    async fn load_current(&self) -> Result<Option<SimpleState>>;
    async fn save_current(&self, state: &SimpleState) -> Result<()>;
}

/// SQLite-backed store. SQLite calls are blocking, so every operation runs
/// on the blocking pool.
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let db_path = data_dir.join("supervisor.db");

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(db_path)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS device_state (
                    kind TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn save(&self, kind: &'static str, state: &SimpleState) -> Result<()> {
        let payload = serde_json::to_string(state)?;
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO device_state (kind, payload, updated_at) VALUES (?, ?, ?)",
                params![kind, payload, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await??;

        Ok(())
    }

    async fn load(&self, kind: &'static str) -> Result<Option<SimpleState>> {
        let conn = self.conn.clone();

        let payload = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare("SELECT payload FROM device_state WHERE kind = ?")?;
            let mut rows = stmt.query_map(params![kind], |row| row.get::<_, String>(0))?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
        .await??;

        match payload {
            Some(json) => {
                let state = serde_json::from_str(&json)
                    .with_context(|| format!("parsing persisted {} state", kind))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_target(&self) -> Result<Option<SimpleState>> {
        self.load(KIND_TARGET).await
    }

    async fn save_target(&self, state: &SimpleState) -> Result<()> {
        self.save(KIND_TARGET, state).await
    }

    async fn load_current(&self) -> Result<Option<SimpleState>> {
        self.load(KIND_CURRENT).await
    }

    async fn save_current(&self, state: &SimpleState) -> Result<()> {
        self.save(KIND_CURRENT, state).await
    }
}

/// In-memory store for tests and diskless operation. Snapshots do not
/// survive a restart.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    states: Arc<Mutex<HashMap<&'static str, SimpleState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_target(&self) -> Result<Option<SimpleState>> {
        Ok(self.states.lock().await.get(KIND_TARGET).cloned())
    }

    async fn save_target(&self, state: &SimpleState) -> Result<()> {
        self.states.lock().await.insert(KIND_TARGET, state.clone());
        Ok(())
    }

    async fn load_current(&self) -> Result<Option<SimpleState>> {
        Ok(self.states.lock().await.get(KIND_CURRENT).cloned())
    }

    async fn save_current(&self, state: &SimpleState) -> Result<()> {
        self.states.lock().await.insert(KIND_CURRENT, state.clone());
        Ok(())
    }
}
