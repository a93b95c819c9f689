//! Murmur Storage -- rusqlite-backed system state.
//!
//! The gossip core persists exactly two things: its own generation counter
//! and the last-known feature string of every peer. WAL mode + busy_timeout
//! for concurrent access from the node process.

use rusqlite::{params, Connection, OptionalExtension};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persistence hook used by the gossip core.
pub trait SystemStore: Send + Sync {
    /// Last generation this node gossiped with, if any.
    fn load_generation(&self) -> Result<Option<i32>>;
    fn save_generation(&self, generation: i32) -> Result<()>;

    /// Upsert the comma-separated feature names last seen for a peer.
    fn save_peer_features(&self, peer: SocketAddr, features: &str) -> Result<()>;
    /// All saved (peer, features) pairs.
    fn load_peer_features(&self) -> Result<Vec<(SocketAddr, String)>>;
    /// Drop a peer's saved row (after eviction from membership).
    fn forget_peer(&self, peer: SocketAddr) -> Result<()>;
}

/// SQLite-backed implementation.
pub struct SqliteSystemStore {
    conn: Mutex<Connection>,
}

impl SqliteSystemStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory store, for tests and ephemeral nodes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS system_state (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS peer_features (
                 peer     TEXT PRIMARY KEY,
                 features TEXT NOT NULL
             );",
        )?;
        Ok(())
    }
}

impl SystemStore for SqliteSystemStore {
    fn load_generation(&self) -> Result<Option<i32>> {
        let conn = self.db()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM system_state WHERE key = 'generation'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    fn save_generation(&self, generation: i32) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO system_state (key, value) VALUES ('generation', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![generation.to_string()],
        )?;
        Ok(())
    }

    fn save_peer_features(&self, peer: SocketAddr, features: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO peer_features (peer, features) VALUES (?1, ?2)
             ON CONFLICT(peer) DO UPDATE SET features = excluded.features",
            params![peer.to_string(), features],
        )?;
        Ok(())
    }

    fn load_peer_features(&self) -> Result<Vec<(SocketAddr, String)>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare("SELECT peer, features FROM peer_features")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (peer, features) = row?;
            match peer.parse::<SocketAddr>() {
                Ok(addr) => out.push((addr, features)),
                Err(_) => tracing::warn!(peer, "store: skipping unparsable saved peer"),
            }
        }
        Ok(out)
    }

    fn forget_peer(&self, peer: SocketAddr) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "DELETE FROM peer_features WHERE peer = ?1",
            params![peer.to_string()],
        )?;
        Ok(())
    }
}
