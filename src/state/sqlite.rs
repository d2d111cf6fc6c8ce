use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::state::{Cursor, StateStore};

/// Cursor kept as a single row in SQLite. Same JSON body as the file store,
/// but replaced inside the database's own transaction.
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;
        info!("State store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS relay_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )
        .context("Failed to create relay_state table")?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self) -> Cursor {
        let conn = self.conn.lock().await;
        let body: Option<String> = match conn
            .query_row("SELECT body FROM relay_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
        {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to read relay state: {}; starting fresh", e);
                return Cursor::default();
            }
        };

        match body.as_deref().map(Cursor::from_json) {
            None => Cursor::default(),
            Some(Ok(cursor)) => cursor,
            Some(Err(e)) => {
                warn!("Stored relay state is corrupt ({:#}); starting fresh", e);
                Cursor::default()
            }
        }
    }

    async fn save(&self, cursor: &Cursor) -> Result<()> {
        let body = cursor.to_json()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO relay_state (id, body) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                updated_at = datetime('now')",
            rusqlite::params![body],
        )
        .context("Failed to save relay state")?;
        Ok(())
    }
}
