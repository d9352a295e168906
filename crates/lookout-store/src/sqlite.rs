use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::info;

use lookout_core::{AgentDefinition, LookoutError, Result};

use crate::AgentStore;

/// SQLite-backed agent store.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening agent store");
        let conn = Connection::open(path).map_err(store_err)?;
        Self::init(conn)
    }

    /// Fully in-memory database (tests, ephemeral runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(store_err)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                prompt TEXT NOT NULL,
                model TEXT NOT NULL,
                interval_secs INTEGER NOT NULL,
                server_address TEXT
            );

            CREATE TABLE IF NOT EXISTS agent_code (
                agent_id TEXT PRIMARY KEY REFERENCES agents(id),
                code TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_memory (
                agent_id TEXT PRIMARY KEY,
                value TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(store_err)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

fn store_err(e: rusqlite::Error) -> LookoutError {
    LookoutError::Store(e.to_string())
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentDefinition> {
    Ok(AgentDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        prompt: row.get(2)?,
        model: row.get(3)?,
        interval_secs: row.get(4)?,
        server_address: row.get(5)?,
    })
}

#[async_trait]
impl AgentStore for SqliteStore {
    async fn load_agent(&self, id: &str) -> Result<AgentDefinition> {
        let db = self.db.lock();
        db.query_row(
            "SELECT id, name, prompt, model, interval_secs, server_address
             FROM agents WHERE id = ?1",
            params![id],
            row_to_agent,
        )
        .optional()
        .map_err(store_err)?
        .ok_or_else(|| LookoutError::AgentNotFound(id.to_string()))
    }

    async fn list_agents(&self) -> Result<Vec<AgentDefinition>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT id, name, prompt, model, interval_secs, server_address
                 FROM agents ORDER BY id",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], row_to_agent)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    async fn load_code(&self, id: &str) -> Result<String> {
        let db = self.db.lock();
        db.query_row(
            "SELECT code FROM agent_code WHERE agent_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_err)?
        .ok_or_else(|| LookoutError::AgentNotFound(id.to_string()))
    }

    async fn save_agent(&self, def: &AgentDefinition, code: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO agents (id, name, prompt, model, interval_secs, server_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                prompt = excluded.prompt,
                model = excluded.model,
                interval_secs = excluded.interval_secs,
                server_address = excluded.server_address",
            params![
                def.id,
                def.name,
                def.prompt,
                def.model,
                def.interval_secs,
                def.server_address
            ],
        )
        .map_err(store_err)?;
        db.execute(
            "INSERT INTO agent_code (agent_id, code) VALUES (?1, ?2)
             ON CONFLICT(agent_id) DO UPDATE SET code = excluded.code",
            params![def.id, code],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_memory(&self, id: &str) -> Result<String> {
        let db = self.db.lock();
        let value: Option<String> = db
            .query_row(
                "SELECT value FROM agent_memory WHERE agent_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(value.unwrap_or_default())
    }

    async fn set_memory(&self, id: &str, value: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO agent_memory (agent_id, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(agent_id) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![id, value],
        )
        .map_err(store_err)?;
        Ok(())
    }

    async fn append_memory(&self, id: &str, value: &str, separator: &str) -> Result<()> {
        // Single statement so interleaved appenders still read-modify-write
        // atomically; cross-agent ordering is last-write-wins by contract.
        let db = self.db.lock();
        db.execute(
            "INSERT INTO agent_memory (agent_id, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(agent_id) DO UPDATE SET
                value = CASE
                    WHEN agent_memory.value = '' THEN excluded.value
                    ELSE agent_memory.value || ?3 || excluded.value
                END,
                updated_at = excluded.updated_at",
            params![id, value, separator],
        )
        .map_err(store_err)?;
        Ok(())
    }
}
