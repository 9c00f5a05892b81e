use std::path::Path;

use chrono::{DateTime, Utc};
use nearswarm_models::AgentReputation;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::CacheError;

pub const REPUTATION_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS agent_reputation (
    agent_id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    success_rate REAL NOT NULL,
    total_operations INTEGER NOT NULL,
    successful_operations INTEGER NOT NULL,
    average_confidence REAL NOT NULL,
    updated_at TEXT NOT NULL
);";

const SELECT_COLUMNS: &str = "SELECT agent_id, role, success_rate, total_operations, \
     successful_operations, average_confidence, updated_at FROM agent_reputation";

/// SQLite-backed store of per-agent track records.
pub struct ReputationStore {
    conn: Connection,
}

impl ReputationStore {
    /// Open (or create) the database file, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(REPUTATION_TABLE_DDL)?;
        tracing::debug!(path = %path.display(), "opened reputation store");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(REPUTATION_TABLE_DDL)?;
        Ok(Self { conn })
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<AgentReputation>, CacheError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{SELECT_COLUMNS} WHERE agent_id = ?1"))?;
        let reputation = stmt
            .query_row(rusqlite::params![agent_id], row_to_reputation)
            .optional()?;
        Ok(reputation)
    }

    pub fn all(&self) -> Result<Vec<AgentReputation>, CacheError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{SELECT_COLUMNS} ORDER BY agent_id"))?;
        let rows = stmt
            .query_map([], row_to_reputation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert(&self, reputation: &AgentReputation) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO agent_reputation \
             (agent_id, role, success_rate, total_operations, successful_operations, \
              average_confidence, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                reputation.agent_id,
                reputation.role,
                reputation.success_rate,
                reputation.total_operations as i64,
                reputation.successful_operations as i64,
                reputation.average_confidence,
                reputation.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Fold one completed action into an agent's record, creating it if needed.
    pub fn record_outcome(
        &self,
        agent_id: &str,
        role: &str,
        success: bool,
        confidence: f64,
    ) -> Result<AgentReputation, CacheError> {
        let mut reputation = self
            .get(agent_id)?
            .unwrap_or_else(|| AgentReputation::new(agent_id, role));
        reputation.record(success, confidence);
        self.upsert(&reputation)?;
        Ok(reputation)
    }
}

fn row_to_reputation(row: &Row<'_>) -> rusqlite::Result<AgentReputation> {
    let total: i64 = row.get(3)?;
    let successful: i64 = row.get(4)?;
    let updated_at: DateTime<Utc> = row.get(6)?;
    Ok(AgentReputation {
        agent_id: row.get(0)?,
        role: row.get(1)?,
        success_rate: row.get(2)?,
        total_operations: total.max(0) as u64,
        successful_operations: successful.max(0) as u64,
        average_confidence: row.get(5)?,
        updated_at,
    })
}
