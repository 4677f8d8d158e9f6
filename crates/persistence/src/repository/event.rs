//! Append-only event log

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRecord {
    pub id: String,
    pub source: String,
    pub action: String,
    /// JSON payload, always carrying a `version` field
    pub data: String,
    pub timestamp: i64,
}

pub struct EventRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EventRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &EventRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO event (id, source, action, data, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.source)
        .bind(&event.action)
        .bind(&event.data)
        .bind(event.timestamp)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Whole log in replay order: timestamp, then insertion order
    pub async fn list(&self) -> DbResult<Vec<EventRecord>> {
        let records = sqlx::query_as::<_, EventRecord>(
            "SELECT id, source, action, data, timestamp FROM event ORDER BY timestamp ASC, rowid ASC",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    pub async fn list_by_action(&self, action: &str) -> DbResult<Vec<EventRecord>> {
        let records = sqlx::query_as::<_, EventRecord>(
            r#"SELECT id, source, action, data, timestamp FROM event
               WHERE action = ?
               ORDER BY timestamp ASC, rowid ASC"#,
        )
        .bind(action)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Drop machine-generated events of one action; manual ones are kept
    pub async fn delete_machine_events(&self, action: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM event WHERE action = ? AND source != 'manual'")
            .bind(action)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop machine-generated moves touching ledgers of one address
    pub async fn delete_machine_moves_for_address(&self, address: &str) -> DbResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM event
               WHERE action = 'tx_ledger_moved' AND source != 'manual'
               AND json_extract(data, '$.tx_ledger_id') IN
                   (SELECT id FROM tx_ledger WHERE lower(address) = lower(?))"#,
        )
        .bind(address)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
