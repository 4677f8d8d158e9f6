//! Logical transaction repository and the ledger↔logical relation

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TxLogicalRecord {
    pub id: String,
    pub count: i64,
    pub description: Option<String>,
    pub note: Option<String>,
    pub timestamp: i64,
    pub address: String,
    pub tx_logical_type: Option<String>,
}

pub struct TxLogicalRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TxLogicalRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create (or reset) the one-ledger logical whose id equals the ledger id
    pub async fn insert_singleton(&self, ledger_id: &str, timestamp: i64, address: &str) -> DbResult<()> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO tx_logical (id, count, timestamp, address, tx_logical_type)
               VALUES (?, 1, ?, ?, NULL)"#,
        )
        .bind(ledger_id)
        .bind(timestamp)
        .bind(address)
        .execute(self.pool)
        .await?;

        sqlx::query("DELETE FROM tx_rel_ledger_logical WHERE tx_ledger_id = ?")
            .bind(ledger_id)
            .execute(self.pool)
            .await?;

        sqlx::query(
            "INSERT INTO tx_rel_ledger_logical (tx_ledger_id, tx_logical_id, ord) VALUES (?, ?, 0)",
        )
        .bind(ledger_id)
        .bind(ledger_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Drop every logical of an address together with its relations
    pub async fn delete_for_address(&self, address: &str) -> DbResult<u64> {
        sqlx::query(
            r#"DELETE FROM tx_rel_ledger_logical
               WHERE tx_logical_id IN (SELECT id FROM tx_logical WHERE lower(address) = lower(?))"#,
        )
        .bind(address)
        .execute(self.pool)
        .await?;

        let result = sqlx::query("DELETE FROM tx_logical WHERE lower(address) = lower(?)")
            .bind(address)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Reparent a ledger; a no-op when the ledger is no longer under `from`
    pub async fn move_ledger(&self, ledger_id: &str, from_logical_id: &str, to_logical_id: &str) -> DbResult<bool> {
        let (next_ord,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(ord) + 1, 0) FROM tx_rel_ledger_logical WHERE tx_logical_id = ?",
        )
        .bind(to_logical_id)
        .fetch_one(self.pool)
        .await?;

        let result = sqlx::query(
            r#"UPDATE tx_rel_ledger_logical
               SET tx_logical_id = ?, ord = ?
               WHERE tx_ledger_id = ? AND tx_logical_id = ?"#,
        )
        .bind(to_logical_id)
        .bind(next_ord)
        .bind(ledger_id)
        .bind(from_logical_id)
        .execute(self.pool)
        .await?;

        for id in [from_logical_id, to_logical_id] {
            sqlx::query(
                r#"UPDATE tx_logical
                   SET count = (SELECT COUNT(*) FROM tx_rel_ledger_logical WHERE tx_logical_id = ?)
                   WHERE id = ?"#,
            )
            .bind(id)
            .bind(id)
            .execute(self.pool)
            .await?;
        }

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_type(&self, id: &str, tx_logical_type: Option<&str>) -> DbResult<bool> {
        let result = sqlx::query("UPDATE tx_logical SET tx_logical_type = ? WHERE id = ?")
            .bind(tx_logical_type)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<TxLogicalRecord>> {
        let record = sqlx::query_as::<_, TxLogicalRecord>(
            r#"SELECT id, count, description, note, timestamp, address, tx_logical_type
               FROM tx_logical WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(record)
    }

    /// Logical currently holding a ledger
    pub async fn logical_id_for_ledger(&self, ledger_id: &str) -> DbResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT tx_logical_id FROM tx_rel_ledger_logical WHERE tx_ledger_id = ?")
                .bind(ledger_id)
                .fetch_optional(self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    /// Non-empty logicals of an entity in processing order: timestamp, then id.
    /// `start`/`end` are inclusive bounds on the timestamp.
    pub async fn list_for_entity(
        &self,
        entity_name: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> DbResult<Vec<TxLogicalRecord>> {
        let records = sqlx::query_as::<_, TxLogicalRecord>(
            r#"SELECT t.id, t.count, t.description, t.note, t.timestamp, t.address, t.tx_logical_type
               FROM tx_logical t
               WHERE lower(t.address) IN (
                   SELECT lower(a.address)
                   FROM address a
                   JOIN entity e ON e.id = a.entity_id
                   WHERE e.name = ?
               )
               AND t.count > 0
               AND (? IS NULL OR t.timestamp >= ?)
               AND (? IS NULL OR t.timestamp <= ?)
               ORDER BY t.timestamp ASC, t.id ASC"#,
        )
        .bind(entity_name)
        .bind(start)
        .bind(start)
        .bind(end)
        .bind(end)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }
}
