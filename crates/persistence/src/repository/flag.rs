//! Flags attached to logicals, lots and disposals

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlagRecord {
    pub id: i64,
    pub target_type: String,
    pub target_id: String,
    pub source: String,
    pub name: String,
    pub description: Option<String>,
}

pub struct FlagRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FlagRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Attach a flag; re-adding the same name to a target is a no-op
    pub async fn add(
        &self,
        target_type: &str,
        target_id: &str,
        source: &str,
        name: &str,
        description: Option<&str>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO flag (target_type, target_id, source, name, description)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(target_type)
        .bind(target_id)
        .bind(source)
        .bind(name)
        .bind(description)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove(&self, target_type: &str, target_id: &str, name: &str) -> DbResult<bool> {
        let result =
            sqlx::query("DELETE FROM flag WHERE target_type = ? AND target_id = ? AND name = ?")
                .bind(target_type)
                .bind(target_id)
                .bind(name)
                .execute(self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_for_target(&self, target_type: &str, target_id: &str) -> DbResult<Vec<FlagRecord>> {
        let records = sqlx::query_as::<_, FlagRecord>(
            r#"SELECT id, target_type, target_id, source, name, description
               FROM flag WHERE target_type = ? AND target_id = ?
               ORDER BY id"#,
        )
        .bind(target_type)
        .bind(target_id)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    pub async fn list_by_type(&self, target_type: &str) -> DbResult<Vec<FlagRecord>> {
        let records = sqlx::query_as::<_, FlagRecord>(
            r#"SELECT id, target_type, target_id, source, name, description
               FROM flag WHERE target_type = ?
               ORDER BY id"#,
        )
        .bind(target_type)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Drop machine flags on an entity's lots and disposals before regeneration
    pub async fn delete_costbasis_flags(&self, entity: &str) -> DbResult<u64> {
        let lots = sqlx::query(
            r#"DELETE FROM flag
               WHERE source = 'perfi' AND target_type = 'CostbasisLot'
               AND target_id IN (SELECT tx_ledger_id FROM costbasis_lot WHERE entity = ?)"#,
        )
        .bind(entity)
        .execute(self.pool)
        .await?;

        let disposals = sqlx::query(
            r#"DELETE FROM flag
               WHERE source = 'perfi' AND target_type = 'CostbasisDisposal'
               AND target_id IN (SELECT CAST(id AS TEXT) FROM costbasis_disposal WHERE entity = ?)"#,
        )
        .bind(entity)
        .execute(self.pool)
        .await?;

        Ok(lots.rows_affected() + disposals.rows_affected())
    }

    /// Drop machine flags on the logicals of an address before regrouping
    pub async fn delete_logical_flags_for_address(&self, address: &str) -> DbResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM flag
               WHERE source = 'perfi' AND target_type = 'TxLogical'
               AND target_id IN (SELECT id FROM tx_logical WHERE lower(address) = lower(?))"#,
        )
        .bind(address)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
