//! Cost-basis lots, disposals and income

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LotRecord {
    pub tx_ledger_id: String,
    pub entity: String,
    pub address: String,
    pub chain: String,
    pub asset_price_id: Option<String>,
    pub symbol: Option<String>,
    pub asset_tx_id: String,
    pub original_amount: String,
    pub current_amount: String,
    pub price_usd: String,
    pub basis_usd: String,
    pub timestamp: i64,
    /// JSON array of ledger snapshots
    pub history: String,
    pub receipt: i64,
    pub price_source: String,
    pub locked_for_year: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DisposalRecord {
    pub id: Option<i64>,
    pub entity: String,
    pub address: String,
    pub asset_price_id: Option<String>,
    pub symbol: String,
    pub amount: String,
    pub timestamp: i64,
    pub duration_held: i64,
    pub basis_timestamp: i64,
    pub basis_tx_ledger_id: String,
    pub basis_usd: String,
    pub total_usd: String,
    pub tx_ledger_id: String,
    pub price_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IncomeRecord {
    pub id: Option<i64>,
    pub entity: String,
    pub address: String,
    pub net_usd: String,
    pub symbol: String,
    pub timestamp: i64,
    pub tx_ledger_id: String,
    pub price: String,
    pub amount: String,
}

const LOT_COLUMNS: &str = "tx_ledger_id, entity, address, chain, asset_price_id, symbol, \
     asset_tx_id, original_amount, current_amount, price_usd, basis_usd, timestamp, history, \
     receipt, price_source, locked_for_year";

const DISPOSAL_COLUMNS: &str = "id, entity, address, asset_price_id, symbol, amount, timestamp, \
     duration_held, basis_timestamp, basis_tx_ledger_id, basis_usd, total_usd, tx_ledger_id, \
     price_source";

pub struct CostbasisRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CostbasisRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Remove all derived cost-basis rows of an entity
    pub async fn delete_for_entity(&self, entity: &str) -> DbResult<()> {
        for table in ["costbasis_lot", "costbasis_disposal", "costbasis_income"] {
            let sql = format!("DELETE FROM {table} WHERE entity = ?");
            sqlx::query(&sql).bind(entity).execute(self.pool).await?;
        }
        Ok(())
    }

    /// Lots are keyed by their originating ledger, so saving replaces
    pub async fn upsert_lot(&self, lot: &LotRecord) -> DbResult<()> {
        let sql = format!(
            "REPLACE INTO costbasis_lot ({LOT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(&lot.tx_ledger_id)
            .bind(&lot.entity)
            .bind(&lot.address)
            .bind(&lot.chain)
            .bind(&lot.asset_price_id)
            .bind(&lot.symbol)
            .bind(&lot.asset_tx_id)
            .bind(&lot.original_amount)
            .bind(&lot.current_amount)
            .bind(&lot.price_usd)
            .bind(&lot.basis_usd)
            .bind(lot.timestamp)
            .bind(&lot.history)
            .bind(lot.receipt)
            .bind(&lot.price_source)
            .bind(lot.locked_for_year)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_disposal(&self, d: &DisposalRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO costbasis_disposal (
                entity, address, asset_price_id, symbol, amount, timestamp, duration_held,
                basis_timestamp, basis_tx_ledger_id, basis_usd, total_usd, tx_ledger_id, price_source
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&d.entity)
        .bind(&d.address)
        .bind(&d.asset_price_id)
        .bind(&d.symbol)
        .bind(&d.amount)
        .bind(d.timestamp)
        .bind(d.duration_held)
        .bind(d.basis_timestamp)
        .bind(&d.basis_tx_ledger_id)
        .bind(&d.basis_usd)
        .bind(&d.total_usd)
        .bind(&d.tx_ledger_id)
        .bind(&d.price_source)
        .execute(self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_income(&self, i: &IncomeRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO costbasis_income
                (entity, address, net_usd, symbol, timestamp, tx_ledger_id, price, amount)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&i.entity)
        .bind(&i.address)
        .bind(&i.net_usd)
        .bind(&i.symbol)
        .bind(i.timestamp)
        .bind(&i.tx_ledger_id)
        .bind(&i.price)
        .bind(&i.amount)
        .execute(self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_lot(&self, tx_ledger_id: &str) -> DbResult<Option<LotRecord>> {
        let sql = format!("SELECT {LOT_COLUMNS} FROM costbasis_lot WHERE tx_ledger_id = ?");
        let record = sqlx::query_as::<_, LotRecord>(&sql)
            .bind(tx_ledger_id)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    pub async fn lots_for_entity(&self, entity: &str) -> DbResult<Vec<LotRecord>> {
        let sql = format!(
            "SELECT {LOT_COLUMNS} FROM costbasis_lot WHERE entity = ? \
             ORDER BY timestamp ASC, tx_ledger_id ASC"
        );
        let records = sqlx::query_as::<_, LotRecord>(&sql)
            .bind(entity)
            .fetch_all(self.pool)
            .await?;
        Ok(records)
    }

    /// Disposals with `start <= timestamp <= end`, in insertion order
    pub async fn disposals_for_entity(&self, entity: &str, start: i64, end: i64) -> DbResult<Vec<DisposalRecord>> {
        let sql = format!(
            "SELECT {DISPOSAL_COLUMNS} FROM costbasis_disposal \
             WHERE entity = ? AND timestamp >= ? AND timestamp <= ? \
             ORDER BY timestamp ASC, id ASC"
        );
        let records = sqlx::query_as::<_, DisposalRecord>(&sql)
            .bind(entity)
            .bind(start)
            .bind(end)
            .fetch_all(self.pool)
            .await?;
        Ok(records)
    }

    pub async fn income_for_entity(&self, entity: &str, start: i64, end: i64) -> DbResult<Vec<IncomeRecord>> {
        let records = sqlx::query_as::<_, IncomeRecord>(
            r#"SELECT id, entity, address, net_usd, symbol, timestamp, tx_ledger_id, price, amount
               FROM costbasis_income
               WHERE entity = ? AND timestamp >= ? AND timestamp <= ?
               ORDER BY timestamp ASC, id ASC"#,
        )
        .bind(entity)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Mark lots opened in the window, or that fed a disposal in the window.
    /// Lots already locked for an earlier year keep that year.
    pub async fn lock_lots(&self, entity: &str, year: i32, start: i64, end: i64) -> DbResult<u64> {
        let result = sqlx::query(
            r#"UPDATE costbasis_lot
               SET locked_for_year = ?
               WHERE entity = ?
               AND locked_for_year IS NULL
               AND (
                 (timestamp >= ? AND timestamp <= ?)
                 OR tx_ledger_id IN (
                   SELECT basis_tx_ledger_id FROM costbasis_disposal
                   WHERE entity = ? AND timestamp >= ? AND timestamp <= ?
                 )
               )"#,
        )
        .bind(year)
        .bind(entity)
        .bind(start)
        .bind(end)
        .bind(entity)
        .bind(start)
        .bind(end)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn locked_lots(&self, entity: &str, year: i32) -> DbResult<Vec<LotRecord>> {
        let sql = format!(
            "SELECT {LOT_COLUMNS} FROM costbasis_lot \
             WHERE entity = ? AND locked_for_year = ? \
             ORDER BY timestamp ASC, tx_ledger_id ASC"
        );
        let records = sqlx::query_as::<_, LotRecord>(&sql)
            .bind(entity)
            .bind(year)
            .fetch_all(self.pool)
            .await?;
        Ok(records)
    }
}
