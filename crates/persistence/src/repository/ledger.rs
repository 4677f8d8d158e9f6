//! Ledger repository: one row per value-movement leg

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TxLedgerRecord {
    pub id: String,
    pub chain: String,
    pub address: String,
    pub hash: String,
    pub from_address: String,
    pub to_address: String,
    pub from_address_name: Option<String>,
    pub to_address_name: Option<String>,
    pub asset_tx_id: String,
    pub isfee: i64,
    pub amount: String,
    pub timestamp: i64,
    pub direction: String,
    pub tx_ledger_type: Option<String>,
    pub asset_price_id: Option<String>,
    pub symbol: Option<String>,
    pub price_usd: Option<String>,
    pub price_source: Option<String>,
}

const LEDGER_COLUMNS: &str = "l.id, l.chain, l.address, l.hash, l.from_address, l.to_address, \
     l.from_address_name, l.to_address_name, l.asset_tx_id, l.isfee, l.amount, l.timestamp, \
     l.direction, l.tx_ledger_type, l.asset_price_id, l.symbol, l.price_usd, l.price_source";

pub struct TxLedgerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TxLedgerRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &TxLedgerRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO tx_ledger (
                id, chain, address, hash, from_address, to_address,
                from_address_name, to_address_name, asset_tx_id, isfee, amount,
                timestamp, direction, tx_ledger_type, asset_price_id, symbol,
                price_usd, price_source
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.id)
        .bind(&record.chain)
        .bind(&record.address)
        .bind(&record.hash)
        .bind(&record.from_address)
        .bind(&record.to_address)
        .bind(&record.from_address_name)
        .bind(&record.to_address_name)
        .bind(&record.asset_tx_id)
        .bind(record.isfee)
        .bind(&record.amount)
        .bind(record.timestamp)
        .bind(&record.direction)
        .bind(&record.tx_ledger_type)
        .bind(&record.asset_price_id)
        .bind(&record.symbol)
        .bind(&record.price_usd)
        .bind(&record.price_source)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Remove every ledger for (chain, address) along with its logical relations
    pub async fn delete_for_address(&self, chain: &str, address: &str) -> DbResult<u64> {
        sqlx::query(
            r#"DELETE FROM tx_rel_ledger_logical
               WHERE tx_ledger_id IN (
                 SELECT id FROM tx_ledger WHERE chain = ? AND lower(address) = lower(?)
               )"#,
        )
        .bind(chain)
        .bind(address)
        .execute(self.pool)
        .await?;

        let result =
            sqlx::query("DELETE FROM tx_ledger WHERE chain = ? AND lower(address) = lower(?)")
                .bind(chain)
                .bind(address)
                .execute(self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<TxLedgerRecord>> {
        let sql = format!("SELECT {LEDGER_COLUMNS} FROM tx_ledger l WHERE l.id = ?");
        let record = sqlx::query_as::<_, TxLedgerRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    /// Ledgers of an address ordered for grouping (timestamp, fee last)
    pub async fn list_for_address(&self, address: &str) -> DbResult<Vec<TxLedgerRecord>> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM tx_ledger l \
             WHERE lower(l.address) = lower(?) \
             ORDER BY l.timestamp ASC, l.isfee ASC, l.id ASC"
        );
        let records = sqlx::query_as::<_, TxLedgerRecord>(&sql)
            .bind(address)
            .fetch_all(self.pool)
            .await?;
        Ok(records)
    }

    /// Ledgers attached to a logical, in relation order
    pub async fn list_for_logical(&self, tx_logical_id: &str) -> DbResult<Vec<TxLedgerRecord>> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM tx_ledger l \
             JOIN tx_rel_ledger_logical r ON r.tx_ledger_id = l.id \
             WHERE r.tx_logical_id = ? \
             ORDER BY r.ord ASC, l.timestamp ASC, l.isfee ASC, l.id ASC"
        );
        let records = sqlx::query_as::<_, TxLedgerRecord>(&sql)
            .bind(tx_logical_id)
            .fetch_all(self.pool)
            .await?;
        Ok(records)
    }

    pub async fn update_type(&self, id: &str, tx_ledger_type: &str) -> DbResult<bool> {
        let result = sqlx::query("UPDATE tx_ledger SET tx_ledger_type = ? WHERE id = ?")
            .bind(tx_ledger_type)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_price(&self, id: &str, price_usd: &str, price_source: &str) -> DbResult<bool> {
        let result =
            sqlx::query("UPDATE tx_ledger SET price_usd = ?, price_source = ? WHERE id = ?")
                .bind(price_usd)
                .bind(price_source)
                .bind(id)
                .execute(self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
