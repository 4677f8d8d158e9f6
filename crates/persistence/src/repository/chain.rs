//! Raw chain/exchange records written by ingesters

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One raw transaction as seen from one address
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TxChainRecord {
    pub chain: String,
    pub address: String,
    pub hash: String,
    pub timestamp: i64,
    /// zlib-compressed JSON payload
    pub raw_data: Vec<u8>,
}

pub struct TxChainRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TxChainRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the payload for (chain, address, hash)
    pub async fn upsert(&self, record: &TxChainRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO tx_chain (chain, address, hash, timestamp, raw_data)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(chain, address, hash) DO UPDATE SET
                 timestamp = excluded.timestamp,
                 raw_data = excluded.raw_data"#,
        )
        .bind(&record.chain)
        .bind(&record.address)
        .bind(&record.hash)
        .bind(record.timestamp)
        .bind(&record.raw_data)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// All raw records for an address in timestamp order
    pub async fn list_for_address(&self, chain: &str, address: &str) -> DbResult<Vec<TxChainRecord>> {
        let records = sqlx::query_as::<_, TxChainRecord>(
            r#"SELECT chain, address, hash, timestamp, raw_data
               FROM tx_chain
               WHERE chain = ? AND lower(address) = lower(?)
               ORDER BY timestamp ASC, hash ASC"#,
        )
        .bind(chain)
        .bind(address)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Distinct chains that have raw records for an address
    pub async fn chains_for_address(&self, address: &str) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT chain FROM tx_chain WHERE lower(address) = lower(?) ORDER BY chain",
        )
        .bind(address)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_upsert_replaces_payload() {
        let db = Database::in_memory().await.unwrap();
        let repo = TxChainRepository::new(db.pool());

        let mut record = TxChainRecord {
            chain: "avalanche".into(),
            address: "0xabc".into(),
            hash: "0x1".into(),
            timestamp: 10,
            raw_data: vec![1, 2, 3],
        };
        repo.upsert(&record).await.unwrap();
        record.raw_data = vec![4];
        repo.upsert(&record).await.unwrap();

        let rows = repo.list_for_address("avalanche", "0xABC").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].raw_data, vec![4]);
        assert_eq!(
            repo.chains_for_address("0xabc").await.unwrap(),
            vec!["avalanche".to_string()]
        );
    }
}
