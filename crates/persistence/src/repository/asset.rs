//! Asset tables: price identifiers and chain-scoped token ids

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetPriceRecord {
    pub id: String,
    pub source: String,
    pub symbol: String,
    pub name: String,
    pub market_cap: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetTxRecord {
    pub chain: String,
    pub id: String,
    pub asset_price_id: Option<String>,
    pub symbol: Option<String>,
    pub name: Option<String>,
}

pub struct AssetRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AssetRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_price(&self, record: &AssetPriceRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO asset_price (id, source, symbol, name, market_cap)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 source = excluded.source,
                 symbol = excluded.symbol,
                 name = excluded.name,
                 market_cap = excluded.market_cap"#,
        )
        .bind(&record.id)
        .bind(&record.source)
        .bind(&record.symbol)
        .bind(&record.name)
        .bind(&record.market_cap)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_tx(&self, record: &AssetTxRecord) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO asset_tx (chain, id, asset_price_id, symbol, name)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(chain, id) DO UPDATE SET
                 asset_price_id = excluded.asset_price_id,
                 symbol = excluded.symbol,
                 name = excluded.name"#,
        )
        .bind(&record.chain)
        .bind(&record.id)
        .bind(&record.asset_price_id)
        .bind(&record.symbol)
        .bind(&record.name)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_prices(&self) -> DbResult<Vec<AssetPriceRecord>> {
        let records = sqlx::query_as::<_, AssetPriceRecord>(
            "SELECT id, source, symbol, name, market_cap FROM asset_price ORDER BY id",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    pub async fn list_txs(&self) -> DbResult<Vec<AssetTxRecord>> {
        let records = sqlx::query_as::<_, AssetTxRecord>(
            "SELECT chain, id, asset_price_id, symbol, name FROM asset_tx ORDER BY chain, id",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_upsert_and_list() {
        let db = Database::in_memory().await.unwrap();
        let repo = AssetRepository::new(db.pool());

        let mut price = AssetPriceRecord {
            id: "avalanche-2".into(),
            source: "coingecko".into(),
            symbol: "avax".into(),
            name: "Avalanche".into(),
            market_cap: None,
        };
        repo.upsert_price(&price).await.unwrap();
        price.market_cap = Some("1000".into());
        repo.upsert_price(&price).await.unwrap();

        repo.upsert_tx(&AssetTxRecord {
            chain: "avalanche".into(),
            id: "avax".into(),
            asset_price_id: Some("avalanche-2".into()),
            symbol: Some("AVAX".into()),
            name: None,
        })
        .await
        .unwrap();

        let prices = repo.list_prices().await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].market_cap.as_deref(), Some("1000"));
        assert_eq!(repo.list_txs().await.unwrap().len(), 1);
    }
}
