//! Entity and address repository

use crate::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A person or organisation whose addresses are accounted together
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntityRecord {
    pub id: i64,
    pub name: String,
    pub note: Option<String>,
}

/// An on-chain account or exchange account owned by an entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AddressRecord {
    pub id: i64,
    pub label: String,
    pub chain: String,
    pub address: String,
    #[sqlx(rename = "type")]
    pub address_type: String,
    pub source: String,
    pub entity_id: i64,
    pub ord: i64,
}

/// Input for a new address row
#[derive(Debug, Clone)]
pub struct NewAddress<'s> {
    pub label: &'s str,
    pub chain: &'s str,
    pub address: &'s str,
    pub address_type: &'s str,
    pub source: &'s str,
}

pub struct EntityRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EntityRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str, note: Option<&str>) -> DbResult<EntityRecord> {
        let result = sqlx::query("INSERT INTO entity (name, note) VALUES (?, ?)")
            .bind(name)
            .bind(note)
            .execute(self.pool)
            .await?;

        Ok(EntityRecord {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            note: note.map(str::to_string),
        })
    }

    pub async fn find_by_name(&self, name: &str) -> DbResult<Option<EntityRecord>> {
        let record =
            sqlx::query_as::<_, EntityRecord>("SELECT id, name, note FROM entity WHERE name = ?")
                .bind(name)
                .fetch_optional(self.pool)
                .await?;
        Ok(record)
    }

    /// Like [`find_by_name`](Self::find_by_name) but missing entities are an error
    pub async fn get_by_name(&self, name: &str) -> DbResult<EntityRecord> {
        self.find_by_name(name)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("entity {name}")))
    }

    pub async fn list(&self) -> DbResult<Vec<EntityRecord>> {
        let records =
            sqlx::query_as::<_, EntityRecord>("SELECT id, name, note FROM entity ORDER BY id")
                .fetch_all(self.pool)
                .await?;
        Ok(records)
    }

    /// Attach an address to an entity; the next display order slot is used
    pub async fn add_address(
        &self,
        entity_id: i64,
        address: &NewAddress<'_>,
    ) -> DbResult<AddressRecord> {
        let (next_ord,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(ord), 0) + 1 FROM address WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_one(self.pool)
                .await?;

        let result = sqlx::query(
            r#"INSERT INTO address (label, chain, address, type, source, entity_id, ord)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(address.label)
        .bind(address.chain)
        .bind(address.address)
        .bind(address.address_type)
        .bind(address.source)
        .bind(entity_id)
        .bind(next_ord)
        .execute(self.pool)
        .await?;

        Ok(AddressRecord {
            id: result.last_insert_rowid(),
            label: address.label.to_string(),
            chain: address.chain.to_string(),
            address: address.address.to_string(),
            address_type: address.address_type.to_string(),
            source: address.source.to_string(),
            entity_id,
            ord: next_ord,
        })
    }

    pub async fn addresses_for_entity(&self, entity_name: &str) -> DbResult<Vec<AddressRecord>> {
        let records = sqlx::query_as::<_, AddressRecord>(
            r#"SELECT a.id, a.label, a.chain, a.address, a.type, a.source, a.entity_id, a.ord
               FROM address a
               JOIN entity e ON e.id = a.entity_id
               WHERE e.name = ?
               ORDER BY a.ord, a.id"#,
        )
        .bind(entity_name)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    /// Entity owning an address (case-insensitive match on the address)
    pub async fn entity_for_address(&self, address: &str) -> DbResult<Option<EntityRecord>> {
        let record = sqlx::query_as::<_, EntityRecord>(
            r#"SELECT e.id, e.name, e.note
               FROM entity e
               JOIN address a ON a.entity_id = e.id
               WHERE lower(a.address) = lower(?)
               LIMIT 1"#,
        )
        .bind(address)
        .fetch_optional(self.pool)
        .await?;
        Ok(record)
    }
}
