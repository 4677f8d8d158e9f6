//! Persistence layer for perfi
//!
//! SQLite storage for raw chain records, the ledger/logical transaction
//! hierarchy, cost-basis lots, disposals, income, the event log and flags.

pub mod repository;
pub mod schema;

use rust_decimal::Decimal;
pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Fractional digits kept for every persisted decimal
pub const DECIMAL_SCALE: u32 = 16;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Render a decimal for a TEXT column, rounded to [`DECIMAL_SCALE`] places
pub fn decimal_to_text(value: Decimal) -> String {
    value.round_dp(DECIMAL_SCALE).normalize().to_string()
}

/// Parse a TEXT column back into a decimal
pub fn text_to_decimal(value: &str) -> DbResult<Decimal> {
    Decimal::from_str(value.trim())
        .or_else(|_| Decimal::from_scientific(value.trim()))
        .map(|d| d.round_dp(DECIMAL_SCALE))
        .map_err(|e| DbError::Decode(format!("{e}: {value}")))
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.configure_pragmas().await?;

        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.configure_pragmas().await?;

        Ok(db)
    }

    /// Run database migrations (execute each statement individually)
    async fn run_migrations(&self) -> DbResult<()> {
        for statement in schema::CREATE_TABLES.split(';') {
            // Strip comment-only lines, then check if any SQL remains
            let sql: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let sql = sql.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }

        // Tolerate "duplicate column name" on databases that already have the column
        for migration in schema::MIGRATIONS {
            if let Err(e) = sqlx::query(migration).execute(&self.pool).await {
                if e.to_string().contains("duplicate column name") {
                    debug!(migration, "Column already present");
                } else {
                    return Err(DbError::Migration(format!("{e}: {migration}")));
                }
            }
        }

        Ok(())
    }

    async fn configure_pragmas(&self) -> DbResult<()> {
        // WAL lets report readers run while a regeneration writes
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("WAL pragma failed: {e}")))?;

        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("synchronous pragma failed: {e}")))?;

        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("foreign_keys pragma failed: {e}")))?;

        // 8 MB cache size (negative = KiB)
        sqlx::query("PRAGMA cache_size=-8000")
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Connection(format!("cache_size pragma failed: {e}")))?;

        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Clone the pool for use in spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_text_is_quantized() {
        assert_eq!(decimal_to_text(dec!(1.50)), "1.5");
        assert_eq!(
            decimal_to_text(dec!(0.12345678901234567890)),
            "0.1234567890123457"
        );
        assert_eq!(decimal_to_text(Decimal::ZERO), "0");
    }

    #[test]
    fn test_text_to_decimal() {
        assert_eq!(text_to_decimal("3.75").unwrap(), dec!(3.75));
        assert_eq!(text_to_decimal(" 2 ").unwrap(), dec!(2));
        assert_eq!(text_to_decimal("1e-3").unwrap(), dec!(0.001));
        assert!(text_to_decimal("abc").is_err());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        // A second run hits the duplicate-column path for every migration
        db.run_migrations().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM costbasis_lot")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
