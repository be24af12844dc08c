//! SQLite connection pool and schema setup

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

const MAX_CONNECTIONS: u32 = 5;

const CREATE_LISTINGS_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS listings (
        listing_id INTEGER PRIMARY KEY,
        listing_url TEXT NOT NULL UNIQUE,
        title TEXT,
        price_raw TEXT,
        price INTEGER,
        make TEXT,
        model TEXT,
        year INTEGER,
        mileage_raw TEXT,
        mileage_km INTEGER,
        engine_volume_raw TEXT,
        engine_volume_l REAL,
        engine_power_raw TEXT,
        engine_power_hp INTEGER,
        fuel_type TEXT,
        transmission TEXT,
        drivetrain TEXT,
        body_type TEXT,
        color TEXT,
        seats INTEGER,
        condition TEXT,
        market TEXT,
        is_new BOOLEAN,
        city TEXT,
        seller_name TEXT,
        seller_phones TEXT,
        description TEXT,
        extras TEXT NOT NULL DEFAULT '[]',
        view_count INTEGER,
        posted_on DATE,
        updated_on DATE,
        is_vip BOOLEAN NOT NULL DEFAULT 0,
        is_featured BOOLEAN NOT NULL DEFAULT 0,
        is_salon BOOLEAN NOT NULL DEFAULT 0,
        has_credit BOOLEAN NOT NULL DEFAULT 0,
        has_barter BOOLEAN NOT NULL DEFAULT 0,
        has_vin BOOLEAN NOT NULL DEFAULT 0,
        image_urls TEXT NOT NULL DEFAULT '[]',
        scraped_at DATETIME NOT NULL,
        first_seen_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
";

const CREATE_INDEXES_SQL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_listings_price ON listings (price)",
    "CREATE INDEX IF NOT EXISTS idx_listings_make ON listings (make)",
    "CREATE INDEX IF NOT EXISTS idx_listings_city ON listings (city)",
    "CREATE INDEX IF NOT EXISTS idx_listings_year ON listings (year)",
    "CREATE INDEX IF NOT EXISTS idx_listings_scraped_at ON listings (scraped_at)",
    "CREATE INDEX IF NOT EXISTS idx_listings_phone_count ON listings (json_array_length(seller_phones))",
];

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Open (and create if missing) the database behind a `sqlite:` URL.
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        let in_memory = db_path.starts_with(":memory:") || db_path.contains("mode=memory");

        if !in_memory {
            if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { MAX_CONNECTIONS })
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {database_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_LISTINGS_SQL).execute(&self.pool).await?;
        for statement in CREATE_INDEXES_SQL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_file_database_in_new_directory() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("listings.db");
        let db = DatabaseConnection::new(&format!("sqlite:{}", db_path.display())).await?;

        assert!(!db.pool().is_closed());
        assert!(db_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn migration_creates_table_and_indexes() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("migrate.db");
        let db = DatabaseConnection::new(&format!("sqlite:{}", db_path.display())).await?;

        db.migrate().await?;
        db.migrate().await?;

        let table = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='listings'")
            .fetch_optional(db.pool())
            .await?;
        assert!(table.is_some());

        let (indexes,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name LIKE 'idx_listings_%'",
        )
        .fetch_one(db.pool())
        .await?;
        assert_eq!(indexes, 6);
        Ok(())
    }
}
