//! Database persistence for per-user bot state.
//!
//! Stores everything needed to resume after restart:
//! - User records (strategy, active cycle, accounting) as JSON blobs
//! - The authorized-user roster
//! - Exchange credentials per user
//! - Timestamped record backups
//! - Control flags shared with other processes on the same database

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::api::ApiCredentials;
use crate::models::{ExchangeKind, UserRecord};

/// Persistence contract used by the registry.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_record(&self, record: &UserRecord) -> Result<()>;

    async fn load_record(&self, user_id: i64) -> Result<Option<UserRecord>>;

    async fn load_all_records(&self) -> Result<Vec<UserRecord>>;

    async fn save_authorized(&self, user_id: i64) -> Result<()>;

    async fn load_authorized(&self) -> Result<Vec<i64>>;

    /// Append a point-in-time copy of a record.
    async fn backup_record(&self, record: &UserRecord) -> Result<()>;

    /// Most recent backup of a user's record.
    async fn latest_backup(&self, user_id: i64) -> Result<Option<UserRecord>>;

    /// Delete backups taken before `cutoff`; returns how many were removed.
    async fn prune_backups(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn save_credentials(&self, user_id: i64, exchange: ExchangeKind, credentials: &ApiCredentials) -> Result<()>;

    async fn load_credentials(&self, user_id: i64) -> Result<Option<(ExchangeKind, ApiCredentials)>>;

    async fn storage_stats(&self) -> Result<StorageStats>;

    /// Write a control flag, replacing any previous value.
    async fn set_control(&self, key: &str, value: &str) -> Result<()>;

    /// Control flag value and when it was written.
    async fn get_control(&self, key: &str) -> Result<Option<(String, DateTime<Utc>)>>;

    async fn clear_control(&self, key: &str) -> Result<()>;
}

/// Row counts across the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub records: i64,
    pub authorized: i64,
    pub credentials: i64,
    pub backups: i64,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records, {} authorized, {} with credentials, {} backups",
            self.records, self.authorized, self.credentials, self.backups
        )
    }
}

/// Fixed-width UTC timestamp so text comparison orders correctly.
fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Private in-memory database (single connection, so every query sees
    /// the same data).
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Live user records
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_records (
                user_id INTEGER PRIMARY KEY,
                exchange TEXT,
                is_active INTEGER NOT NULL DEFAULT 0,
                trading_enabled INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Authorized roster
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS authorized_users (
                user_id INTEGER PRIMARY KEY,
                authorized_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Exchange credentials
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                user_id INTEGER PRIMARY KEY,
                exchange TEXT NOT NULL,
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Record backups
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS record_backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Control flags
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS control_flags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_record_backups_user ON record_backups(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_record_backups_time ON record_backups(created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for Database {
    // ==================== User Records ====================

    async fn save_record(&self, record: &UserRecord) -> Result<()> {
        let data = serde_json::to_string(record).context("Failed to serialize user record")?;

        sqlx::query(
            r#"
            INSERT INTO user_records (user_id, exchange, is_active, trading_enabled, data, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                exchange = excluded.exchange,
                is_active = excluded.is_active,
                trading_enabled = excluded.trading_enabled,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.user_id)
        .bind(record.exchange.map(|e| e.as_str()))
        .bind(record.is_active)
        .bind(record.trading_enabled)
        .bind(data)
        .bind(stamp(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save record for user {}", record.user_id))?;

        Ok(())
    }

    async fn load_record(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM user_records WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(data,)| {
            serde_json::from_str(&data).with_context(|| format!("Corrupt record for user {}", user_id))
        })
        .transpose()
    }

    async fn load_all_records(&self) -> Result<Vec<UserRecord>> {
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT user_id, data FROM user_records ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch user records")?;

        let mut records = Vec::with_capacity(rows.len());
        for (user_id, data) in rows {
            match serde_json::from_str::<UserRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(user_id, error = %e, "Skipping unreadable user record"),
            }
        }

        Ok(records)
    }

    // ==================== Authorized Users ====================

    async fn save_authorized(&self, user_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO authorized_users (user_id, authorized_at) VALUES (?, ?)")
            .bind(user_id)
            .bind(stamp(Utc::now()))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_authorized(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM authorized_users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ==================== Backups ====================

    async fn backup_record(&self, record: &UserRecord) -> Result<()> {
        let data = serde_json::to_string(record).context("Failed to serialize user record")?;

        sqlx::query("INSERT INTO record_backups (user_id, data, created_at) VALUES (?, ?, ?)")
            .bind(record.user_id)
            .bind(data)
            .bind(stamp(Utc::now()))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to back up record for user {}", record.user_id))?;

        Ok(())
    }

    async fn latest_backup(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT data FROM record_backups WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(data,)| serde_json::from_str(&data).context("Corrupt record backup"))
            .transpose()
    }

    async fn prune_backups(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM record_backups WHERE created_at < ?")
            .bind(stamp(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ==================== Credentials ====================

    async fn save_credentials(&self, user_id: i64, exchange: ExchangeKind, credentials: &ApiCredentials) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (user_id, exchange, api_key, api_secret, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                exchange = excluded.exchange,
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(exchange.as_str())
        .bind(&credentials.api_key)
        .bind(&credentials.api_secret)
        .bind(stamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_credentials(&self, user_id: i64) -> Result<Option<(ExchangeKind, ApiCredentials)>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT exchange, api_key, api_secret FROM credentials WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((exchange, api_key, api_secret)) = row else {
            return Ok(None);
        };

        let exchange: ExchangeKind = exchange.parse()?;
        Ok(Some((exchange, ApiCredentials { api_key, api_secret })))
    }

    // ==================== Control Flags ====================

    async fn set_control(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO control_flags (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(stamp(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to set control flag {}", key))?;

        Ok(())
    }

    async fn get_control(&self, key: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT value, updated_at FROM control_flags WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(value, updated_at)| -> Result<(String, DateTime<Utc>)> {
            let at = DateTime::parse_from_rfc3339(&updated_at)
                .with_context(|| format!("Bad timestamp on control flag {}", key))?;
            Ok((value, at.with_timezone(&Utc)))
        })
        .transpose()
    }

    async fn clear_control(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM control_flags WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Stats ====================

    async fn storage_stats(&self) -> Result<StorageStats> {
        let (records,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user_records")
            .fetch_one(&self.pool)
            .await?;

        let (authorized,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM authorized_users")
            .fetch_one(&self.pool)
            .await?;

        let (credentials,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM credentials")
            .fetch_one(&self.pool)
            .await?;

        let (backups,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM record_backups")
            .fetch_one(&self.pool)
            .await?;

        Ok(StorageStats {
            records,
            authorized,
            credentials,
            backups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::StrategyConfig;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    fn make_record(user_id: i64) -> UserRecord {
        let config = StrategyConfig::default();
        UserRecord::new(user_id, &config.symbol, config.params(), config.placeholder_balance)
    }

    #[tokio::test]
    async fn test_record_roundtrip_and_upsert() {
        let db = assert_ok!(Database::in_memory().await);
        assert!(db.load_record(1).await.unwrap().is_none());

        let mut record = make_record(1);
        db.save_record(&record).await.unwrap();

        record.total_profit = dec!(1.25);
        record.cycle_count = 3;
        db.save_record(&record).await.unwrap();

        let loaded = db.load_record(1).await.unwrap().unwrap();
        assert_eq!(loaded.total_profit, dec!(1.25));
        assert_eq!(loaded.cycle_count, 3);
        assert_eq!(db.load_all_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_authorized_roster_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.save_authorized(7).await.unwrap();
        db.save_authorized(7).await.unwrap();
        db.save_authorized(3).await.unwrap();

        assert_eq!(db.load_authorized().await.unwrap(), vec![3, 7]);
    }

    #[tokio::test]
    async fn test_credentials() {
        let db = Database::in_memory().await.unwrap();
        let creds = ApiCredentials {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        };
        db.save_credentials(5, ExchangeKind::Bybit, &creds).await.unwrap();

        let (exchange, loaded) = db.load_credentials(5).await.unwrap().unwrap();
        assert_eq!(exchange, ExchangeKind::Bybit);
        assert_eq!(loaded.api_key, "key");
        assert!(db.load_credentials(6).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backups_and_pruning() {
        let db = Database::in_memory().await.unwrap();
        let mut record = make_record(9);
        db.backup_record(&record).await.unwrap();
        record.cycle_count = 2;
        db.backup_record(&record).await.unwrap();

        let latest = db.latest_backup(9).await.unwrap().unwrap();
        assert_eq!(latest.cycle_count, 2);

        let pruned = db.prune_backups(Utc::now() - Duration::days(7)).await.unwrap();
        assert_eq!(pruned, 0);

        let pruned = db.prune_backups(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(pruned, 2);

        let stats = db.storage_stats().await.unwrap();
        assert_eq!(stats.backups, 0);
    }

    #[tokio::test]
    async fn test_storage_stats() {
        let db = Database::in_memory().await.unwrap();
        db.save_record(&make_record(1)).await.unwrap();
        db.save_record(&make_record(2)).await.unwrap();
        db.save_authorized(1).await.unwrap();

        let stats = db.storage_stats().await.unwrap();
        assert_eq!(
            stats,
            StorageStats {
                records: 2,
                authorized: 1,
                credentials: 0,
                backups: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_control_flags() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.get_control("heartbeat").await.unwrap().is_none());

        let before = Utc::now() - Duration::seconds(1);
        db.set_control("heartbeat", "70").await.unwrap();
        db.set_control("heartbeat", "130").await.unwrap();

        let (value, at) = db.get_control("heartbeat").await.unwrap().unwrap();
        assert_eq!(value, "130");
        assert!(at > before);

        db.clear_control("heartbeat").await.unwrap();
        assert!(db.get_control("heartbeat").await.unwrap().is_none());
        db.clear_control("heartbeat").await.unwrap();
    }
}
