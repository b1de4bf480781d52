//! SQLite-based checkpoint store

use crate::persistence::{CheckpointStore, StoredOutput};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// SQLite checkpoint store
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Open (or create) a store; `:memory:` gives a private in-memory database
    pub async fn new(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        // One connection keeps `:memory:` databases from splitting per connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("pipewright");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;

        let db_path = db_dir.join("checkpoints.db");
        Self::new(&db_path.to_string_lossy()).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS step_outputs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                step_name TEXT NOT NULL,
                content TEXT NOT NULL,
                saved_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_step_outputs_step ON step_outputs(step_name);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn persist(&self, id: &str, snapshot: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoints (id, snapshot, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(id)
        .bind(serde_json::to_string(snapshot)?)
        .bind(Self::to_naive(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to save checkpoint")?;

        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT snapshot FROM checkpoints WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load checkpoint")?;

        match row {
            Some(row) => {
                let raw: String = row.get("snapshot");
                Ok(Some(serde_json::from_str(&raw).context("Corrupt checkpoint")?))
            }
            None => Ok(None),
        }
    }

    async fn write_output(&self, step_name: &str, content: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_outputs (step_name, content, saved_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(step_name)
        .bind(serde_json::to_string(content)?)
        .bind(Self::to_naive(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to save step output")?;

        Ok(())
    }

    async fn outputs(&self, step_name: &str) -> Result<Vec<StoredOutput>> {
        let rows = sqlx::query(
            r#"
            SELECT step_name, content, saved_at
            FROM step_outputs
            WHERE step_name = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(step_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list step outputs")?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("content");
                Ok(StoredOutput {
                    step_name: row.get("step_name"),
                    content: serde_json::from_str(&raw)?,
                    saved_at: Self::from_naive(row.get("saved_at")),
                })
            })
            .collect()
    }
}
