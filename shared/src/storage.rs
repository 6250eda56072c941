//! Shared SQLite database used by every plugin that persists state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

pub const DATABASE_FILE: &str = "kiana.sqlite3";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    /// Opens (creating if needed) the database file in WAL mode with foreign
    /// keys enforced.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        info!("Opened database {}", path.display());

        Ok(Self {
            pool,
            path: Some(path.to_owned()),
        })
    }

    /// Fresh in-memory database. Limited to one connection so every query
    /// sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        Ok(Self { pool, path: None })
    }

    /// Runs idempotent schema statements in a single transaction.
    pub async fn ensure_schema(&self, statements: &[&str]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Schema statement failed: {statement}"))?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
