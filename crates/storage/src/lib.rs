use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{PeerId, Timestamp};

const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLastRead {
    pub peer_id: PeerId,
    pub read_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        // Every connection to an in-memory database sees its own empty database.
        let max_connections = if database_url.starts_with(MEMORY_DATABASE_URL) {
            1
        } else {
            5
        };
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_last_reads(&self) -> Result<HashMap<PeerId, Timestamp>> {
        Ok(self
            .list_last_reads()
            .await?
            .into_iter()
            .map(|row| (row.peer_id, row.read_at))
            .collect())
    }

    pub async fn list_last_reads(&self) -> Result<Vec<StoredLastRead>> {
        let rows = sqlx::query(
            "SELECT peer_id, read_at_ms, updated_at FROM last_reads ORDER BY peer_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list last-read watermarks")?;

        rows.into_iter()
            .map(|r| {
                let peer_id = PeerId(r.get::<String, _>(0));
                let read_at_ms = r.get::<i64, _>(1);
                let read_at = DateTime::from_timestamp_millis(read_at_ms).ok_or_else(|| {
                    anyhow!("stored watermark for peer {peer_id} is out of range: {read_at_ms}")
                })?;
                Ok(StoredLastRead {
                    peer_id,
                    read_at,
                    updated_at: r.get::<DateTime<Utc>, _>(2),
                })
            })
            .collect()
    }

    pub async fn last_read_for_peer(&self, peer_id: &PeerId) -> Result<Option<Timestamp>> {
        let row = sqlx::query("SELECT read_at_ms FROM last_reads WHERE peer_id = ?")
            .bind(peer_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| DateTime::from_timestamp_millis(r.get::<i64, _>(0))))
    }

    pub async fn upsert_last_read(&self, peer_id: &PeerId, read_at: Timestamp) -> Result<()> {
        sqlx::query(
            "INSERT INTO last_reads (peer_id, read_at_ms, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(peer_id) DO UPDATE SET read_at_ms=excluded.read_at_ms, updated_at=excluded.updated_at",
        )
        .bind(peer_id.as_str())
        .bind(read_at.timestamp_millis())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store last-read watermark for peer {peer_id}"))?;
        Ok(())
    }

    pub async fn delete_last_reads(&self, peers: &HashSet<PeerId>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for peer_id in peers {
            removed += sqlx::query("DELETE FROM last_reads WHERE peer_id = ?")
                .bind(peer_id.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit()
            .await
            .context("failed to commit last-read removal")?;
        Ok(removed)
    }

    pub async fn clear_last_reads(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM last_reads")
            .execute(&self.pool)
            .await
            .context("failed to clear last-read watermarks")?;
        Ok(result.rows_affected())
    }
}

pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

pub fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == MEMORY_DATABASE_URL || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
