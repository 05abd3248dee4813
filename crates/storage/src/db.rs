use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerlabel_core::Fingerprint;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

use crate::entry::{CacheBackend, CacheEntry, CacheError, EntrySource, Loaded, Record};

pub type DbPool = Pool<Sqlite>;

/// SQLite-backed cache storage: one row per live fingerprint.
pub struct SqliteBackend {
    pool: DbPool,
}

impl SqliteBackend {
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = create_db(&format!("sqlite:{}?mode=rwc", path.display())).await?;
        Ok(Self { pool })
    }

    pub async fn open_in_memory() -> Result<Self, CacheError> {
        let pool = create_db("sqlite::memory:").await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

async fn create_db(url: &str) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(url)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classification_cache (
            fingerprint TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            category TEXT NOT NULL,
            vendor TEXT,
            source TEXT NOT NULL,
            confidence REAL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Option<(Fingerprint, CacheEntry)> {
    let fingerprint = Fingerprint::parse(&row.try_get::<String, _>("fingerprint").ok()?)?;
    let source = row
        .try_get::<String, _>("source")
        .ok()?
        .parse::<EntrySource>()
        .ok()?;
    let created_at = DateTime::parse_from_rfc3339(&row.try_get::<String, _>("created_at").ok()?)
        .ok()?
        .with_timezone(&Utc);
    let category: String = row.try_get("category").ok()?;
    if category.trim().is_empty() {
        return None;
    }

    Some((
        fingerprint,
        CacheEntry {
            description: row.try_get("description").ok()?,
            category,
            vendor: row.try_get("vendor").ok()?,
            source,
            confidence: row
                .try_get::<Option<f64>, _>("confidence")
                .ok()?
                .map(|c| c as f32),
            created_at,
        },
    ))
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    async fn load(&self) -> Result<Loaded, CacheError> {
        let rows = sqlx::query(
            "SELECT fingerprint, description, category, vendor, source, confidence, created_at FROM classification_cache ORDER BY fingerprint",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = Loaded::default();
        for row in &rows {
            match decode_row(row) {
                Some((fp, entry)) => loaded.records.push(Record::Put(fp, entry)),
                None => loaded.skipped += 1,
            }
        }
        Ok(loaded)
    }

    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT OR REPLACE INTO classification_cache (fingerprint, description, category, vendor, source, confidence, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(fingerprint.as_str())
        .bind(&entry.description)
        .bind(&entry.category)
        .bind(entry.vendor.as_deref())
        .bind(entry.source.to_string())
        .bind(entry.confidence.map(f64::from))
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM classification_cache WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn compact(&self, _live: &[(Fingerprint, CacheEntry)]) -> Result<(), CacheError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}
