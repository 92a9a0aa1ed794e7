//! Storage layer: SQLite schemas and helpers.
//!
//! Holds DB pool setup, the migration runner, and the document/meta tables
//! shared by ingestion and indexing. Vector rows live in `chunks` and are
//! managed by the vector store in `finrag-core`.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub text: String,
    pub source: String,
    pub kind: String,
}

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = if database_url.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(database_url)?
    } else {
        let path = std::path::PathBuf::from(database_url);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        SqliteConnectOptions::new().filename(path)
    };
    let options = options.create_if_missing(true);

    let mut opts = SqlitePoolOptions::new();
    if database_url.contains("memory") {
        opts = opts.max_connections(1);
    } else {
        opts = opts.max_connections(5);
    }
    debug!(database_url, "connecting sqlite pool");
    let pool = opts.connect_with(options).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    // Embedded from crates/storage/migrations; safe to run repeatedly.
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Replaces the stored document set in one transaction.
pub async fn replace_documents(
    pool: &SqlitePool,
    docs: &[StoredDocument],
) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
    for doc in docs {
        sqlx::query(
            r#"
            INSERT INTO documents (id, text, source, kind, fetched_at)
            VALUES (?1, ?2, ?3, ?4, strftime('%s','now'))
            ON CONFLICT(id) DO UPDATE SET
                text=excluded.text,
                source=excluded.source,
                kind=excluded.kind,
                fetched_at=excluded.fetched_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.text)
        .bind(&doc.source)
        .bind(&doc.kind)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(docs.len())
}

pub async fn load_documents(pool: &SqlitePool) -> anyhow::Result<Vec<StoredDocument>> {
    let rows = sqlx::query("SELECT id, text, source, kind FROM documents ORDER BY id")
        .fetch_all(pool)
        .await?;
    let mut docs = Vec::with_capacity(rows.len());
    for row in rows {
        docs.push(StoredDocument {
            id: row.try_get("id")?,
            text: row.try_get("text")?,
            source: row.try_get("source")?,
            kind: row.try_get("kind")?,
        });
    }
    Ok(docs)
}

pub async fn clear_documents(pool: &SqlitePool) -> anyhow::Result<u64> {
    let res = sqlx::query("DELETE FROM documents").execute(pool).await?;
    Ok(res.rows_affected())
}

pub async fn get_meta(pool: &SqlitePool, key: &str) -> anyhow::Result<Option<String>> {
    let row = sqlx::query("SELECT value FROM index_meta WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<String, _>(0)))
}

pub async fn set_meta(pool: &SqlitePool, key: &str, value: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO index_meta (key, value, updated_at)
        VALUES (?1, ?2, strftime('%s','now'))
        ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}
