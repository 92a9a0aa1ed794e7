//! Vector stores for embedded chunks.
//!
//! Scores are distances (lower is closer): squared L2 between normalized
//! vectors, which equals `2 - 2 * cosine`.

use crate::config::AppConfig;
use crate::models::{ChunkMeta, RetrievedChunk, VectorRecord};
use anyhow::{bail, Context};
use providers::qdrant::{QdrantClient, QdrantConfig, QdrantPoint};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, records: Vec<VectorRecord>) -> anyhow::Result<()>;
    /// Nearest `k` chunks, closest first.
    async fn query(&self, vector: &[f32], k: usize) -> anyhow::Result<Vec<RetrievedChunk>>;
    /// Removes every chunk in the collection and returns how many there were.
    async fn clear(&self) -> anyhow::Result<usize>;
    async fn count(&self) -> anyhow::Result<usize>;
    /// Distinct document ids in insertion order.
    async fn doc_ids(&self) -> anyhow::Result<Vec<String>>;
}

pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn by_distance(a: &RetrievedChunk, b: &RetrievedChunk) -> Ordering {
    a.score
        .partial_cmp(&b.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}

pub fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Brute-force store over the `chunks` table.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    collection: String,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool, collection: &str) -> Self {
        Self {
            pool,
            collection: collection.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add(&self, records: Vec<VectorRecord>) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in &records {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO chunks (collection, id, doc_id, chunk_index, text, source, kind, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&self.collection)
            .bind(&r.id)
            .bind(&r.meta.doc_id)
            .bind(r.meta.chunk as i64)
            .bind(&r.text)
            .bind(&r.meta.source)
            .bind(&r.meta.kind)
            .bind(encode_embedding(&r.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(collection = %self.collection, added = records.len(), "sqlite vector store add");
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> anyhow::Result<Vec<RetrievedChunk>> {
        let rows = sqlx::query(
            "SELECT id, doc_id, chunk_index, text, source, kind, embedding FROM chunks WHERE collection = ?1",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        let mut skipped = 0usize;
        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let embedding = decode_embedding(&blob);
            if embedding.len() != vector.len() {
                skipped += 1;
                continue;
            }
            hits.push(RetrievedChunk {
                id: row.try_get("id")?,
                text: row.try_get("text")?,
                meta: ChunkMeta {
                    source: row.try_get("source")?,
                    chunk: row.try_get::<i64, _>("chunk_index")? as usize,
                    doc_id: row.try_get("doc_id")?,
                    kind: row.try_get("kind")?,
                },
                score: squared_l2(vector, &embedding),
            });
        }
        if skipped > 0 {
            warn!(
                skipped,
                dims = vector.len(),
                "chunks with a different embedding width were ignored; rebuild the index"
            );
        }
        hits.sort_by(by_distance);
        hits.truncate(k);
        Ok(hits)
    }

    async fn clear(&self) -> anyhow::Result<usize> {
        let res = sqlx::query("DELETE FROM chunks WHERE collection = ?1")
            .bind(&self.collection)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() as usize)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        let n: i64 = sqlx::query("SELECT COUNT(*) FROM chunks WHERE collection = ?1")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(n as usize)
    }

    async fn doc_ids(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT doc_id FROM chunks WHERE collection = ?1 GROUP BY doc_id ORDER BY MIN(rowid)",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>(0).map_err(Into::into))
            .collect()
    }
}

pub struct QdrantStore {
    client: QdrantClient,
}

const QDRANT_BATCH: usize = 256;

impl QdrantStore {
    pub fn new(client: QdrantClient) -> Self {
        Self { client }
    }

    /// Qdrant only accepts UUIDs or integers as point ids.
    pub fn point_id(chunk_id: &str) -> String {
        let hex = blake3::hash(chunk_id.as_bytes()).to_hex();
        let h = &hex.as_str()[..32];
        format!("{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
    }

    fn payload(record: &VectorRecord) -> HashMap<String, Value> {
        HashMap::from([
            ("chunk_id".to_string(), json!(record.id)),
            ("text".to_string(), json!(record.text)),
            ("doc_id".to_string(), json!(record.meta.doc_id)),
            ("chunk".to_string(), json!(record.meta.chunk)),
            ("source".to_string(), json!(record.meta.source)),
            ("type".to_string(), json!(record.meta.kind)),
        ])
    }

    fn from_payload(payload: &Value, score: f32) -> Option<RetrievedChunk> {
        let text_of = |k: &str| payload.get(k).and_then(Value::as_str).map(str::to_string);
        Some(RetrievedChunk {
            id: text_of("chunk_id")?,
            text: text_of("text").unwrap_or_default(),
            meta: ChunkMeta {
                source: text_of("source").unwrap_or_default(),
                chunk: payload.get("chunk").and_then(Value::as_u64).unwrap_or(0) as usize,
                doc_id: text_of("doc_id")?,
                kind: text_of("type").unwrap_or_default(),
            },
            // Cosine similarity -> squared L2 between unit vectors.
            score: 2.0 - 2.0 * score,
        })
    }
}

#[async_trait::async_trait]
impl VectorStore for QdrantStore {
    async fn add(&self, records: Vec<VectorRecord>) -> anyhow::Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        self.client.ensure_collection(first.vector.len()).await?;
        for batch in records.chunks(QDRANT_BATCH) {
            let points = batch
                .iter()
                .map(|r| QdrantPoint {
                    id: Self::point_id(&r.id),
                    vector: r.vector.clone(),
                    payload: Self::payload(r),
                })
                .collect();
            self.client.upsert(points).await?;
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> anyhow::Result<Vec<RetrievedChunk>> {
        let resp = self.client.search(vector.to_vec(), k as u64, None).await?;
        let mut hits: Vec<RetrievedChunk> = resp
            .result
            .iter()
            .filter_map(|r| r.payload.as_ref().and_then(|p| Self::from_payload(p, r.score)))
            .collect();
        hits.sort_by(by_distance);
        Ok(hits)
    }

    async fn clear(&self) -> anyhow::Result<usize> {
        let n = self.client.count().await?;
        self.client.delete_collection().await?;
        Ok(n as usize)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.client.count().await? as usize)
    }

    async fn doc_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        let mut offset = None;
        loop {
            let page = self.client.scroll(QDRANT_BATCH as u64, offset).await?;
            for p in &page.points {
                if let Some(id) = p
                    .payload
                    .as_ref()
                    .and_then(|pl| pl.get("doc_id"))
                    .and_then(Value::as_str)
                {
                    if !out.iter().any(|d| d == id) {
                        out.push(id.to_string());
                    }
                }
            }
            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        Ok(out)
    }
}

pub fn build_vector_store(
    config: &AppConfig,
    pool: &SqlitePool,
) -> anyhow::Result<Arc<dyn VectorStore>> {
    match config.vectors.provider.as_str() {
        "sqlite" => Ok(Arc::new(SqliteVectorStore::new(
            pool.clone(),
            &config.vectors.collection,
        ))),
        "qdrant" => {
            let url = config
                .vectors
                .url
                .clone()
                .context("vectors.url is required for the qdrant provider")?;
            let client = QdrantClient::new(QdrantConfig {
                url,
                collection: config.vectors.collection.clone(),
                api_key: std::env::var("QDRANT_API_KEY").ok(),
            });
            Ok(Arc::new(QdrantStore::new(client)))
        }
        other => bail!("unknown vector store provider: {}", other),
    }
}
