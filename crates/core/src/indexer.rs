use crate::chunker::Chunker;
use crate::config::EmbeddingConfig;
use crate::embeddings::{self, EmbeddingRequest};
use crate::models::{ChunkMeta, Document, VectorRecord, DEFAULT_KIND, DEFAULT_SOURCE};
use crate::vectorstore::VectorStore;
use providers::ProviderRegistry;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub id: String,
    pub text: String,
    pub meta: ChunkMeta,
}

/// Splits documents into chunks with ids of the form `{doc_id}#chunk{i}`.
pub fn chunk_documents(docs: &[Document], chunker: Chunker) -> Vec<PendingChunk> {
    let mut out = Vec::new();
    for d in docs {
        for (i, text) in chunker.split(&d.text).into_iter().enumerate() {
            let source = if d.source.is_empty() { DEFAULT_SOURCE } else { &d.source };
            let kind = if d.kind.is_empty() { DEFAULT_KIND } else { &d.kind };
            out.push(PendingChunk {
                id: format!("{}#chunk{}", d.id, i),
                text,
                meta: ChunkMeta {
                    source: source.to_string(),
                    chunk: i,
                    doc_id: d.id.clone(),
                    kind: kind.to_string(),
                },
            });
        }
    }
    out
}

/// Rebuilds the collection from `docs`.
///
/// Returns the number of chunks written. When nothing chunks out the store is
/// left untouched and 0 is returned.
pub async fn build_index(
    docs: &[Document],
    chunker: Chunker,
    store: &dyn VectorStore,
    registry: &ProviderRegistry,
    cfg: &EmbeddingConfig,
) -> anyhow::Result<usize> {
    let pending = chunk_documents(docs, chunker);
    if pending.is_empty() {
        return Ok(0);
    }

    info!("Starting embedding phase for {} chunks...", pending.len());
    let embedded = embeddings::embed(
        EmbeddingRequest {
            texts: pending.iter().map(|c| c.text.clone()).collect(),
            provider: Some(cfg.provider.clone()),
            batch_size: cfg.batch_size,
        },
        registry,
    )
    .await?;
    info!("Embedding complete.");

    let records: Vec<VectorRecord> = pending
        .into_iter()
        .zip(embedded.vectors)
        .map(|(c, vector)| VectorRecord {
            id: c.id,
            text: c.text,
            vector,
            meta: c.meta,
        })
        .collect();
    let count = records.len();

    let removed = store.clear().await?;
    store.add(records).await?;
    info!(removed, added = count, "index rebuilt");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_and_meta_follow_documents() {
        let docs = vec![
            Document {
                id: "av/AAPL/overview".into(),
                text: "AAPL Company Overview:\n- Name: Apple Inc".into(),
                source: "alpha_vantage:overview".into(),
                kind: "api/alpha_vantage".into(),
            },
            Document {
                id: "custom/1".into(),
                text: "free text".into(),
                source: String::new(),
                kind: String::new(),
            },
            Document {
                id: "blank".into(),
                text: "  ".into(),
                source: "x".into(),
                kind: "y".into(),
            },
        ];
        let chunks = chunk_documents(&docs, Chunker::Identity);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "av/AAPL/overview#chunk0");
        assert_eq!(chunks[0].meta.source, "alpha_vantage:overview");
        assert_eq!(chunks[1].meta.source, DEFAULT_SOURCE);
        assert_eq!(chunks[1].meta.kind, DEFAULT_KIND);
    }
}
