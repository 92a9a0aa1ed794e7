use serde::{Deserialize, Serialize};
use storage::StoredDocument;

pub const DEFAULT_SOURCE: &str = "alpha_vantage";
pub const DEFAULT_KIND: &str = "api/alpha_vantage";

/// One natural-language passage produced by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<StoredDocument> for Document {
    fn from(d: StoredDocument) -> Self {
        Self {
            id: d.id,
            text: d.text,
            source: d.source,
            kind: d.kind,
        }
    }
}

impl From<&Document> for StoredDocument {
    fn from(d: &Document) -> Self {
        Self {
            id: d.id.clone(),
            text: d.text.clone(),
            source: d.source.clone(),
            kind: d.kind.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub source: String,
    pub chunk: usize,
    pub doc_id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ChunkMeta {
    /// Ticker taken from the document id (`av/BTC-USD/...` -> `BTC`).
    pub fn symbol(&self) -> Option<String> {
        symbol_from_doc_id(&self.doc_id)
    }
}

/// A chunk ready to be written to a vector store.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub meta: ChunkMeta,
}

/// A search hit. `score` is a distance: lower is closer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub meta: ChunkMeta,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<RetrievedChunk>,
    /// True when the text was extracted from context instead of generated.
    pub fallback: bool,
}

pub fn symbol_from_doc_id(doc_id: &str) -> Option<String> {
    let segment = doc_id.split('/').nth(1)?;
    let symbol = segment.split('-').next().unwrap_or_default();
    if symbol.is_empty() {
        None
    } else {
        Some(symbol.to_string())
    }
}
